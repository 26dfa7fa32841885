//! Reconnecting WebSocket connection manager.
//!
//! One manager owns at most one transport at a time. Each transport is
//! driven by its own task, tagged with a generation number; events from a
//! transport whose generation is no longer current are ignored, so a
//! superseded socket can never change the manager's state.
//!
//! Lifecycle:
//! 1. `connect()` moves `Disconnected -> Connecting` and spawns a driver.
//! 2. On open: `Connected`, attempt counter cleared, subscription replayed.
//! 3. On a non-clean close: backoff reconnect until the attempt budget is
//!    spent, then `CircuitOpen` until `reset()` or `disconnect()`.

use crate::config::ConnectionSettings;
use crate::error::{Result, SyncError};
use crate::timer::ScheduledTask;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tagsync_core::{
    ClientMessage, ConnectionState, ConnectionStatus, EventKind, Listener, ListenerHandle,
    ListenerId, Listeners, ServerMessage, Vendor,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Frames queued for the driver task.
enum Outbound {
    Text(String),
    /// Close the socket with a normal close code and exit.
    Close,
}

struct Inner {
    state: ConnectionState,
    /// Bumped whenever the current transport is abandoned.
    generation: u64,
    /// Present only while connected.
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    driver: Option<JoinHandle<()>>,
    reconnect: Option<ScheduledTask>,
}

impl Inner {
    /// Drop the current transport. An open socket is closed cleanly by its
    /// driver; a handshake still in progress is aborted.
    fn release_transport(&mut self) {
        self.reconnect = None;
        match self.outbound.take() {
            Some(tx) => {
                let _ = tx.send(Outbound::Close);
                self.driver = None;
            }
            None => {
                if let Some(driver) = self.driver.take() {
                    driver.abort();
                }
            }
        }
        self.generation += 1;
    }

    fn send(&self, message: &ClientMessage) -> bool {
        if self.state.status != ConnectionStatus::Connected {
            return false;
        }
        let Some(tx) = &self.outbound else {
            return false;
        };
        match message.encode() {
            Ok(text) => tx.send(Outbound::Text(text)).is_ok(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode outbound message");
                false
            }
        }
    }
}

struct Shared {
    settings: ConnectionSettings,
    inner: Mutex<Inner>,
    listeners: Listeners<EventKind, ServerMessage>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &Inner) {
        self.state_tx.send_replace(inner.state.clone());
    }

    fn connect(self: &Arc<Self>) {
        let mut inner = self.lock();
        if inner.state.status.blocks_connect() {
            tracing::debug!(status = ?inner.state.status, "connect ignored");
            return;
        }
        inner.release_transport();
        inner.state.status = ConnectionStatus::Connecting;
        let generation = inner.generation;
        let shared = self.clone();
        inner.driver = Some(tokio::spawn(async move { shared.drive(generation).await }));
        tracing::debug!(generation, attempt = inner.state.attempt_count, "connecting");
        self.publish(&inner);
    }

    fn disconnect(&self) {
        let mut inner = self.lock();
        inner.release_transport();
        if inner.state.status == ConnectionStatus::CircuitOpen {
            inner.state.last_error = None;
        }
        inner.state.status = ConnectionStatus::Disconnected;
        inner.state.attempt_count = 0;
        self.publish(&inner);
    }

    fn reset(self: &Arc<Self>) {
        let mut inner = self.lock();
        inner.release_transport();
        let topic = inner.state.subscribed_topic.take();
        inner.state = ConnectionState {
            subscribed_topic: topic,
            ..ConnectionState::default()
        };
        let delay = self.settings.policy.reset_delay();
        inner.reconnect = Some(self.schedule_connect(delay));
        tracing::info!(?delay, "connection reset");
        self.publish(&inner);
    }

    fn schedule_connect(self: &Arc<Self>, delay: Duration) -> ScheduledTask {
        let weak = Arc::downgrade(self);
        ScheduledTask::after(delay, async move {
            if let Some(shared) = weak.upgrade() {
                shared.connect();
            }
        })
    }

    async fn drive(self: Arc<Self>, generation: u64) {
        let clean = match self.run_transport(generation).await {
            Ok(clean) => clean,
            Err(e) => {
                tracing::warn!(error = %e, "transport error");
                let mut inner = self.lock();
                if inner.generation == generation {
                    inner.state.last_error = Some(e.to_string());
                }
                false
            }
        };
        self.on_closed(generation, clean);
    }

    /// Returns whether the transport closed cleanly.
    async fn run_transport(&self, generation: u64) -> Result<bool> {
        let url = self.settings.request_url()?;
        let timeout = self.settings.policy.connect_timeout();
        let (ws, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str()))
            .await
            .map_err(|_| SyncError::Transport(format!("connect timed out after {timeout:?}")))?
            .map_err(transport)?;
        let (mut sink, mut stream) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel();
        if !self.on_open(generation, tx) {
            let _ = sink.send(Message::Close(None)).await;
            return Ok(true);
        }

        let keepalive = self.settings.policy.keepalive().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                out = rx.recv() => match out {
                    Some(Outbound::Text(text)) => {
                        sink.send(Message::Text(text.into())).await.map_err(transport)?;
                    }
                    Some(Outbound::Close) | None => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client disconnect".into(),
                        };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        let _ = sink.close().await;
                        return Ok(true);
                    }
                },

                _ = ticker.tick() => {
                    let ping = ClientMessage::Ping.encode()?;
                    sink.send(Message::Text(ping.into())).await.map_err(transport)?;
                }

                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatch(generation, text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        let clean = frame.as_ref().is_some_and(|f| f.code == CloseCode::Normal);
                        tracing::debug!(clean, "server closed connection");
                        return Ok(clean);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(transport(e)),
                    None => return Ok(false),
                },
            }
        }
    }

    /// Install a freshly opened transport. Returns false if it was
    /// superseded while the handshake was in flight.
    fn on_open(&self, generation: u64, tx: mpsc::UnboundedSender<Outbound>) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        inner.state.status = ConnectionStatus::Connected;
        inner.state.attempt_count = 0;
        inner.state.last_error = None;
        inner.outbound = Some(tx);
        if let Some(project_id) = inner.state.subscribed_topic.clone() {
            let replayed = inner.send(&ClientMessage::Subscribe { project_id });
            tracing::debug!(replayed, "replayed subscription");
        }
        tracing::info!(url = %self.settings.url, "connected");
        self.publish(&inner);
        true
    }

    fn dispatch(&self, generation: u64, text: &str) {
        let message = match ServerMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring undecodable frame");
                return;
            }
        };
        {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            inner.state.last_event_at = Some(SystemTime::now());
            if let ServerMessage::Error { error, .. } = &message {
                inner.state.last_error = Some(error.clone());
            }
            self.publish(&inner);
        }
        self.listeners.emit(message.kind(), &message);
    }

    fn on_closed(self: &Arc<Self>, generation: u64, clean: bool) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        inner.outbound = None;
        inner.driver = None;

        if clean {
            inner.state.status = ConnectionStatus::Disconnected;
            tracing::info!("connection closed");
            self.publish(&inner);
            return;
        }

        let policy = &self.settings.policy;
        inner.state.attempt_count += 1;
        let attempt = inner.state.attempt_count;
        if attempt >= policy.max_attempts {
            inner.state.status = ConnectionStatus::CircuitOpen;
            inner.state.last_error = Some(format!(
                "giving up after {attempt} attempts; reset the connection to try again"
            ));
            tracing::warn!(attempt, "reconnect budget exhausted, circuit open");
        } else {
            let delay = policy.backoff(attempt);
            inner.state.status = ConnectionStatus::Disconnected;
            inner.reconnect = Some(self.schedule_connect(delay));
            tracing::info!(attempt, ?delay, "scheduling reconnect");
        }
        self.publish(&inner);
    }
}

fn transport(e: tokio_tungstenite::tungstenite::Error) -> SyncError {
    SyncError::Transport(e.to_string())
}

/// Maintains one live connection to a tag-sync server.
///
/// Methods that start I/O (`connect`, `reset`) must be called from within a
/// Tokio runtime. Dropping the manager closes its transport.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings) -> Self {
        let state = ConnectionState::default();
        let (state_tx, _) = watch::channel(state.clone());
        Self {
            shared: Arc::new(Shared {
                settings,
                inner: Mutex::new(Inner {
                    state,
                    generation: 0,
                    outbound: None,
                    driver: None,
                    reconnect: None,
                }),
                listeners: Listeners::new(),
                state_tx,
            }),
        }
    }

    /// Open the transport. Ignored while connecting, connected, or while
    /// the circuit is open.
    pub fn connect(&self) {
        self.shared.connect();
    }

    /// Close the transport and cancel any pending reconnect. Clears the
    /// attempt counter and the circuit breaker; the subscribed topic is kept.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// Clear counters and the circuit breaker, then reconnect after the
    /// configured reset delay.
    pub fn reset(&self) {
        self.shared.reset();
    }

    /// Send a message if connected. Messages are never queued while
    /// disconnected.
    pub fn send(&self, message: &ClientMessage) -> bool {
        let sent = self.shared.lock().send(message);
        if !sent {
            tracing::debug!("dropping outbound message, not connected");
        }
        sent
    }

    /// Remember `project_id` and subscribe to it now if connected. The
    /// subscription is replayed after every reconnect.
    pub fn subscribe(&self, project_id: impl Into<String>) -> bool {
        let project_id = project_id.into();
        let mut inner = self.shared.lock();
        inner.state.subscribed_topic = Some(project_id.clone());
        let sent = inner.send(&ClientMessage::Subscribe { project_id });
        self.shared.publish(&inner);
        sent
    }

    /// Forget the subscribed topic and tell the server if connected.
    pub fn unsubscribe(&self) -> bool {
        let mut inner = self.shared.lock();
        inner.state.subscribed_topic = None;
        let sent = inner.send(&ClientMessage::Unsubscribe);
        self.shared.publish(&inner);
        sent
    }

    /// Ask the server to re-parse structured text for a project.
    pub fn sync_tags(
        &self,
        project_id: impl Into<String>,
        vendor: Vendor,
        st_code: impl Into<String>,
        debounce_ms: u64,
    ) -> Result<()> {
        let inner = self.shared.lock();
        if inner.state.status == ConnectionStatus::CircuitOpen {
            return Err(SyncError::CircuitOpen {
                attempts: inner.state.attempt_count,
            });
        }
        let message = ClientMessage::SyncTags {
            project_id: project_id.into(),
            vendor,
            st_code: st_code.into(),
            debounce_ms,
        };
        if inner.send(&message) {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }

    /// Call `f` for every inbound message of `kind`.
    pub fn on<F>(&self, kind: EventKind, f: F) -> ListenerHandle
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        self.shared.listeners.on(kind, f)
    }

    /// Register a shared callback. Registering the same `Arc` twice for one
    /// kind is a no-op.
    pub fn add_listener(&self, kind: EventKind, listener: Listener<ServerMessage>) -> ListenerHandle {
        self.shared.listeners.add(kind, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.lock().state.status
    }

    /// Observe state changes.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Wait until the manager reaches `status`.
    pub async fn wait_for(&self, status: ConnectionStatus) -> ConnectionState {
        let mut rx = self.watch();
        match rx.wait_for(|s| s.status == status).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.disconnect();
        self.shared.listeners.clear();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.shared.settings.url)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(ConnectionSettings::new("ws://127.0.0.1:9/ws"))
    }

    #[test]
    fn send_fails_while_disconnected() {
        let m = manager();
        assert!(!m.send(&ClientMessage::Ping));
        assert!(matches!(
            m.sync_tags("p1", Vendor::Rockwell, "", 0),
            Err(SyncError::NotConnected)
        ));
    }

    #[test]
    fn subscribe_is_remembered_while_disconnected() {
        let m = manager();
        assert!(!m.subscribe("p1"));
        assert_eq!(m.state().subscribed_topic.as_deref(), Some("p1"));
        assert_eq!(m.watch().borrow().subscribed_topic.as_deref(), Some("p1"));

        m.disconnect();
        assert_eq!(m.state().subscribed_topic.as_deref(), Some("p1"));

        m.unsubscribe();
        assert!(m.state().subscribed_topic.is_none());
    }

    #[test]
    fn disconnect_clears_circuit() {
        let m = manager();
        {
            let mut inner = m.shared.lock();
            inner.state.status = ConnectionStatus::CircuitOpen;
            inner.state.attempt_count = 5;
            inner.state.last_error = Some("giving up".into());
        }
        assert!(matches!(
            m.sync_tags("p1", Vendor::Siemens, "", 0),
            Err(SyncError::CircuitOpen { attempts: 5 })
        ));

        m.disconnect();
        let state = m.state();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert_eq!(state.attempt_count, 0);
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn connect_is_ignored_while_circuit_open() {
        let m = manager();
        m.shared.lock().state.status = ConnectionStatus::CircuitOpen;
        m.connect();
        let inner = m.shared.lock();
        assert_eq!(inner.state.status, ConnectionStatus::CircuitOpen);
        assert!(inner.driver.is_none());
    }
}
