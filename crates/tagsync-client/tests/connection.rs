//! Connection manager behaviour against a real local WebSocket server.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tagsync_core::{ClientMessage, ConnectionStatus, EventKind, ServerMessage, Vendor};
use tagsync_client::{ConnectionConfig, ConnectionManager, ConnectionSettings, SyncError};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    /// Complete the handshake and keep the socket open.
    Hold,
    /// Drop the first connection without a close frame after its first frame.
    DropFirst,
    /// Close every connection with code 1000 right after the handshake.
    CloseNormally,
    /// Accept TCP and hang up before the handshake.
    Refuse,
    /// Accept TCP and never answer the handshake.
    Stall,
}

struct TestServer {
    addr: SocketAddr,
    dials: Arc<AtomicUsize>,
    /// Text frames received, tagged with the connection index.
    frames: mpsc::UnboundedReceiver<(usize, String)>,
    push: broadcast::Sender<String>,
}

impl TestServer {
    async fn start(mode: Mode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dials = Arc::new(AtomicUsize::new(0));
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let (push, _) = broadcast::channel::<String>(64);

        let counter = dials.clone();
        let pusher = push.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if mode == Mode::Refuse {
                    drop(stream);
                    continue;
                }
                if mode == Mode::Stall {
                    tokio::spawn(async move {
                        let _held = stream;
                        std::future::pending::<()>().await;
                    });
                    continue;
                }
                let frames_tx = frames_tx.clone();
                let mut push_rx = pusher.subscribe();
                tokio::spawn(async move {
                    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    let (mut sink, mut source) = ws.split();
                    if mode == Mode::CloseNormally {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "done".into(),
                        };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        return;
                    }
                    loop {
                        tokio::select! {
                            frame = source.next() => match frame {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = frames_tx.send((n, text.to_string()));
                                    if mode == Mode::DropFirst && n == 0 {
                                        return;
                                    }
                                }
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                                Some(Ok(_)) => {}
                            },
                            out = push_rx.recv() => match out {
                                Ok(text) => {
                                    if sink.send(Message::Text(text.into())).await.is_err() {
                                        return;
                                    }
                                }
                                Err(_) => return,
                            },
                        }
                    }
                });
            }
        });

        Self {
            addr,
            dials,
            frames,
            push,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/ws/tags", self.addr)
    }

    fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    async fn next_frame(&mut self) -> (usize, ClientMessage) {
        let (n, text) = tokio::time::timeout(Duration::from_secs(5), self.frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("server stopped");
        (n, ClientMessage::decode(&text).unwrap())
    }

    fn push(&self, message: serde_json::Value) {
        self.push.send(message.to_string()).unwrap();
    }
}

fn fast_policy() -> ConnectionConfig {
    ConnectionConfig {
        max_attempts: 3,
        base_delay_ms: 10,
        max_delay_ms: 40,
        keepalive_ms: 60_000,
        reset_delay_ms: 10,
        connect_timeout_ms: 2_000,
    }
}

fn manager(server: &TestServer, policy: ConnectionConfig) -> ConnectionManager {
    ConnectionManager::new(ConnectionSettings::new(server.url()).with_policy(policy))
}

async fn wait_for(manager: &ConnectionManager, status: ConnectionStatus) {
    tokio::time::timeout(Duration::from_secs(5), manager.wait_for(status))
        .await
        .unwrap_or_else(|_| panic!("never reached {status:?}: {:?}", manager.state()));
}

async fn eventually(what: &str, f: impl Fn() -> bool) {
    for _ in 0..500 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn subscription_is_replayed_once_after_reconnect() {
    let mut server = TestServer::start(Mode::DropFirst).await;
    let manager = manager(&server, fast_policy());
    assert!(!manager.subscribe("p1"));

    manager.connect();
    let subscribe = ClientMessage::Subscribe {
        project_id: "p1".into(),
    };
    assert_eq!(server.next_frame().await, (0, subscribe.clone()));

    // The first socket is dropped; the manager reconnects and replays.
    assert_eq!(server.next_frame().await, (1, subscribe));
    wait_for(&manager, ConnectionStatus::Connected).await;
    assert_eq!(manager.state().attempt_count, 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server.frames.try_recv().is_err());
    assert_eq!(server.dials(), 2);
}

#[tokio::test]
async fn circuit_opens_after_max_attempts_and_reset_resumes() {
    let server = TestServer::start(Mode::Refuse).await;
    let manager = manager(&server, fast_policy());

    manager.connect();
    wait_for(&manager, ConnectionStatus::CircuitOpen).await;
    assert_eq!(server.dials(), 3);
    let state = manager.state();
    assert_eq!(state.attempt_count, 3);
    assert!(state.last_error.is_some());

    // Nothing dials while the circuit is open, including explicit connects.
    manager.connect();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.dials(), 3);
    assert_eq!(manager.status(), ConnectionStatus::CircuitOpen);
    assert!(matches!(
        manager.sync_tags("p1", Vendor::Siemens, "VAR END_VAR", 500),
        Err(SyncError::CircuitOpen { attempts: 3 })
    ));

    manager.reset();
    assert_eq!(manager.state().attempt_count, 0);
    wait_for(&manager, ConnectionStatus::CircuitOpen).await;
    assert_eq!(server.dials(), 6);
}

#[tokio::test]
async fn stalled_handshake_times_out_and_counts_as_a_failure() {
    let server = TestServer::start(Mode::Stall).await;
    let manager = manager(
        &server,
        ConnectionConfig {
            max_attempts: 2,
            connect_timeout_ms: 50,
            ..fast_policy()
        },
    );

    let mut states = manager.watch();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let seen = errors.clone();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            if let Some(error) = states.borrow_and_update().last_error.clone() {
                seen.lock().unwrap().push(error);
            }
        }
    });

    manager.connect();
    wait_for(&manager, ConnectionStatus::CircuitOpen).await;
    assert_eq!(server.dials(), 2);
    let state = manager.state();
    assert_eq!(state.attempt_count, 2);
    assert!(state.last_error.is_some());
    let errors = errors.lock().unwrap().clone();
    assert!(errors.iter().any(|e| e.contains("timed out")), "{errors:?}");
}

#[tokio::test]
async fn disconnect_clears_the_circuit() {
    let server = TestServer::start(Mode::Refuse).await;
    let manager = manager(&server, fast_policy());

    manager.connect();
    wait_for(&manager, ConnectionStatus::CircuitOpen).await;
    manager.disconnect();
    let state = manager.state();
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert_eq!(state.attempt_count, 0);
    assert_eq!(state.last_error, None);

    manager.connect();
    eventually("a fresh dial", || server.dials() > 3).await;
}

#[tokio::test]
async fn events_reach_listeners_in_order() {
    let server = TestServer::start(Mode::Hold).await;
    let manager = manager(&server, fast_policy());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = seen.clone();
    manager.on(EventKind::SyncQueued, move |msg| {
        if let ServerMessage::SyncQueued { timestamp } = msg {
            log.lock().unwrap().push(timestamp.clone().unwrap_or_default());
        }
    });
    let log = seen.clone();
    let updates = manager.on(EventKind::TagsUpdated, move |msg| {
        if let ServerMessage::TagsUpdated { tags, .. } = msg {
            log.lock().unwrap().push(format!("tags:{}", tags.len()));
        }
    });

    manager.connect();
    wait_for(&manager, ConnectionStatus::Connected).await;

    server.push(serde_json::json!({"type": "sync_queued", "timestamp": "1"}));
    server.push(serde_json::json!({
        "type": "tags_updated",
        "success": true,
        "projectId": "p1",
        "tags": [{"name": "Motor1", "dataType": "BOOL"}],
        "parsedCount": 1
    }));
    server.push(serde_json::json!({"type": "sync_queued", "timestamp": "2"}));
    eventually("three events", || seen.lock().unwrap().len() == 3).await;
    assert_eq!(*seen.lock().unwrap(), vec!["1", "tags:1", "2"]);
    assert!(manager.state().last_event_at.is_some());

    // Removed listeners see nothing further; malformed frames are skipped.
    assert!(updates.dispose());
    server.push(serde_json::json!({"type": "mystery"}));
    server.push(serde_json::json!({
        "type": "tags_updated",
        "success": true,
        "projectId": "p1"
    }));
    server.push(serde_json::json!({"type": "sync_queued", "timestamp": "3"}));
    eventually("fourth event", || seen.lock().unwrap().len() == 4).await;
    assert_eq!(seen.lock().unwrap().last().map(String::as_str), Some("3"));
}

#[tokio::test]
async fn server_error_events_are_recorded() {
    let server = TestServer::start(Mode::Hold).await;
    let manager = manager(&server, fast_policy());
    manager.connect();
    wait_for(&manager, ConnectionStatus::Connected).await;

    server.push(serde_json::json!({"type": "error", "error": "Invalid token"}));
    eventually("error recorded", || {
        manager.state().last_error.as_deref() == Some("Invalid token")
    })
    .await;
    assert_eq!(manager.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn keepalive_sends_pings() {
    let mut server = TestServer::start(Mode::Hold).await;
    let manager = manager(
        &server,
        ConnectionConfig {
            keepalive_ms: 50,
            ..fast_policy()
        },
    );
    manager.connect();

    assert_eq!(server.next_frame().await.1, ClientMessage::Ping);
    assert_eq!(server.next_frame().await.1, ClientMessage::Ping);
    assert_eq!(server.dials(), 1);
}

#[tokio::test]
async fn messages_are_not_queued_while_disconnected() {
    let mut server = TestServer::start(Mode::Hold).await;
    let manager = manager(&server, fast_policy());

    assert!(!manager.send(&ClientMessage::Ping));
    assert!(matches!(
        manager.sync_tags("p1", Vendor::Rockwell, "", 0),
        Err(SyncError::NotConnected)
    ));

    manager.connect();
    wait_for(&manager, ConnectionStatus::Connected).await;
    manager
        .sync_tags("p1", Vendor::Beckhoff, "VAR\n  Speed : REAL;\nEND_VAR", 250)
        .unwrap();
    let (_, first) = server.next_frame().await;
    assert!(matches!(first, ClientMessage::SyncTags { vendor: Vendor::Beckhoff, debounce_ms: 250, .. }));
}

#[tokio::test]
async fn disconnect_is_clean_and_final() {
    let mut server = TestServer::start(Mode::Hold).await;
    let manager = manager(&server, fast_policy());
    manager.connect();
    wait_for(&manager, ConnectionStatus::Connected).await;
    assert!(manager.subscribe("p9"));
    server.next_frame().await;

    manager.disconnect();
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.dials(), 1);
    assert_eq!(manager.state().subscribed_topic.as_deref(), Some("p9"));
}

#[tokio::test]
async fn normal_server_close_does_not_reconnect() {
    let server = TestServer::start(Mode::CloseNormally).await;
    let manager = manager(&server, fast_policy());

    manager.connect();
    eventually("the first dial", || server.dials() == 1).await;
    wait_for(&manager, ConnectionStatus::Disconnected).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.dials(), 1);
    let state = manager.state();
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert_eq!(state.attempt_count, 0);
}
