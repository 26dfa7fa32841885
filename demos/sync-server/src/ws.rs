//! Tag-sync WebSocket endpoint.

use crate::parser;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tagsync_core::{ClientMessage, ServerMessage, Vendor, now_ms};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

type Sink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// A message for the subscribers of one project.
#[derive(Clone)]
struct Update {
    project_id: String,
    text: String,
}

pub struct Hub {
    token: Option<String>,
    updates: broadcast::Sender<Update>,
    /// Pending parse per project; a newer request replaces the older one.
    pending: Mutex<HashMap<String, AbortHandle>>,
}

impl Hub {
    pub fn new(token: Option<String>) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            token,
            updates,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn schedule_parse(self: &Arc<Self>, project_id: String, vendor: Vendor, st_code: String, delay: Duration) {
        let hub = self.clone();
        let key = project_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            hub.publish_parse(project_id, vendor, &st_code);
        });
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.insert(key, task.abort_handle()) {
            previous.abort();
        }
    }

    fn publish_parse(&self, project_id: String, vendor: Vendor, st_code: &str) {
        let timestamp = Some(now_ms().to_string());
        let message = match parser::parse(st_code) {
            Ok(tags) => {
                tracing::info!("Parsed {} tags for project {} ({})", tags.len(), project_id, vendor);
                ServerMessage::TagsUpdated {
                    success: true,
                    project_id: project_id.clone(),
                    parsed_count: tags.len() as u64,
                    tags,
                    timestamp,
                }
            }
            Err(e) => {
                tracing::info!("Parse failed for project {}: {}", project_id, e);
                ServerMessage::Error {
                    error: format!("{vendor} parse failed: {e}"),
                    timestamp,
                }
            }
        };
        match serde_json::to_string(&message) {
            Ok(text) => {
                let _ = self.updates.send(Update { project_id, text });
            }
            Err(e) => tracing::warn!("Failed to encode update: {}", e),
        }
    }
}

pub async fn run(addr: SocketAddr, hub: Arc<Hub>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Tag sync listening on ws://{}", addr);

    loop {
        let (stream, client_addr) = listener.accept().await?;
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, client_addr, hub).await {
                tracing::warn!("Connection error from {}: {}", client_addr, e);
            }
        });
    }
}

/// Value of `name` in a URL query string, form-decoded.
fn query_param(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

async fn send(sink: &mut Sink, message: &ServerMessage) -> anyhow::Result<()> {
    sink.send(Message::Text(serde_json::to_string(message)?.into())).await?;
    Ok(())
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, hub: Arc<Hub>) -> anyhow::Result<()> {
    let mut query = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        query = req.uri().query().map(str::to_string);
        Ok(resp)
    })
    .await?;
    let (mut sink, mut stream) = ws.split();

    if let Some(expected) = &hub.token {
        let offered = query.as_deref().and_then(|q| query_param(q, "token"));
        if offered.as_ref() != Some(expected) {
            tracing::info!("Rejecting {}: invalid token", addr);
            let error = ServerMessage::Error {
                error: "Invalid token".into(),
                timestamp: Some(now_ms().to_string()),
            };
            send(&mut sink, &error).await?;
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: "invalid token".into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
            return Ok(());
        }
    }

    tracing::debug!("New connection from {}", addr);
    let mut updates = hub.updates.subscribe();
    let mut subscribed: Option<String> = None;

    loop {
        tokio::select! {
            msg = stream.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket error: {}", e);
                        break;
                    }
                };
                let timestamp = Some(now_ms().to_string());
                match ClientMessage::decode(&text) {
                    Ok(ClientMessage::Subscribe { project_id }) => {
                        tracing::info!("{} subscribed to {}", addr, project_id);
                        subscribed = Some(project_id);
                    }
                    Ok(ClientMessage::Unsubscribe) => {
                        subscribed = None;
                    }
                    Ok(ClientMessage::SyncTags { project_id, vendor, st_code, debounce_ms }) => {
                        hub.schedule_parse(project_id, vendor, st_code, Duration::from_millis(debounce_ms));
                        send(&mut sink, &ServerMessage::SyncQueued { timestamp }).await?;
                    }
                    Ok(ClientMessage::Ping) => {
                        send(&mut sink, &ServerMessage::Pong { timestamp }).await?;
                    }
                    Err(e) => {
                        tracing::warn!("Invalid message from {}: {}", addr, e);
                        let error = ServerMessage::Error { error: "Invalid message".into(), timestamp };
                        send(&mut sink, &error).await?;
                    }
                }
            }

            update = updates.recv() => match update {
                Ok(update) => {
                    if subscribed.as_deref() == Some(update.project_id.as_str()) {
                        sink.send(Message::Text(update.text.into())).await?;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("{} missed {} updates", addr, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    tracing::debug!("Connection closed: {}", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_read_from_query() {
        assert_eq!(query_param("token=abc", "token").as_deref(), Some("abc"));
        assert_eq!(query_param("x=1&token=a+b%2Fc", "token").as_deref(), Some("a b/c"));
        assert_eq!(query_param("tokenx=1", "token"), None);
        assert_eq!(query_param("token=100%", "token").as_deref(), Some("100%"));
    }
}
