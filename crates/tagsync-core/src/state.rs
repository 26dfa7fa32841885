//! Connection lifecycle state.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No transport. Initial state.
    Disconnected,
    /// Transport handshake in progress.
    Connecting,
    /// Normal operation.
    Connected,
    /// Retry budget exhausted; stays here until reset.
    CircuitOpen,
}

impl ConnectionStatus {
    /// Whether a `connect()` call should be ignored in this status.
    pub fn blocks_connect(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting | ConnectionStatus::Connected | ConnectionStatus::CircuitOpen
        )
    }
}

/// Observable state of one logical connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Consecutive failed attempts. Reset on successful connect.
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Remembered across reconnects and replayed after each one.
    pub subscribed_topic: Option<String>,
    pub last_event_at: Option<SystemTime>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            attempt_count: 0,
            last_error: None,
            subscribed_topic: None,
            last_event_at: None,
        }
    }
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn is_circuit_open(&self) -> bool {
        self.status == ConnectionStatus::CircuitOpen
    }
}
