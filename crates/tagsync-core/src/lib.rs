//! Core types for tagsync.
//!
//! This crate provides the protocol primitives shared by clients and
//! servers: wire messages, connection state, the listener fan-out used to
//! deliver events, and the version records a server exposes.

mod listeners;
mod message;
mod patch;
mod state;
mod version;

pub use listeners::{Listener, ListenerHandle, ListenerId, Listeners};
pub use message::{ClientMessage, EventKind, ProtocolError, ServerMessage, Tag, Vendor};
pub use patch::{Change, diff, merge_patch};
pub use state::{ConnectionState, ConnectionStatus};
pub use version::{RollbackOutcome, VersionSnapshot};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
