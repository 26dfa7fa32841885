//! Client side of tagsync.
//!
//! Two independent pieces live here:
//!
//! - [`ConnectionManager`] keeps one WebSocket open to the tag server,
//!   reconnecting with exponential backoff until a circuit breaker trips,
//!   and fans inbound events out to registered listeners.
//! - [`AutosavePipeline`] owns a resource's editable state and persists it
//!   through a [`RemoteStore`] with debouncing, retries, a local
//!   [`FallbackCache`] and best-effort version snapshots.
//!
//! Both must be created inside a Tokio runtime.

mod autosave;
mod config;
mod connection;
mod error;
mod fallback;
mod store;
mod timer;

pub use autosave::{
    AutosaveEvent, AutosaveEventKind, AutosavePipeline, AutosaveStatus, Persistable, PersistOutcome,
    SaveReport,
};
pub use config::{AutosaveConfig, ClientConfig, ConnectionConfig, ConnectionSettings};
pub use connection::ConnectionManager;
pub use error::{FallbackError, Result, StoreError, SyncError};
pub use fallback::{FallbackCache, FallbackEntry, FallbackStore, FileFallbackStore, MemoryFallbackStore};
pub use store::{HttpStore, RemoteStore};
