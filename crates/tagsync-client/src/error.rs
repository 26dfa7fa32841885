//! Client error types.

use tagsync_core::ProtocolError;

/// Errors surfaced by the connection manager and autosave pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Connection-level failure. Recovered internally via backoff.
    #[error("transport error: {0}")]
    Transport(String),
    /// Retry budget exhausted; requires an explicit reset.
    #[error("connection failed after {attempts} attempts; reset required")]
    CircuitOpen { attempts: u32 },
    #[error("not connected")]
    NotConnected,
    /// A save did not reach the remote store.
    #[error("persistence failed: {0}")]
    Persistence(#[source] StoreError),
    /// A version snapshot request failed. Never reported as a save failure.
    #[error("versioning failed: {0}")]
    Versioning(#[source] StoreError),
    #[error("fallback cache: {0}")]
    Fallback(#[from] FallbackError),
    #[error("state encoding: {0}")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Failure talking to the remote store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    /// The store refused the request for a domain reason.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Failure reading or writing the local fallback cache.
#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_open_mentions_reset() {
        let err = SyncError::CircuitOpen { attempts: 5 };
        assert_eq!(err.to_string(), "connection failed after 5 attempts; reset required");
    }

    #[test]
    fn persistence_wraps_store_error() {
        let err = SyncError::Persistence(StoreError::Status {
            status: 503,
            message: "unavailable".into(),
        });
        assert!(err.to_string().contains("503"), "got: {err}");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn fallback_io_converts() {
        let inner = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: SyncError = FallbackError::from(inner).into();
        assert!(err.to_string().starts_with("fallback cache: i/o"));
    }
}
