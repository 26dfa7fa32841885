//! Server-held version snapshots.

use serde::{Deserialize, Serialize};

/// An immutable record of persisted state, owned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSnapshot {
    pub version_number: u64,
    #[serde(default)]
    pub message: Option<String>,
    /// Whether the server created this from an automatic trigger.
    #[serde(default)]
    pub is_auto: bool,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    /// Full state at this version, when the server includes it.
    #[serde(default)]
    pub state: Option<serde_json::Value>,
}

/// Result of rolling a resource back to an earlier version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOutcome {
    pub rolled_back_to: u64,
    /// The version created to record the rollback itself.
    pub new_version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_history_entry() {
        let text = r#"{"versionNumber": 4, "message": "before refactor", "createdAt": "2024-05-01T10:00:00Z"}"#;
        let v: VersionSnapshot = serde_json::from_str(text).unwrap();
        assert_eq!(v.version_number, 4);
        assert_eq!(v.message.as_deref(), Some("before refactor"));
        assert!(!v.is_auto);
        assert!(v.state.is_none());
    }

    #[test]
    fn decode_rollback() {
        let r: RollbackOutcome =
            serde_json::from_str(r#"{"rolledBackTo": 2, "newVersion": 7}"#).unwrap();
        assert_eq!(r, RollbackOutcome { rolled_back_to: 2, new_version: 7 });
    }
}
