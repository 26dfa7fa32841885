//! Protocol messages.
//!
//! Frames are JSON text messages discriminated by a `type` field. Field
//! names on the wire are camelCase.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// PLC vendor whose dialect the server should parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Rockwell,
    Siemens,
    Beckhoff,
}

impl Vendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::Rockwell => "rockwell",
            Vendor::Siemens => "siemens",
            Vendor::Beckhoff => "beckhoff",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vendor {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rockwell" => Ok(Vendor::Rockwell),
            "siemens" => Ok(Vendor::Siemens),
            "beckhoff" => Ok(Vendor::Beckhoff),
            other => Err(ProtocolError::UnknownVendor(other.to_string())),
        }
    }
}

/// A tag as reported by the server after parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub name: String,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Vendor-specific attributes the client does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Tag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: None,
            address: None,
            description: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }
}

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Start receiving updates for a project.
    Subscribe { project_id: String },
    /// Stop receiving updates.
    Unsubscribe,
    /// Ask the server to re-parse structured text into tags.
    SyncTags {
        project_id: String,
        vendor: Vendor,
        st_code: String,
        debounce_ms: u64,
    },
    /// Liveness check.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// The tag set of a project changed.
    TagsUpdated {
        success: bool,
        project_id: String,
        #[serde(default)]
        tags: Vec<Tag>,
        #[serde(default)]
        parsed_count: u64,
        #[serde(default)]
        timestamp: Option<String>,
    },
    /// A `sync_tags` request was accepted and is waiting out its debounce.
    SyncQueued {
        #[serde(default)]
        timestamp: Option<String>,
    },
    /// Error or rejection.
    Error {
        error: String,
        #[serde(default)]
        timestamp: Option<String>,
    },
    /// Reply to a ping.
    Pong {
        #[serde(default)]
        timestamp: Option<String>,
    },
}

/// Discriminant of [`ServerMessage`], used to route events to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TagsUpdated,
    SyncQueued,
    Error,
    Pong,
}

impl ServerMessage {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerMessage::TagsUpdated { .. } => EventKind::TagsUpdated,
            ServerMessage::SyncQueued { .. } => EventKind::SyncQueued,
            ServerMessage::Error { .. } => EventKind::Error,
            ServerMessage::Pong { .. } => EventKind::Pong,
        }
    }

    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

impl ClientMessage {
    /// Encode as a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

/// Error encoding or decoding a protocol frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("unknown vendor: {0}")]
    UnknownVendor(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_messages_use_wire_names() {
        let msg = ClientMessage::SyncTags {
            project_id: "p1".into(),
            vendor: Vendor::Siemens,
            st_code: "VAR x : INT; END_VAR".into(),
            debounce_ms: 500,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "sync_tags",
                "projectId": "p1",
                "vendor": "siemens",
                "stCode": "VAR x : INT; END_VAR",
                "debounceMs": 500
            })
        );

        let ping = ClientMessage::Ping.encode().unwrap();
        assert_eq!(ping, r#"{"type":"ping"}"#);
    }

    #[test]
    fn decode_tags_updated() {
        let text = r#"{
            "type": "tags_updated",
            "success": true,
            "projectId": "p1",
            "tags": [{"name": "Motor1", "dataType": "BOOL", "scope": "global"}],
            "parsedCount": 1,
            "timestamp": "2024-01-01T00:00:00Z"
        }"#;
        let msg = ServerMessage::decode(text).unwrap();
        assert_eq!(msg.kind(), EventKind::TagsUpdated);
        let ServerMessage::TagsUpdated { tags, parsed_count, .. } = msg else {
            panic!("wrong variant");
        };
        assert_eq!(parsed_count, 1);
        assert_eq!(tags[0].name, "Motor1");
        assert_eq!(tags[0].data_type.as_deref(), Some("BOOL"));
        assert_eq!(tags[0].extra.get("scope"), Some(&json!("global")));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        assert!(ServerMessage::decode(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn vendor_parse() {
        assert_eq!("Beckhoff".parse::<Vendor>().unwrap(), Vendor::Beckhoff);
        assert!("omron".parse::<Vendor>().is_err());
    }
}
