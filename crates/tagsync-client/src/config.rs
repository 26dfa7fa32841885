//! Client configuration.
//!
//! Every field has a default, so a config file only needs to name what it
//! changes:
//!
//! ```toml
//! api_base_url = "https://plc.example.com/api"
//! ws_url = "wss://plc.example.com/ws/tags"
//! token = "..."
//!
//! [connection]
//! max_attempts = 5
//!
//! [autosave]
//! debounce_ms = 2000
//! ```

use crate::error::{Result, SyncError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Prefix for local fallback keys.
    pub app_namespace: String,
    pub api_base_url: String,
    pub ws_url: String,
    pub token: Option<String>,
    /// Directory for the file-backed fallback cache.
    pub fallback_dir: Option<PathBuf>,
    pub connection: ConnectionConfig,
    pub autosave: AutosaveConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            app_namespace: "plc_editor".to_string(),
            api_base_url: "http://127.0.0.1:8080/api".to_string(),
            ws_url: "ws://127.0.0.1:8081/ws/tags".to_string(),
            token: None,
            fallback_dir: None,
            connection: ConnectionConfig::default(),
            autosave: AutosaveConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection.max_attempts == 0 {
            return Err(SyncError::Config("connection.max_attempts must be at least 1".into()));
        }
        if self.autosave.debounce_ms == 0 {
            return Err(SyncError::Config("autosave.debounce_ms must be positive".into()));
        }
        if self.app_namespace.is_empty() {
            return Err(SyncError::Config("app_namespace cannot be empty".into()));
        }
        Ok(())
    }

    /// The connection settings with the top-level URL and token folded in.
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            url: self.ws_url.clone(),
            token: self.token.clone(),
            policy: self.connection.clone(),
        }
    }
}

/// Reconnection and keepalive policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub keepalive_ms: u64,
    /// Delay before reconnecting after a manual reset.
    pub reset_delay_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            keepalive_ms: 30_000,
            reset_delay_ms: 1000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ConnectionConfig {
    /// Delay before reconnect attempt number `attempt`: `base * 2^attempt`,
    /// capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Everything a connection manager needs.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub url: String,
    /// Sent as the `token` query parameter.
    pub token: Option<String>,
    pub policy: ConnectionConfig,
}

impl ConnectionSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            policy: ConnectionConfig::default(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_policy(mut self, policy: ConnectionConfig) -> Self {
        self.policy = policy;
        self
    }

    /// The URL to dial, with the auth token attached.
    pub fn request_url(&self) -> Result<String> {
        let mut url =
            reqwest::Url::parse(&self.url).map_err(|e| SyncError::Config(format!("{}: {e}", self.url)))?;
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url.into())
    }
}

/// Debounce, retry and versioning policy for autosave.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutosaveConfig {
    pub debounce_ms: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    /// Request an automatic version after this many background saves.
    pub auto_version_every: u32,
    /// ... or once this long has passed since the last automatic version.
    pub auto_version_interval_ms: u64,
    /// Fallback entries older than this are discarded unread.
    pub fallback_max_age_ms: u64,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2000,
            max_retries: 3,
            retry_base_ms: 2000,
            auto_version_every: 10,
            auto_version_interval_ms: 5 * 60 * 1000,
            fallback_max_age_ms: 60 * 60 * 1000,
        }
    }
}

impl AutosaveConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Delay before retry number `attempt` (1-based): 2s, 4s, 8s by default.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_base_ms.saturating_mul(factor))
    }

    pub fn auto_version_interval(&self) -> Duration {
        Duration::from_millis(self.auto_version_interval_ms)
    }

    pub fn fallback_max_age(&self) -> Duration {
        Duration::from_millis(self.fallback_max_age_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let config = ClientConfig::default();
        assert_eq!(config.connection.max_attempts, 5);
        assert_eq!(config.autosave.debounce(), Duration::from_secs(2));
        assert_eq!(config.autosave.fallback_max_age(), Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ClientConfig::from_toml(
            r#"
            app_namespace = "line3"
            token = "secret"

            [connection]
            max_attempts = 8

            [autosave]
            auto_version_every = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.app_namespace, "line3");
        assert_eq!(config.connection.max_attempts, 8);
        assert_eq!(config.connection.base_delay_ms, 1000);
        assert_eq!(config.autosave.auto_version_every, 4);
        assert_eq!(config.autosave.max_retries, 3);
    }

    #[test]
    fn rejects_zero_attempts() {
        let err = ClientConfig::from_toml("[connection]\nmax_attempts = 0").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ConnectionConfig::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(16));
        assert_eq!(policy.backoff(10), Duration::from_secs(30));
    }

    #[test]
    fn retry_delays() {
        let autosave = AutosaveConfig::default();
        let delays: Vec<u64> = (1..=3).map(|n| autosave.retry_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8]);
    }

    #[test]
    fn token_goes_in_query() {
        let settings = ConnectionSettings::new("ws://localhost:9000/ws/tags").with_token("a b");
        assert_eq!(settings.request_url().unwrap(), "ws://localhost:9000/ws/tags?token=a+b");
        assert!(ConnectionSettings::new("not a url").request_url().is_err());
    }
}
