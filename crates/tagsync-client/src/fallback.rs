//! Local fallback cache for state that could not be saved remotely.
//!
//! Entries are keyed `{namespace}_{resource_id}_fallback` and hold the
//! state, the time it was written and the resource it belongs to.

use crate::error::FallbackError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tagsync_core::now_ms;

type Result<T> = std::result::Result<T, FallbackError>;

/// Key-value storage backing a [`FallbackCache`].
pub trait FallbackStore: Send + Sync + 'static {
    fn read(&self, key: &str) -> Result<Option<String>>;
    fn write(&self, key: &str, value: &str) -> Result<()>;
    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

/// One JSON file per key in a directory.
#[derive(Debug, Clone)]
pub struct FileFallbackStore {
    dir: PathBuf,
}

impl FileFallbackStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        let mut name = String::with_capacity(key.len() + 5);
        for b in key.bytes() {
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
                name.push(b as char);
            } else {
                let _ = write!(name, "%{b:02X}");
            }
        }
        name.push_str(".json");
        self.dir.join(name)
    }
}

impl FallbackStore for FileFallbackStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.path(key)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path(key)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// In-process storage. Clones share entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryFallbackStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryFallbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.keys().cloned().collect()
    }
}

impl FallbackStore for MemoryFallbackStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// A saved copy of unsaved state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackEntry<S> {
    pub state: S,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub resource_id: String,
}

/// Namespaced, age-bounded view over a [`FallbackStore`].
#[derive(Clone)]
pub struct FallbackCache {
    store: Arc<dyn FallbackStore>,
    namespace: String,
}

impl FallbackCache {
    pub fn new(store: impl FallbackStore, namespace: impl Into<String>) -> Self {
        Self {
            store: Arc::new(store),
            namespace: namespace.into(),
        }
    }

    pub fn key(&self, resource_id: &str) -> String {
        format!("{}_{}_fallback", self.namespace, resource_id)
    }

    pub fn write<S: Serialize>(&self, resource_id: &str, state: &S) -> Result<()> {
        let entry = FallbackEntry {
            state,
            timestamp: now_ms(),
            resource_id: resource_id.to_string(),
        };
        let text = serde_json::to_string(&entry)?;
        self.store.write(&self.key(resource_id), &text)?;
        tracing::info!(resource_id, "wrote fallback entry");
        Ok(())
    }

    /// Load the entry for `resource_id` if it is younger than `max_age`.
    ///
    /// Stale, corrupt, or mismatched entries are removed and reported as
    /// absent.
    pub fn load<S: DeserializeOwned>(
        &self,
        resource_id: &str,
        max_age: Duration,
    ) -> Result<Option<FallbackEntry<S>>> {
        let key = self.key(resource_id);
        let Some(text) = self.store.read(&key)? else {
            return Ok(None);
        };
        let entry: FallbackEntry<S> = match serde_json::from_str(&text) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(resource_id, error = %e, "discarding unreadable fallback entry");
                self.store.remove(&key)?;
                return Ok(None);
            }
        };
        if entry.resource_id != resource_id {
            tracing::warn!(resource_id, found = %entry.resource_id, "discarding mismatched fallback entry");
            self.store.remove(&key)?;
            return Ok(None);
        }
        let age = Duration::from_millis(now_ms().saturating_sub(entry.timestamp));
        if age > max_age {
            tracing::debug!(resource_id, ?age, "discarding stale fallback entry");
            self.store.remove(&key)?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    pub fn clear(&self, resource_id: &str) -> Result<()> {
        self.store.remove(&self.key(resource_id))
    }
}

impl std::fmt::Debug for FallbackCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackCache")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn keys_are_namespaced() {
        let store = MemoryFallbackStore::new();
        let a = FallbackCache::new(store.clone(), "plc_editor");
        a.write("p1", &json!({"x": 1})).unwrap();
        a.write("p2", &json!({"x": 2})).unwrap();

        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec!["plc_editor_p1_fallback", "plc_editor_p2_fallback"]);

        let p1: FallbackEntry<Value> = a.load("p1", HOUR).unwrap().unwrap();
        assert_eq!(p1.state, json!({"x": 1}));
        assert_eq!(p1.resource_id, "p1");
    }

    #[test]
    fn stale_entries_are_discarded() {
        let store = MemoryFallbackStore::new();
        let cache = FallbackCache::new(store.clone(), "app");
        let old = FallbackEntry {
            state: json!({"x": 1}),
            timestamp: now_ms() - 2 * 3600 * 1000,
            resource_id: "p1".to_string(),
        };
        store
            .write(&cache.key("p1"), &serde_json::to_string(&old).unwrap())
            .unwrap();

        assert!(cache.load::<Value>("p1", HOUR).unwrap().is_none());
        assert!(store.keys().is_empty());
    }

    #[test]
    fn corrupt_entries_are_discarded() {
        let store = MemoryFallbackStore::new();
        let cache = FallbackCache::new(store.clone(), "app");
        store.write(&cache.key("p1"), "{not json").unwrap();

        assert!(cache.load::<Value>("p1", HOUR).unwrap().is_none());
        assert!(store.keys().is_empty());
    }

    #[test]
    fn file_store_roundtrip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileFallbackStore::new(dir.path().join("fallback")).unwrap();
        let cache = FallbackCache::new(store.clone(), "app");

        cache.write("line/1", &json!({"tags": ["A"]})).unwrap();
        assert!(store.dir().join("app_line%2F1_fallback.json").exists());

        let entry: FallbackEntry<Value> = cache.load("line/1", HOUR).unwrap().unwrap();
        assert_eq!(entry.state, json!({"tags": ["A"]}));

        cache.clear("line/1").unwrap();
        assert!(cache.load::<Value>("line/1", HOUR).unwrap().is_none());
        // Clearing twice is fine.
        cache.clear("line/1").unwrap();
    }
}
