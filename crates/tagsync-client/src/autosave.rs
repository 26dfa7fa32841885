//! Debounced autosave with retry, local fallback and version snapshots.
//!
//! Every mutation restarts a debounce timer; when it fires the latest
//! state is sent as a background save. At most one save is in flight per
//! pipeline. Background failures retry with exponential backoff; a manual
//! failure, or a background failure with no retries left, is reported to
//! the caller and the state is written to the local fallback cache.
//!
//! States are compared by their serialized JSON value, so two instances
//! with the same content are equal regardless of identity.

use crate::config::AutosaveConfig;
use crate::error::{Result, StoreError, SyncError};
use crate::fallback::FallbackCache;
use crate::store::RemoteStore;
use crate::timer::ScheduledTask;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tagsync_core::{ListenerHandle, ListenerId, Listeners, RollbackOutcome, VersionSnapshot, merge_patch};
use tokio::time::Instant;

/// State a pipeline can own.
pub trait Persistable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Persistable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveKind {
    Background,
    Manual,
}

/// What a persist attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// The state was written.
    Saved,
    /// The state already matched the last persisted state; nothing was sent.
    Unchanged,
    /// Another save was in flight; this one will be retried after it.
    Deferred,
    /// The pipeline was reloaded or rolled back since the save was
    /// requested. Nothing was recorded locally.
    Superseded,
}

/// Result of [`AutosavePipeline::save_with_message`].
#[derive(Debug, Clone, PartialEq)]
pub struct SaveReport {
    pub outcome: PersistOutcome,
    /// The version created, if the snapshot request succeeded.
    pub version: Option<u64>,
    pub version_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutosaveStatus {
    pub has_unsaved_changes: bool,
    pub is_saving: bool,
    pub last_saved_at: Option<SystemTime>,
    pub last_error: Option<String>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AutosaveEventKind {
    Saved,
    SaveFailed,
    VersionCreated,
    VersionFailed,
    Recovered,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AutosaveEvent {
    Saved {
        manual: bool,
    },
    SaveFailed {
        manual: bool,
        error: String,
        will_retry: bool,
    },
    VersionCreated {
        version: u64,
        message: Option<String>,
    },
    VersionFailed {
        error: String,
        message: Option<String>,
    },
    /// Unsaved state was restored from the fallback cache.
    Recovered {
        written_at_ms: u64,
    },
}

impl AutosaveEvent {
    pub fn kind(&self) -> AutosaveEventKind {
        match self {
            AutosaveEvent::Saved { .. } => AutosaveEventKind::Saved,
            AutosaveEvent::SaveFailed { .. } => AutosaveEventKind::SaveFailed,
            AutosaveEvent::VersionCreated { .. } => AutosaveEventKind::VersionCreated,
            AutosaveEvent::VersionFailed { .. } => AutosaveEventKind::VersionFailed,
            AutosaveEvent::Recovered { .. } => AutosaveEventKind::Recovered,
        }
    }
}

struct Inner<S> {
    current: S,
    /// Serialized form of the last state the store acknowledged.
    last_persisted: Option<Value>,
    has_unsaved_changes: bool,
    is_saving: bool,
    last_saved_at: Option<SystemTime>,
    last_error: Option<String>,
    retry_count: u32,
    saves_since_version: u32,
    last_auto_version: Instant,
    debounce: Option<ScheduledTask>,
    retry: Option<ScheduledTask>,
    /// A background save fired while another save was in flight.
    rerun: bool,
    /// Bumped by reload and rollback. Saves started under an older epoch
    /// are discarded.
    epoch: u64,
}

struct Shared<S, R> {
    resource_id: String,
    config: AutosaveConfig,
    store: R,
    fallback: FallbackCache,
    inner: Mutex<Inner<S>>,
    /// Held for the duration of a store call.
    flight: tokio::sync::Mutex<()>,
    listeners: Listeners<AutosaveEventKind, AutosaveEvent>,
}

impl<S, R> Shared<S, R>
where
    S: Persistable,
    R: RemoteStore<S>,
{
    fn lock(&self) -> MutexGuard<'_, Inner<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: AutosaveEvent) {
        self.listeners.emit(event.kind(), &event);
    }

    fn schedule_save(self: &Arc<Self>, delay: Duration, epoch: u64) -> ScheduledTask {
        let weak = Arc::downgrade(self);
        ScheduledTask::after(delay, async move {
            if let Some(shared) = weak.upgrade()
                && let Err(e) = shared.persist_snapshot(SaveKind::Background, Some(epoch)).await
            {
                tracing::debug!(resource_id = %shared.resource_id, error = %e, "background save failed");
            }
        })
    }

    /// Apply `f` to the current state and re-arm the debounce timer if the
    /// result differs from what was last persisted.
    fn mutate<F>(self: &Arc<Self>, f: F) -> Result<bool>
    where
        F: FnOnce(&mut S) -> Result<()>,
    {
        let mut inner = self.lock();
        f(&mut inner.current)?;
        let value = serde_json::to_value(&inner.current)?;
        let dirty = inner.last_persisted.as_ref() != Some(&value);
        inner.has_unsaved_changes = dirty;
        inner.retry = None;
        let epoch = inner.epoch;
        inner.debounce = dirty.then(|| self.schedule_save(self.config.debounce(), epoch));
        Ok(dirty)
    }

    async fn persist(self: &Arc<Self>, kind: SaveKind) -> Result<PersistOutcome> {
        self.persist_snapshot(kind, None).await.map(|(outcome, _)| outcome)
    }

    /// Persist the current state. Returns the outcome and the state that
    /// is now known to be stored.
    ///
    /// `expected` is the epoch a scheduled save was armed under; the save
    /// is dropped if the pipeline has been reloaded or rolled back since.
    async fn persist_snapshot(
        self: &Arc<Self>,
        kind: SaveKind,
        expected: Option<u64>,
    ) -> Result<(PersistOutcome, S)> {
        let _flight = match kind {
            SaveKind::Manual => self.flight.lock().await,
            SaveKind::Background => match self.flight.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    let mut inner = self.lock();
                    if expected.is_some_and(|e| e != inner.epoch) {
                        return Ok((PersistOutcome::Superseded, inner.current.clone()));
                    }
                    inner.rerun = true;
                    return Ok((PersistOutcome::Deferred, inner.current.clone()));
                }
            },
        };

        let (snapshot, value, epoch) = {
            let mut inner = self.lock();
            if expected.is_some_and(|e| e != inner.epoch) {
                tracing::debug!(resource_id = %self.resource_id, "dropping save armed before reload");
                return Ok((PersistOutcome::Superseded, inner.current.clone()));
            }
            if kind == SaveKind::Manual {
                inner.debounce = None;
            }
            let value = serde_json::to_value(&inner.current)?;
            if inner.last_persisted.as_ref() == Some(&value) {
                inner.has_unsaved_changes = false;
                return Ok((PersistOutcome::Unchanged, inner.current.clone()));
            }
            inner.is_saving = true;
            (inner.current.clone(), value, inner.epoch)
        };

        tracing::debug!(resource_id = %self.resource_id, ?kind, "saving");
        let result = match kind {
            SaveKind::Background => self.store.autosave(&self.resource_id, &snapshot).await,
            SaveKind::Manual => self.store.save(&self.resource_id, &snapshot).await,
        };

        match result {
            Ok(()) => {
                let outcome = if self.on_saved(kind, &snapshot, value, epoch) {
                    PersistOutcome::Saved
                } else {
                    PersistOutcome::Superseded
                };
                Ok((outcome, snapshot))
            }
            Err(e) => Err(self.on_failed(kind, e, epoch)),
        }
    }

    /// Record a completed save. Returns false, leaving the pipeline
    /// untouched, if it was reloaded or rolled back while the request ran.
    fn on_saved(self: &Arc<Self>, kind: SaveKind, snapshot: &S, value: Value, epoch: u64) -> bool {
        let auto_version = {
            let mut inner = self.lock();
            inner.is_saving = false;
            if inner.epoch != epoch {
                tracing::debug!(resource_id = %self.resource_id, ?kind, "discarding superseded save response");
                return false;
            }
            // The state may have moved on while the request was in flight.
            let current = serde_json::to_value(&inner.current).ok();
            inner.has_unsaved_changes = current.as_ref() != Some(&value);
            inner.last_persisted = Some(value);
            inner.last_saved_at = Some(SystemTime::now());
            inner.last_error = None;
            inner.retry_count = 0;
            inner.retry = None;
            self.rearm_if_deferred(&mut inner);
            kind == SaveKind::Background && self.auto_version_due(&mut inner)
        };
        tracing::info!(resource_id = %self.resource_id, ?kind, "saved");
        self.emit(AutosaveEvent::Saved {
            manual: kind == SaveKind::Manual,
        });

        if auto_version {
            let shared = self.clone();
            let snapshot = snapshot.clone();
            tokio::spawn(async move {
                let _ = shared.request_version(None, &snapshot).await;
            });
        }
        true
    }

    fn on_failed(self: &Arc<Self>, kind: SaveKind, e: StoreError, epoch: u64) -> SyncError {
        let error = e.to_string();
        let (will_retry, pending) = {
            let mut inner = self.lock();
            inner.is_saving = false;
            if inner.epoch != epoch {
                tracing::debug!(resource_id = %self.resource_id, ?kind, %error, "discarding superseded save failure");
                return SyncError::Persistence(e);
            }
            inner.last_error = Some(error.clone());
            let will_retry = kind == SaveKind::Background && inner.retry_count < self.config.max_retries;
            if will_retry {
                inner.retry_count += 1;
                let delay = self.config.retry_delay(inner.retry_count);
                tracing::warn!(resource_id = %self.resource_id, attempt = inner.retry_count, ?delay, %error, "save failed, retrying");
                inner.retry = Some(self.schedule_save(delay, epoch));
                inner.rerun = false;
                (true, None)
            } else {
                inner.retry_count = 0;
                inner.retry = None;
                self.rearm_if_deferred(&mut inner);
                tracing::warn!(resource_id = %self.resource_id, ?kind, %error, "save failed");
                (false, Some(inner.current.clone()))
            }
        };

        if let Some(state) = pending
            && let Err(fe) = self.fallback.write(&self.resource_id, &state)
        {
            tracing::error!(resource_id = %self.resource_id, error = %fe, "failed to write fallback entry");
        }
        self.emit(AutosaveEvent::SaveFailed {
            manual: kind == SaveKind::Manual,
            error,
            will_retry,
        });
        SyncError::Persistence(e)
    }

    fn rearm_if_deferred(self: &Arc<Self>, inner: &mut Inner<S>) {
        if std::mem::take(&mut inner.rerun) && inner.has_unsaved_changes && inner.retry.is_none() {
            let epoch = inner.epoch;
            inner.debounce = Some(self.schedule_save(self.config.debounce(), epoch));
        }
    }

    /// Count a background save and report whether an automatic version is
    /// due. The counter resets whenever one is due.
    fn auto_version_due(&self, inner: &mut Inner<S>) -> bool {
        inner.saves_since_version += 1;
        let every = self.config.auto_version_every;
        let due = (every > 0 && inner.saves_since_version >= every)
            || inner.last_auto_version.elapsed() >= self.config.auto_version_interval();
        if due {
            inner.saves_since_version = 0;
            inner.last_auto_version = Instant::now();
        }
        due
    }

    /// Best effort: failures are logged and emitted, never retried.
    async fn request_version(&self, message: Option<&str>, state: &S) -> Result<u64> {
        match self.store.create_version(&self.resource_id, message, state).await {
            Ok(version) => {
                tracing::info!(resource_id = %self.resource_id, version, "version created");
                self.emit(AutosaveEvent::VersionCreated {
                    version,
                    message: message.map(str::to_string),
                });
                Ok(version)
            }
            Err(e) => {
                tracing::warn!(resource_id = %self.resource_id, error = %e, "version request failed");
                self.emit(AutosaveEvent::VersionFailed {
                    error: e.to_string(),
                    message: message.map(str::to_string),
                });
                Err(SyncError::Versioning(e))
            }
        }
    }

    fn cancel_timers(&self) {
        let mut inner = self.lock();
        inner.debounce = None;
        inner.retry = None;
    }

    /// Cancel timers and invalidate every save started so far.
    fn supersede(&self, inner: &mut Inner<S>) {
        inner.epoch += 1;
        inner.debounce = None;
        inner.retry = None;
        inner.rerun = false;
        inner.retry_count = 0;
    }
}

/// Owns one resource's client-side state and keeps it persisted.
///
/// Must be used from within a Tokio runtime. Dropping the pipeline cancels
/// its timers and writes any unsaved state to the fallback cache.
pub struct AutosavePipeline<S, R>
where
    S: Persistable,
    R: RemoteStore<S>,
{
    shared: Arc<Shared<S, R>>,
}

impl<S, R> AutosavePipeline<S, R>
where
    S: Persistable,
    R: RemoteStore<S>,
{
    /// Create a pipeline whose `initial` state is already persisted.
    pub fn new(
        resource_id: impl Into<String>,
        initial: S,
        store: R,
        fallback: FallbackCache,
        config: AutosaveConfig,
    ) -> Result<Self> {
        let persisted = serde_json::to_value(&initial)?;
        Ok(Self {
            shared: Arc::new(Shared {
                resource_id: resource_id.into(),
                config,
                store,
                fallback,
                inner: Mutex::new(Inner {
                    current: initial,
                    last_persisted: Some(persisted),
                    has_unsaved_changes: false,
                    is_saving: false,
                    last_saved_at: None,
                    last_error: None,
                    retry_count: 0,
                    saves_since_version: 0,
                    last_auto_version: Instant::now(),
                    debounce: None,
                    retry: None,
                    rerun: false,
                    epoch: 0,
                }),
                flight: tokio::sync::Mutex::new(()),
                listeners: Listeners::new(),
            }),
        })
    }

    /// Create a pipeline and replay any recent fallback entry for it.
    pub async fn open(
        resource_id: impl Into<String>,
        initial: S,
        store: R,
        fallback: FallbackCache,
        config: AutosaveConfig,
    ) -> Result<Self> {
        let pipeline = Self::new(resource_id, initial, store, fallback, config)?;
        if let Err(e) = pipeline.recover().await {
            tracing::warn!(resource_id = %pipeline.resource_id(), error = %e, "fallback recovery did not save");
        }
        Ok(pipeline)
    }

    /// Load a fallback entry younger than the configured age bound, make it
    /// the current state and try to persist it once. The entry is removed
    /// afterwards whatever the outcome, so a bad payload is replayed at
    /// most once.
    pub async fn recover(&self) -> Result<Option<PersistOutcome>> {
        let shared = &self.shared;
        let max_age = shared.config.fallback_max_age();
        let Some(entry) = shared.fallback.load::<S>(&shared.resource_id, max_age)? else {
            return Ok(None);
        };
        {
            let mut inner = shared.lock();
            inner.current = entry.state;
            inner.has_unsaved_changes = true;
        }
        tracing::info!(resource_id = %shared.resource_id, "recovered unsaved state from fallback");
        shared.emit(AutosaveEvent::Recovered {
            written_at_ms: entry.timestamp,
        });

        let result = shared.persist(SaveKind::Background).await;
        if let Err(e) = shared.fallback.clear(&shared.resource_id) {
            tracing::warn!(resource_id = %shared.resource_id, error = %e, "failed to clear fallback entry");
        }
        result.map(Some)
    }

    pub fn resource_id(&self) -> &str {
        &self.shared.resource_id
    }

    /// A copy of the current in-memory state.
    pub fn state(&self) -> S {
        self.shared.lock().current.clone()
    }

    pub fn status(&self) -> AutosaveStatus {
        let inner = self.shared.lock();
        AutosaveStatus {
            has_unsaved_changes: inner.has_unsaved_changes,
            is_saving: inner.is_saving,
            last_saved_at: inner.last_saved_at,
            last_error: inner.last_error.clone(),
            retry_count: inner.retry_count,
        }
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.shared.lock().has_unsaved_changes
    }

    /// Mutate the state in place. Returns whether it now differs from the
    /// last persisted state.
    pub fn update<F>(&self, f: F) -> Result<bool>
    where
        F: FnOnce(&mut S),
    {
        self.shared.mutate(|state| {
            f(state);
            Ok(())
        })
    }

    /// Replace the state with a function of the previous one.
    pub fn update_with<F>(&self, f: F) -> Result<bool>
    where
        F: FnOnce(&S) -> S,
    {
        self.shared.mutate(|state| {
            *state = f(state);
            Ok(())
        })
    }

    pub fn replace(&self, state: S) -> Result<bool> {
        self.shared.mutate(|current| {
            *current = state;
            Ok(())
        })
    }

    /// Merge a partial JSON object into the state (RFC 7386). The state is
    /// left untouched if the merged document no longer fits `S`.
    pub fn merge(&self, patch: Value) -> Result<bool> {
        self.shared.mutate(|state| {
            let mut doc = serde_json::to_value(&*state)?;
            merge_patch(&mut doc, &patch);
            *state = serde_json::from_value(doc)?;
            Ok(())
        })
    }

    /// Save now, bypassing the debounce timer.
    pub async fn save_now(&self) -> Result<PersistOutcome> {
        self.shared.persist(SaveKind::Manual).await
    }

    /// Save now and then request a named version. A failed version request
    /// is reported in the returned [`SaveReport`], not as an error.
    pub async fn save_with_message(&self, message: &str) -> Result<SaveReport> {
        let (outcome, snapshot) = self.shared.persist_snapshot(SaveKind::Manual, None).await?;
        if outcome == PersistOutcome::Superseded {
            return Ok(SaveReport {
                outcome,
                version: None,
                version_error: None,
            });
        }
        let (version, version_error) = match self.shared.request_version(Some(message), &snapshot).await {
            Ok(version) => (Some(version), None),
            Err(e) => (None, Some(e.to_string())),
        };
        Ok(SaveReport {
            outcome,
            version,
            version_error,
        })
    }

    /// Install a state fetched from the server as both current and
    /// persisted. Pending saves are dropped and the response of a save
    /// already in flight is ignored.
    pub fn reload(&self, state: S) -> Result<()> {
        let value = serde_json::to_value(&state)?;
        let mut inner = self.shared.lock();
        self.shared.supersede(&mut inner);
        inner.current = state;
        inner.last_persisted = Some(value);
        inner.has_unsaved_changes = false;
        Ok(())
    }

    pub async fn version_history(&self) -> Result<Vec<VersionSnapshot>> {
        self.shared
            .store
            .version_history(&self.shared.resource_id)
            .await
            .map_err(SyncError::Versioning)
    }

    /// Roll the server back to `version`. Pending local saves are dropped
    /// and a save already in flight completes before the rollback is sent,
    /// so neither can overwrite the restored state. Call [`reload`] with
    /// the server's state afterwards.
    ///
    /// [`reload`]: AutosavePipeline::reload
    pub async fn rollback(&self, version: u64) -> Result<RollbackOutcome> {
        {
            let mut inner = self.shared.lock();
            self.shared.supersede(&mut inner);
        }
        let _flight = self.shared.flight.lock().await;
        let outcome = self
            .shared
            .store
            .rollback(&self.shared.resource_id, version)
            .await
            .map_err(SyncError::Versioning)?;
        tracing::info!(
            resource_id = %self.shared.resource_id,
            rolled_back_to = outcome.rolled_back_to,
            new_version = outcome.new_version,
            "rolled back"
        );
        Ok(outcome)
    }

    pub async fn delete_version(&self, version: u64) -> Result<()> {
        self.shared
            .store
            .delete_version(&self.shared.resource_id, version)
            .await
            .map_err(SyncError::Versioning)
    }

    pub fn on<F>(&self, kind: AutosaveEventKind, f: F) -> ListenerHandle
    where
        F: Fn(&AutosaveEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.on(kind, f)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    /// Cancel timers and keep any unsaved state in the fallback cache.
    pub fn close(&self) {
        self.shared.cancel_timers();
        let unsaved = {
            let inner = self.shared.lock();
            inner.has_unsaved_changes.then(|| inner.current.clone())
        };
        if let Some(state) = unsaved
            && let Err(e) = self.shared.fallback.write(&self.shared.resource_id, &state)
        {
            tracing::error!(resource_id = %self.shared.resource_id, error = %e, "failed to write fallback entry");
        }
    }
}

impl<S, R> Drop for AutosavePipeline<S, R>
where
    S: Persistable,
    R: RemoteStore<S>,
{
    fn drop(&mut self) {
        self.close();
    }
}
