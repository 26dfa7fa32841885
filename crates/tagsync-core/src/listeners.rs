//! Observer registry shared by the connection manager and the autosave
//! pipeline.
//!
//! Listeners are kept as an ordered list of records. Registering the same
//! callback (same `Arc`) twice for the same kind returns the existing
//! handle instead of adding a duplicate.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// A shareable listener callback.
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Identifies one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Record<K, E> {
    id: ListenerId,
    kind: K,
    callback: Listener<E>,
}

struct Registry<K, E> {
    next_id: AtomicU64,
    records: Mutex<Vec<Record<K, E>>>,
}

impl<K, E> Registry<K, E> {
    fn records(&self) -> MutexGuard<'_, Vec<Record<K, E>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fan-out of events of type `E`, filtered by kind `K`.
pub struct Listeners<K, E> {
    registry: Arc<Registry<K, E>>,
}

impl<K, E> Clone for Listeners<K, E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<K, E> Default for Listeners<K, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, E> Listeners<K, E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                records: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.registry.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a registration. Returns whether it was present.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut records = self.registry.records();
        let before = records.len();
        records.retain(|r| r.id != id);
        records.len() != before
    }

    pub fn clear(&self) {
        self.registry.records().clear();
    }
}

impl<K, E> Listeners<K, E>
where
    K: Copy + PartialEq + Send + 'static,
    E: 'static,
{
    /// Register a callback for events of `kind`.
    pub fn add(&self, kind: K, callback: Listener<E>) -> ListenerHandle {
        let mut records = self.registry.records();
        if let Some(existing) = records
            .iter()
            .find(|r| r.kind == kind && Arc::ptr_eq(&r.callback, &callback))
        {
            return self.handle(existing.id);
        }
        let id = ListenerId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        records.push(Record { id, kind, callback });
        self.handle(id)
    }

    /// Register a closure for events of `kind`.
    pub fn on<F>(&self, kind: K, f: F) -> ListenerHandle
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.add(kind, Arc::new(f))
    }

    /// Deliver `event` to every listener registered for `kind`, in
    /// registration order. Returns how many listeners were invoked.
    ///
    /// Callbacks run without the registry lock held, so they may register
    /// or remove listeners. A panicking callback is logged and skipped.
    pub fn emit(&self, kind: K, event: &E) -> usize {
        let targets: Vec<(ListenerId, Listener<E>)> = self
            .registry
            .records()
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| (r.id, r.callback.clone()))
            .collect();

        for (id, callback) in &targets {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::warn!(listener = id.0, "event listener panicked");
            }
        }
        targets.len()
    }

    fn handle(&self, id: ListenerId) -> ListenerHandle {
        let weak: Weak<Registry<K, E>> = Arc::downgrade(&self.registry);
        ListenerHandle {
            id,
            remove: Box::new(move || {
                weak.upgrade().is_some_and(|registry| {
                    let mut records = registry.records();
                    let before = records.len();
                    records.retain(|r| r.id != id);
                    records.len() != before
                })
            }),
        }
    }
}

/// Disposer for a registration.
///
/// Dropping the handle leaves the listener registered; call
/// [`ListenerHandle::dispose`] to remove it.
pub struct ListenerHandle {
    id: ListenerId,
    remove: Box<dyn Fn() -> bool + Send + Sync>,
}

impl ListenerHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the listener. Returns whether it was still registered.
    pub fn dispose(self) -> bool {
        (self.remove)()
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle").field("id", &self.id).finish()
    }
}
