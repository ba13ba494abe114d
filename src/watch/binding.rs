//! Watch registry and change broadcast.
//!
//! Every watch remembers the dependency set of its last materialization. A
//! broadcast re-materializes only the watches whose dependencies intersect the
//! dirty keys and delivers a result only when it differs from the previous one.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::entity::EntityKey;
use crate::error::{CacheError, CacheResult};
use crate::query::{Materialized, Materializer, SelectionSet};
use crate::storage::EntityStore;

use super::stream::WatchStream;

/// Unique identifier for a registered watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchId(Uuid);

impl WatchId {
    /// Create a new random watch id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for WatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch:{}", self.0)
    }
}

/// A re-materialized result delivered to a watcher.
#[derive(Debug, Clone)]
pub struct WatchUpdate {
    /// Watch the update belongs to.
    pub watch_id: WatchId,
    /// Monotonic per-watch counter, starting at 1 for the first update after registration.
    pub revision: u64,
    /// The new materialization.
    pub result: Materialized,
}

/// Result of registering a watch.
#[derive(Debug)]
pub struct WatchRegistration {
    /// Id to unregister with.
    pub watch_id: WatchId,
    /// The materialization at registration time.
    pub initial: Materialized,
    /// Updates after `initial`.
    pub stream: WatchStream,
}

/// Configuration for [`ViewBinding`].
#[derive(Debug, Clone)]
pub struct ViewBindingConfig {
    /// Per-watch stream buffer capacity.
    pub stream_capacity: usize,
    /// Max queued unregister requests.
    pub control_queue_capacity: usize,
}

impl Default for ViewBindingConfig {
    fn default() -> Self {
        Self {
            stream_capacity: 64,
            control_queue_capacity: 1024,
        }
    }
}

struct WatchEntry {
    selection: SelectionSet,
    root: EntityKey,
    last: Materialized,
    revision: u64,
    tx: Sender<WatchUpdate>,
}

/// Keeps registered views in sync with the entity store.
pub struct ViewBinding {
    store: Arc<dyn EntityStore>,
    cfg: ViewBindingConfig,
    watches: Mutex<HashMap<WatchId, WatchEntry>>,
    control_tx: Sender<WatchId>,
    control_rx: Receiver<WatchId>,
    dropped_updates: AtomicU64,
}

impl fmt::Debug for ViewBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewBinding")
            .field("cfg", &self.cfg)
            .field("dropped_updates", &self.dropped_updates())
            .finish_non_exhaustive()
    }
}

impl ViewBinding {
    /// Create an empty instance.
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>, cfg: ViewBindingConfig) -> Self {
        let (control_tx, control_rx) = bounded(cfg.control_queue_capacity.max(1));
        Self {
            store,
            cfg,
            watches: Mutex::new(HashMap::new()),
            control_tx,
            control_rx,
            dropped_updates: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> CacheResult<MutexGuard<'_, HashMap<WatchId, WatchEntry>>> {
        self.watches
            .lock()
            .map_err(|_| CacheError::internal("watch registry lock poisoned"))
    }

    /// Register a watch on `selection` rooted at `root`.
    ///
    /// The root is retained in the store for as long as the watch is registered.
    pub fn watch(&self, selection: SelectionSet, root: EntityKey) -> CacheResult<WatchRegistration> {
        let initial = Materializer::new(self.store.as_ref()).materialize(&selection, &root)?;
        let watch_id = WatchId::new();
        let (tx, rx) = bounded(self.cfg.stream_capacity.max(1));

        self.store.retain(&root)?;
        self.lock()?.insert(
            watch_id,
            WatchEntry {
                selection,
                root: root.clone(),
                last: initial.clone(),
                revision: 0,
                tx,
            },
        );
        debug!(%watch_id, %root, "watch registered");

        Ok(WatchRegistration {
            watch_id,
            initial,
            stream: WatchStream::new(watch_id, rx, self.control_tx.clone()),
        })
    }

    /// Remove a watch immediately. Returns `false` if it was not registered.
    pub fn unwatch(&self, watch_id: WatchId) -> CacheResult<bool> {
        let removed = self.lock()?.remove(&watch_id);
        Ok(match removed {
            Some(entry) => {
                self.release_root(watch_id, &entry.root);
                true
            }
            None => false,
        })
    }

    /// Number of registered watches, after applying pending unregistrations.
    pub fn active_watches(&self) -> CacheResult<usize> {
        self.drain_control()?;
        Ok(self.lock()?.len())
    }

    /// Updates discarded because a watcher's buffer was full.
    pub fn dropped_updates(&self) -> u64 {
        self.dropped_updates.load(Ordering::Relaxed)
    }

    /// The last result delivered (or the initial one) for a watch.
    pub fn current(&self, watch_id: WatchId) -> CacheResult<Option<Materialized>> {
        Ok(self.lock()?.get(&watch_id).map(|entry| entry.last.clone()))
    }

    /// Re-materialize every watch that depends on a dirty key.
    ///
    /// Returns the number of updates delivered.
    pub fn broadcast(&self, dirty: &HashSet<EntityKey>) -> CacheResult<usize> {
        self.drain_control()?;
        if dirty.is_empty() {
            return Ok(0);
        }

        let materializer = Materializer::new(self.store.as_ref());
        let mut delivered = 0;
        let mut disconnected = Vec::new();

        let mut watches = self.lock()?;
        for (watch_id, entry) in watches.iter_mut() {
            if entry.last.dependencies.is_disjoint(dirty) {
                continue;
            }

            let next = materializer.materialize_with_previous(&entry.selection, &entry.root, Some(&entry.last))?;
            if next.data == entry.last.data && next.completeness == entry.last.completeness {
                entry.last.dependencies = next.dependencies;
                trace!(%watch_id, "watch result unchanged");
                continue;
            }

            entry.revision += 1;
            entry.last = next;
            let update = WatchUpdate {
                watch_id: *watch_id,
                revision: entry.revision,
                result: entry.last.clone(),
            };
            match entry.tx.try_send(update) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped_updates.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => disconnected.push(*watch_id),
            }
        }

        for watch_id in disconnected {
            if let Some(entry) = watches.remove(&watch_id) {
                self.release_root(watch_id, &entry.root);
            }
        }

        Ok(delivered)
    }

    /// Drop every watch without releasing roots. Used after the store is cleared.
    pub fn clear(&self) -> CacheResult<()> {
        self.lock()?.clear();
        while self.control_rx.try_recv().is_ok() {}
        Ok(())
    }

    fn drain_control(&self) -> CacheResult<()> {
        let pending: Vec<WatchId> = self.control_rx.try_iter().collect();
        if pending.is_empty() {
            return Ok(());
        }
        let mut watches = self.lock()?;
        for watch_id in pending {
            if let Some(entry) = watches.remove(&watch_id) {
                self.release_root(watch_id, &entry.root);
            }
        }
        Ok(())
    }

    fn release_root(&self, watch_id: WatchId, root: &EntityKey) {
        if self.store.release(root).is_err() {
            debug!(%watch_id, %root, "watch root was no longer retained");
        } else {
            debug!(%watch_id, %root, "watch unregistered");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::entity::Fields;
    use crate::query::ResultNode;
    use crate::storage::InMemoryEntityStore;
    use crate::value::Value;

    fn store_with_suggestion() -> Arc<InMemoryEntityStore> {
        let store = Arc::new(InMemoryEntityStore::new());
        let mut fields = Fields::new();
        fields.insert("status".to_string(), Value::from("open"));
        store.write(&EntityKey::new("Suggestion", "42"), fields).unwrap();
        store.take_dirty().unwrap();
        store
    }

    fn status_shape() -> SelectionSet {
        SelectionSet::new().scalar("status")
    }

    fn status_of(update: &Materialized) -> Option<String> {
        match update.data.path("status") {
            Some(ResultNode::Scalar(Value::String(s))) => Some(s.clone()),
            _ => None,
        }
    }

    #[test]
    fn initial_result_is_returned_on_registration() {
        let store = store_with_suggestion();
        let binding = ViewBinding::new(store, ViewBindingConfig::default());
        let reg = binding
            .watch(status_shape(), EntityKey::new("Suggestion", "42"))
            .unwrap();
        assert_eq!(status_of(&reg.initial).as_deref(), Some("open"));
        assert_eq!(binding.active_watches().unwrap(), 1);
    }

    #[test]
    fn change_to_dependency_is_delivered() {
        let store = store_with_suggestion();
        let binding = ViewBinding::new(store.clone(), ViewBindingConfig::default());
        let key = EntityKey::new("Suggestion", "42");
        let reg = binding.watch(status_shape(), key.clone()).unwrap();

        store.write_field(&key, "status", Value::from("discarded")).unwrap();
        let dirty = store.take_dirty().unwrap();
        assert_eq!(binding.broadcast(&dirty).unwrap(), 1);

        let update = reg.stream.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(update.revision, 1);
        assert_eq!(status_of(&update.result).as_deref(), Some("discarded"));
    }

    #[test]
    fn unrelated_change_is_not_delivered() {
        let store = store_with_suggestion();
        let binding = ViewBinding::new(store.clone(), ViewBindingConfig::default());
        let reg = binding
            .watch(status_shape(), EntityKey::new("Suggestion", "42"))
            .unwrap();

        store
            .write_field(&EntityKey::new("Suggestion", "43"), "status", Value::from("open"))
            .unwrap();
        let dirty = store.take_dirty().unwrap();
        assert_eq!(binding.broadcast(&dirty).unwrap(), 0);
        assert!(reg.stream.try_recv().unwrap().is_none());
    }

    #[test]
    fn identical_rewrite_is_not_delivered() {
        let store = store_with_suggestion();
        let binding = ViewBinding::new(store.clone(), ViewBindingConfig::default());
        let key = EntityKey::new("Suggestion", "42");
        let reg = binding.watch(status_shape(), key.clone()).unwrap();

        store.write_field(&key, "status", Value::from("open")).unwrap();
        let dirty = store.take_dirty().unwrap();
        assert_eq!(binding.broadcast(&dirty).unwrap(), 0);
        assert!(reg.stream.try_recv().unwrap().is_none());
    }

    #[test]
    fn dropping_stream_unregisters_and_releases_root() {
        let store = store_with_suggestion();
        let binding = ViewBinding::new(store.clone(), ViewBindingConfig::default());
        let key = EntityKey::new("Suggestion", "42");
        let reg = binding.watch(status_shape(), key.clone()).unwrap();

        assert!(store.garbage_collect().unwrap().is_empty());
        drop(reg);
        assert_eq!(binding.active_watches().unwrap(), 0);
        assert_eq!(store.garbage_collect().unwrap(), vec![key]);
    }

    #[test]
    fn full_buffer_counts_dropped_updates() {
        let store = store_with_suggestion();
        let cfg = ViewBindingConfig {
            stream_capacity: 1,
            ..ViewBindingConfig::default()
        };
        let binding = ViewBinding::new(store.clone(), cfg);
        let key = EntityKey::new("Suggestion", "42");
        let reg = binding.watch(status_shape(), key.clone()).unwrap();

        for status in ["a", "b", "c"] {
            store.write_field(&key, "status", Value::from(status)).unwrap();
            let dirty = store.take_dirty().unwrap();
            binding.broadcast(&dirty).unwrap();
        }

        assert_eq!(binding.dropped_updates(), 2);
        let current = binding.current(reg.watch_id).unwrap().unwrap();
        assert_eq!(status_of(&current).as_deref(), Some("c"));
    }
}
