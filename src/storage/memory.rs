//! In-memory storage backend.
//!
//! This module provides the thread-safe in-memory implementation of
//! `EntityStore`. One instance lives for the whole signed-in session.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::RwLock;

use tracing::debug;

use crate::entity::{EntityKey, Fields};
use crate::storage::traits::{EntityStore, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
struct StoreState {
    entities: BTreeMap<EntityKey, Fields>,
    roots: HashMap<EntityKey, usize>,
    dirty: HashSet<EntityKey>,
}

impl StoreState {
    fn is_root(&self, key: &EntityKey) -> bool {
        key.is_root_query() || self.roots.contains_key(key)
    }

    fn reachable(&self) -> HashSet<EntityKey> {
        let mut seen: HashSet<EntityKey> = HashSet::new();
        let mut queue: VecDeque<EntityKey> = self
            .entities
            .keys()
            .filter(|k| self.is_root(k))
            .cloned()
            .collect();
        // Retained keys that are not stored yet still count as roots.
        queue.extend(self.roots.keys().cloned());

        let mut refs = Vec::new();
        while let Some(key) = queue.pop_front() {
            if !seen.insert(key.clone()) {
                continue;
            }
            let Some(fields) = self.entities.get(&key) else {
                continue;
            };
            refs.clear();
            for value in fields.values() {
                value.collect_references(&mut refs);
            }
            for next in refs.drain(..) {
                if !seen.contains(&next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }
}

/// Thread-safe in-memory entity store.
///
/// # Examples
///
/// ```
/// use smartcache::{EntityKey, EntityStore, Fields, InMemoryEntityStore, Value};
///
/// let store = InMemoryEntityStore::new();
/// let key = EntityKey::new("Story", "1");
/// let mut fields = Fields::new();
/// fields.insert("title".to_string(), Value::from("Pricing page"));
/// store.write(&key, fields).unwrap();
///
/// assert!(store.read(&key).unwrap().is_some());
/// assert!(store.read(&EntityKey::new("Story", "2")).unwrap().is_none());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    state: RwLock<StoreState>,
}

impl InMemoryEntityStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities.
    pub fn len(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("store.len"))?;
        Ok(state.entities.len())
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

impl EntityStore for InMemoryEntityStore {
    fn write(&self, key: &EntityKey, fields: Fields) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("store.write"))?;
        let entry = state.entities.entry(key.clone()).or_default();
        for (name, value) in fields {
            entry.insert(name, value);
        }
        state.dirty.insert(key.clone());
        Ok(())
    }

    fn read(&self, key: &EntityKey) -> Result<Option<Fields>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("store.read"))?;
        Ok(state.entities.get(key).cloned())
    }

    fn evict(&self, key: &EntityKey) -> Result<bool, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("store.evict"))?;
        let removed = state.entities.remove(key).is_some();
        if removed {
            debug!(%key, "evicted entity");
            state.dirty.insert(key.clone());
        }
        Ok(removed)
    }

    fn restore(&self, key: &EntityKey, fields: Option<Fields>) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("store.restore"))?;
        match fields {
            Some(fields) => {
                state.entities.insert(key.clone(), fields);
            }
            None => {
                state.entities.remove(key);
            }
        }
        state.dirty.insert(key.clone());
        Ok(())
    }

    fn replace_references(&self, from: &EntityKey, to: &EntityKey) -> Result<usize, StorageError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("store.replace_references"))?;

        let mut changed = Vec::new();
        for (key, fields) in &mut state.entities {
            let mut touched = false;
            for value in fields.values_mut() {
                touched |= value.replace_reference(from, to);
            }
            if touched {
                changed.push(key.clone());
            }
        }

        if let Some(count) = state.roots.remove(from) {
            *state.roots.entry(to.clone()).or_insert(0) += count;
        }

        let n = changed.len();
        state.dirty.extend(changed);
        debug!(%from, %to, entities = n, "replaced references");
        Ok(n)
    }

    fn retain(&self, key: &EntityKey) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("store.retain"))?;
        *state.roots.entry(key.clone()).or_insert(0) += 1;
        Ok(())
    }

    fn release(&self, key: &EntityKey) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("store.release"))?;
        match state.roots.get(key).copied() {
            None => Err(StorageError::NotRetained(key.clone())),
            Some(count) if count <= 1 => {
                state.roots.remove(key);
                Ok(())
            }
            Some(count) => {
                state.roots.insert(key.clone(), count - 1);
                Ok(())
            }
        }
    }

    fn garbage_collect(&self) -> Result<Vec<EntityKey>, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("store.gc"))?;
        let reachable = state.reachable();

        let removed: Vec<EntityKey> = state
            .entities
            .keys()
            .filter(|k| !reachable.contains(*k))
            .cloned()
            .collect();

        for key in &removed {
            state.entities.remove(key);
            state.dirty.insert(key.clone());
        }

        if !removed.is_empty() {
            debug!(removed = removed.len(), "garbage collected entities");
        }
        Ok(removed)
    }

    fn take_dirty(&self) -> Result<HashSet<EntityKey>, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("store.take_dirty"))?;
        Ok(std::mem::take(&mut state.dirty))
    }

    fn keys(&self) -> Result<Vec<EntityKey>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("store.keys"))?;
        Ok(state.entities.keys().cloned().collect())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("store.clear"))?;
        *state = StoreState::default();
        debug!("cleared entity store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::value::Value;

    fn fields(pairs: &[(&str, Value)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_write_merges_field_by_field() {
        let store = InMemoryEntityStore::new();
        let key = EntityKey::new("Story", "1");

        store
            .write(&key, fields(&[("title", Value::from("a")), ("status", Value::from("open"))]))
            .unwrap();
        store.write(&key, fields(&[("status", Value::from("closed"))])).unwrap();

        let got = store.read(&key).unwrap().unwrap();
        assert_eq!(got.get("title"), Some(&Value::from("a")));
        assert_eq!(got.get("status"), Some(&Value::from("closed")));
    }

    #[test]
    fn test_read_missing_is_none_not_default() {
        let store = InMemoryEntityStore::new();
        let key = EntityKey::new("Story", "1");
        store.write(&key, Fields::new()).unwrap();

        // An entity with no fields is distinguishable from an unknown key.
        assert_eq!(store.read(&key).unwrap(), Some(Fields::new()));
        assert_eq!(store.read(&EntityKey::new("Story", "2")).unwrap(), None);
        assert_eq!(store.read_field(&key, "title").unwrap(), None);
    }

    #[test]
    fn test_dirty_tracking() {
        let store = InMemoryEntityStore::new();
        let a = EntityKey::new("Tag", "a");
        let b = EntityKey::new("Tag", "b");
        store.write_field(&a, "name", Value::from("x")).unwrap();
        store.write_field(&b, "name", Value::from("y")).unwrap();
        store.evict(&a).unwrap();

        let dirty = store.take_dirty().unwrap();
        assert!(dirty.contains(&a));
        assert!(dirty.contains(&b));
        assert!(store.take_dirty().unwrap().is_empty());
    }

    #[test]
    fn test_restore_is_exact() {
        let store = InMemoryEntityStore::new();
        let key = EntityKey::new("Comment", "1");
        store
            .write(&key, fields(&[("body", Value::from("hi")), ("extra", Value::Int(1))]))
            .unwrap();

        store.restore(&key, Some(fields(&[("body", Value::from("hi"))]))).unwrap();
        assert_eq!(store.read(&key).unwrap(), Some(fields(&[("body", Value::from("hi"))])));

        store.restore(&key, None).unwrap();
        assert_eq!(store.read(&key).unwrap(), None);
    }

    #[test]
    fn test_garbage_collect_keeps_reachable_and_is_idempotent() {
        let store = InMemoryEntityStore::new();
        let root = EntityKey::root_query();
        let story = EntityKey::new("Story", "1");
        let comment = EntityKey::new("Comment", "1");
        let orphan = EntityKey::new("Comment", "2");
        let retained = EntityKey::new("Tag", "t");

        store
            .write_field(
                &root,
                "stories",
                Value::Connection(Connection::from_edges(vec![story.clone()])),
            )
            .unwrap();
        store
            .write_field(&story, "comments", Value::List(vec![Value::Ref(comment.clone())]))
            .unwrap();
        store.write_field(&comment, "body", Value::from("ok")).unwrap();
        store.write_field(&orphan, "body", Value::from("gone")).unwrap();
        store.write_field(&retained, "name", Value::from("kept")).unwrap();
        store.retain(&retained).unwrap();

        let removed = store.garbage_collect().unwrap();
        assert_eq!(removed, vec![orphan]);
        let after_once = store.keys().unwrap();

        assert!(store.garbage_collect().unwrap().is_empty());
        assert_eq!(store.keys().unwrap(), after_once);
    }

    #[test]
    fn test_release_unretained_is_error() {
        let store = InMemoryEntityStore::new();
        let key = EntityKey::new("Tag", "t");
        assert!(matches!(store.release(&key), Err(StorageError::NotRetained(_))));

        store.retain(&key).unwrap();
        store.retain(&key).unwrap();
        store.release(&key).unwrap();
        store.release(&key).unwrap();
        assert!(store.release(&key).is_err());
    }

    #[test]
    fn test_replace_references_rewrites_connections() {
        let store = InMemoryEntityStore::new();
        let story = EntityKey::new("Story", "1");
        let temp = EntityKey::placeholder("Comment");
        let real = EntityKey::new("Comment", "917");

        store
            .write_field(
                &story,
                "comments",
                Value::Connection(Connection::from_edges(vec![temp.clone()])),
            )
            .unwrap();
        store.write_field(&story, "pinned", Value::Ref(temp.clone())).unwrap();

        assert_eq!(store.replace_references(&temp, &real).unwrap(), 1);
        let fields = store.read(&story).unwrap().unwrap();
        assert_eq!(fields["comments"].as_connection().unwrap().edges(), &[real.clone()]);
        assert_eq!(fields["pinned"], Value::Ref(real));
    }

    #[test]
    fn test_clear() {
        let store = InMemoryEntityStore::new();
        store
            .write_field(&EntityKey::new("Story", "1"), "title", Value::from("x"))
            .unwrap();
        store.clear().unwrap();
        assert!(store.is_empty().unwrap());
        assert!(store.take_dirty().unwrap().is_empty());
    }
}
