//! Abstract storage trait for the normalized entity store.
//!
//! Every cache mutation (server results, optimistic patches, rollbacks,
//! placeholder substitution) is funneled through this trait. Materialized
//! query results are immutable snapshots and are never patched in place.

use std::collections::HashSet;

use thiserror::Error;

use crate::entity::{EntityKey, Fields};
use crate::value::Value;

/// Errors that can occur during storage operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Entity not found where one was required.
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityKey),

    /// Release called more often than retain.
    #[error("Key is not retained: {0}")]
    NotRetained(EntityKey),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),
}

/// Storage trait for normalized entities.
///
/// # Semantics
/// - `write` merges field-by-field; fields absent from `fields` keep their value
/// - `read` returns `Ok(None)` for an unknown key, never an empty default
/// - every mutating call marks the touched keys dirty until `take_dirty`
pub trait EntityStore: Send + Sync {
    /// Merge `fields` into the entity at `key`, creating it if absent.
    fn write(&self, key: &EntityKey, fields: Fields) -> Result<(), StorageError>;

    /// Get an entity's fields.
    fn read(&self, key: &EntityKey) -> Result<Option<Fields>, StorageError>;

    /// Remove an entity. Returns false if it was not present.
    ///
    /// References elsewhere are left in place and filtered at materialization time.
    fn evict(&self, key: &EntityKey) -> Result<bool, StorageError>;

    /// Replace an entity exactly: `None` removes it, `Some` replaces the whole field map.
    fn restore(&self, key: &EntityKey, fields: Option<Fields>) -> Result<(), StorageError>;

    /// Rewrite every reference to `from` (refs, lists, connection edges) into `to`.
    ///
    /// Returns the number of entities that changed.
    fn replace_references(&self, from: &EntityKey, to: &EntityKey) -> Result<usize, StorageError>;

    /// Add a GC root (refcounted).
    fn retain(&self, key: &EntityKey) -> Result<(), StorageError>;

    /// Drop one GC root reference.
    fn release(&self, key: &EntityKey) -> Result<(), StorageError>;

    /// Remove every entity unreachable from the root set. Returns the removed keys, sorted.
    fn garbage_collect(&self) -> Result<Vec<EntityKey>, StorageError>;

    /// Drain the set of keys touched since the last drain.
    fn take_dirty(&self) -> Result<HashSet<EntityKey>, StorageError>;

    /// All stored keys, sorted.
    fn keys(&self) -> Result<Vec<EntityKey>, StorageError>;

    /// Drop every entity, root, and dirty mark.
    fn clear(&self) -> Result<(), StorageError>;

    /// Read a single field.
    fn read_field(&self, key: &EntityKey, field: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.read(key)?.and_then(|mut fields| fields.remove(field)))
    }

    /// Merge a single field.
    fn write_field(&self, key: &EntityKey, field: &str, value: Value) -> Result<(), StorageError> {
        let mut fields = Fields::new();
        fields.insert(field.to_string(), value);
        self.write(key, fields)
    }

    /// Returns true if the key is stored.
    fn contains(&self, key: &EntityKey) -> Result<bool, StorageError> {
        Ok(self.read(key)?.is_some())
    }
}
