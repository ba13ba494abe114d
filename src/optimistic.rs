//! Optimistic patch application.
//!
//! A patch is written into the store synchronously when a mutation is
//! dispatched, before the network call resolves. The pre-patch values of every
//! affected key are captured first so the patch can be rolled back exactly.
//!
//! Overlapping patches on the same key snapshot in issue order: the second
//! patch's snapshot contains the first patch's speculative values. Rolling the
//! second back restores the first's speculation, not the original. Rolling the
//! first back while the second is pending hands the original values to the
//! second's snapshot instead.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::connection::Connection;
use crate::entity::{EntityKey, Fields};
use crate::error::{CacheError, CacheResult, ExecutionError, ValidationError};
use crate::storage::EntityStore;
use crate::value::Value;

/// Unique identifier for a dispatched mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(Uuid);

impl MutationId {
    /// Create a new random mutation id.
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

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a pending mutation record.
///
/// `Pending -> Confirmed | RolledBack`. Both terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    /// Patch applied, server reply outstanding.
    Pending,
    /// Server truth replaced the speculation.
    Confirmed,
    /// Snapshot restored after a failure.
    RolledBack,
}

impl fmt::Display for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// An applied-but-unconfirmed optimistic patch.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    /// Mutation id.
    pub id: MutationId,
    /// Operation name, for logs.
    pub label: String,
    pub(crate) issue: u64,
    pub(crate) affected: Vec<EntityKey>,
    pub(crate) placeholders: Vec<EntityKey>,
    pub(crate) snapshot: BTreeMap<EntityKey, Option<Fields>>,
}

impl PendingMutation {
    /// Keys declared affected at apply time.
    #[must_use]
    pub fn affected(&self) -> &[EntityKey] {
        &self.affected
    }

    /// Placeholder keys minted by the patch.
    #[must_use]
    pub fn placeholders(&self) -> &[EntityKey] {
        &self.placeholders
    }

    /// Pre-apply value of a key (`Some(None)` = the key did not exist).
    #[must_use]
    pub fn snapshot_of(&self, key: &EntityKey) -> Option<&Option<Fields>> {
        self.snapshot.get(key)
    }

    /// Every key the patch may have touched (affected keys plus placeholders).
    pub(crate) fn gc_roots(&self) -> impl Iterator<Item = &EntityKey> {
        self.affected.iter().chain(self.placeholders.iter())
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    next_issue: u64,
    pending: HashMap<MutationId, PendingMutation>,
    finished: HashMap<MutationId, MutationState>,
    // Issue numbers of pending patches per key.
    claims: HashMap<EntityKey, BTreeSet<u64>>,
    // Issue number of the mutation whose server truth last landed per key.
    committed: HashMap<EntityKey, u64>,
}

/// Shared book-keeping of pending mutations, used by the applier and the reconciler.
#[derive(Debug, Default)]
pub struct MutationLedger {
    state: Mutex<LedgerState>,
}

impl MutationLedger {
    /// An empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CacheResult<MutexGuard<'_, LedgerState>> {
        self.state
            .lock()
            .map_err(|_| CacheError::internal("mutation ledger lock poisoned"))
    }

    /// Current state of a mutation, if known.
    pub fn state(&self, id: MutationId) -> CacheResult<Option<MutationState>> {
        let state = self.lock()?;
        if state.pending.contains_key(&id) {
            return Ok(Some(MutationState::Pending));
        }
        Ok(state.finished.get(&id).copied())
    }

    /// Number of pending mutations.
    pub fn pending_count(&self) -> CacheResult<usize> {
        Ok(self.lock()?.pending.len())
    }

    /// Ids of pending mutations, in issue order.
    pub fn pending_ids(&self) -> CacheResult<Vec<MutationId>> {
        let state = self.lock()?;
        let mut ids: Vec<(u64, MutationId)> = state.pending.values().map(|p| (p.issue, p.id)).collect();
        ids.sort_unstable();
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    /// Forget everything (sign-out).
    pub fn clear(&self) -> CacheResult<()> {
        *self.lock()? = LedgerState::default();
        Ok(())
    }

    /// Remove a pending record for reconciliation.
    pub(crate) fn take(&self, id: MutationId) -> CacheResult<PendingMutation> {
        let mut state = self.lock()?;
        let Some(record) = state.pending.remove(&id) else {
            return Err(match state.finished.get(&id) {
                Some(done) => ExecutionError::MutationNotPending {
                    id,
                    state: done.to_string(),
                },
                None => ExecutionError::MutationNotFound { id },
            }
            .into());
        };

        for key in record.gc_roots() {
            if let Some(issues) = state.claims.get_mut(key) {
                issues.remove(&record.issue);
                if issues.is_empty() {
                    state.claims.remove(key);
                }
            }
        }
        Ok(record)
    }

    /// Record the terminal state of a reconciled mutation.
    pub(crate) fn finish(&self, id: MutationId, outcome: MutationState) -> CacheResult<()> {
        self.lock()?.finished.insert(id, outcome);
        Ok(())
    }

    /// Returns true if server truth issued at `issue` would clobber newer state for `key`.
    pub(crate) fn is_stale(&self, key: &EntityKey, issue: u64) -> CacheResult<bool> {
        let state = self.lock()?;
        let newer_pending = state
            .claims
            .get(key)
            .is_some_and(|issues| issues.range(issue + 1..).next().is_some());
        let newer_committed = state.committed.get(key).is_some_and(|&c| c > issue);
        Ok(newer_pending || newer_committed)
    }

    /// Hand a rolled-back mutation's pre-apply value of `key` to the next newer
    /// pending patch on that key.
    ///
    /// That patch snapshotted the failed speculation; after the hand-off its own
    /// rollback lands on state no failed mutation wrote. Nothing is handed off
    /// when server truth issued in between already landed on `key`.
    pub(crate) fn rebase_snapshots(
        &self,
        key: &EntityKey,
        issue: u64,
        snapshot: &Option<Fields>,
    ) -> CacheResult<Option<MutationId>> {
        let mut state = self.lock()?;
        let Some(next) = state
            .claims
            .get(key)
            .and_then(|issues| issues.range(issue + 1..).next().copied())
        else {
            return Ok(None);
        };
        if state.committed.get(key).is_some_and(|&c| c > issue && c < next) {
            return Ok(None);
        }
        let Some(record) = state.pending.values_mut().find(|r| r.issue == next) else {
            return Ok(None);
        };
        record.snapshot.insert(key.clone(), snapshot.clone());
        Ok(Some(record.id))
    }

    /// Rewrite references to a substituted placeholder inside pending snapshots,
    /// so a later rollback never restores a reference to an evicted placeholder.
    pub(crate) fn substitute_in_snapshots(&self, from: &EntityKey, to: &EntityKey) -> CacheResult<usize> {
        let mut state = self.lock()?;
        let mut changed = 0;
        for record in state.pending.values_mut() {
            for fields in record.snapshot.values_mut().flatten() {
                for value in fields.values_mut() {
                    if value.replace_reference(from, to) {
                        changed += 1;
                    }
                }
            }
        }
        Ok(changed)
    }

    /// Record that server truth issued at `issue` landed on `key`.
    pub(crate) fn mark_committed(&self, key: &EntityKey, issue: u64) -> CacheResult<()> {
        let mut state = self.lock()?;
        let slot = state.committed.entry(key.clone()).or_insert(issue);
        *slot = (*slot).max(issue);
        Ok(())
    }
}

/// Restricted store handle passed to patch functions.
///
/// Only keys declared affected, and placeholders minted through this writer,
/// may be written.
pub struct PatchWriter<'a> {
    store: &'a dyn EntityStore,
    declared: HashSet<EntityKey>,
    placeholders: Vec<EntityKey>,
    max_placeholders: usize,
}

impl<'a> PatchWriter<'a> {
    fn check(&self, key: &EntityKey) -> CacheResult<()> {
        if self.declared.contains(key) || self.placeholders.contains(key) {
            Ok(())
        } else {
            Err(ValidationError::UndeclaredKey { key: key.clone() }.into())
        }
    }

    /// Read any key (reads are unrestricted).
    pub fn read(&self, key: &EntityKey) -> CacheResult<Option<Fields>> {
        Ok(self.store.read(key)?)
    }

    /// Merge speculative fields.
    pub fn write(&mut self, key: &EntityKey, fields: Fields) -> CacheResult<()> {
        self.check(key)?;
        Ok(self.store.write(key, fields)?)
    }

    /// Merge one speculative field.
    pub fn write_field(&mut self, key: &EntityKey, field: &str, value: impl Into<Value>) -> CacheResult<()> {
        self.check(key)?;
        Ok(self.store.write_field(key, field, value.into())?)
    }

    /// Speculatively remove an entity.
    pub fn evict(&mut self, key: &EntityKey) -> CacheResult<bool> {
        self.check(key)?;
        Ok(self.store.evict(key)?)
    }

    /// Mint a placeholder entity of the given type.
    pub fn placeholder(&mut self, typename: &str) -> CacheResult<EntityKey> {
        if self.placeholders.len() >= self.max_placeholders {
            return Err(ValidationError::TooManyPlaceholders {
                max: self.max_placeholders,
            }
            .into());
        }
        let key = EntityKey::placeholder(typename);
        self.placeholders.push(key.clone());
        Ok(key)
    }

    /// Remove `item` from the connection or reference list at `owner.field`.
    ///
    /// Returns the position it occupied, or `None` if it was not there.
    pub fn remove_edge(&mut self, owner: &EntityKey, field: &str, item: &EntityKey) -> CacheResult<Option<usize>> {
        self.check(owner)?;
        let Some(mut value) = self.store.read_field(owner, field)? else {
            return Ok(None);
        };
        let removed = match &mut value {
            Value::Connection(conn) => conn.remove(item),
            Value::List(items) => {
                let pos = items.iter().position(|v| v.as_ref_key() == Some(item));
                if let Some(i) = pos {
                    items.remove(i);
                }
                pos
            }
            _ => return Err(not_a_connection(owner, field)),
        };
        if removed.is_some() {
            self.store.write_field(owner, field, value)?;
        }
        Ok(removed)
    }

    /// Insert `item` at `index` (clamped) into the connection or reference list at
    /// `owner.field`, creating an empty connection if the field is absent.
    ///
    /// Returns false if the item was already present.
    pub fn insert_edge(&mut self, owner: &EntityKey, field: &str, index: usize, item: EntityKey) -> CacheResult<bool> {
        self.check(owner)?;
        let mut value = self
            .store
            .read_field(owner, field)?
            .unwrap_or_else(|| Value::Connection(Connection::default()));
        let inserted = match &mut value {
            Value::Connection(conn) => conn.insert(index, item),
            Value::List(items) => {
                if items.iter().any(|v| v.as_ref_key() == Some(&item)) {
                    false
                } else {
                    let index = index.min(items.len());
                    items.insert(index, Value::Ref(item));
                    true
                }
            }
            _ => return Err(not_a_connection(owner, field)),
        };
        if inserted {
            self.store.write_field(owner, field, value)?;
        }
        Ok(inserted)
    }

    /// Append `item` to the end of the collection at `owner.field`.
    pub fn append_edge(&mut self, owner: &EntityKey, field: &str, item: EntityKey) -> CacheResult<bool> {
        self.insert_edge(owner, field, usize::MAX, item)
    }
}

fn not_a_connection(owner: &EntityKey, field: &str) -> CacheError {
    ExecutionError::NotAConnection {
        key: owner.clone(),
        field: field.to_string(),
    }
    .into()
}

/// Applies optimistic patches and records rollback snapshots.
pub struct OptimisticApplier {
    store: Arc<dyn EntityStore>,
    ledger: Arc<MutationLedger>,
    max_placeholders: usize,
}

impl OptimisticApplier {
    /// `max_placeholders` bounds the placeholders one patch may mint (at least 1).
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>, ledger: Arc<MutationLedger>, max_placeholders: usize) -> Self {
        Self {
            store,
            ledger,
            max_placeholders: max_placeholders.max(1),
        }
    }

    /// Snapshot `affected_keys`, then run `patch` against the store.
    ///
    /// If `patch` fails, everything it wrote is restored before the error is
    /// returned and no pending record is created.
    pub fn apply<F>(
        &self,
        id: MutationId,
        label: &str,
        affected_keys: &[EntityKey],
        patch: F,
    ) -> CacheResult<Vec<EntityKey>>
    where
        F: FnOnce(&mut PatchWriter<'_>) -> CacheResult<()>,
    {
        let mut ledger = self.ledger.lock()?;
        if ledger.pending.contains_key(&id) || ledger.finished.contains_key(&id) {
            return Err(ValidationError::DuplicateMutation { id }.into());
        }

        let mut snapshot = BTreeMap::new();
        for key in affected_keys {
            snapshot.insert(key.clone(), self.store.read(key)?);
        }

        let mut writer = PatchWriter {
            store: self.store.as_ref(),
            declared: affected_keys.iter().cloned().collect(),
            placeholders: Vec::new(),
            max_placeholders: self.max_placeholders,
        };

        let outcome = patch(&mut writer);
        let placeholders = writer.placeholders;
        for key in &placeholders {
            snapshot.insert(key.clone(), None);
        }

        if let Err(err) = outcome {
            for (key, fields) in snapshot {
                self.store.restore(&key, fields)?;
            }
            debug!(mutation = %id, label, error = %err, "optimistic patch aborted");
            return Err(err);
        }

        let issue = ledger.next_issue;
        ledger.next_issue += 1;

        let record = PendingMutation {
            id,
            label: label.to_string(),
            issue,
            affected: affected_keys.to_vec(),
            placeholders: placeholders.clone(),
            snapshot,
        };
        for key in record.gc_roots() {
            self.store.retain(key)?;
            ledger.claims.entry(key.clone()).or_default().insert(issue);
        }
        ledger.pending.insert(id, record);

        info!(
            mutation = %id,
            label,
            affected = affected_keys.len(),
            placeholders = placeholders.len(),
            "applied optimistic patch"
        );
        Ok(placeholders)
    }
}
