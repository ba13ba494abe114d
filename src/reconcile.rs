//! Reconciliation of optimistic patches with server results.
//!
//! Every pending mutation ends in exactly one of two terminal states:
//! - `Confirmed`: authoritative fields overwrite the speculative ones and
//!   placeholder keys are substituted by the real keys.
//! - `RolledBack`: the apply-time snapshot is restored exactly.
//!
//! Server truth for a key is discarded when a newer optimistic patch is still
//! pending on that key, or when a newer mutation's truth already landed. The
//! same rule holds for rollback: a key owned by newer state keeps its value,
//! and the snapshot moves to the next pending patch on that key instead.

use std::sync::Arc;

use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::entity::{EntityKey, Fields};
use crate::error::{CacheError, CacheResult};
use crate::normalize::normalize;
use crate::optimistic::{MutationId, MutationLedger, MutationState, PendingMutation};
use crate::storage::{EntityStore, StorageError};
use crate::telemetry::{ErrorSink, TracingErrorSink};

/// Authoritative result of a mutation, in store terms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerTruth {
    writes: Vec<(EntityKey, Fields)>,
    evictions: Vec<EntityKey>,
    substitutions: Vec<(EntityKey, EntityKey)>,
}

impl ServerTruth {
    /// Truth with no writes, evictions, or substitutions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Authoritative fields for `key`.
    #[must_use]
    pub fn write(mut self, key: EntityKey, fields: Fields) -> Self {
        self.writes.push((key, fields));
        self
    }

    /// Server confirmed `key` is gone.
    #[must_use]
    pub fn evict(mut self, key: EntityKey) -> Self {
        self.evictions.push(key);
        self
    }

    /// Placeholder `temp` is the server entity `real`.
    #[must_use]
    pub fn substitute(mut self, temp: EntityKey, real: EntityKey) -> Self {
        self.substitutions.push((temp, real));
        self
    }

    /// Every entity in a GraphQL response tree becomes an authoritative write.
    pub fn from_response(data: &Json) -> CacheResult<Self> {
        let normalized = normalize(data)?;
        Ok(Self {
            writes: normalized.entities.into_iter().collect(),
            evictions: Vec::new(),
            substitutions: Vec::new(),
        })
    }

    /// Appends another truth's operations.
    #[must_use]
    pub fn merge(mut self, other: ServerTruth) -> Self {
        self.writes.extend(other.writes);
        self.evictions.extend(other.evictions);
        self.substitutions.extend(other.substitutions);
        self
    }

    /// Returns true if nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.evictions.is_empty() && self.substitutions.is_empty()
    }
}

/// What a confirmation actually changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Keys whose authoritative fields were written.
    pub written: Vec<EntityKey>,
    /// Keys evicted on the server's word.
    pub evicted: Vec<EntityKey>,
    /// Keys skipped because newer state exists.
    pub stale: Vec<EntityKey>,
    /// Placeholder substitutions performed.
    pub substituted: Vec<(EntityKey, EntityKey)>,
}

/// Outcome of a batch of independent mutations.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Confirmed members, in dispatch order.
    pub succeeded: Vec<MutationId>,
    /// Rolled-back members with the error that caused it.
    pub failed: Vec<(MutationId, CacheError)>,
}

impl BatchReport {
    /// No member failed.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Moves pending mutations into their terminal state.
pub struct Reconciler {
    store: Arc<dyn EntityStore>,
    ledger: Arc<MutationLedger>,
    errors: Arc<dyn ErrorSink>,
}

impl Reconciler {
    /// Reconciler that logs background failures through `tracing`.
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>, ledger: Arc<MutationLedger>) -> Self {
        Self {
            store,
            ledger,
            errors: Arc::new(TracingErrorSink),
        }
    }

    /// Route failures that must not abort reconciliation to `errors`.
    #[must_use]
    pub fn with_error_sink(mut self, errors: Arc<dyn ErrorSink>) -> Self {
        self.errors = errors;
        self
    }

    /// Confirm a pending mutation with the server's result.
    pub fn confirm(&self, id: MutationId, truth: ServerTruth) -> CacheResult<ReconcileReport> {
        let record = self.ledger.take(id)?;
        self.release_roots(&record);

        let mut report = ReconcileReport::default();

        for (temp, real) in truth.substitutions {
            if let Some(fields) = self.store.read(&temp)? {
                if !self.store.contains(&real)? {
                    self.store.write(&real, fields)?;
                }
            }
            self.store.replace_references(&temp, &real)?;
            self.ledger.substitute_in_snapshots(&temp, &real)?;
            self.store.evict(&temp)?;
            report.substituted.push((temp, real));
        }

        for (key, fields) in truth.writes {
            if self.ledger.is_stale(&key, record.issue)? {
                warn!(mutation = %id, %key, "discarding stale server fields");
                report.stale.push(key);
                continue;
            }
            self.store.write(&key, fields)?;
            self.ledger.mark_committed(&key, record.issue)?;
            report.written.push(key);
        }

        for key in truth.evictions {
            if self.ledger.is_stale(&key, record.issue)? {
                warn!(mutation = %id, %key, "discarding stale server eviction");
                report.stale.push(key);
                continue;
            }
            self.store.evict(&key)?;
            self.ledger.mark_committed(&key, record.issue)?;
            report.evicted.push(key);
        }

        self.ledger.finish(id, MutationState::Confirmed)?;
        info!(
            mutation = %id,
            label = %record.label,
            written = report.written.len(),
            stale = report.stale.len(),
            "mutation confirmed"
        );
        Ok(report)
    }

    /// Restore the apply-time snapshot of a pending mutation.
    ///
    /// Keys that a newer pending patch or newer server truth owns are left as
    /// they are and returned; their snapshot is handed to the next pending
    /// patch on the key.
    pub fn rollback(&self, id: MutationId, reason: &CacheError) -> CacheResult<Vec<EntityKey>> {
        let record = self.ledger.take(id)?;
        self.release_roots(&record);

        let mut kept = Vec::new();
        for (key, fields) in &record.snapshot {
            if self.ledger.is_stale(key, record.issue)? {
                let heir = self.ledger.rebase_snapshots(key, record.issue, fields)?;
                debug!(mutation = %id, %key, heir = ?heir, "newer state owns key, not restoring");
                kept.push(key.clone());
                continue;
            }
            self.store.restore(key, fields.clone())?;
        }

        self.ledger.finish(id, MutationState::RolledBack)?;
        warn!(
            mutation = %id,
            label = %record.label,
            restored = record.snapshot.len() - kept.len(),
            kept = kept.len(),
            error = %reason,
            "mutation rolled back"
        );
        Ok(kept)
    }

    fn release_roots(&self, record: &PendingMutation) {
        for key in record.gc_roots() {
            match self.store.release(key) {
                // The store was cleared since apply (sign-out).
                Ok(()) | Err(StorageError::NotRetained(_)) => {}
                Err(err) => self.errors.report("release_roots", &err),
            }
        }
    }
}
