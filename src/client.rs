//! The cache client: one entry point wiring store, mutations, views and transports.
//!
//! A typical mutation runs as follows:
//! 1. local validation (nothing is touched on failure),
//! 2. the optimistic patch is applied and broadcast before any network I/O,
//! 3. the request is awaited,
//! 4. the pending record is confirmed or rolled back and the result broadcast.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value as Json};
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::entity::{EntityKey, Fields};
use crate::error::{CacheError, CacheResult, ExecutionError};
use crate::filter::FilterState;
use crate::mutations::{InviteMembers, MutationRequest, MutationSpec};
use crate::normalize::{field_key, normalize};
use crate::optimistic::{MutationId, MutationLedger, OptimisticApplier};
use crate::query::{Materialized, Materializer, SelectionSet};
use crate::reconcile::{BatchReport, ReconcileReport, Reconciler};
use crate::request::{poll_until, QueryTracker};
use crate::session::SessionContext;
use crate::storage::{EntityStore, InMemoryEntityStore};
use crate::telemetry::{ErrorSink, TracingErrorSink};
use crate::transport::{AjaxTransport, GraphqlRequest, GraphqlTransport};
use crate::value::Value;
use crate::watch::{ViewBinding, WatchRegistration};

/// A confirmed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOutcome {
    /// Id the mutation was applied under.
    pub id: MutationId,
    /// Real keys that replaced the patch's placeholders, in creation order.
    pub created: Vec<EntityKey>,
    /// What the confirmation wrote, evicted, or skipped as stale.
    pub report: ReconcileReport,
}

/// Builder for [`CacheClient`].
pub struct CacheClientBuilder {
    cfg: CacheConfig,
    graphql: Arc<dyn GraphqlTransport>,
    ajax: Arc<dyn AjaxTransport>,
    store: Option<Arc<dyn EntityStore>>,
    session: Option<Arc<SessionContext>>,
    errors: Option<Arc<dyn ErrorSink>>,
}

impl CacheClientBuilder {
    /// Replace the default configuration.
    #[must_use]
    pub fn config(mut self, cfg: CacheConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// Use `store` instead of a fresh in-memory store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share an existing session.
    #[must_use]
    pub fn session(mut self, session: Arc<SessionContext>) -> Self {
        self.session = Some(session);
        self
    }

    /// Where background failures go. Defaults to [`TracingErrorSink`].
    #[must_use]
    pub fn error_sink(mut self, errors: Arc<dyn ErrorSink>) -> Self {
        self.errors = Some(errors);
        self
    }

    /// Validate the configuration and assemble the client.
    pub fn build(self) -> CacheResult<CacheClient> {
        self.cfg.validate()?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryEntityStore::new()) as Arc<dyn EntityStore>);
        let ledger = Arc::new(MutationLedger::new());
        let errors = self
            .errors
            .unwrap_or_else(|| Arc::new(TracingErrorSink) as Arc<dyn ErrorSink>);

        Ok(CacheClient {
            applier: OptimisticApplier::new(
                Arc::clone(&store),
                Arc::clone(&ledger),
                self.cfg.max_placeholders_per_mutation,
            ),
            reconciler: Reconciler::new(Arc::clone(&store), Arc::clone(&ledger)).with_error_sink(Arc::clone(&errors)),
            binding: ViewBinding::new(Arc::clone(&store), self.cfg.view_binding()),
            tracker: QueryTracker::new(),
            session: self.session.unwrap_or_default(),
            errors,
            graphql: self.graphql,
            ajax: self.ajax,
            cfg: self.cfg,
            store,
            ledger,
        })
    }
}

/// Normalized cache with optimistic mutations and live views.
pub struct CacheClient {
    cfg: CacheConfig,
    store: Arc<dyn EntityStore>,
    ledger: Arc<MutationLedger>,
    applier: OptimisticApplier,
    reconciler: Reconciler,
    binding: ViewBinding,
    tracker: QueryTracker,
    session: Arc<SessionContext>,
    errors: Arc<dyn ErrorSink>,
    graphql: Arc<dyn GraphqlTransport>,
    ajax: Arc<dyn AjaxTransport>,
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient")
            .field("cfg", &self.cfg)
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

impl CacheClient {
    /// Start building a client over the given transports.
    #[must_use]
    pub fn builder(graphql: Arc<dyn GraphqlTransport>, ajax: Arc<dyn AjaxTransport>) -> CacheClientBuilder {
        CacheClientBuilder {
            cfg: CacheConfig::default(),
            graphql,
            ajax,
            store: None,
            session: None,
            errors: None,
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.cfg
    }

    /// The normalized entity store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// Pending and finished mutations.
    #[must_use]
    pub fn ledger(&self) -> &MutationLedger {
        &self.ledger
    }

    /// Session state: user, credentials, loading flags.
    #[must_use]
    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    /// Registered watches.
    #[must_use]
    pub fn binding(&self) -> &ViewBinding {
        &self.binding
    }

    /// Current request per view.
    #[must_use]
    pub fn tracker(&self) -> &QueryTracker {
        &self.tracker
    }

    /// Materialize `selection` rooted at `root` once.
    pub fn read_query(&self, selection: &SelectionSet, root: &EntityKey) -> CacheResult<Materialized> {
        Ok(Materializer::new(self.store.as_ref()).materialize(selection, root)?)
    }

    /// Register a live view.
    pub fn watch(&self, selection: SelectionSet, root: EntityKey) -> CacheResult<WatchRegistration> {
        self.binding.watch(selection, root)
    }

    /// Deliver pending store changes to watchers. Returns the number of updates sent.
    pub fn publish(&self) -> CacheResult<usize> {
        let dirty = self.store.take_dirty()?;
        if dirty.is_empty() {
            return Ok(0);
        }
        self.binding.broadcast(&dirty)
    }

    /// Normalize a query payload and store it under `ROOT_QUERY.field(args)`.
    pub fn write_query_result(&self, field: &str, args: Option<&Json>, payload: &Json) -> CacheResult<Value> {
        let normalized = normalize(payload)?;
        for (key, fields) in normalized.entities {
            self.store.write(&key, fields)?;
        }
        self.store
            .write_field(&EntityKey::root_query(), &field_key(field, args), normalized.value.clone())?;
        self.publish()?;
        Ok(normalized.value)
    }

    /// Merge the next page of a connection field. Returns how many new edges were added.
    pub fn append_page(&self, owner: &EntityKey, field: &str, page: &Json) -> CacheResult<usize> {
        let normalized = normalize(page)?;
        let Value::Connection(next) = normalized.value else {
            return Err(ExecutionError::NotAConnection {
                key: owner.clone(),
                field: field.to_string(),
            }
            .into());
        };
        for (key, fields) in normalized.entities {
            self.store.write(&key, fields)?;
        }

        let (merged, added) = match self.store.read_field(owner, field)? {
            Some(Value::Connection(mut current)) => {
                let added = current.append_page(next);
                (current, added)
            }
            Some(_) => {
                return Err(ExecutionError::NotAConnection {
                    key: owner.clone(),
                    field: field.to_string(),
                }
                .into())
            }
            None => {
                let added = next.len();
                (next, added)
            }
        };
        self.store.write_field(owner, field, Value::Connection(merged))?;
        debug!(%owner, field, added, "appended page");
        self.publish()?;
        Ok(added)
    }

    /// Drop an entity locally (e.g. after a live-socket delete).
    pub fn evict(&self, key: &EntityKey) -> CacheResult<bool> {
        let removed = self.store.evict(key)?;
        self.publish()?;
        Ok(removed)
    }

    /// Collect unreachable entities.
    pub fn gc(&self) -> CacheResult<Vec<EntityKey>> {
        let collected = self.store.garbage_collect()?;
        if !collected.is_empty() {
            debug!(collected = collected.len(), "garbage collected");
            self.publish()?;
        }
        Ok(collected)
    }

    /// Run a mutation end to end.
    ///
    /// The optimistic patch is visible to watchers before the request is sent. On
    /// any failure the patch is rolled back and the error returned; an auth
    /// failure additionally clears the session credentials.
    pub async fn mutate<M: MutationSpec + ?Sized>(&self, mutation: &M) -> CacheResult<MutationOutcome> {
        mutation.validate()?;
        let id = MutationId::new();
        let placeholders = self.apply(id, mutation)?;
        self.settle(mutation, id, &placeholders).await
    }

    /// Run independent mutations.
    ///
    /// Every mutation is validated before anything is applied. Members then run
    /// one at a time, so each snapshot is taken after its predecessor settled and
    /// one member's rollback can never undo a sibling that succeeded.
    pub async fn mutate_batch<M: MutationSpec>(&self, mutations: &[M]) -> CacheResult<BatchReport> {
        for mutation in mutations {
            mutation.validate()?;
        }

        let mut report = BatchReport::default();
        for mutation in mutations {
            let id = MutationId::new();
            let settled = match self.apply(id, mutation) {
                Ok(placeholders) => self.settle(mutation, id, &placeholders).await,
                Err(err) => Err(err),
            };
            match settled {
                Ok(_) => report.succeeded.push(id),
                Err(err) => report.failed.push((id, err)),
            }
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "batch settled"
        );
        Ok(report)
    }

    /// Validate and send a bulk invite, one independent mutation per address.
    pub async fn invite_members(&self, invite: InviteMembers) -> CacheResult<BatchReport> {
        let invites = invite.into_invites()?;
        self.mutate_batch(&invites).await
    }

    fn apply<M: MutationSpec + ?Sized>(&self, id: MutationId, mutation: &M) -> CacheResult<Vec<EntityKey>> {
        let placeholders = self
            .applier
            .apply(id, mutation.label(), &mutation.affected_keys(), |patch| mutation.optimistic(patch))?;
        self.publish()?;
        Ok(placeholders)
    }

    async fn settle<M: MutationSpec + ?Sized>(
        &self,
        mutation: &M,
        id: MutationId,
        placeholders: &[EntityKey],
    ) -> CacheResult<MutationOutcome> {
        let response = self.dispatch(mutation.request(placeholders)).await;
        let truth = response.and_then(|data| mutation.reconcile(placeholders, &data));

        let outcome = match truth {
            Ok(truth) => self.reconciler.confirm(id, truth).map(|report| {
                let created = placeholders
                    .iter()
                    .filter_map(|temp| {
                        report
                            .substituted
                            .iter()
                            .find(|(from, _)| from == temp)
                            .map(|(_, to)| to.clone())
                    })
                    .collect();
                MutationOutcome { id, created, report }
            }),
            Err(err) => {
                if err.is_auth() {
                    if let Err(session_err) = self.session.on_auth_failure() {
                        self.errors.report("auth_failure", &session_err);
                    }
                }
                if let Err(rollback_err) = self.reconciler.rollback(id, &err) {
                    self.errors.report("rollback", &rollback_err);
                }
                Err(err)
            }
        };

        self.publish()?;
        if self.cfg.gc_after_reconcile {
            self.gc()?;
        }
        outcome
    }

    async fn dispatch(&self, request: MutationRequest) -> CacheResult<Json> {
        match request {
            MutationRequest::Graphql(request) => Ok(self.graphql.execute(request).await?.into_data()?),
            MutationRequest::Ajax(mut request) => {
                request.nonce = self.session.nonce()?;
                let action = request.action.clone();
                Ok(self.ajax.post(request).await?.into_result(&action)?)
            }
        }
    }

    /// A list query whose variables carry `filters`, with relative dates resolved now.
    pub fn filtered_request(
        operation_name: &str,
        query: &str,
        filters: &FilterState,
    ) -> CacheResult<GraphqlRequest> {
        let variables = json!({ "filters": filters.to_variables(Utc::now())? });
        Ok(GraphqlRequest::new(operation_name, query).with_variables(variables))
    }

    /// Fetch a list for `view` and store `data[field]` under `ROOT_QUERY.field`.
    ///
    /// Starting another fetch for the same view cancels this one; a cancelled or
    /// superseded fetch never writes to the store.
    pub async fn fetch_list(&self, view: &str, field: &str, request: GraphqlRequest) -> CacheResult<Value> {
        self.session.set_loading(view, true)?;
        let fetched = self
            .tracker
            .run(view, async { Ok::<_, CacheError>(self.graphql.execute(request).await?.into_data()?) })
            .await;

        let data = match fetched {
            Ok(data) => data,
            Err(err) => {
                if is_cancelled(&err) {
                    debug!(view, "list fetch superseded");
                } else {
                    self.session.set_loading(view, false)?;
                    if err.is_auth() {
                        self.session.on_auth_failure()?;
                    }
                }
                return Err(err);
            }
        };

        self.session.set_loading(view, false)?;
        let payload = data.get(field).ok_or_else(|| ExecutionError::MalformedPayload {
            reason: format!("missing '{field}' in response"),
        })?;
        self.write_query_result(field, None, payload)
    }

    /// Poll the latest suggestion batch of a story until it differs from `known_batch`.
    ///
    /// Each poll stores the story it received. Returns the new batch key.
    pub async fn await_new_batch(&self, story_id: &str, known_batch: Option<&str>) -> CacheResult<EntityKey> {
        let story = EntityKey::new("Story", story_id);
        poll_until(self.cfg.poll_interval(), self.cfg.poll_max_attempts, |attempt| {
            let request = GraphqlRequest::new(
                "LatestBatch",
                "query LatestBatch($storyId: ID!) { story(id: $storyId) { __typename id latestBatch { __typename id status } } }",
            )
            .with_variables(json!({ "storyId": story_id }));
            let story = story.clone();
            async move {
                let data = self.graphql.execute(request).await?.into_data()?;
                let payload = data.get("story").unwrap_or(&Json::Null);
                let normalized = normalize(payload)?;
                for (key, fields) in normalized.entities {
                    self.store.write(&key, fields)?;
                }
                self.publish()?;

                let latest = self
                    .store
                    .read_field(&story, "latestBatch")?
                    .and_then(|v| v.as_ref_key().cloned());
                debug!(%story, attempt, ?latest, "polled latest batch");
                Ok::<_, CacheError>(latest.filter(|batch| known_batch.map_or(true, |known| batch.id.to_string() != known)))
            }
        })
        .await
    }

    /// Report a background failure without interrupting the caller.
    pub fn report_background(&self, context: &str, err: &CacheError) {
        self.errors.report(context, err);
    }

    /// Tear down all session-scoped state.
    pub fn sign_out(&self) -> CacheResult<()> {
        self.tracker.cancel_all()?;
        self.binding.clear()?;
        self.ledger.clear()?;
        self.store.clear()?;
        self.session.sign_out()?;
        info!("signed out, cache cleared");
        Ok(())
    }

    /// Seed an entity directly (bootstrapped page data, live-socket pushes).
    pub fn write_entity(&self, key: &EntityKey, fields: Fields) -> CacheResult<()> {
        self.store.write(key, fields)?;
        self.publish()?;
        Ok(())
    }
}

fn is_cancelled(err: &CacheError) -> bool {
    matches!(err, CacheError::Execution(ExecutionError::Cancelled { .. }))
}
