//! # smartcache - optimistic normalized cache for the Smart Edits dashboard
//!
//! Server data is split into entities keyed by `Type:id` and stored once.
//! Views read through query shapes, mutations patch the store before the network
//! answers, and the server's reply either confirms or exactly undoes the patch.
//!
//! ## Core Concepts
//!
//! - **Entity store**: field-level merges, lazy eviction, reachability GC
//! - **Materializer**: resolves a selection against the store, tolerating missing data
//! - **Optimistic patch**: speculative writes with an apply-time snapshot
//! - **Reconciliation**: confirm (placeholder substitution) or exact rollback
//! - **View binding**: watches re-run only when a key they read changes
//! - **Filter state**: canonical, URL-safe table filters
//!
//! ## Usage
//!
//! ```rust,ignore
//! use smartcache::{CacheClient, EntityKey, SelectionSet};
//! use smartcache::mutations::DiscardSuggestion;
//!
//! let client = CacheClient::builder(graphql, ajax).build()?;
//! let view = client.watch(
//!     SelectionSet::parse("status suggestions { title status }")?,
//!     EntityKey::new("Batch", "b1"),
//! )?;
//!
//! // Suggestion 42 leaves the list immediately; it comes back if the server refuses.
//! client
//!     .mutate(&DiscardSuggestion { batch_id: "b1".into(), suggestion_id: "42".into() })
//!     .await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod connection;
pub mod entity;
pub mod error;
pub mod value;

// Store, normalization and queries
pub mod normalize;
pub mod query;
pub mod storage;

// Optimistic lifecycle
pub mod mutations;
pub mod optimistic;
pub mod reconcile;

// Views and URL state
pub mod filter;
pub mod watch;

// Boundary and session
pub mod client;
pub mod config;
pub mod request;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use client::{CacheClient, CacheClientBuilder, MutationOutcome};
pub use config::CacheConfig;
pub use connection::{Connection, PageInfo};
pub use entity::{EntityId, EntityKey, Fields, Typename};
pub use error::{CacheError, CacheResult, ExecutionError, TransportError, ValidationError};
pub use filter::{FilterState, Predicate, RelativeRange, Scalar, UrlState};
pub use mutations::{MutationRequest, MutationSpec};
pub use optimistic::{MutationId, MutationLedger, MutationState, OptimisticApplier, PatchWriter};
pub use query::{Completeness, Materialized, Materializer, ResultNode, SelectionSet};
pub use reconcile::{BatchReport, ReconcileReport, Reconciler, ServerTruth};
pub use request::{poll_until, QueryTracker, RequestHandle};
pub use session::{Credentials, SessionContext, UserProfile};
pub use storage::{EntityStore, InMemoryEntityStore, StorageError};
pub use telemetry::{ErrorSink, RecordingErrorSink, TracingErrorSink};
pub use transport::{AjaxEnvelope, AjaxRequest, AjaxTransport, GraphqlRequest, GraphqlResponse, GraphqlTransport};
pub use value::Value;
pub use watch::{ViewBinding, WatchId, WatchRegistration, WatchStream, WatchUpdate};
