//! In-flight request tracking and bounded polling.
//!
//! A list view has at most one current request. Starting a new one for the same
//! view cancels the previous token, and a response that arrives for a superseded
//! handle is refused so it can never overwrite fresher results.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{CacheError, CacheResult, ExecutionError};

/// Handle for one in-flight request of a view.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    view: String,
    generation: u64,
    token: CancellationToken,
}

impl RequestHandle {
    /// View the request belongs to.
    #[must_use]
    pub fn view(&self) -> &str {
        &self.view
    }

    /// Monotonic across all views; later requests have larger numbers.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns true once superseded or cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when this request is superseded or cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    fn cancelled_error(&self) -> CacheError {
        CacheError::Execution(ExecutionError::Cancelled {
            view: self.view.clone(),
        })
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    next_generation: u64,
    current: HashMap<String, RequestHandle>,
}

/// Tracks the current request per view.
#[derive(Debug, Default)]
pub struct QueryTracker {
    state: Mutex<TrackerState>,
}

impl QueryTracker {
    /// Create an empty instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CacheResult<MutexGuard<'_, TrackerState>> {
        self.state
            .lock()
            .map_err(|_| CacheError::internal("query tracker lock poisoned"))
    }

    /// Start a request for `view`, cancelling the previous one.
    pub fn begin(&self, view: &str) -> CacheResult<RequestHandle> {
        let mut state = self.lock()?;
        state.next_generation += 1;
        let handle = RequestHandle {
            view: view.to_string(),
            generation: state.next_generation,
            token: CancellationToken::new(),
        };
        if let Some(previous) = state.current.insert(view.to_string(), handle.clone()) {
            previous.token.cancel();
            debug!(view, superseded = previous.generation, "cancelled in-flight request");
        }
        Ok(handle)
    }

    /// Whether `handle` is still the live request of its view.
    pub fn is_current(&self, handle: &RequestHandle) -> CacheResult<bool> {
        let state = self.lock()?;
        Ok(!handle.is_cancelled()
            && state
                .current
                .get(&handle.view)
                .is_some_and(|h| h.generation == handle.generation))
    }

    /// Finish `handle`. Fails with `Cancelled` if it was superseded.
    pub fn complete(&self, handle: &RequestHandle) -> CacheResult<()> {
        let mut state = self.lock()?;
        let current = state
            .current
            .get(&handle.view)
            .is_some_and(|h| h.generation == handle.generation);
        if !current || handle.is_cancelled() {
            trace!(view = %handle.view, generation = handle.generation, "discarding stale response");
            return Err(handle.cancelled_error());
        }
        state.current.remove(&handle.view);
        Ok(())
    }

    /// Cancel the current request of `view`, if any.
    pub fn cancel(&self, view: &str) -> CacheResult<bool> {
        let removed = self.lock()?.current.remove(view);
        Ok(removed.map(|h| h.token.cancel()).is_some())
    }

    /// Cancel every in-flight request.
    pub fn cancel_all(&self) -> CacheResult<()> {
        for (_, handle) in self.lock()?.current.drain() {
            handle.token.cancel();
        }
        Ok(())
    }

    /// Run `fut` as the current request of `view`.
    ///
    /// Resolves to `Cancelled` if a newer request for the same view starts first
    /// or if the response arrives after being superseded.
    pub async fn run<T, F>(&self, view: &str, fut: F) -> CacheResult<T>
    where
        F: Future<Output = CacheResult<T>>,
    {
        let handle = self.begin(view)?;
        let output = tokio::select! {
            biased;
            () = handle.cancelled() => return Err(handle.cancelled_error()),
            out = fut => out,
        };
        self.complete(&handle)?;
        output
    }
}

/// Call `check` every `interval` until it yields `Some`, at most `max_attempts` times.
///
/// The first check runs immediately. Errors from `check` end the loop.
pub async fn poll_until<T, F, Fut>(interval: Duration, max_attempts: u32, mut check: F) -> CacheResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = CacheResult<Option<T>>>,
{
    for attempt in 1..=max_attempts {
        if attempt > 1 {
            tokio::time::sleep(interval).await;
        }
        if let Some(done) = check(attempt).await? {
            debug!(attempt, "poll reached terminal state");
            return Ok(done);
        }
        trace!(attempt, max_attempts, "poll not terminal yet");
    }
    Err(CacheError::Execution(ExecutionError::PollExhausted {
        attempts: max_attempts,
    }))
}
