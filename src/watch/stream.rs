//! Receiving side of a watch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::{CacheError, CacheResult, ExecutionError};

use super::binding::{WatchId, WatchUpdate};

/// A subscription stream of re-materialized results for one view.
///
/// Dropping this stream attempts best-effort unregistration.
#[derive(Debug)]
pub struct WatchStream {
    watch_id: WatchId,
    rx: Receiver<WatchUpdate>,
    control_tx: Sender<WatchId>,
    unregistered: AtomicBool,
}

impl WatchStream {
    pub(crate) fn new(watch_id: WatchId, rx: Receiver<WatchUpdate>, control_tx: Sender<WatchId>) -> Self {
        Self {
            watch_id,
            rx,
            control_tx,
            unregistered: AtomicBool::new(false),
        }
    }

    /// The watch id backing this stream.
    #[must_use]
    pub const fn watch_id(&self) -> WatchId {
        self.watch_id
    }

    /// Best-effort explicit unregistration.
    ///
    /// Non-blocking and idempotent. The binding layer removes the watch on its
    /// next broadcast.
    pub fn unsubscribe(&self) {
        if self.unregistered.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.control_tx.try_send(self.watch_id);
    }

    /// Receive the next update (blocking).
    pub fn recv(&self) -> CacheResult<WatchUpdate> {
        self.rx.recv().map_err(|_| disconnected())
    }

    /// Receive the next update if one is queued.
    pub fn try_recv(&self) -> CacheResult<Option<WatchUpdate>> {
        match self.rx.try_recv() {
            Ok(update) => Ok(Some(update)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(disconnected()),
        }
    }

    /// Receive the next update with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> CacheResult<WatchUpdate> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => CacheError::Execution(ExecutionError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            RecvTimeoutError::Disconnected => disconnected(),
        })
    }

    /// Drain every queued update, returning the newest.
    pub fn latest(&self) -> Option<WatchUpdate> {
        self.rx.try_iter().last()
    }
}

fn disconnected() -> CacheError {
    CacheError::Execution(ExecutionError::Disconnected {
        path: "watch_stream".to_string(),
    })
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        if !self.unregistered.swap(true, Ordering::AcqRel) {
            let _ = self.control_tx.try_send(self.watch_id);
        }
    }
}
