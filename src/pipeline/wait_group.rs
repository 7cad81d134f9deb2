//! Pending-work counter for the pipeline join.
//!
//! Work is registered *before* it is spawned and released when its
//! [`WorkGuard`] drops, so [`WaitGroup::wait`] cannot return while anything
//! registered is still running, including work that panicked.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    pending: AtomicUsize,
    idle: Notify,
}

#[derive(Clone, Default)]
pub struct WaitGroup {
    inner: Arc<Inner>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one unit of work. Hold the guard for as long as the work runs.
    #[must_use = "dropping the guard releases the registration immediately"]
    pub fn register(&self) -> WorkGuard {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        WorkGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Wait until every registered unit has been released.
    pub async fn wait(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            // Subscribe before checking so a release in between is not missed.
            idle.as_mut().enable();

            if self.pending() == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// Registration for one unit of work; released on drop.
pub struct WorkGuard {
    inner: Arc<Inner>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if self.inner.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
