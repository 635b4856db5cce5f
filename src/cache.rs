//! Cached view of which queues currently hold eligible work.
//!
//! Scheduler-triggered dispatch runs fire for every configured queue on
//! every tick, and most ticks find nothing to do. The set of active queue
//! names is computed at most once per window; every probe inside the window
//! answers from the cached set. Staleness is bounded by the window: a job
//! enqueued right after a refresh waits at most one window before a
//! scheduler run sees it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use rustc_hash::FxHashSet;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::JobStore;

/// Default refresh window for the process-wide cache.
pub const DEFAULT_CACHE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Default)]
struct CachedQueues {
    queues: FxHashSet<String>,
    refreshed_at: Option<Instant>,
}

impl CachedQueues {
    fn is_stale(&self, window: Duration) -> bool {
        self.refreshed_at.map_or(true, |at| at.elapsed() >= window)
    }
}

/// Shared queue-activity cache.
///
/// One instance lives for the whole process: created lazily on first use via
/// [`QueueActivityCache::shared`], refreshed on demand whenever a probe finds
/// it stale, never torn down. Standalone instances can be built with
/// [`QueueActivityCache::new`] when isolation matters, as in tests.
pub struct QueueActivityCache {
    window: Duration,
    inner: RwLock<CachedQueues>,
}

impl QueueActivityCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: RwLock::new(CachedQueues::default()),
        }
    }

    /// The process-wide instance, using [`DEFAULT_CACHE_WINDOW`].
    pub fn shared() -> Arc<QueueActivityCache> {
        static SHARED: Lazy<Arc<QueueActivityCache>> =
            Lazy::new(|| Arc::new(QueueActivityCache::new(DEFAULT_CACHE_WINDOW)));
        SHARED.clone()
    }

    /// Whether the queue holds at least one eligible job, as of the last
    /// refresh. Refreshes the cached set first when the window has lapsed.
    pub async fn has_queued_jobs(
        &self,
        store: &dyn JobStore,
        queue: &str,
    ) -> Result<bool, StoreError> {
        {
            let cached = self.inner.read().await;
            if !cached.is_stale(self.window) {
                return Ok(cached.queues.contains(queue));
            }
        }

        let mut cached = self.inner.write().await;
        // another task may have refreshed while we waited for the write lock
        if cached.is_stale(self.window) {
            let names = store.queues_with_eligible_jobs(None).await?;
            cached.queues = names.into_iter().collect();
            cached.refreshed_at = Some(Instant::now());
            tracing::debug!(active_queues = cached.queues.len(), "queue activity refreshed");
        }

        let cached = cached.downgrade();
        Ok(cached.queues.contains(queue))
    }

    /// Drops the cached set so the next probe refreshes immediately.
    pub async fn invalidate(&self) {
        let mut cached = self.inner.write().await;
        cached.queues.clear();
        cached.refreshed_at = None;
    }
}
