//! Integration-style tests driving the dispatcher against the in-memory
//! backend.

mod cache;
mod dequeue;
mod queue_control;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::cache::QueueActivityCache;
use crate::dispatch::{DeliveryService, Dispatcher, DispatcherConfig};
use crate::error::ProcessError;
use crate::job::Job;
use crate::store::MemoryStore;

pub(crate) fn store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

/// Dispatcher wired entirely to one memory store, with a short-window
/// isolated activity cache so tests do not share cached state.
pub(crate) fn dispatcher(store: &Arc<MemoryStore>) -> Dispatcher {
    Dispatcher::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        DispatcherConfig::default().with_server_id("test-server"),
    )
    .with_activity_cache(Arc::new(QueueActivityCache::new(Duration::from_millis(50))))
}

pub(crate) fn queued_job(
    queue: &str,
    document_id: &str,
    limit: u32,
    factor: f64,
    wait_ms: i64,
) -> Job {
    Job::new(queue, document_id)
        .with_retry_limit(limit)
        .with_retry_factor(factor)
        .with_time_to_wait(wait_ms)
}

/// Fails the first `fail_first` calls, then succeeds.
pub(crate) struct FlakyService {
    fail_first: u32,
    pub(crate) calls: AtomicU32,
}

impl FlakyService {
    pub(crate) fn new(fail_first: u32) -> Self {
        Self {
            fail_first,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl DeliveryService for FlakyService {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn process(&self, _job: &Job, _payload: &Value) -> Result<Option<Value>, ProcessError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            Err(ProcessError::new("transport refused the document"))
        } else {
            Ok(None)
        }
    }
}

/// Sleeps per job and records how many jobs ran at once.
pub(crate) struct CountingService {
    active: AtomicU32,
    pub(crate) max_active: AtomicU32,
    pub(crate) total: AtomicU32,
    delay: Duration,
}

impl CountingService {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            active: AtomicU32::new(0),
            max_active: AtomicU32::new(0),
            total: AtomicU32::new(0),
            delay,
        }
    }
}

#[async_trait]
impl DeliveryService for CountingService {
    fn name(&self) -> &str {
        "counting"
    }

    async fn process(&self, _job: &Job, _payload: &Value) -> Result<Option<Value>, ProcessError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        Ok(Some(json!({ "processed": true })))
    }
}
