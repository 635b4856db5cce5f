//! The dispatch run: poll, claim, deliver, await.
//!
//! A run drains one queue with a bounded worker pool. Popping stops when the
//! queue is empty and every worker has finished, or when a scheduler-driven
//! run notices the queue was disabled mid-flight. Shutdown first waits for
//! in-flight jobs, then aborts whatever will not quiesce.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::cache::QueueActivityCache;
use crate::dequeue;
use crate::error::{DispatchError, ProcessError};
use crate::job::{DispatchOutcome, Job, LogSeverity};
use crate::queue;
use crate::retry::{self, RetryStrategy};
use crate::store::{CompletionSink, DocumentStore, JobStore, QueueStore};

/// A transport that knows how to deliver one job.
#[async_trait]
pub trait DeliveryService: Send + Sync {
    fn name(&self) -> &str;

    /// Processes one claimed job. An `Err` is a normal per-job failure: the
    /// job is reported as failed and handed to retry handling, and the run
    /// moves on.
    async fn process(&self, job: &Job, payload: &Value) -> Result<Option<Value>, ProcessError>;
}

/// What started this run.
///
/// Scheduler runs honor the queue's administrative state and skip queues the
/// activity cache reports as empty. Manual runs deliver regardless of state,
/// which is how a disabled queue gets drained by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchTrigger {
    Scheduler,
    Manual,
}

/// Process-level dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Identity stamped onto claimed jobs.
    pub server_id: String,
    /// How long an empty poll waits on the oldest worker before retrying.
    pub poll_interval: Duration,
    /// Grace period for in-flight jobs at the end of a run.
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            server_id: format!("relayq-{}", std::process::id()),
            poll_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl DispatcherConfig {
    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = server_id.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }
}

/// Per-run options.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub queue: String,
    /// Opaque payload handed to the delivery service with every job.
    pub payload: Value,
    /// Worker pool size.
    pub concurrency: usize,
    /// Retry limit applied to dispatched jobs; 0 defers to the document's
    /// delivery profile.
    pub retry_limit: u32,
    /// Backoff multiplier in real form.
    pub retry_factor: f64,
    /// Base wait between retries in milliseconds.
    pub time_to_wait: i64,
    /// Deliver only the oldest creation group per pass.
    pub ordered: bool,
    /// Only deliver jobs created at least this long ago.
    pub min_age: Option<chrono::Duration>,
    /// Suspend the whole queue when a job exhausts its retries.
    pub suspend_on_exhaustion: bool,
    /// User status stamped onto a document whose job exhausted its retries.
    pub exhausted_status: String,
    pub trigger: DispatchTrigger,
}

impl DispatchOptions {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            payload: Value::Null,
            concurrency: 1,
            retry_limit: 0,
            retry_factor: 1.0,
            time_to_wait: 0,
            ordered: false,
            min_age: None,
            suspend_on_exhaustion: false,
            exhausted_status: "EXHAUSTED".to_string(),
            trigger: DispatchTrigger::Manual,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retries(mut self, limit: u32, factor: f64, wait_ms: i64) -> Self {
        self.retry_limit = limit;
        self.retry_factor = factor;
        self.time_to_wait = wait_ms;
        self
    }

    pub fn with_ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn with_min_age(mut self, min_age: chrono::Duration) -> Self {
        self.min_age = Some(min_age);
        self
    }

    pub fn with_suspend_on_exhaustion(mut self, suspend: bool) -> Self {
        self.suspend_on_exhaustion = suspend;
        self
    }

    pub fn with_exhausted_status(mut self, status: impl Into<String>) -> Self {
        self.exhausted_status = status.into();
        self
    }

    pub fn with_trigger(mut self, trigger: DispatchTrigger) -> Self {
        self.trigger = trigger;
        self
    }
}

/// What a finished run did.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// Jobs claimed and handed to workers.
    pub dispatched: u64,
    /// Set when in-flight jobs had to be aborted at shutdown.
    pub forced_shutdown: bool,
    pub elapsed: Duration,
}

/// Bounded pool of job workers.
///
/// Submission blocks on a semaphore once every slot is busy, so the pop loop
/// can never outrun the workers.
struct WorkerPool {
    semaphore: Arc<Semaphore>,
    handles: VecDeque<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size.max(1))),
            handles: VecDeque::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.handles.is_empty()
    }

    async fn submit<F>(&mut self, work: F) -> Result<(), DispatchError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::PoolClosed)?;
        self.handles.push_back(tokio::spawn(async move {
            work.await;
            drop(permit);
        }));
        Ok(())
    }

    /// Waits up to `wait` for the oldest worker to finish. Returns true when
    /// it did (or no workers remain); on timeout the handle stays queued so
    /// no worker is ever dropped unobserved.
    async fn await_first(&mut self, wait: Duration) -> bool {
        let Some(front) = self.handles.front_mut() else {
            return true;
        };
        match timeout(wait, front).await {
            Ok(result) => {
                self.handles.pop_front();
                if let Err(e) = result {
                    if !e.is_cancelled() {
                        tracing::error!(error = %e, "worker task failed");
                    }
                }
                true
            }
            Err(_) => false,
        }
    }

    async fn join_all(&mut self) {
        while let Some(front) = self.handles.front_mut() {
            let result = front.await;
            self.handles.pop_front();
            if let Err(e) = result {
                if !e.is_cancelled() {
                    tracing::error!(error = %e, "worker task failed");
                }
            }
        }
    }

    /// Drains the pool: waits out the grace period, then aborts stragglers.
    /// Returns false when anything had to be aborted.
    async fn shutdown(&mut self, wait: Duration) -> bool {
        if timeout(wait, self.join_all()).await.is_ok() {
            return true;
        }

        tracing::warn!("worker pool did not quiesce in time, aborting in-flight jobs");
        for handle in &self.handles {
            handle.abort();
        }
        let _ = timeout(wait, self.join_all()).await;
        // cancellations surface here and are ignored
        self.join_all().await;
        false
    }
}

struct JobContext {
    jobs: Arc<dyn JobStore>,
    queues: Arc<dyn QueueStore>,
    documents: Arc<dyn DocumentStore>,
    completions: Arc<dyn CompletionSink>,
    service: Arc<dyn DeliveryService>,
    payload: Value,
    server_id: String,
    queue_name: String,
    queue_type: String,
    strategy: RetryStrategy,
    suspend_on_exhaustion: bool,
    exhausted_status: String,
}

/// Drives delivery runs against a set of storage gateways.
pub struct Dispatcher {
    jobs: Arc<dyn JobStore>,
    queues: Arc<dyn QueueStore>,
    documents: Arc<dyn DocumentStore>,
    completions: Arc<dyn CompletionSink>,
    cache: Arc<QueueActivityCache>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queues: Arc<dyn QueueStore>,
        documents: Arc<dyn DocumentStore>,
        completions: Arc<dyn CompletionSink>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            jobs,
            queues,
            documents,
            completions,
            cache: QueueActivityCache::shared(),
            config,
        }
    }

    /// Swaps in an isolated activity cache instead of the process-wide one.
    pub fn with_activity_cache(mut self, cache: Arc<QueueActivityCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Runs one delivery pass over the queue named in `options`.
    ///
    /// An unknown queue fails synchronously before anything is claimed.
    /// Within the run, per-job failures are reported and retried without
    /// aborting the pass; a storage failure stops popping, drains the pool
    /// and surfaces as the run's error.
    pub async fn run(
        &self,
        service: Arc<dyn DeliveryService>,
        options: DispatchOptions,
    ) -> Result<DispatchReport, DispatchError> {
        if options.queue.is_empty() {
            return Err(DispatchError::InvalidOptions("queue name is empty".into()));
        }

        let mut queue = self
            .queues
            .get(&options.queue)
            .await?
            .ok_or_else(|| DispatchError::UnknownQueue(options.queue.clone()))?;

        // scheduler ticks probe every configured queue; the cache keeps the
        // no-work case away from a full head selection
        if options.trigger == DispatchTrigger::Scheduler
            && !self
                .cache
                .has_queued_jobs(self.jobs.as_ref(), &queue.name)
                .await?
        {
            return Ok(DispatchReport {
                dispatched: 0,
                forced_shutdown: false,
                elapsed: Duration::ZERO,
            });
        }

        let started = Instant::now();
        let mut pool = WorkerPool::new(options.concurrency);
        let mut dispatched: u64 = 0;
        let mut run_error: Option<DispatchError> = None;

        let ctx = Arc::new(JobContext {
            jobs: self.jobs.clone(),
            queues: self.queues.clone(),
            documents: self.documents.clone(),
            completions: self.completions.clone(),
            service,
            payload: options.payload.clone(),
            server_id: self.config.server_id.clone(),
            queue_name: queue.name.clone(),
            queue_type: queue.queue_type.clone(),
            strategy: RetryStrategy {
                limit: options.retry_limit,
                factor: options.retry_factor,
                wait_ms: options.time_to_wait,
            },
            suspend_on_exhaustion: options.suspend_on_exhaustion,
            exhausted_status: options.exhausted_status.clone(),
        });

        loop {
            if options.trigger == DispatchTrigger::Scheduler
                && !(queue.state.is_enabled() || queue.state.is_draining())
            {
                tracing::debug!(queue = %queue.name, state = %queue.state, "queue not deliverable, ending run");
                break;
            }

            match dequeue::pop(
                self.jobs.as_ref(),
                &queue.name,
                options.ordered,
                options.min_age,
                &self.config.server_id,
            )
            .await
            {
                Ok(Some(job)) => {
                    let ctx = ctx.clone();
                    // stamped at claim time: the elapsed figure reported to
                    // the completion sink includes any wait for a pool slot
                    let dequeued_at = Instant::now();
                    if let Err(e) = pool
                        .submit(async move { process_one(ctx, job, dequeued_at).await })
                        .await
                    {
                        run_error = Some(e);
                        break;
                    }
                    dispatched += 1;
                }
                Ok(None) => {
                    if pool.is_idle() {
                        break;
                    }
                    // an in-flight job may fail and requeue itself
                    pool.await_first(self.config.poll_interval).await;
                }
                Err(e) => {
                    run_error = Some(DispatchError::Store(e));
                    break;
                }
            }

            if options.trigger == DispatchTrigger::Scheduler {
                // operators can flip the queue state mid-run
                match queue::refresh(self.queues.as_ref(), queue).await {
                    Ok(fresh) => queue = fresh,
                    Err(e) => {
                        run_error = Some(DispatchError::Store(e));
                        break;
                    }
                }
            }
        }

        let graceful = pool.shutdown(self.config.shutdown_timeout).await;

        if let Some(error) = run_error {
            return Err(error);
        }

        tracing::debug!(
            queue = %ctx.queue_name,
            dispatched,
            forced = !graceful,
            "dispatch run complete"
        );
        Ok(DispatchReport {
            dispatched,
            forced_shutdown: !graceful,
            elapsed: started.elapsed(),
        })
    }
}

/// One worker's whole job lifecycle: deliver, report, hand off to retry
/// handling. Never panics the pool; reporting and retry errors are logged
/// and swallowed so one job cannot take down the run.
///
/// `dequeued_at` is the claim instant, not the worker start: elapsed time
/// reported downstream is measured since dequeue.
async fn process_one(ctx: Arc<JobContext>, mut job: Job, dequeued_at: Instant) {
    let attempt = attempt_delivery(&ctx, &mut job).await;
    let (outcome, message, output) = match attempt {
        Ok(output) => (DispatchOutcome::Success, None, output),
        Err(e) => (DispatchOutcome::Failure, Some(e.to_string()), None),
    };

    let elapsed_ms = dequeued_at.elapsed().as_millis() as i64;
    if let Err(e) = ctx
        .completions
        .report(
            &job.id,
            &ctx.queue_name,
            outcome,
            message.as_deref(),
            elapsed_ms,
            output.as_ref(),
        )
        .await
    {
        tracing::error!(job_id = %job.id, error = %e, "completion report failed");
    }

    if let Err(e) = retry::retry(
        ctx.jobs.as_ref(),
        ctx.queues.as_ref(),
        ctx.documents.as_ref(),
        &job.id,
        ctx.suspend_on_exhaustion,
        &ctx.exhausted_status,
        &ctx.server_id,
    )
    .await
    {
        tracing::error!(job_id = %job.id, error = %e, "retry handling failed");
    }
}

async fn attempt_delivery(
    ctx: &JobContext,
    job: &mut Job,
) -> Result<Option<Value>, Box<dyn std::error::Error + Send + Sync>> {
    // the dequeue mark stays loud even on status-silenced queues
    ctx.documents
        .set_status(&job.document_id, None, Some("DEQUEUED"), false)
        .await?;
    ctx.documents
        .log_event(
            &job.document_id,
            LogSeverity::Message,
            "Processing",
            &format!("Dequeued from {} queue '{}'", ctx.queue_type, ctx.queue_name),
            &format!(
                "Service '{}' attempting to process document",
                ctx.service.name()
            ),
        )
        .await?;

    retry::apply_retry_strategy(ctx.jobs.as_ref(), ctx.documents.as_ref(), job, ctx.strategy)
        .await?;

    Ok(ctx.service.process(job, &ctx.payload).await?)
}
