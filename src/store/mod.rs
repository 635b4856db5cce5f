//! Storage gateways.
//!
//! The dispatcher talks to four narrow traits: [`JobStore`] and
//! [`QueueStore`] for its own durable state, [`DocumentStore`] for the
//! document system that owns status and activity logging, and
//! [`CompletionSink`] for reporting attempt outcomes. [`MemoryStore`]
//! implements all four for tests and embedding; [`PostgresStore`] backs the
//! first two with Postgres.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;
use crate::job::{DispatchOutcome, Job, LogSeverity};
use crate::queue::DeliveryQueue;
use crate::retry::RetryStrategy;

mod memory;
mod postgres;

pub use memory::{ActivityEvent, CompletionRecord, DocumentRecord, MemoryStore};
pub use postgres::PostgresStore;

/// Durable storage for delivery jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// Ids of every job attached to the document, regardless of status.
    async fn ids_for_document(&self, document_id: &str) -> Result<Vec<String>, StoreError>;

    /// Ids of jobs eligible for delivery on the queue, creation-ascending.
    ///
    /// Eligible means QUEUED with `updated_at` at or before now, and when
    /// `min_age` is given, created at least that long ago. When `ordered` is
    /// set only the group sharing the minimum `created_at` among eligible
    /// jobs is returned. `fetch_limit` caps the result.
    async fn eligible_ids(
        &self,
        queue: &str,
        ordered: bool,
        min_age: Option<chrono::Duration>,
        fetch_limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError>;

    /// Atomically claims a QUEUED job for this server, flipping it to
    /// DELIVERING and stamping `server_id` and `updated_at`.
    ///
    /// Returns false when the job was already claimed or is no longer
    /// QUEUED; with competing consumers that is a normal outcome, not an
    /// error. Status is the only condition: a job whose retry gate sits in
    /// the future still claims, eligibility filtering happens upstream.
    async fn claim(&self, id: &str, server_id: &str) -> Result<bool, StoreError>;

    /// Persists the job exactly as given.
    ///
    /// `updated_at` must be written verbatim: retry handling stores a future
    /// value there as the retry-delay gate.
    async fn update(&self, job: &Job) -> Result<(), StoreError>;

    /// Number of jobs currently eligible for delivery on the queue.
    async fn count_eligible(
        &self,
        queue: &str,
        min_age: Option<chrono::Duration>,
    ) -> Result<u64, StoreError>;

    /// Names of every queue holding at least one eligible job.
    async fn queues_with_eligible_jobs(
        &self,
        min_age: Option<chrono::Duration>,
    ) -> Result<Vec<String>, StoreError>;
}

/// Durable storage for queue records.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<DeliveryQueue>, StoreError>;

    async fn list(&self) -> Result<Vec<DeliveryQueue>, StoreError>;

    async fn update(&self, queue: &DeliveryQueue) -> Result<(), StoreError>;
}

/// Gateway to the document system that owns the payloads being delivered.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Updates the document's system and/or user status. `silent` suppresses
    /// the write entirely for queues configured with status silence.
    async fn set_status(
        &self,
        document_id: &str,
        system_status: Option<&str>,
        user_status: Option<&str>,
        silent: bool,
    ) -> Result<(), StoreError>;

    /// Appends an entry to the document's activity log.
    async fn log_event(
        &self,
        document_id: &str,
        severity: LogSeverity,
        category: &str,
        summary: &str,
        detail: &str,
    ) -> Result<(), StoreError>;

    /// Whether the document has errors no amount of retrying will fix.
    async fn has_unrecoverable_errors(&self, document_id: &str) -> Result<bool, StoreError>;

    /// The document's configured delivery retry profile, if any.
    async fn delivery_profile(
        &self,
        document_id: &str,
    ) -> Result<Option<RetryStrategy>, StoreError>;
}

/// Receives the outcome of every delivery attempt.
///
/// On failure the sink owns the bookkeeping the retry pass later reads back:
/// it increments the job's retry count and flips the status to QUEUED while
/// attempts remain, or FAILED once a positive limit is reached.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn report(
        &self,
        job_id: &str,
        queue: &str,
        outcome: DispatchOutcome,
        message: Option<&str>,
        elapsed_ms: i64,
        output: Option<&Value>,
    ) -> Result<(), StoreError>;
}
