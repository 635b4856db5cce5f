//! In-memory backend for tests and single-process embedding.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::error::StoreError;
use crate::job::{DispatchOutcome, Job, JobStatus, LogSeverity};
use crate::queue::DeliveryQueue;
use crate::retry::RetryStrategy;
use crate::store::{CompletionSink, DocumentStore, JobStore, QueueStore};

/// One entry in a document's activity log.
#[derive(Debug, Clone)]
pub struct ActivityEvent {
    pub severity: LogSeverity,
    pub category: String,
    pub summary: String,
    pub detail: String,
}

/// Everything the memory backend tracks about a document.
#[derive(Debug, Clone, Default)]
pub struct DocumentRecord {
    pub system_status: Option<String>,
    pub user_status: Option<String>,
    pub events: Vec<ActivityEvent>,
    pub unrecoverable: bool,
    pub profile: Option<RetryStrategy>,
}

/// A delivery attempt outcome as handed to the completion sink.
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub job_id: String,
    pub queue: String,
    pub outcome: DispatchOutcome,
    pub message: Option<String>,
    pub elapsed_ms: i64,
    pub output: Option<Value>,
}

/// Backend keeping jobs, queues, documents and completions in process
/// memory. Implements every storage gateway the dispatcher needs.
#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<FxHashMap<String, Job>>,
    queues: RwLock<FxHashMap<String, DeliveryQueue>>,
    documents: RwLock<FxHashMap<String, DocumentRecord>>,
    completions: RwLock<Vec<CompletionRecord>>,
    eligibility_queries: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Job creation stays with callers; the dispatcher only ever claims and
    /// updates what is already there.
    pub fn insert_job(&self, job: Job) {
        self.jobs.write().insert(job.id.clone(), job);
    }

    pub fn insert_queue(&self, queue: DeliveryQueue) {
        self.queues.write().insert(queue.name.clone(), queue);
    }

    pub fn put_document(&self, document_id: impl Into<String>, record: DocumentRecord) {
        self.documents.write().insert(document_id.into(), record);
    }

    pub fn job(&self, id: &str) -> Option<Job> {
        self.jobs.read().get(id).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<DeliveryQueue> {
        self.queues.read().get(name).cloned()
    }

    pub fn document(&self, id: &str) -> Option<DocumentRecord> {
        self.documents.read().get(id).cloned()
    }

    pub fn completions(&self) -> Vec<CompletionRecord> {
        self.completions.read().clone()
    }

    /// How many times [`JobStore::queues_with_eligible_jobs`] has run.
    pub fn eligibility_queries(&self) -> u64 {
        self.eligibility_queries.load(Ordering::Relaxed)
    }

    fn eligible_sorted(&self, queue: &str, min_age: Option<chrono::Duration>) -> Vec<Job> {
        let now = Utc::now();
        let mut eligible: Vec<Job> = self
            .jobs
            .read()
            .values()
            .filter(|job| job.queue == queue && job.is_eligible(now, min_age))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        eligible
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().get(id).cloned())
    }

    async fn ids_for_document(&self, document_id: &str) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self
            .jobs
            .read()
            .values()
            .filter(|job| job.document_id == document_id)
            .map(|job| job.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn eligible_ids(
        &self,
        queue: &str,
        ordered: bool,
        min_age: Option<chrono::Duration>,
        fetch_limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        let eligible = self.eligible_sorted(queue, min_age);
        let mut ids: Vec<String> = if ordered {
            let Some(first) = eligible.first() else {
                return Ok(Vec::new());
            };
            let oldest = first.created_at;
            eligible
                .iter()
                .take_while(|job| job.created_at == oldest)
                .map(|job| job.id.clone())
                .collect()
        } else {
            eligible.iter().map(|job| job.id.clone()).collect()
        };
        if let Some(limit) = fetch_limit {
            ids.truncate(limit);
        }
        Ok(ids)
    }

    async fn claim(&self, id: &str, server_id: &str) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write();
        match jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Queued => {
                job.status = JobStatus::Delivering;
                job.server_id = Some(server_id.to_string());
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        // updated_at lands exactly as carried; it doubles as the retry gate
        self.jobs.write().insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn count_eligible(
        &self,
        queue: &str,
        min_age: Option<chrono::Duration>,
    ) -> Result<u64, StoreError> {
        Ok(self.eligible_sorted(queue, min_age).len() as u64)
    }

    async fn queues_with_eligible_jobs(
        &self,
        min_age: Option<chrono::Duration>,
    ) -> Result<Vec<String>, StoreError> {
        self.eligibility_queries.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let names: FxHashSet<String> = self
            .jobs
            .read()
            .values()
            .filter(|job| job.is_eligible(now, min_age))
            .map(|job| job.queue.clone())
            .collect();
        Ok(names.into_iter().collect())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<Option<DeliveryQueue>, StoreError> {
        Ok(self.queues.read().get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<DeliveryQueue>, StoreError> {
        let mut queues: Vec<DeliveryQueue> = self.queues.read().values().cloned().collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(queues)
    }

    async fn update(&self, queue: &DeliveryQueue) -> Result<(), StoreError> {
        self.queues.write().insert(queue.name.clone(), queue.clone());
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn set_status(
        &self,
        document_id: &str,
        system_status: Option<&str>,
        user_status: Option<&str>,
        silent: bool,
    ) -> Result<(), StoreError> {
        if silent {
            return Ok(());
        }
        let mut documents = self.documents.write();
        let record = documents.entry(document_id.to_string()).or_default();
        if let Some(status) = system_status {
            record.system_status = Some(status.to_string());
        }
        if let Some(status) = user_status {
            record.user_status = Some(status.to_string());
        }
        Ok(())
    }

    async fn log_event(
        &self,
        document_id: &str,
        severity: LogSeverity,
        category: &str,
        summary: &str,
        detail: &str,
    ) -> Result<(), StoreError> {
        let mut documents = self.documents.write();
        let record = documents.entry(document_id.to_string()).or_default();
        record.events.push(ActivityEvent {
            severity,
            category: category.to_string(),
            summary: summary.to_string(),
            detail: detail.to_string(),
        });
        Ok(())
    }

    async fn has_unrecoverable_errors(&self, document_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .documents
            .read()
            .get(document_id)
            .map_or(false, |record| record.unrecoverable))
    }

    async fn delivery_profile(
        &self,
        document_id: &str,
    ) -> Result<Option<RetryStrategy>, StoreError> {
        Ok(self
            .documents
            .read()
            .get(document_id)
            .and_then(|record| record.profile))
    }
}

#[async_trait]
impl CompletionSink for MemoryStore {
    async fn report(
        &self,
        job_id: &str,
        queue: &str,
        outcome: DispatchOutcome,
        message: Option<&str>,
        elapsed_ms: i64,
        output: Option<&Value>,
    ) -> Result<(), StoreError> {
        self.completions.write().push(CompletionRecord {
            job_id: job_id.to_string(),
            queue: queue.to_string(),
            outcome,
            message: message.map(str::to_string),
            elapsed_ms,
            output: output.cloned(),
        });

        let mut jobs = self.jobs.write();
        if let Some(job) = jobs.get_mut(job_id) {
            job.transport_status = Some(outcome.as_str().to_string());
            job.transport_message = message.map(str::to_string);
            job.transport_time_ms = elapsed_ms;
            job.output = output.cloned();
            match outcome {
                DispatchOutcome::Success => job.status = JobStatus::Delivered,
                DispatchOutcome::Failure => {
                    job.retries += 1;
                    job.status = if job.retry_limit > 0 && job.retries >= job.retry_limit {
                        JobStatus::Failed
                    } else {
                        JobStatus::Queued
                    };
                }
            }
            job.updated_at = Utc::now();
        }
        Ok(())
    }
}
