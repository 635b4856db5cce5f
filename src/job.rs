//! Delivery job records and their lifecycle states.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::retry::pack_retry_factor;

/// Persisted status of a delivery job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting to be claimed, or waiting out a retry delay.
    Queued,
    /// Claimed by a worker and in flight.
    Delivering,
    /// Processed successfully.
    Delivered,
    /// Last attempt failed.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Delivering => "DELIVERING",
            JobStatus::Delivered => "DELIVERED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for JobStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "QUEUED" => Ok(JobStatus::Queued),
            "DELIVERING" => Ok(JobStatus::Delivering),
            "DELIVERED" => Ok(JobStatus::Delivered),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Outcome of one delivery attempt, as reported to the completion sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success,
    Failure,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Success => "success",
            DispatchOutcome::Failure => "fail",
        }
    }
}

/// Severity of an activity-log event on the owning document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    Message,
    Warning,
    Error,
}

impl LogSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSeverity::Message => "MESSAGE",
            LogSeverity::Warning => "WARNING",
            LogSeverity::Error => "ERROR",
        }
    }
}

/// A persisted unit of queued work tied to an owning document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub document_id: String,
    pub queue: String,
    pub status: JobStatus,
    /// Delivery attempts made so far.
    pub retries: u32,
    /// Maximum attempts; 0 defers to the document's delivery profile.
    pub retry_limit: u32,
    /// Backoff multiplier in packed form, see [`crate::retry::pack_retry_factor`].
    pub retry_factor: u64,
    /// Base wait between retries in milliseconds.
    pub time_to_wait: i64,
    /// Identity of the worker that claimed the job.
    pub server_id: Option<String>,
    pub transport_status: Option<String>,
    pub transport_message: Option<String>,
    pub transport_time_ms: i64,
    pub output: Option<Value>,
    pub created_at: DateTime<Utc>,
    /// Last-touched instant; set into the future it acts as a retry-delay gate.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// New queued job with a generated id.
    pub fn new(queue: impl Into<String>, document_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.into(),
            queue: queue.into(),
            status: JobStatus::Queued,
            retries: 0,
            retry_limit: 0,
            retry_factor: 1,
            time_to_wait: 0,
            server_id: None,
            transport_status: None,
            transport_message: None,
            transport_time_ms: 0,
            output: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    /// Sets the backoff multiplier from its real form.
    pub fn with_retry_factor(mut self, factor: f64) -> Self {
        self.retry_factor = pack_retry_factor(factor);
        self
    }

    pub fn with_time_to_wait(mut self, wait_ms: i64) -> Self {
        self.time_to_wait = wait_ms;
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    pub fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = at;
        self
    }

    /// True when the job can be claimed for delivery at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>, min_age: Option<Duration>) -> bool {
        self.status == JobStatus::Queued
            && self.updated_at <= now
            && min_age.map_or(true, |age| self.created_at <= now - age)
    }
}
