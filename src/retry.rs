//! Retry/backoff policy for delivery jobs.
//!
//! The backoff multiplier is persisted in a packed integer form so a single
//! integer column can carry either a plain integer factor or a fractional one
//! with three decimal digits: factors that are fractional or >= 1000 are
//! stored multiplied by 1000, and any stored value >= 1000 is divided by 1000
//! on the way out. Stored values at or above 1000 always get the fractional
//! reading, so an integer factor of exactly 1000 or more cannot round-trip;
//! 1500 unpacks to 1.5.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, StoreError};
use crate::job::{Job, JobStatus, LogSeverity};
use crate::queue::QueueState;
use crate::store::{DocumentStore, JobStore, QueueStore};

/// Decimal digits of precision carried by a packed retry factor.
pub const RETRY_FACTOR_PRECISION: u32 = 3;

/// 10^[`RETRY_FACTOR_PRECISION`].
pub const RETRY_FACTOR_MULTIPLIER: u64 = 1000;

/// Packs a backoff factor for storage in an integer field.
pub fn pack_retry_factor(factor: f64) -> u64 {
    if factor >= RETRY_FACTOR_MULTIPLIER as f64 || factor.fract() != 0.0 {
        (factor * RETRY_FACTOR_MULTIPLIER as f64).round() as u64
    } else {
        factor.round() as u64
    }
}

/// Recovers the real backoff factor from its stored form, rounded to
/// [`RETRY_FACTOR_PRECISION`] decimal places.
pub fn unpack_retry_factor(stored: u64) -> f64 {
    let multiplier = RETRY_FACTOR_MULTIPLIER as f64;
    if stored >= RETRY_FACTOR_MULTIPLIER {
        (stored as f64 / multiplier * multiplier).round() / multiplier
    } else {
        stored as f64
    }
}

/// True when the job has burned through a positive retry limit and its last
/// attempt failed.
pub fn is_exhausted(retries: u32, retry_limit: u32, status: JobStatus) -> bool {
    retry_limit > 0 && retries >= retry_limit && status == JobStatus::Failed
}

/// True when the job has failed at least once: either re-queued after a
/// prior attempt, or exhausted outright.
pub fn is_failed(retries: u32, status: JobStatus, exhausted: bool) -> bool {
    (retries > 0 && status == JobStatus::Queued) || exhausted
}

/// Earliest instant the job should next be attempted.
///
/// A non-positive `time_to_wait` means no delay. A factor above 1.0 kicks in
/// from the second retry onward: wait x factor^(retries - 1), truncated to
/// whole milliseconds. Factor 1.0 degenerates to a fixed interval.
pub fn next_retry_at(
    now: DateTime<Utc>,
    retries: u32,
    retry_factor: u64,
    time_to_wait: i64,
) -> DateTime<Utc> {
    if time_to_wait <= 0 {
        return now;
    }

    let factor = unpack_retry_factor(retry_factor);
    let delay_ms = if factor > 1.0 && retries > 1 {
        (time_to_wait as f64 * factor.powi(retries as i32 - 1)) as i64
    } else {
        time_to_wait
    };

    now.checked_add_signed(Duration::milliseconds(delay_ms))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Retry settings applied to a job before processing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategy {
    /// Maximum delivery attempts; 0 defers to the document's delivery profile.
    pub limit: u32,
    /// Backoff multiplier in its real form, not packed.
    pub factor: f64,
    /// Base wait between retries in milliseconds.
    pub wait_ms: i64,
}

/// Resolves the effective retry strategy for a job and persists it when it
/// differs from what the job already carries.
///
/// A requested limit of 0 defers to the owning document's delivery profile
/// when that profile configures a positive retry count. The job's
/// `updated_at` is left untouched by the persist.
pub async fn apply_retry_strategy(
    jobs: &dyn JobStore,
    documents: &dyn DocumentStore,
    job: &mut Job,
    requested: RetryStrategy,
) -> Result<(), StoreError> {
    let mut effective = requested;
    if requested.limit == 0 {
        if let Some(profile) = documents.delivery_profile(&job.document_id).await? {
            if profile.limit > 0 {
                effective = profile;
            }
        }
    }

    let packed = pack_retry_factor(effective.factor);
    if job.retry_limit != effective.limit
        || job.retry_factor != packed
        || job.time_to_wait != effective.wait_ms
    {
        job.retry_limit = effective.limit;
        job.retry_factor = packed;
        job.time_to_wait = effective.wait_ms;
        jobs.update(job).await?;
    }

    Ok(())
}

/// Re-queues the job for a later attempt, or escalates when its retries are
/// exhausted.
///
/// The job is re-fetched first so decisions are made on what the completion
/// sink persisted, not on a stale in-flight copy; a missing job is a no-op.
/// A failed-but-not-exhausted job keeps its QUEUED status and gets a future
/// `updated_at` as its retry-delay gate. On exhaustion the owning document is
/// marked with `exhausted_status`, and when `suspend` is set the job's
/// retries are reset to 1, the job is reassigned to `server_id` and
/// rescheduled, and the whole queue is suspended until an operator resumes
/// delivery.
pub async fn retry(
    jobs: &dyn JobStore,
    queues: &dyn QueueStore,
    documents: &dyn DocumentStore,
    job_id: &str,
    suspend: bool,
    exhausted_status: &str,
    server_id: &str,
) -> Result<(), DispatchError> {
    let Some(mut job) = jobs.get(job_id).await? else {
        return Ok(());
    };

    let queue = queues
        .get(&job.queue)
        .await?
        .ok_or_else(|| DispatchError::UnknownQueue(job.queue.clone()))?;
    let silent = queue.status_silence();

    let exhausted = is_exhausted(job.retries, job.retry_limit, job.status);
    if !is_failed(job.retries, job.status, exhausted) {
        return Ok(());
    }

    if exhausted {
        if job.retry_limit > 0 {
            documents
                .set_status(&job.document_id, None, Some(exhausted_status), silent)
                .await?;
            documents
                .log_event(
                    &job.document_id,
                    LogSeverity::Error,
                    "Delivery",
                    &format!("Exhausted all retries ({}/{})", job.retries, job.retry_limit),
                    &format!(
                        "Exhausted all retries ({} of {}) of task \"{}\" on {} queue \"{}\"",
                        job.retries, job.retry_limit, job.id, queue.queue_type, queue.name
                    ),
                )
                .await?;
        }

        if suspend {
            // reset retries back to 1 so the job runs once more after resume
            job.retries = 1;
            job.status = JobStatus::Queued;
            job.server_id = Some(server_id.to_string());
            let next_retry = next_retry_at(Utc::now(), job.retries, job.retry_factor, job.time_to_wait);
            job.updated_at = next_retry;
            jobs.update(&job).await?;

            let was_suspended = queue.state == QueueState::Suspended;
            if !was_suspended {
                let mut suspended = queue.clone();
                suspended.state = QueueState::Suspended;
                queues.update(&suspended).await?;
                documents
                    .log_event(
                        &job.document_id,
                        LogSeverity::Warning,
                        "Delivery",
                        &format!("Suspended {} queue \"{}\"", queue.queue_type, queue.name),
                        &format!(
                            "Delivery of {} queue \"{}\" was suspended due to task \"{}\" exhaustion",
                            queue.queue_type, queue.name, job.id
                        ),
                    )
                    .await?;
            }

            documents
                .set_status(
                    &job.document_id,
                    Some("QUEUED"),
                    Some(if was_suspended { "REQUEUED" } else { "SUSPENDED" }),
                    silent,
                )
                .await?;
            documents
                .log_event(
                    &job.document_id,
                    LogSeverity::Message,
                    "Delivery",
                    &format!("Retries reset ({}/{})", job.retries, job.retry_limit),
                    &format!(
                        "Retries reset to ensure task is processed upon queue delivery \
                         resumption; if this task is not required to be processed again, it \
                         should be manually deleted. Next retry ({} of {}) of task \"{}\" on \
                         {} queue \"{}\" scheduled no earlier than \"{}\"",
                        job.retries,
                        job.retry_limit,
                        job.id,
                        queue.queue_type,
                        queue.name,
                        next_retry.to_rfc3339()
                    ),
                )
                .await?;
        }
    } else {
        // force the job to wait out its backoff before the next claim
        let next_retry = next_retry_at(Utc::now(), job.retries, job.retry_factor, job.time_to_wait);
        job.updated_at = next_retry;
        jobs.update(&job).await?;

        documents
            .set_status(&job.document_id, Some("QUEUED"), Some("REQUEUED"), silent)
            .await?;
        documents
            .log_event(
                &job.document_id,
                LogSeverity::Message,
                "Delivery",
                &format!("Next retry scheduled ({}/{})", job.retries, job.retry_limit),
                &format!(
                    "Next retry ({} of {}) of task \"{}\" on {} queue \"{}\" scheduled no \
                     earlier than \"{}\"",
                    job.retries,
                    job.retry_limit,
                    job.id,
                    queue.queue_type,
                    queue.name,
                    next_retry.to_rfc3339()
                ),
            )
            .await?;
    }

    Ok(())
}
