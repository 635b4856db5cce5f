//! Head selection and claiming.
//!
//! Any number of dispatchers may poll the same queue. Selection is a plain
//! read; exclusivity comes from the conditional claim, so losing a claim to
//! another consumer is routine and just means moving on to the next
//! candidate.

use chrono::Utc;
use rustc_hash::FxHashSet;

use crate::error::StoreError;
use crate::job::{Job, JobStatus};
use crate::store::JobStore;

/// Jobs currently eligible at the head of the queue, creation-ascending,
/// without claiming anything.
///
/// With `ordered` set only the oldest creation group is considered. Jobs
/// whose ids appear in `exclude` are skipped.
pub async fn peek(
    store: &dyn JobStore,
    queue: &str,
    ordered: bool,
    min_age: Option<chrono::Duration>,
    exclude: &FxHashSet<String>,
    fetch_limit: Option<usize>,
) -> Result<Vec<Job>, StoreError> {
    let ids = store.eligible_ids(queue, ordered, min_age, fetch_limit).await?;
    let now = Utc::now();
    let mut jobs = Vec::with_capacity(ids.len());
    for id in ids {
        if exclude.contains(&id) {
            continue;
        }
        // the row may have been claimed or re-gated since the id listing
        if let Some(job) = store.get(&id).await? {
            if job.is_eligible(now, min_age) {
                jobs.push(job);
            }
        }
    }
    Ok(jobs)
}

/// Claims and returns the next deliverable job, or `None` when the queue has
/// nothing eligible left.
pub async fn pop(
    store: &dyn JobStore,
    queue: &str,
    ordered: bool,
    min_age: Option<chrono::Duration>,
    server_id: &str,
) -> Result<Option<Job>, StoreError> {
    let mut lost: FxHashSet<String> = FxHashSet::default();
    loop {
        let batch = peek(store, queue, ordered, min_age, &lost, None).await?;
        if batch.is_empty() {
            return Ok(None);
        }
        for mut job in batch {
            if store.claim(&job.id, server_id).await? {
                job.status = JobStatus::Delivering;
                job.server_id = Some(server_id.to_string());
                job.updated_at = Utc::now();
                return Ok(Some(job));
            }
            tracing::debug!(job_id = %job.id, queue = %queue, "claim lost to another consumer");
            lost.insert(job.id);
        }
    }
}

/// Number of jobs currently eligible for delivery on the queue.
pub async fn size(
    store: &dyn JobStore,
    queue: &str,
    min_age: Option<chrono::Duration>,
) -> Result<u64, StoreError> {
    store.count_eligible(queue, min_age).await
}
