//! Postgres-backed job and queue storage.
//!
//! Documents and completion reporting live in external systems, so this
//! backend only implements [`JobStore`] and [`QueueStore`]. The claim path
//! relies on a conditional UPDATE: whichever server flips the row out of
//! QUEUED first wins, everyone else sees zero rows affected.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crate::error::StoreError;
use crate::job::{Job, JobStatus};
use crate::queue::{DeliveryQueue, QueueState};
use crate::store::{JobStore, QueueStore};

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(50)
            .min_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the tables and indexes this backend needs.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS delivery_jobs (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                queue TEXT NOT NULL,
                status TEXT NOT NULL,
                retries INTEGER NOT NULL DEFAULT 0,
                retry_limit INTEGER NOT NULL DEFAULT 0,
                retry_factor BIGINT NOT NULL DEFAULT 1,
                time_to_wait BIGINT NOT NULL DEFAULT 0,
                server_id TEXT,
                transport_status TEXT,
                transport_message TEXT,
                transport_time_ms BIGINT NOT NULL DEFAULT 0,
                output JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_delivery_jobs_eligible \
             ON delivery_jobs (queue, status, updated_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_delivery_jobs_document \
             ON delivery_jobs (document_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS delivery_queues (
                name TEXT PRIMARY KEY,
                queue_type TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL DEFAULT 'ENABLED',
                schedule JSONB
            )",
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("database schema ready");
        Ok(())
    }

    pub async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO delivery_jobs \
             (id, document_id, queue, status, retries, retry_limit, retry_factor, \
              time_to_wait, server_id, transport_status, transport_message, \
              transport_time_ms, output, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(&job.id)
        .bind(&job.document_id)
        .bind(&job.queue)
        .bind(job.status.as_str())
        .bind(job.retries as i32)
        .bind(job.retry_limit as i32)
        .bind(job.retry_factor as i64)
        .bind(job.time_to_wait)
        .bind(job.server_id.as_deref())
        .bind(job.transport_status.as_deref())
        .bind(job.transport_message.as_deref())
        .bind(job.transport_time_ms)
        .bind(job.output.as_ref())
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_queue(&self, queue: &DeliveryQueue) -> Result<(), StoreError> {
        let schedule = queue
            .schedule
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        sqlx::query(
            "INSERT INTO delivery_queues (name, queue_type, state, schedule) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (name) DO UPDATE SET queue_type = EXCLUDED.queue_type, \
             state = EXCLUDED.state, schedule = EXCLUDED.schedule",
        )
        .bind(&queue.name)
        .bind(&queue.queue_type)
        .bind(queue.state.as_str())
        .bind(schedule)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = row.get("status");
    let status = JobStatus::try_from(status.as_str()).map_err(StoreError::Backend)?;
    Ok(Job {
        id: row.get("id"),
        document_id: row.get("document_id"),
        queue: row.get("queue"),
        status,
        retries: row.get::<i32, _>("retries") as u32,
        retry_limit: row.get::<i32, _>("retry_limit") as u32,
        retry_factor: row.get::<i64, _>("retry_factor") as u64,
        time_to_wait: row.get("time_to_wait"),
        server_id: row.get("server_id"),
        transport_status: row.get("transport_status"),
        transport_message: row.get("transport_message"),
        transport_time_ms: row.get("transport_time_ms"),
        output: row.get("output"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn queue_from_row(row: &PgRow) -> Result<DeliveryQueue, StoreError> {
    let state: String = row.get("state");
    let state = QueueState::try_from(state.as_str()).map_err(StoreError::Backend)?;
    let schedule: Option<serde_json::Value> = row.get("schedule");
    let schedule = schedule.map(serde_json::from_value).transpose()?;
    Ok(DeliveryQueue {
        name: row.get("name"),
        queue_type: row.get("queue_type"),
        state,
        schedule,
    })
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(
            "SELECT id, document_id, queue, status, retries, retry_limit, retry_factor, \
             time_to_wait, server_id, transport_status, transport_message, \
             transport_time_ms, output, created_at, updated_at \
             FROM delivery_jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn ids_for_document(&self, document_id: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT id FROM delivery_jobs WHERE document_id = $1 ORDER BY id")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn eligible_ids(
        &self,
        queue: &str,
        ordered: bool,
        min_age: Option<chrono::Duration>,
        fetch_limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        let now = Utc::now();
        let min_created = min_age.map(|age| now - age);

        let mut sql = String::from(
            "SELECT id FROM delivery_jobs \
             WHERE queue = $1 AND status = 'QUEUED' AND updated_at <= $2",
        );
        if min_created.is_some() {
            sql.push_str(" AND created_at <= $3");
        }
        if ordered {
            sql.push_str(
                " AND created_at = (SELECT MIN(created_at) FROM delivery_jobs \
                 WHERE queue = $1 AND status = 'QUEUED' AND updated_at <= $2",
            );
            if min_created.is_some() {
                sql.push_str(" AND created_at <= $3");
            }
            sql.push(')');
        }
        sql.push_str(" ORDER BY created_at, id");
        if fetch_limit.is_some() {
            let placeholder = if min_created.is_some() { 4 } else { 3 };
            sql.push_str(&format!(" LIMIT ${placeholder}"));
        }

        let mut query = sqlx::query(&sql).bind(queue).bind(now);
        if let Some(cutoff) = min_created {
            query = query.bind(cutoff);
        }
        if let Some(limit) = fetch_limit {
            query = query.bind(limit as i64);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn claim(&self, id: &str, server_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE delivery_jobs SET status = 'DELIVERING', server_id = $2, updated_at = $3 \
             WHERE id = $1 AND status = 'QUEUED'",
        )
        .bind(id)
        .bind(server_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        // updated_at lands exactly as carried; it doubles as the retry gate
        sqlx::query(
            "UPDATE delivery_jobs SET document_id = $2, queue = $3, status = $4, \
             retries = $5, retry_limit = $6, retry_factor = $7, time_to_wait = $8, \
             server_id = $9, transport_status = $10, transport_message = $11, \
             transport_time_ms = $12, output = $13, created_at = $14, updated_at = $15 \
             WHERE id = $1",
        )
        .bind(&job.id)
        .bind(&job.document_id)
        .bind(&job.queue)
        .bind(job.status.as_str())
        .bind(job.retries as i32)
        .bind(job.retry_limit as i32)
        .bind(job.retry_factor as i64)
        .bind(job.time_to_wait)
        .bind(job.server_id.as_deref())
        .bind(job.transport_status.as_deref())
        .bind(job.transport_message.as_deref())
        .bind(job.transport_time_ms)
        .bind(job.output.as_ref())
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_eligible(
        &self,
        queue: &str,
        min_age: Option<chrono::Duration>,
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let min_created = min_age.map(|age| now - age);

        let mut sql = String::from(
            "SELECT COUNT(*) AS count FROM delivery_jobs \
             WHERE queue = $1 AND status = 'QUEUED' AND updated_at <= $2",
        );
        if min_created.is_some() {
            sql.push_str(" AND created_at <= $3");
        }

        let mut query = sqlx::query(&sql).bind(queue).bind(now);
        if let Some(cutoff) = min_created {
            query = query.bind(cutoff);
        }

        let row = query.fetch_one(&self.pool).await?;
        Ok(row.get::<i64, _>("count") as u64)
    }

    async fn queues_with_eligible_jobs(
        &self,
        min_age: Option<chrono::Duration>,
    ) -> Result<Vec<String>, StoreError> {
        let now = Utc::now();
        let min_created = min_age.map(|age| now - age);

        let mut sql = String::from(
            "SELECT DISTINCT queue FROM delivery_jobs \
             WHERE status = 'QUEUED' AND updated_at <= $1",
        );
        if min_created.is_some() {
            sql.push_str(" AND created_at <= $2");
        }

        let mut query = sqlx::query(&sql).bind(now);
        if let Some(cutoff) = min_created {
            query = query.bind(cutoff);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|row| row.get("queue")).collect())
    }
}

#[async_trait]
impl QueueStore for PostgresStore {
    async fn get(&self, name: &str) -> Result<Option<DeliveryQueue>, StoreError> {
        let row = sqlx::query(
            "SELECT name, queue_type, state, schedule FROM delivery_queues WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(queue_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<DeliveryQueue>, StoreError> {
        let rows =
            sqlx::query("SELECT name, queue_type, state, schedule FROM delivery_queues ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(queue_from_row).collect()
    }

    async fn update(&self, queue: &DeliveryQueue) -> Result<(), StoreError> {
        let schedule = queue
            .schedule
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        sqlx::query(
            "UPDATE delivery_queues SET queue_type = $2, state = $3, schedule = $4 \
             WHERE name = $1",
        )
        .bind(&queue.name)
        .bind(&queue.queue_type)
        .bind(queue.state.as_str())
        .bind(schedule)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
