use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

use crate::db::queries;
use crate::models::job::{Job, JobStatus, Transition};

/// Durable keyed storage for job records.
///
/// The only mutations are creation and conditional updates keyed by job id;
/// no caller ever writes a job unconditionally.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError>;

    /// Move a job to `transition.to` if its current status is an allowed
    /// predecessor. Fails with [`StoreError::Conflict`] (carrying the current
    /// status) when it is not, and [`StoreError::NotFound`] when the job is
    /// unknown.
    async fn transition(&self, job_id: &str, transition: &Transition) -> Result<Job, StoreError>;

    /// Add a metadata key if it is not already set; `Ok(false)` when it was.
    /// Status and `updatedAt` are left alone.
    async fn annotate_if_absent(
        &self,
        job_id: &str,
        key: &str,
        value: Value,
    ) -> Result<bool, StoreError>;

    /// Failed jobs eligible for a re-drive, oldest failure first: transient
    /// class, no `redrivenTo` marker, fewer than `max_attempts` re-drives
    /// in their chain. Ineligible failures never take up the `limit`.
    async fn list_redrivable(
        &self,
        max_attempts: u64,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Job store backed by the `generation_jobs` table.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn refused(&self, job_id: &str, transition: &Transition) -> StoreError {
        match queries::get_job(&self.pool, job_id).await {
            Ok(Some(job)) => StoreError::Conflict {
                job_id: job_id.to_string(),
                current: job.status,
                requested: transition.to,
            },
            Ok(None) => StoreError::NotFound(job_id.to_string()),
            Err(e) => StoreError::Database(e),
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        queries::create_job(&self.pool, job).await?;
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(queries::get_job(&self.pool, job_id).await?)
    }

    async fn transition(&self, job_id: &str, transition: &Transition) -> Result<Job, StoreError> {
        match queries::transition_job(&self.pool, job_id, transition).await? {
            Some(job) => Ok(job),
            None => Err(self.refused(job_id, transition).await),
        }
    }

    async fn annotate_if_absent(
        &self,
        job_id: &str,
        key: &str,
        value: Value,
    ) -> Result<bool, StoreError> {
        if queries::annotate_job_if_absent(&self.pool, job_id, key, value).await? {
            return Ok(true);
        }
        match queries::get_job(&self.pool, job_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(job_id.to_string())),
        }
    }

    async fn list_redrivable(
        &self,
        max_attempts: u64,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let max_attempts = i64::try_from(max_attempts).unwrap_or(i64::MAX);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Ok(queries::list_redrivable_jobs(&self.pool, max_attempts, limit).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Failures of the job store and the quota ledger.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {job_id} is {current}, cannot move to {requested}")]
    Conflict {
        job_id: String,
        current: JobStatus,
        requested: JobStatus,
    },
}
