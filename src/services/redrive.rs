//! Re-drive of failed jobs.
//!
//! The worker acknowledges whole batches regardless of per-message outcome,
//! so a job that failed for a transient reason is never redelivered by the
//! transport. The reconciler finds those jobs and submits a fresh copy of
//! each. The original stays `failed` and is linked to its replacement
//! through `redrivenTo` / `redrivenFrom` metadata. Re-drives are operator
//! actions and do not charge quota.

use serde::Serialize;
use std::sync::Arc;

use crate::models::job::{meta, ErrorClass, Job, JobStatus, Transition};
use crate::models::message::JobMessage;
use crate::services::coordinator::{compensate, mark_queued};
use crate::services::jobs::{JobStore, StoreError};
use crate::services::queue::{QueueError, WorkQueue};

/// A chain of re-drives stops after this many attempts.
pub const MAX_REDRIVE_ATTEMPTS: u64 = 3;

/// Error recorded on a replacement whose original was claimed by another pass.
pub const SUPERSEDED: &str = "superseded by a concurrent re-drive";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RedriveReport {
    pub examined: usize,
    pub redriven: usize,
    /// Jobs another reconciler re-drove first.
    pub skipped: usize,
    pub failed: usize,
}

fn attempt(job: &Job) -> u64 {
    job.metadata
        .get(meta::REDRIVE_ATTEMPT)
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
}

/// Whether a failed job should get a fresh copy.
pub fn is_redrivable(job: &Job, max_attempts: u64) -> bool {
    job.status == JobStatus::Failed
        && job.error_class() == Some(ErrorClass::Transient)
        && !job.metadata.contains_key(meta::REDRIVEN_TO)
        && attempt(job) < max_attempts
}

pub struct Reconciler {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
}

impl Reconciler {
    pub fn new(jobs: Arc<dyn JobStore>, queue: Arc<dyn WorkQueue>) -> Self {
        Self { jobs, queue }
    }

    /// Re-drive up to `limit` eligible failed jobs, oldest first.
    pub async fn redrive(&self, limit: usize) -> Result<RedriveReport, StoreError> {
        let candidates = self
            .jobs
            .list_redrivable(MAX_REDRIVE_ATTEMPTS, limit)
            .await?;
        let mut report = RedriveReport::default();

        for job in &candidates {
            report.examined += 1;

            match self.redrive_job(job).await {
                Ok(Some(new_job_id)) => {
                    report.redriven += 1;
                    metrics::counter!("generation_jobs_redriven_total").increment(1);
                    tracing::info!(job_id = %job.job_id, new_job_id = %new_job_id, "Job re-driven");
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(job_id = %job.job_id, error = %e, "Re-drive failed");
                }
            }
        }

        tracing::info!(
            examined = report.examined,
            redriven = report.redriven,
            skipped = report.skipped,
            failed = report.failed,
            "Re-drive pass complete"
        );
        Ok(report)
    }

    /// The replacement is created before the original is claimed, so a
    /// claimed original always points at an existing job. Returns `Ok(None)`
    /// when another reconciler claimed the original first.
    async fn redrive_job(&self, original: &Job) -> Result<Option<String>, RedriveError> {
        let mut replacement = Job::new(
            &original.owner_id,
            &original.input_ref,
            &original.prompt,
            &original.style,
        );
        replacement
            .metadata
            .insert(meta::REDRIVEN_FROM.to_string(), original.job_id.clone().into());
        replacement
            .metadata
            .insert(meta::REDRIVE_ATTEMPT.to_string(), (attempt(original) + 1).into());

        self.jobs.create(&replacement).await?;

        let claimed = self
            .jobs
            .annotate_if_absent(
                &original.job_id,
                meta::REDRIVEN_TO,
                replacement.job_id.clone().into(),
            )
            .await;
        match claimed {
            Ok(true) => {}
            Ok(false) => {
                self.retire(&replacement.job_id).await;
                return Ok(None);
            }
            Err(e) => {
                self.retire(&replacement.job_id).await;
                return Err(e.into());
            }
        }

        let message = JobMessage::for_job(&replacement, None);
        match self.queue.publish(&message).await {
            Ok(message_id) => {
                mark_queued(self.jobs.as_ref(), &replacement.job_id, &message_id).await;
                Ok(Some(replacement.job_id))
            }
            Err(e) => {
                compensate(self.jobs.as_ref(), &replacement.job_id).await;
                Err(RedriveError::Publish(e))
            }
        }
    }

    /// Fail an unclaimed replacement permanently so nothing re-drives it.
    async fn retire(&self, job_id: &str) {
        let transition = Transition::failed(SUPERSEDED, ErrorClass::Permanent);
        if let Err(e) = self.jobs.transition(job_id, &transition).await {
            tracing::error!(job_id, error = %e, "Failed to retire unclaimed replacement");
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum RedriveError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("publish failed: {0}")]
    Publish(#[from] QueueError),
}
