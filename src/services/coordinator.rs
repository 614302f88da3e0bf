//! Quota-gated job submission.
//!
//! A submission creates a `pending` job, publishes it to the work queue and
//! only then charges the owner's daily quota. When publishing fails the job
//! is compensated to `failed` and no quota is charged.
//!
//! The quota check and the increment are two separate operations, so
//! concurrent submissions from one owner can all pass the check before any
//! of them commits. The daily limit is therefore a soft limit that can be
//! overshot by up to `concurrency - 1`.

use axum::http::StatusCode;
use std::sync::Arc;
use std::time::Instant;

use crate::config::SubmissionPolicy;
use crate::models::job::{meta, ErrorClass, Job, Transition};
use crate::models::message::JobMessage;
use crate::services::jobs::{JobStore, StoreError};
use crate::services::queue::{QueueError, WorkQueue};
use crate::services::quota::{self, QuotaLedger};
use crate::services::storage::{ObjectRef, ObjectStore, StorageError};

/// Error recorded on a job whose message never reached the queue.
pub const ENQUEUE_FAILED: &str = "failed to enqueue";

/// A validated-at-the-edge request to generate an image.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub owner_id: String,
    pub input_ref: String,
    pub prompt: String,
    pub style: String,
    /// Live connection to notify when processing finishes.
    pub connection_id: Option<String>,
}

/// Outcome of an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job_id: String,
    pub remaining_quota: u32,
}

pub struct SubmissionCoordinator {
    jobs: Arc<dyn JobStore>,
    quota: Arc<dyn QuotaLedger>,
    storage: Arc<dyn ObjectStore>,
    queue: Arc<dyn WorkQueue>,
    policy: SubmissionPolicy,
}

impl SubmissionCoordinator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        quota: Arc<dyn QuotaLedger>,
        storage: Arc<dyn ObjectStore>,
        queue: Arc<dyn WorkQueue>,
        policy: SubmissionPolicy,
    ) -> Self {
        Self {
            jobs,
            quota,
            storage,
            queue,
            policy,
        }
    }

    pub fn daily_limit(&self) -> u32 {
        self.policy.daily_limit
    }

    /// Validate, check quota, create the job, publish it, then charge quota.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Submission, SubmitError> {
        let start = Instant::now();
        let owner_id = request.owner_id.as_str();

        tracing::info!(
            owner_id,
            input_ref = %request.input_ref,
            style = %request.style,
            prompt_length = request.prompt.chars().count(),
            "Job submission received"
        );

        let (input, prompt) = match self.validate(&request).await {
            Ok(valid) => valid,
            Err(e) => {
                tracing::warn!(owner_id, error = %e, "Submission rejected");
                metrics::counter!("generation_jobs_rejected_total", "reason" => e.reason())
                    .increment(1);
                return Err(e);
            }
        };

        let day = quota::today();
        let used = self.quota.peek(owner_id, day).await?;
        if used >= self.policy.daily_limit {
            tracing::warn!(
                owner_id,
                current_usage = used,
                daily_limit = self.policy.daily_limit,
                "Daily quota exceeded"
            );
            metrics::counter!("generation_jobs_rejected_total", "reason" => "quota_exceeded")
                .increment(1);
            return Err(SubmitError::QuotaExceeded {
                daily_limit: self.policy.daily_limit,
            });
        }

        let job = Job::new(owner_id, &input.to_string(), prompt, &request.style);
        self.jobs.create(&job).await?;
        tracing::info!(job_id = %job.job_id, owner_id, input_ref = %job.input_ref, "Job created");

        let message = JobMessage::for_job(&job, request.connection_id.clone());
        let message_id = match self.queue.publish(&message).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(job_id = %job.job_id, owner_id, error = %e, "Publish failed");
                compensate(self.jobs.as_ref(), &job.job_id).await;
                metrics::counter!("generation_jobs_rejected_total", "reason" => "publish_failed")
                    .increment(1);
                return Err(SubmitError::Publish {
                    job_id: job.job_id,
                    source: e,
                });
            }
        };
        tracing::info!(job_id = %job.job_id, message_id = %message_id, "Job published");

        // The message is out; from here on nothing may fail the submission.
        let new_count = match self.quota.increment(owner_id, day).await {
            Ok(count) => {
                tracing::info!(owner_id, current_usage = count, "Usage incremented");
                count
            }
            Err(e) => {
                tracing::error!(
                    job_id = %job.job_id,
                    owner_id,
                    error = %e,
                    "Quota commit failed after publish, job proceeds uncharged"
                );
                metrics::counter!("generation_quota_commit_failures_total").increment(1);
                used + 1
            }
        };

        mark_queued(self.jobs.as_ref(), &job.job_id, &message_id).await;

        metrics::counter!("generation_jobs_submitted_total").increment(1);
        tracing::info!(
            job_id = %job.job_id,
            owner_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Job queued"
        );

        Ok(Submission {
            job_id: job.job_id,
            remaining_quota: self.policy.daily_limit.saturating_sub(new_count),
        })
    }

    async fn validate<'a>(
        &self,
        request: &'a SubmitRequest,
    ) -> Result<(ObjectRef, &'a str), SubmitError> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(SubmitError::Validation("prompt is required".to_string()));
        }
        if prompt.chars().count() > self.policy.max_prompt_length {
            return Err(SubmitError::Validation(format!(
                "prompt is too long (max {} characters)",
                self.policy.max_prompt_length
            )));
        }

        let input: ObjectRef = request
            .input_ref
            .parse()
            .map_err(|e: StorageError| SubmitError::Validation(e.to_string()))?;

        if !self.storage.exists(&input).await? {
            return Err(SubmitError::InputNotFound(input.to_string()));
        }

        Ok((input, prompt))
    }
}

/// Compensating transition for a job whose message never left.
pub(crate) async fn compensate(jobs: &dyn JobStore, job_id: &str) {
    let transition = Transition::failed(ENQUEUE_FAILED, ErrorClass::Transient);
    if let Err(e) = jobs.transition(job_id, &transition).await {
        tracing::error!(job_id, error = %e, "Failed to mark unpublished job as failed");
    }
}

/// Record `queued` after a successful publish. Never fails the caller: the
/// message is already out and the worker accepts `pending` jobs.
pub(crate) async fn mark_queued(jobs: &dyn JobStore, job_id: &str, message_id: &str) {
    match jobs.transition(job_id, &Transition::queued(message_id)).await {
        Ok(_) => {}
        // The worker got the message first and already claimed the job.
        Err(StoreError::Conflict { current, .. }) => {
            tracing::debug!(job_id, %current, "Job advanced before it was marked queued");
            let annotated = jobs
                .annotate_if_absent(job_id, meta::QUEUE_MESSAGE_ID, message_id.into())
                .await;
            if let Err(e) = annotated {
                tracing::warn!(job_id, error = %e, "Failed to record queue message id");
            }
        }
        Err(e) => {
            tracing::error!(job_id, error = %e, "Failed to mark published job as queued");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("{0}")]
    Validation(String),

    #[error("uploaded file not found: {0}")]
    InputNotFound(String),

    #[error("daily quota of {daily_limit} exceeded")]
    QuotaExceeded { daily_limit: u32 },

    #[error("failed to queue image generation request")]
    Publish {
        job_id: String,
        #[source]
        source: QueueError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SubmitError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SubmitError::Validation(_) => StatusCode::BAD_REQUEST,
            SubmitError::InputNotFound(_) => StatusCode::NOT_FOUND,
            SubmitError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            SubmitError::Publish { .. } | SubmitError::Store(_) | SubmitError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// The job created before the failure, if one was.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            SubmitError::Publish { job_id, .. } => Some(job_id),
            _ => None,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            SubmitError::Validation(_) => "validation",
            SubmitError::InputNotFound(_) => "input_not_found",
            SubmitError::QuotaExceeded { .. } => "quota_exceeded",
            SubmitError::Publish { .. } => "publish_failed",
            SubmitError::Store(_) | SubmitError::Storage(_) => "internal",
        }
    }
}
