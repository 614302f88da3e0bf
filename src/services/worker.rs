//! Processing of delivered queue batches.
//!
//! Every message is handled inside its own failure boundary: whatever goes
//! wrong is written to that job's record and the batch moves on. The batch
//! itself never fails. Once a batch has been processed all of its
//! deliveries are acknowledged, so the transport does not redeliver
//! individually failed messages. Failed jobs with a transient error class
//! are picked up again by [`crate::services::redrive::Reconciler`].

use futures::stream::{self, StreamExt};
use image::ImageFormat;
use serde::Serialize;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use crate::config::WorkerSettings;
use crate::models::job::{meta, ErrorClass, JobStatus, Transition};
use crate::models::message::{JobMessage, Notification};
use crate::services::generation::{GenerationError, GenerationService};
use crate::services::jobs::{JobStore, StoreError};
use crate::services::notify::Notifier;
use crate::services::queue::{Delivery, QueueError, WorkQueue};
use crate::services::storage::{ObjectRef, ObjectStore, StorageError};

/// Per-batch tally returned to the transport instead of an error.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub processed: usize,
    pub failed: usize,
    /// Redeliveries of jobs that had already finished.
    pub skipped: usize,
}

/// What happened to a single message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    Completed { job_id: String },
    Failed { job_id: Option<String>, error: String },
    Skipped { job_id: String, status: JobStatus },
}

/// Where generated images are written for a given owner and job. Outputs
/// are always stored as PNG.
pub fn output_key(owner_id: &str, job_id: &str) -> String {
    format!("generated/{owner_id}/{job_id}.png")
}

#[derive(Debug, thiserror::Error)]
enum ProcessError {
    #[error("job is already {0}")]
    AlreadyFinished(JobStatus),

    #[error("job record not found")]
    JobMissing,

    #[error("job store error: {0}")]
    Store(StoreError),

    #[error("invalid input reference: {0}")]
    InputRef(StorageError),

    #[error("failed to read input image: {0}")]
    InputRead(StorageError),

    #[error("input image could not be decoded: {0}")]
    InputDecode(#[from] image::ImageError),

    #[error("{0}")]
    Generation(#[from] GenerationError),

    #[error("generated image could not be decoded: {0}")]
    OutputDecode(image::ImageError),

    #[error("failed to store output image: {0}")]
    OutputWrite(StorageError),
}

impl ProcessError {
    fn class(&self) -> ErrorClass {
        match self {
            ProcessError::Store(_) | ProcessError::OutputWrite(_) => ErrorClass::Transient,
            ProcessError::InputRead(StorageError::NotFound(_)) => ErrorClass::Permanent,
            ProcessError::InputRead(_) => ErrorClass::Transient,
            ProcessError::Generation(e) if e.is_transient() => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}

impl From<StoreError> for ProcessError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { current, .. } => ProcessError::AlreadyFinished(current),
            StoreError::NotFound(_) => ProcessError::JobMissing,
            other => ProcessError::Store(other),
        }
    }
}

struct CompletedJob {
    output_ref: String,
    processing_time: f64,
}

pub struct ProcessingWorker {
    jobs: Arc<dyn JobStore>,
    storage: Arc<dyn ObjectStore>,
    generator: Arc<dyn GenerationService>,
    notifier: Arc<dyn Notifier>,
    settings: WorkerSettings,
}

impl ProcessingWorker {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        storage: Arc<dyn ObjectStore>,
        generator: Arc<dyn GenerationService>,
        notifier: Arc<dyn Notifier>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            jobs,
            storage,
            generator,
            notifier,
            settings,
        }
    }

    /// Receive one batch, process it and acknowledge every delivery.
    ///
    /// Returns `Ok(None)` when the queue had nothing to hand out.
    pub async fn run_once(
        &self,
        queue: &dyn WorkQueue,
        max: usize,
    ) -> Result<Option<BatchReport>, QueueError> {
        let deliveries = queue.receive(max).await?;
        if deliveries.is_empty() {
            return Ok(None);
        }

        let report = self.process_batch(&deliveries).await;

        for delivery in &deliveries {
            if let Err(e) = queue.ack(delivery).await {
                tracing::warn!(message_id = %delivery.message_id, error = %e, "Failed to ack delivery");
            }
        }

        Ok(Some(report))
    }

    /// Process every delivery independently and tally the outcomes.
    pub async fn process_batch(&self, deliveries: &[Delivery]) -> BatchReport {
        let outcomes: Vec<MessageOutcome> = stream::iter(deliveries)
            .map(|delivery| self.process_delivery(delivery))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut report = BatchReport::default();
        for outcome in &outcomes {
            match outcome {
                MessageOutcome::Completed { .. } => report.processed += 1,
                MessageOutcome::Failed { .. } => report.failed += 1,
                MessageOutcome::Skipped { .. } => report.skipped += 1,
            }
        }

        tracing::info!(
            processed = report.processed,
            failed = report.failed,
            skipped = report.skipped,
            "Batch processing complete"
        );
        report
    }

    pub async fn process_delivery(&self, delivery: &Delivery) -> MessageOutcome {
        match JobMessage::parse(&delivery.body) {
            Ok(message) => self.process_message(&message).await,
            Err(malformed) => {
                tracing::warn!(
                    message_id = %delivery.message_id,
                    job_id = malformed.job_id.as_deref().unwrap_or("unknown"),
                    error = %malformed,
                    "Malformed queue message"
                );
                let error = malformed.to_string();
                if let Some(job_id) = &malformed.job_id {
                    self.record_failure(job_id, &error, ErrorClass::Permanent, None)
                        .await;
                }
                metrics::counter!("generation_jobs_failed_total").increment(1);
                MessageOutcome::Failed {
                    job_id: malformed.job_id,
                    error,
                }
            }
        }
    }

    pub async fn process_message(&self, message: &JobMessage) -> MessageOutcome {
        let started = Instant::now();
        let job_id = message.job_id.as_str();
        tracing::info!(job_id, owner_id = %message.owner_id, "Processing job");

        match self.execute(message, started).await {
            Ok(done) => {
                metrics::counter!("generation_jobs_completed_total").increment(1);
                tracing::info!(
                    job_id,
                    output_ref = %done.output_ref,
                    processing_time = done.processing_time,
                    "Job completed"
                );
                if let Some(connection_id) = &message.connection_id {
                    let notification =
                        Notification::completed(job_id, &done.output_ref, done.processing_time);
                    self.push(connection_id, &notification).await;
                }
                MessageOutcome::Completed {
                    job_id: job_id.to_string(),
                }
            }
            Err(ProcessError::AlreadyFinished(status)) => {
                tracing::info!(job_id, %status, "Job already finished, skipping redelivery");
                MessageOutcome::Skipped {
                    job_id: job_id.to_string(),
                    status,
                }
            }
            Err(e) => {
                let error = e.to_string();
                tracing::error!(job_id, error = %error, error_class = %e.class(), "Job failed");
                metrics::counter!("generation_jobs_failed_total").increment(1);

                if !matches!(e, ProcessError::JobMissing) {
                    let elapsed = started.elapsed().as_secs_f64();
                    self.record_failure(job_id, &error, e.class(), Some(elapsed))
                        .await;
                }
                if let Some(connection_id) = &message.connection_id {
                    self.push(connection_id, &Notification::failed(job_id, &error))
                        .await;
                }
                MessageOutcome::Failed {
                    job_id: Some(job_id.to_string()),
                    error,
                }
            }
        }
    }

    async fn execute(
        &self,
        message: &JobMessage,
        started: Instant,
    ) -> Result<CompletedJob, ProcessError> {
        let job = self
            .jobs
            .get(&message.job_id)
            .await?
            .ok_or(ProcessError::JobMissing)?;
        if job.status.is_terminal() {
            return Err(ProcessError::AlreadyFinished(job.status));
        }

        self.jobs
            .transition(&message.job_id, &Transition::processing())
            .await?;

        let input: ObjectRef = message.input_ref.parse().map_err(ProcessError::InputRef)?;
        tracing::debug!(job_id = %message.job_id, input = %input, "Downloading input image");
        let input_bytes = self
            .storage
            .get(&input)
            .await
            .map_err(ProcessError::InputRead)?;
        let input_png = normalize_to_png(&input_bytes)?;

        tracing::debug!(job_id = %message.job_id, "Calling generation service");
        let generation_start = Instant::now();
        let image = tokio::time::timeout(
            self.settings.generation_timeout,
            self.generator.generate(&message.prompt, &input_png),
        )
        .await
        .map_err(|_| GenerationError::Timeout(self.settings.generation_timeout))??;
        let generation_time = generation_start.elapsed().as_secs_f64();
        metrics::histogram!("generation_seconds").record(generation_time);

        tracing::info!(
            job_id = %message.job_id,
            generation_time,
            size = image.data.len(),
            mime_type = %image.mime_type,
            "Image generated"
        );

        let data = if image.mime_type == "image/png" {
            image.data
        } else {
            normalize_to_png(&image.data).map_err(ProcessError::OutputDecode)?
        };
        let key = output_key(&message.owner_id, &message.job_id);
        let output = ObjectRef::new(self.settings.result_bucket.clone(), key.clone());
        self.storage
            .put(&output, &data, "image/png")
            .await
            .map_err(ProcessError::OutputWrite)?;
        let output_ref = output.to_string();

        let model = if image.model.is_empty() {
            self.settings.model_name.clone()
        } else {
            image.model
        };
        let processing_time = started.elapsed().as_secs_f64();
        let transition = Transition::completed(&output_ref)
            .with_metadata(meta::GENERATION_TIME, generation_time)
            .with_metadata(meta::MODEL_NAME, model)
            .with_metadata(meta::OUTPUT_KEY, key)
            .with_metadata(meta::S3_URI, output_ref.clone())
            .with_metadata(meta::PROCESSING_TIME, processing_time);
        self.jobs.transition(&message.job_id, &transition).await?;

        Ok(CompletedJob {
            output_ref,
            processing_time,
        })
    }

    async fn record_failure(
        &self,
        job_id: &str,
        error: &str,
        class: ErrorClass,
        processing_time: Option<f64>,
    ) {
        let mut transition = Transition::failed(error, class);
        if let Some(elapsed) = processing_time {
            transition = transition.with_metadata(meta::PROCESSING_TIME, elapsed);
        }
        match self.jobs.transition(job_id, &transition).await {
            Ok(_) => {}
            Err(StoreError::Conflict { current, .. }) => {
                tracing::warn!(job_id, %current, "Job already finished, failure not recorded");
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to record job failure");
            }
        }
    }

    /// Best-effort push. Failures are logged and never touch job state.
    async fn push(&self, connection_id: &str, notification: &Notification) {
        if let Err(e) = self.notifier.notify(connection_id, notification).await {
            metrics::counter!("generation_notifications_failed_total").increment(1);
            tracing::warn!(connection_id, error = %e, "Failed to push notification");
        }
    }
}

/// Decode whatever format was uploaded and re-encode it as PNG.
fn normalize_to_png(bytes: &[u8]) -> Result<Vec<u8>, image::ImageError> {
    let decoded = image::load_from_memory(bytes)?;
    let mut png = Vec::new();
    decoded.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(png)
}
