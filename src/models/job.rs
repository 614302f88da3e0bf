use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Well-known keys in a job's metadata map.
pub mod meta {
    pub const QUEUE_MESSAGE_ID: &str = "queueMessageId";
    pub const GENERATION_TIME: &str = "generationTime";
    pub const MODEL_NAME: &str = "modelName";
    pub const OUTPUT_KEY: &str = "outputKey";
    pub const S3_URI: &str = "s3Uri";
    pub const PROCESSING_TIME: &str = "processingTime";
    pub const ERROR_CLASS: &str = "errorClass";
    pub const REDRIVEN_FROM: &str = "redrivenFrom";
    pub const REDRIVEN_TO: &str = "redrivenTo";
    pub const REDRIVE_ATTEMPT: &str = "redriveAttempt";
}

/// Status of an image generation job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Statuses a job may hold immediately before moving into `self`.
    pub fn predecessors(self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Pending => &[],
            Queued => &[Pending],
            // Pending: the worker can receive the message before the coordinator
            // records `queued`. Processing: redelivery after a worker died mid-job.
            Processing => &[Pending, Queued, Processing],
            Completed => &[Processing],
            Failed => &[Pending, Queued, Processing],
        }
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        next.predecessors().contains(&self)
    }
}

/// Whether a failure is worth re-driving.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    /// Infrastructure or upstream trouble (storage, timeouts, queue outages).
    Transient,
    /// Bad input or a refusal from the generation model; re-running won't help.
    Permanent,
}

/// One user-initiated image generation request and its lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub owner_id: String,
    pub status: JobStatus,
    pub input_ref: String,
    pub output_ref: Option<String>,
    pub prompt: String,
    pub style: String,
    pub error: Option<String>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh `pending` job with a newly generated id.
    pub fn new(owner_id: &str, input_ref: &str, prompt: &str, style: &str) -> Self {
        let now = Utc::now();
        Self {
            job_id: new_job_id(),
            owner_id: owner_id.to_string(),
            status: JobStatus::Pending,
            input_ref: input_ref.to_string(),
            output_ref: None,
            prompt: prompt.to_string(),
            style: style.to_string(),
            error: None,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a transition in place, refusing it (and returning the current
    /// status) when the job is not in one of the allowed predecessor states.
    pub fn apply(&mut self, transition: &Transition, now: DateTime<Utc>) -> Result<(), JobStatus> {
        if !self.status.can_transition_to(transition.to) {
            return Err(self.status);
        }

        self.status = transition.to;
        self.updated_at = now;
        if let Some(output_ref) = &transition.output_ref {
            self.output_ref = Some(output_ref.clone());
        }
        if let Some(error) = &transition.error {
            self.error = Some(error.clone());
        }
        for (key, value) in &transition.metadata {
            self.metadata.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        self.metadata
            .get(meta::ERROR_CLASS)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }
}

/// `job_` followed by 12 hex characters.
pub fn new_job_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("job_{}", &hex[..12])
}

/// A requested status change plus the fields that change with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub to: JobStatus,
    pub output_ref: Option<String>,
    pub error: Option<String>,
    pub metadata: Map<String, Value>,
}

impl Transition {
    fn to(status: JobStatus) -> Self {
        Self {
            to: status,
            output_ref: None,
            error: None,
            metadata: Map::new(),
        }
    }

    pub fn queued(queue_message_id: &str) -> Self {
        Self::to(JobStatus::Queued).with_metadata(meta::QUEUE_MESSAGE_ID, queue_message_id)
    }

    pub fn processing() -> Self {
        Self::to(JobStatus::Processing)
    }

    pub fn completed(output_ref: &str) -> Self {
        Self {
            output_ref: Some(output_ref.to_string()),
            ..Self::to(JobStatus::Completed)
        }
    }

    pub fn failed(error: impl Into<String>, class: ErrorClass) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::to(JobStatus::Failed)
        }
        .with_metadata(meta::ERROR_CLASS, class.to_string())
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}
