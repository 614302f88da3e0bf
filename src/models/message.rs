use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::job::{Job, JobStatus};

const DEFAULT_STYLE: &str = "custom";

/// Job payload carried on the work queue from the coordinator to the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub job_id: String,
    pub owner_id: String,
    pub input_ref: String,
    pub prompt: String,
    pub style: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

/// A queue body that could not be turned into a [`JobMessage`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("malformed job message: {reason}")]
pub struct MalformedMessage {
    /// Present when the body was readable enough to identify the job.
    pub job_id: Option<String>,
    pub reason: String,
}

impl JobMessage {
    pub fn for_job(job: &Job, connection_id: Option<String>) -> Self {
        Self {
            job_id: job.job_id.clone(),
            owner_id: job.owner_id.clone(),
            input_ref: job.input_ref.clone(),
            prompt: job.prompt.clone(),
            style: job.style.clone(),
            created_at: job.created_at,
            connection_id,
        }
    }

    /// Parse and validate a raw queue body.
    ///
    /// Field extraction goes through a loose JSON value first so that a body
    /// with a bad or missing field still yields its `jobId` when one is there.
    pub fn parse(body: &str) -> Result<Self, MalformedMessage> {
        let value: Value = serde_json::from_str(body).map_err(|e| MalformedMessage {
            job_id: None,
            reason: format!("body is not valid JSON: {e}"),
        })?;

        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let job_id = field("jobId");
        let owner_id = field("ownerId");
        let input_ref = field("inputRef");
        let prompt = field("prompt");

        let missing: Vec<&str> = [
            ("jobId", job_id.is_none()),
            ("ownerId", owner_id.is_none()),
            ("inputRef", input_ref.is_none()),
            ("prompt", prompt.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect();

        match (job_id, owner_id, input_ref, prompt) {
            (Some(job_id), Some(owner_id), Some(input_ref), Some(prompt)) => Ok(Self {
                job_id,
                owner_id,
                input_ref,
                prompt,
                style: field("style").unwrap_or_else(|| DEFAULT_STYLE.to_string()),
                created_at: field("createdAt")
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now),
                connection_id: field("connectionId"),
            }),
            (job_id, ..) => Err(MalformedMessage {
                job_id,
                reason: format!("missing required fields: {}", missing.join(", ")),
            }),
        }
    }
}

/// Best-effort push sent to a live client connection.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Notification {
    ImageCompleted {
        job_id: String,
        status: JobStatus,
        output_ref: String,
        processing_time: f64,
    },
    ImageFailed {
        job_id: String,
        status: JobStatus,
        error: String,
    },
}

impl Notification {
    pub fn completed(job_id: &str, output_ref: &str, processing_time: f64) -> Self {
        Notification::ImageCompleted {
            job_id: job_id.to_string(),
            status: JobStatus::Completed,
            output_ref: output_ref.to_string(),
            processing_time,
        }
    }

    pub fn failed(job_id: &str, error: &str) -> Self {
        Notification::ImageFailed {
            job_id: job_id.to_string(),
            status: JobStatus::Failed,
            error: error.to_string(),
        }
    }
}
