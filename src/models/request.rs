use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::job::JobStatus;

/// Object keys under this prefix are the only accepted generation inputs.
pub const UPLOAD_PREFIX: &str = "uploads/";

fn default_style() -> String {
    "custom".to_string()
}

/// Body of `POST /api/v1/generate`.
///
/// The prompt is checked by the coordinator, which owns the configured
/// length limit.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(default)]
    #[garde(custom(validate_file_key))]
    pub file_key: String,

    #[serde(default)]
    #[garde(skip)]
    pub prompt: String,

    #[serde(default = "default_style")]
    #[garde(length(chars, min = 1, max = 64))]
    pub style: String,

    #[serde(default)]
    #[garde(length(min = 1, max = 128))]
    pub connection_id: Option<String>,
}

fn validate_file_key(value: &str, _context: &()) -> garde::Result {
    if value.is_empty() {
        return Err(garde::Error::new("fileKey is required"));
    }
    if !value.starts_with(UPLOAD_PREFIX) || value.len() == UPLOAD_PREFIX.len() {
        return Err(garde::Error::new("invalid file key format"));
    }
    Ok(())
}

/// Response after a job was accepted and queued.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub remaining_quota: u32,
    pub message: String,
}

/// Error body for every non-2xx API response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_quota: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            job_id: None,
            remaining_quota: None,
            message: None,
        }
    }
}
