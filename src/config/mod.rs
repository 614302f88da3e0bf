use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the work queue
    pub redis_url: String,

    /// S3-compatible endpoint URL
    pub s3_endpoint: String,

    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    pub s3_access_key: String,

    pub s3_secret_key: String,

    /// Use path-style addressing (LocalStack, MinIO)
    #[serde(default)]
    pub s3_path_style: bool,

    /// Bucket holding user uploads (generation inputs)
    pub upload_bucket: String,

    /// Bucket receiving generated images
    pub result_bucket: String,

    pub gemini_api_key: String,

    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Submissions allowed per user per UTC day
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,

    #[serde(default = "default_max_prompt_length")]
    pub max_prompt_length: usize,

    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,

    /// Messages taken from the queue per worker poll
    #[serde(default = "default_worker_batch_size")]
    pub worker_batch_size: usize,

    /// Messages processed concurrently within one batch (1 = sequential)
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Connection-callback endpoint for live notifications; pushes are skipped when unset
    pub notification_endpoint: Option<String>,

    /// Where the worker serves its Prometheus scrape endpoint
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,

    /// Seconds a received message stays invisible before it is handed out again
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    #[serde(default = "default_redrive_batch_size")]
    pub redrive_batch_size: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_s3_region() -> String {
    "auto".to_string()
}

fn default_model_name() -> String {
    "gemini-2.5-flash-image".to_string()
}

fn default_daily_limit() -> u32 {
    10
}

fn default_max_prompt_length() -> usize {
    2000
}

fn default_generation_timeout_secs() -> u64 {
    120
}

fn default_worker_batch_size() -> usize {
    10
}

fn default_worker_concurrency() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_visibility_timeout_secs() -> u64 {
    900
}

fn default_redrive_batch_size() -> usize {
    50
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn submission_policy(&self) -> SubmissionPolicy {
        SubmissionPolicy {
            daily_limit: self.daily_limit,
            max_prompt_length: self.max_prompt_length,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            result_bucket: self.result_bucket.clone(),
            model_name: self.model_name.clone(),
            generation_timeout: Duration::from_secs(self.generation_timeout_secs),
            concurrency: self.worker_concurrency.max(1),
        }
    }
}

/// Limits enforced by the submission coordinator.
#[derive(Debug, Clone)]
pub struct SubmissionPolicy {
    pub daily_limit: u32,
    pub max_prompt_length: usize,
}

impl Default for SubmissionPolicy {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            max_prompt_length: default_max_prompt_length(),
        }
    }
}

/// Settings for the processing worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub result_bucket: String,
    /// Recorded when the generation service does not report its own version.
    pub model_name: String,
    pub generation_timeout: Duration,
    pub concurrency: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            result_bucket: "results".to_string(),
            model_name: default_model_name(),
            generation_timeout: Duration::from_secs(default_generation_timeout_secs()),
            concurrency: default_worker_concurrency(),
        }
    }
}
