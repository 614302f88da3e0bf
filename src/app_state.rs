use std::sync::Arc;

use crate::services::{coordinator::SubmissionCoordinator, jobs::JobStore, queue::WorkQueue};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub coordinator: Arc<SubmissionCoordinator>,
    /// Bucket that `fileKey` values are resolved against.
    pub upload_bucket: String,
}

impl AppState {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        coordinator: SubmissionCoordinator,
        upload_bucket: &str,
    ) -> Self {
        Self {
            jobs,
            queue,
            coordinator: Arc::new(coordinator),
            upload_bucket: upload_bucket.to_string(),
        }
    }
}
