use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::models::message::Notification;

/// Best-effort push channel to a client's live connection.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        connection_id: &str,
        notification: &Notification,
    ) -> Result<(), NotificationError>;
}

/// Posts notifications to `{endpoint}/@connections/{connection_id}`, the
/// shape used by websocket connection-management APIs.
pub struct HttpNotifier {
    http: Client,
    endpoint: String,
}

impl HttpNotifier {
    pub fn new(endpoint: &str) -> Result<Self, NotificationError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(NotificationError::Http)?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(
        &self,
        connection_id: &str,
        notification: &Notification,
    ) -> Result<(), NotificationError> {
        let url = format!("{}/@connections/{}", self.endpoint, connection_id);
        let response = self
            .http
            .post(&url)
            .json(notification)
            .send()
            .await
            .map_err(NotificationError::Http)?;

        match response.status().as_u16() {
            200..=299 => Ok(()),
            410 => Err(NotificationError::Gone(connection_id.to_string())),
            status => Err(NotificationError::Status(status)),
        }
    }
}

/// Used when no notification endpoint is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, connection_id: &str, _: &Notification) -> Result<(), NotificationError> {
        tracing::debug!(connection_id, "No notification endpoint configured, skipping push");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("connection {0} is gone")]
    Gone(String),

    #[error("notification endpoint returned status {0}")]
    Status(u16),
}
