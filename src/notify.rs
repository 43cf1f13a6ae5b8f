use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub user_id: String,
    pub message: String,
    pub link: String,
    pub severity: Severity,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Request(String),
}

/// Delivery of user-facing messages. Callers never wait on the outcome.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            target = "hermes.notify",
            user_id = %notification.user_id,
            severity = ?notification.severity,
            link = %notification.link,
            "{}",
            notification.message
        );
        Ok(())
    }
}

pub struct WebhookNotifier {
    url: String,
    http: Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            http: crate::http::build_client(timeout, connect_timeout),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|err| NotifyError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

pub fn job_link(job_id: uuid::Uuid) -> String {
    format!("/imports/{job_id}")
}

pub fn user_imports_link(user_id: &str) -> String {
    format!("/users/{}#my_imports", urlencoding::encode(user_id))
}

#[cfg(test)]
pub use recording::RecordingNotifier;

#[cfg(test)]
mod recording {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
        fail: bool,
    }

    impl RecordingNotifier {
        pub fn failing() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        pub async fn sent(&self) -> Vec<Notification> {
            self.sent.lock().await.clone()
        }

        /// Waits briefly for detached deliveries to land.
        pub async fn settle(&self, expected: usize) -> Vec<Notification> {
            for _ in 0..50 {
                if self.sent.lock().await.len() >= expected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.sent().await
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.sent.lock().await.push(notification.clone());
            if self.fail {
                return Err(NotifyError::Request("HTTP 503".into()));
            }
            Ok(())
        }
    }
}
