//! Push delivery
//!
//! The dispatcher only sees [`PushTransport`]. The HTTP transport posts an
//! FCM-style data message; without an endpoint configured, messages are
//! only logged.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::PushConfig;

#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Deliver one message to a device. Errors are opaque to callers.
    async fn send(&self, device_token: &str, title: &str, body: &str) -> Result<()>;
}

/// Body of a reminder: who it is for, what to do, which schedule
pub fn reminder_body(user_name: &str, message: &str, schedule_name: &str) -> String {
    format!("{user_name}, {message}\nSchedule: {schedule_name}")
}

/// Pick a transport for the given config
pub fn from_config(config: &PushConfig) -> Result<Arc<dyn PushTransport>> {
    match &config.endpoint {
        Some(endpoint) => Ok(Arc::new(HttpPushTransport::new(
            endpoint.clone(),
            config.api_key.clone(),
            config.timeout_secs,
        )?)),
        None => {
            tracing::warn!("No push endpoint configured, reminders will only be logged");
            Ok(Arc::new(LogPushTransport))
        }
    }
}

pub struct HttpPushTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpPushTransport {
    pub fn new(endpoint: String, api_key: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build push HTTP client")?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn send(&self, device_token: &str, title: &str, body: &str) -> Result<()> {
        let payload = serde_json::json!({
            "message": {
                "token": device_token,
                "data": {
                    "title": title,
                    "content": body,
                }
            }
        });

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        request
            .send()
            .await
            .context("Push request failed")?
            .error_for_status()
            .context("Push service rejected the message")?;

        Ok(())
    }
}

/// Transport that only logs, for setups without a push service
pub struct LogPushTransport;

#[async_trait]
impl PushTransport for LogPushTransport {
    async fn send(&self, device_token: &str, title: &str, body: &str) -> Result<()> {
        tracing::info!(device_token, title, body, "Push message (log only)");
        Ok(())
    }
}

#[cfg(test)]
pub use recording::RecordingPushTransport;
