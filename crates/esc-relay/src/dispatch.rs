//! Webhook transport.

use crate::RelayError;
use async_trait::async_trait;
use esc_core::RedactedUrl;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_ERROR_BODY_CHARS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    Failed(String),
}

/// Sends one escalation payload downstream. Implementations never return
/// transport errors as `Err`; every failure is a [`DispatchOutcome::Failed`].
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, payload: &Value) -> DispatchOutcome;
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    url: Option<String>,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(url: Option<String>, timeout: Duration) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { url, client })
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }
}

#[async_trait]
impl Dispatcher for WebhookDispatcher {
    async fn dispatch(&self, payload: &Value) -> DispatchOutcome {
        let Some(url) = self.url.as_deref() else {
            return DispatchOutcome::Failed("webhook url not configured".to_string());
        };

        let response = match self.client.post(url).json(payload).send().await {
            Ok(response) => response,
            Err(err) => {
                // reqwest errors embed the full URL, query string included.
                let err = err.without_url();
                return DispatchOutcome::Failed(format!("webhook request failed: {err}"));
            }
        };

        let status = response.status();
        if status.is_success() {
            debug!(event = "webhook_delivered", url = %RedactedUrl(url), status = status.as_u16());
            return DispatchOutcome::Delivered;
        }

        let body = response.text().await.unwrap_or_default();
        warn!(
            event = "webhook_rejected",
            url = %RedactedUrl(url),
            status = status.as_u16(),
            body = %truncate_chars(&body, MAX_ERROR_BODY_CHARS)
        );
        DispatchOutcome::Failed(format!("webhook status {}", status.as_u16()))
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
