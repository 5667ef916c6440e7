use crate::error::SendError;
use crate::Sender;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::time::Duration;
use tripwire_common::types::{Contact, Event, TriggerSnapshot};

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const MAX_ERROR_BODY: usize = 512;

/// POSTs the JSON package to the contact's URL.
///
/// Network failures, 5xx and 429 responses are transient; any other
/// non-success status and an unparseable URL are permanent.
pub struct WebhookSender {
    client: reqwest::Client,
}

impl WebhookSender {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebhookSender {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn classify(status: StatusCode, body: &str) -> SendError {
    let mut body = body.to_string();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    let message = format!("webhook returned {status}: {body}");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        SendError::Transient(message)
    } else {
        SendError::Permanent(message)
    }
}

#[async_trait]
impl Sender for WebhookSender {
    async fn init(&mut self, settings: &HashMap<String, String>) -> Result<(), SendError> {
        let timeout_secs = match settings.get("timeout_secs") {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|e| SendError::Permanent(format!("invalid timeout_secs '{raw}': {e}")))?,
            None => DEFAULT_TIMEOUT_SECS,
        };
        self.client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| SendError::Permanent(format!("failed to build HTTP client: {e}")))?;
        Ok(())
    }

    async fn send(
        &self,
        events: &[Event],
        contact: &Contact,
        trigger: &TriggerSnapshot,
        throttled: bool,
    ) -> Result<(), SendError> {
        let url = reqwest::Url::parse(&contact.value).map_err(|e| {
            SendError::Permanent(format!("invalid webhook url '{}': {e}", contact.value))
        })?;
        let package = super::package(events, contact, trigger, throttled);

        let response = self
            .client
            .post(url)
            .json(&package)
            .send()
            .await
            .map_err(|e| SendError::Transient(format!("webhook request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(contact_id = %contact.id, status = status.as_u16(), "Webhook delivered");
            return Ok(());
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|e| format!("[failed to read response body: {e}]"));
        Err(classify(status, &body))
    }
}
