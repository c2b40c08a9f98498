//! Email channel: JSON POST to an HTTP mail relay.

use serde_json::json;
use tracing::debug;

use crate::channel::{classify_response, ChannelAdapter, ChannelKind, SendOutcome};

pub struct EmailAdapter {
    client: reqwest::Client,
    relay_url: String,
    to: String,
}

impl EmailAdapter {
    pub fn new(client: reqwest::Client, relay_url: String, to: String) -> Self {
        Self { client, relay_url, to }
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for EmailAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(&self, payload: &serde_json::Value) -> SendOutcome {
        let subject = payload
            .get("title")
            .and_then(|t| t.as_str())
            .unwrap_or("driftwatch alert");
        let body = payload
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string());

        debug!(url = %self.relay_url, to = %self.to, "posting email notification");
        let result = self
            .client
            .post(&self.relay_url)
            .json(&json!({
                "to": self.to,
                "subject": subject,
                "body": body,
            }))
            .send()
            .await;

        classify_response(result)
    }
}
