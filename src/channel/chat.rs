//! Chat channel: Slack-compatible incoming webhook.

use serde_json::json;
use tracing::debug;

use crate::channel::{classify_response, ChannelAdapter, ChannelKind, SendOutcome};

pub struct ChatAdapter {
    client: reqwest::Client,
    webhook_url: String,
}

impl ChatAdapter {
    pub fn new(client: reqwest::Client, webhook_url: String) -> Self {
        Self { client, webhook_url }
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for ChatAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Chat
    }

    async fn send(&self, payload: &serde_json::Value) -> SendOutcome {
        // Incoming webhooks want a plain text body; fall back to the raw
        // payload for digest or custom shapes
        let text = payload
            .get("message")
            .and_then(|m| m.as_str())
            .map(|m| {
                let title = payload.get("title").and_then(|t| t.as_str()).unwrap_or("");
                if title.is_empty() {
                    m.to_string()
                } else {
                    format!("*{title}*\n{m}")
                }
            })
            .unwrap_or_else(|| payload.to_string());

        debug!(url = %self.webhook_url, "posting chat notification");
        let result = self
            .client
            .post(&self.webhook_url)
            .json(&json!({ "text": text }))
            .send()
            .await;

        classify_response(result)
    }
}
