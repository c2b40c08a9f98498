//! Generic webhook channel: the full alert JSON, as-is.

use tracing::debug;

use crate::channel::{classify_response, ChannelAdapter, ChannelKind, SendOutcome};

pub struct WebhookAdapter {
    client: reqwest::Client,
    url: String,
}

impl WebhookAdapter {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for WebhookAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn send(&self, payload: &serde_json::Value) -> SendOutcome {
        debug!(url = %self.url, "posting webhook notification");
        let result = self.client.post(&self.url).json(payload).send().await;
        classify_response(result)
    }
}
