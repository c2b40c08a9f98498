//! Outbound channel adapters.
//!
//! Each adapter satisfies one uniform contract: send a rendered payload to
//! a destination and classify the result. Expected failure modes (timeouts,
//! 5xx, rejected destinations) are outcomes, not errors -- an adapter only
//! errors for programmer mistakes.

pub mod chat;
pub mod email;
pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ChannelConfig;

/// Delivery outcome classification. Transient failures are retried with
/// backoff; permanent failures dead-letter the job immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl SendOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendOutcome::Success => "success",
            SendOutcome::TransientFailure => "transient_failure",
            SendOutcome::PermanentFailure => "permanent_failure",
        }
    }
}

/// The supported channel kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Chat,
    Email,
    Webhook,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Chat => "chat",
            ChannelKind::Email => "email",
            ChannelKind::Webhook => "webhook",
        }
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(ChannelKind::Chat),
            "email" => Ok(ChannelKind::Email),
            "webhook" => Ok(ChannelKind::Webhook),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform send contract every channel satisfies. The dispatcher bounds the
/// call with a timeout; a send outliving it counts as transient.
#[async_trait::async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn send(&self, payload: &serde_json::Value) -> SendOutcome;
}

/// The set of adapters the dispatcher can route to, built from the
/// configured destinations. Channels without a destination are absent.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    adapters: HashMap<ChannelKind, Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    pub fn from_config(cfg: &ChannelConfig) -> Self {
        let client = reqwest::Client::new();
        let mut adapters: HashMap<ChannelKind, Arc<dyn ChannelAdapter>> = HashMap::new();

        if let Some(url) = &cfg.chat_webhook_url {
            adapters.insert(
                ChannelKind::Chat,
                Arc::new(chat::ChatAdapter::new(client.clone(), url.clone())),
            );
        }
        if let (Some(url), Some(to)) = (&cfg.email_relay_url, &cfg.email_to) {
            adapters.insert(
                ChannelKind::Email,
                Arc::new(email::EmailAdapter::new(client.clone(), url.clone(), to.clone())),
            );
        }
        if let Some(url) = &cfg.webhook_url {
            adapters.insert(
                ChannelKind::Webhook,
                Arc::new(webhook::WebhookAdapter::new(client, url.clone())),
            );
        }

        Self { adapters }
    }

    /// Registry with explicit adapters. Tests use this to script outcomes.
    pub fn with_adapters(adapters: Vec<Arc<dyn ChannelAdapter>>) -> Self {
        Self {
            adapters: adapters.into_iter().map(|a| (a.kind(), a)).collect(),
        }
    }

    pub fn get(&self, kind: ChannelKind) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn is_configured(&self, kind: ChannelKind) -> bool {
        self.adapters.contains_key(&kind)
    }
}

/// Classify an HTTP response (or transport error) into a send outcome.
/// 2xx succeeds; 408/429 and 5xx are retryable; other 4xx means the
/// destination rejected the payload for good.
pub(crate) fn classify_response(result: Result<reqwest::Response, reqwest::Error>) -> SendOutcome {
    match result {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() {
                SendOutcome::Success
            } else if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
                SendOutcome::TransientFailure
            } else {
                SendOutcome::PermanentFailure
            }
        }
        Err(e) if e.is_timeout() || e.is_connect() => SendOutcome::TransientFailure,
        Err(e) if e.is_builder() || e.is_request() => SendOutcome::PermanentFailure,
        Err(_) => SendOutcome::TransientFailure,
    }
}
