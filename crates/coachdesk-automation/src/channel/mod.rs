//! Outbound channel adapters.
//! The engine treats the channel as a capability: one rendered message to one
//! address, success or a classified failure. No retries happen here.

mod dry_run;
mod telegram;
mod webhook;

pub use dry_run::LogChannel;
pub use telegram::TelegramChannel;
pub use webhook::WebhookChannel;

use async_trait::async_trait;
use coachdesk_core::config::ChannelConfig;
use coachdesk_core::error::{CoachDeskError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A message ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

/// Transient failures may succeed later (network, throttling); permanent
/// ones will not (bad address, revoked consent at the provider).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelErrorKind {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?} channel failure: {detail}")]
pub struct ChannelError {
    pub kind: ChannelErrorKind,
    pub detail: String,
}

impl ChannelError {
    pub fn transient(detail: impl Into<String>) -> Self {
        Self { kind: ChannelErrorKind::Transient, detail: detail.into() }
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self { kind: ChannelErrorKind::Permanent, detail: detail.into() }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ChannelErrorKind::Transient
    }

    /// Classify an HTTP status returned by a provider.
    pub(crate) fn from_status(status: reqwest::StatusCode, detail: String) -> Self {
        if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
        {
            Self::transient(detail)
        } else {
            Self::permanent(detail)
        }
    }
}

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, address: &str, message: &RenderedMessage) -> std::result::Result<(), ChannelError>;
}

/// Build the configured channel adapter.
pub fn build_channel(config: &ChannelConfig) -> Result<Arc<dyn ChannelAdapter>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match config.kind.as_str() {
        "log" => Ok(Arc::new(LogChannel)),
        "webhook" => {
            if config.webhook_url.is_empty() {
                return Err(CoachDeskError::Config("channel.webhook_url is required for the webhook channel".into()));
            }
            Ok(Arc::new(WebhookChannel::new(&config.webhook_url, config.webhook_headers.clone(), timeout)))
        }
        "telegram" => {
            if config.telegram_bot_token.is_empty() {
                return Err(CoachDeskError::Config(
                    "channel.telegram_bot_token is required for the telegram channel".into(),
                ));
            }
            Ok(Arc::new(TelegramChannel::new(&config.telegram_bot_token, timeout)))
        }
        other => Err(CoachDeskError::Config(format!("Unknown channel kind: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_status_classification() {
        assert!(ChannelError::from_status(StatusCode::BAD_GATEWAY, "x".into()).is_transient());
        assert!(ChannelError::from_status(StatusCode::TOO_MANY_REQUESTS, "x".into()).is_transient());
        assert!(!ChannelError::from_status(StatusCode::BAD_REQUEST, "x".into()).is_transient());
        assert!(!ChannelError::from_status(StatusCode::FORBIDDEN, "x".into()).is_transient());
    }

    #[test]
    fn test_build_channel_from_config() {
        let mut config = ChannelConfig::default();
        assert_eq!(build_channel(&config).unwrap().name(), "log");

        config.kind = "webhook".into();
        assert!(build_channel(&config).is_err());
        config.webhook_url = "https://hooks.example.com/n".into();
        assert_eq!(build_channel(&config).unwrap().name(), "webhook");

        config.kind = "telegram".into();
        assert!(build_channel(&config).is_err());
        config.telegram_bot_token = "123:abc".into();
        assert_eq!(build_channel(&config).unwrap().name(), "telegram");

        config.kind = "carrier-pigeon".into();
        assert!(build_channel(&config).is_err());
    }
}
