//! Telegram Bot API: `sendMessage`, the recipient address is the chat id.

use async_trait::async_trait;
use std::time::Duration;

use super::{ChannelAdapter, ChannelError, RenderedMessage};

pub struct TelegramChannel {
    bot_token: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: &str, timeout: Duration) -> Self {
        Self {
            bot_token: bot_token.to_string(),
            timeout,
            client: reqwest::Client::new(),
        }
    }

    fn text(message: &RenderedMessage) -> String {
        if message.subject.is_empty() {
            escape_markdown(&message.body)
        } else {
            format!("*{}*\n\n{}", escape_markdown(&message.subject), escape_markdown(&message.body))
        }
    }
}

#[async_trait]
impl ChannelAdapter for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, address: &str, message: &RenderedMessage) -> Result<(), ChannelError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": address,
                "text": Self::text(message),
                "parse_mode": "Markdown"
            }))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ChannelError::transient(format!("Telegram send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::debug!("✅ Telegram message sent to chat {address}");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(ChannelError::from_status(status, format!("Telegram API error {status}: {body}")))
        }
    }
}

/// Escape Telegram MarkdownV1 special characters.
fn escape_markdown(s: &str) -> String {
    s.replace('_', "\\_")
        .replace('*', "\\*")
        .replace('[', "\\[")
        .replace('`', "\\`")
}
