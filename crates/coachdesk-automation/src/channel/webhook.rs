//! Generic HTTP webhook: POST with a JSON body per message.

use async_trait::async_trait;
use std::time::Duration;

use super::{ChannelAdapter, ChannelError, RenderedMessage};

pub struct WebhookChannel {
    url: String,
    headers: Vec<(String, String)>,
    timeout: Duration,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: &str, headers: Vec<(String, String)>, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            headers,
            timeout,
            client: reqwest::Client::new(),
        }
    }

    fn payload(address: &str, message: &RenderedMessage) -> serde_json::Value {
        serde_json::json!({
            "to": address,
            "subject": message.subject,
            "body": message.body,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
    }
}

#[async_trait]
impl ChannelAdapter for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, address: &str, message: &RenderedMessage) -> Result<(), ChannelError> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&Self::payload(address, message))
            .timeout(self.timeout);

        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ChannelError::transient(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::debug!("✅ Webhook accepted message for {address}");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(ChannelError::from_status(status, format!("Webhook error {status}: {body}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let msg = RenderedMessage { subject: "Hi".into(), body: "See you at 09:00".into() };
        let payload = WebhookChannel::payload("chat-1", &msg);
        assert_eq!(payload["to"], "chat-1");
        assert_eq!(payload["subject"], "Hi");
        assert_eq!(payload["body"], "See you at 09:00");
        assert!(payload["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        // Port 9 on localhost: nothing listens, connection is refused.
        let ch = WebhookChannel::new("http://127.0.0.1:9/hook", vec![], Duration::from_millis(500));
        let msg = RenderedMessage { subject: "s".into(), body: "b".into() };
        let err = ch.send("chat-1", &msg).await.unwrap_err();
        assert!(err.is_transient());
    }
}
