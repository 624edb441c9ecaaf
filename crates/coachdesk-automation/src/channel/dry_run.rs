//! Dry-run channel: logs the message instead of delivering it.

use async_trait::async_trait;

use super::{ChannelAdapter, ChannelError, RenderedMessage};

pub struct LogChannel;

#[async_trait]
impl ChannelAdapter for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, address: &str, message: &RenderedMessage) -> Result<(), ChannelError> {
        tracing::info!("📨 [dry-run] to {address}: {} | {}", message.subject, message.body);
        Ok(())
    }
}
