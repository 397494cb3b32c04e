use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::{ChannelId, MessageRef, ThreadRef},
    messaging::types::{Embed, HistoryPage, MessagingCapabilities, OutboundMessage, Severity, WebhookIdentity},
    Result,
};

/// Outbound side of a platform connection (the publisher identity).
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send(&self, channel_id: ChannelId, content: &str, embeds: &[Embed])
        -> Result<MessageRef>;
    async fn edit(&self, msg: MessageRef, content: &str) -> Result<()>;
    async fn delete(&self, msg: MessageRef) -> Result<()>;
}

/// History access on the listener identity.
#[async_trait]
pub trait HistorySource: Send + Sync {
    fn supports_history(&self) -> bool;

    /// Messages strictly after `after`, oldest first, at most `limit`.
    async fn fetch_history(
        &self,
        channel_id: ChannelId,
        after: DateTime<Utc>,
        limit: usize,
    ) -> Result<HistoryPage>;
}

/// Discussion threads used by the position tracker.
#[async_trait]
pub trait ThreadingPort: Send + Sync {
    async fn create_thread(
        &self,
        channel_id: ChannelId,
        title: &str,
        seed_text: &str,
    ) -> Result<ThreadRef>;
    async fn rename_thread(&self, thread: ThreadRef, title: &str) -> Result<()>;
    async fn post_to_thread(&self, thread: ThreadRef, text: &str) -> Result<()>;
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn deliver(
        &self,
        url: &str,
        message: &OutboundMessage,
        identity: Option<&WebhookIdentity>,
    ) -> Result<()>;
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, severity: Severity, text: &str) -> Result<()>;
}
