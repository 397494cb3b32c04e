use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{AuthorId, ChannelId, MessageId, MessageRef};

/// Cross-platform inbound message model.
///
/// Produced by the connection adapter; read-only to the core.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub id: MessageId,
    pub author: Author,
    pub channel_id: ChannelId,
    pub raw_content: String,
    pub attachments: Vec<Attachment>,
    pub embeds: Vec<Embed>,
    pub created_at: DateTime<Utc>,
    pub reply_target: Option<ReplyTarget>,
    /// Public back-link to the source message, if the platform has one.
    pub link: Option<String>,
}

impl InboundMessage {
    pub fn message_ref(&self) -> MessageRef {
        MessageRef {
            channel_id: self.channel_id,
            message_id: self.id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Author {
    pub id: AuthorId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
}

/// The message an inbound message replies to.
#[derive(Clone, Debug)]
pub struct ReplyTarget {
    pub message_id: MessageId,
    pub author_name: Option<String>,
    pub content: String,
    pub link: Option<String>,
}

/// Structured rich embed, passed through untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Identity shown for a webhook delivery instead of the webhook's default.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookIdentity {
    pub username: String,
    pub avatar_url: Option<String>,
}

/// Display-ready content built per delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub content: String,
    pub embeds: Vec<Embed>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryTarget {
    Channel(ChannelId),
    Webhook {
        url: String,
        identity: Option<WebhookIdentity>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundDelivery {
    pub target: DeliveryTarget,
    pub message: OutboundMessage,
}

/// One page of channel history, oldest first.
#[derive(Clone, Debug, Default)]
pub struct HistoryPage {
    pub messages: Vec<InboundMessage>,
}

/// Capabilities / feature flags of a messenger implementation.
#[derive(Clone, Copy, Debug)]
pub struct MessagingCapabilities {
    pub supports_edit: bool,
    pub supports_threads: bool,
    pub supports_history: bool,
    pub max_message_len: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}
