//! Telegram `Message` → core `InboundMessage`.

use chrono::{DateTime, Utc};
use teloxide::types::Message;

use relay_core::{
    domain::{AuthorId, ChannelId, MessageId},
    messaging::types::{Attachment, Author, InboundMessage, ReplyTarget},
};

/// The parts of a Telegram message the relay reads.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageView {
    pub id: i32,
    pub chat_id: i64,
    pub date: DateTime<Utc>,
    pub author_id: i64,
    pub author_name: String,
    pub text: Option<String>,
    pub has_media: bool,
    /// `t.me` link; absent for private groups without a username.
    pub link: Option<String>,
    pub reply: Option<Box<MessageView>>,
}

impl MessageView {
    pub fn from_message(msg: &Message) -> Self {
        let (author_id, author_name) = if let Some(user) = msg.from() {
            (user.id.0 as i64, user.full_name())
        } else if let Some(chat) = msg.sender_chat() {
            (chat.id.0, chat.title().unwrap_or("channel").to_string())
        } else {
            (msg.chat.id.0, msg.chat.title().unwrap_or("channel").to_string())
        };

        Self {
            id: msg.id.0,
            chat_id: msg.chat.id.0,
            date: msg.date,
            author_id,
            author_name,
            text: msg.text().or_else(|| msg.caption()).map(str::to_string),
            has_media: msg.photo().is_some()
                || msg.document().is_some()
                || msg.video().is_some()
                || msg.animation().is_some(),
            link: msg.url().map(|u| u.to_string()),
            reply: msg
                .reply_to_message()
                .map(|r| Box::new(Self::from_message(r))),
        }
    }
}

/// Media is referenced by its public message link; bot file URLs embed the token.
pub fn to_inbound(view: &MessageView) -> InboundMessage {
    let attachments = match (&view.link, view.has_media) {
        (Some(link), true) => vec![Attachment { url: link.clone() }],
        _ => Vec::new(),
    };

    InboundMessage {
        id: MessageId(view.id as i64),
        author: Author {
            id: AuthorId(view.author_id),
            display_name: view.author_name.clone(),
            avatar_url: None,
        },
        channel_id: ChannelId(view.chat_id),
        raw_content: view.text.clone().unwrap_or_default(),
        attachments,
        embeds: Vec::new(),
        created_at: view.date,
        reply_target: view.reply.as_deref().map(|r| ReplyTarget {
            message_id: MessageId(r.id as i64),
            author_name: Some(r.author_name.clone()),
            content: r.text.clone().unwrap_or_default(),
            link: r.link.clone(),
        }),
        link: view.link.clone(),
    }
}
