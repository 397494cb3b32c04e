//! Telegram adapter (teloxide).
//!
//! Implements the `relay-core` messaging and threading ports over the
//! Telegram Bot API, plus the publisher and listener identities the
//! supervisor runs.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use teloxide::prelude::*;
use tokio::time::sleep;
use tracing::debug;

pub mod convert;
pub mod listener;
pub mod publisher;

pub use listener::{TelegramListener, TelegramListenerFactory};
pub use publisher::{TelegramPublisher, TelegramPublisherFactory};

use relay_core::{
    domain::{ChannelId, MessageId, MessageRef, ThreadRef},
    errors::Error,
    messaging::{
        port::{MessagingPort, ThreadingPort},
        types::{Embed, MessagingCapabilities},
    },
    Result,
};

pub const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

pub fn capabilities() -> MessagingCapabilities {
    MessagingCapabilities {
        supports_edit: true,
        supports_threads: true,
        supports_history: false,
        max_message_len: TELEGRAM_MESSAGE_LIMIT,
    }
}

/// Telegram has no embeds; render them as trailing text blocks.
pub fn render_with_embeds(content: &str, embeds: &[Embed]) -> String {
    let mut out = content.to_string();
    for embed in embeds {
        let block: Vec<&str> = [&embed.title, &embed.description, &embed.url, &embed.image_url]
            .into_iter()
            .filter_map(|f| f.as_deref())
            .filter(|f| !f.is_empty())
            .collect();
        if block.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&block.join("\n"));
    }
    out
}

/// Publisher-side connection.
///
/// Threads are reply chains: the root message carries the title and every
/// post replies to it.
#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
    /// Chat titles resolved on first use; dropped with the publisher instance.
    channels: Arc<Mutex<HashMap<ChannelId, String>>>,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self {
            bot,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(channel_id: ChannelId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(channel_id.0)
    }

    fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
        teloxide::types::MessageId(message_id.0 as i32)
    }

    fn map_err(target: &str, e: teloxide::RequestError) -> Error {
        match e {
            teloxide::RequestError::RetryAfter(_) => Error::RateLimited {
                target: target.to_string(),
            },
            teloxide::RequestError::Network(e) => Error::Transport {
                target: target.to_string(),
                reason: e.to_string(),
            },
            other => Error::External(format!("telegram error: {other}")),
        }
    }

    async fn with_retry<T, Fut>(&self, target: &str, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(target, other)),
                },
            }
        }
    }

    /// Look the chat up once per publisher instance so unknown ids fail early.
    async fn resolve(&self, channel_id: ChannelId) -> Result<()> {
        let known = self
            .channels
            .lock()
            .map(|c| c.contains_key(&channel_id))
            .unwrap_or(false);
        if known {
            return Ok(());
        }
        let target = channel_id.to_string();
        let chat = self
            .with_retry(&target, || self.bot.get_chat(Self::tg_chat(channel_id)))
            .await?;
        let title = chat.title().unwrap_or_default().to_string();
        debug!(target: "relay::tx", channel = %channel_id, %title, "channel resolved");
        if let Ok(mut cache) = self.channels.lock() {
            cache.insert(channel_id, title);
        }
        Ok(())
    }

    async fn send_text(
        &self,
        channel_id: ChannelId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageRef> {
        if text.trim().is_empty() {
            return Err(Error::Unsupported("empty message".to_string()));
        }
        self.resolve(channel_id).await?;
        let target = channel_id.to_string();
        let msg = self
            .with_retry(&target, || {
                let req = self.bot.send_message(Self::tg_chat(channel_id), text.to_string());
                match reply_to {
                    Some(root) => req.reply_to_message_id(Self::tg_msg_id(root)),
                    None => req,
                }
            })
            .await?;
        Ok(MessageRef {
            channel_id,
            message_id: MessageId(msg.id.0 as i64),
        })
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        capabilities()
    }

    async fn send(&self, channel_id: ChannelId, content: &str, embeds: &[Embed]) -> Result<MessageRef> {
        let text = render_with_embeds(content, embeds);
        self.send_text(channel_id, &text, None).await
    }

    async fn edit(&self, msg: MessageRef, content: &str) -> Result<()> {
        let target = msg.channel_id.to_string();
        self.with_retry(&target, || {
            self.bot.edit_message_text(
                Self::tg_chat(msg.channel_id),
                Self::tg_msg_id(msg.message_id),
                content.to_string(),
            )
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, msg: MessageRef) -> Result<()> {
        let target = msg.channel_id.to_string();
        self.with_retry(&target, || {
            self.bot
                .delete_message(Self::tg_chat(msg.channel_id), Self::tg_msg_id(msg.message_id))
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ThreadingPort for TelegramMessenger {
    async fn create_thread(&self, channel_id: ChannelId, title: &str, seed_text: &str) -> Result<ThreadRef> {
        let root = self.send_text(channel_id, title, None).await?;
        self.send_text(channel_id, seed_text, Some(root.message_id))
            .await?;
        Ok(ThreadRef {
            channel_id,
            thread_id: root.message_id.0,
        })
    }

    async fn rename_thread(&self, thread: ThreadRef, title: &str) -> Result<()> {
        self.edit(
            MessageRef {
                channel_id: thread.channel_id,
                message_id: MessageId(thread.thread_id),
            },
            title,
        )
        .await
    }

    async fn post_to_thread(&self, thread: ThreadRef, text: &str) -> Result<()> {
        self.send_text(thread.channel_id, text, Some(MessageId(thread.thread_id)))
            .await
            .map(|_| ())
    }
}
