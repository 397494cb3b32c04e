//! Listener identity: long-polls `getUpdates` and feeds the dispatcher.
//!
//! Telegram has no gateway heartbeat, so every successful poll counts as one.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use teloxide::{
    prelude::*,
    types::{AllowedUpdate, UpdateKind},
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::{
    dispatcher::{DispatchReport, Dispatcher, InboundSink},
    domain::ChannelId,
    errors::Error,
    history::{forward_history_all, HistorySettings},
    identity::{HealthCell, Identity, IdentityFactory, Role},
    messaging::{
        port::HistorySource,
        types::{HistoryPage, InboundMessage},
    },
    Result,
};

use crate::convert::{to_inbound, MessageView};

/// Consecutive failed polls before the connection is reported closed.
const MAX_POLL_FAILURES: u32 = 5;
const POLL_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug)]
pub struct ListenerSettings {
    /// Long-poll timeout; must stay below the supervisor's lapse window.
    pub poll_timeout: Duration,
    pub history: HistorySettings,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(4),
            history: HistorySettings::default(),
        }
    }
}

/// One-shot history replay request, consumed by the first listener that starts.
pub type PendingReplay = Arc<std::sync::Mutex<Option<DateTime<Utc>>>>;

pub struct TelegramListener {
    bot: Bot,
    dispatcher: Arc<Mutex<Dispatcher>>,
    replay: PendingReplay,
    settings: ListenerSettings,
}

impl TelegramListener {
    pub fn new(
        bot: Bot,
        dispatcher: Arc<Mutex<Dispatcher>>,
        replay: PendingReplay,
        settings: ListenerSettings,
    ) -> Self {
        Self {
            bot,
            dispatcher,
            replay,
            settings,
        }
    }

    async fn replay_history(&self, cancel: &CancellationToken) {
        let since = self.replay.lock().ok().and_then(|mut r| r.take());
        let Some(since) = since else {
            return;
        };
        let channels: Vec<ChannelId> = self.dispatcher.lock().await.table().channels().to_vec();
        info!(target: "relay::rx", %since, channels = channels.len(), "replaying history");
        let mut sink = LockedDispatcher(&self.dispatcher);
        let n = forward_history_all(
            self,
            &mut sink,
            &channels,
            since,
            self.settings.history,
            cancel,
        )
        .await;
        info!(target: "relay::rx", replayed = n, "history replay done");
    }

    async fn poll_loop(&self, health: &HealthCell, cancel: &CancellationToken) -> Result<()> {
        let mut offset: i32 = 0;
        let mut failures = 0u32;
        let timeout_secs = self.settings.poll_timeout.as_secs().max(1) as u32;

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                res = self
                    .bot
                    .get_updates()
                    .offset(offset)
                    .timeout(timeout_secs)
                    .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::ChannelPost])
                    .send() => res,
            };

            let updates = match polled {
                Ok(updates) => updates,
                Err(e) => {
                    failures += 1;
                    warn!(target: "relay::rx", failures, "getUpdates failed: {e}");
                    if failures >= MAX_POLL_FAILURES {
                        return Err(Error::Closed(format!("listener polling failed: {e}")));
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(POLL_RETRY_DELAY) => {}
                    }
                    continue;
                }
            };
            failures = 0;
            health.beat();

            for update in updates {
                offset = offset.max(update.id + 1);
                let msg = match update.kind {
                    UpdateKind::Message(msg) | UpdateKind::ChannelPost(msg) => msg,
                    _ => continue,
                };
                let inbound = to_inbound(&MessageView::from_message(&msg));
                debug!(target: "relay::rx", channel = %inbound.channel_id, id = inbound.id.0, "inbound");
                let report = self.dispatcher.lock().await.on_inbound(inbound).await;
                debug!(target: "relay::rx", ?report, "dispatched");
            }

            // failures are logged as they are collected
            self.dispatcher.lock().await.reap().await;
        }
    }
}

/// Takes the dispatcher lock per message so live traffic interleaves with replay.
struct LockedDispatcher<'a>(&'a Mutex<Dispatcher>);

#[async_trait]
impl InboundSink for LockedDispatcher<'_> {
    async fn on_inbound(&mut self, msg: InboundMessage) -> DispatchReport {
        self.0.lock().await.on_inbound(msg).await
    }

    async fn on_replay(&mut self, msg: InboundMessage) -> DispatchReport {
        self.0.lock().await.on_replay(msg).await
    }
}

#[async_trait]
impl HistorySource for TelegramListener {
    fn supports_history(&self) -> bool {
        false
    }

    async fn fetch_history(&self, channel_id: ChannelId, _after: DateTime<Utc>, _limit: usize) -> Result<HistoryPage> {
        Err(Error::Unsupported(format!(
            "bot API offers no history for channel {channel_id}"
        )))
    }
}

#[async_trait(?Send)]
impl Identity for TelegramListener {
    fn role(&self) -> Role {
        Role::Listener
    }

    async fn run(self: Box<Self>, health: Arc<HealthCell>, cancel: CancellationToken) -> Result<()> {
        let me = self
            .bot
            .get_me()
            .await
            .map_err(|e| Error::Closed(format!("listener login failed: {e}")))?;
        info!(target: "relay::rx", user = %me.username(), "listener connected");
        health.mark_ready();

        // Replay runs alongside polling so heartbeats keep flowing.
        let (_, polled) = tokio::join!(
            self.replay_history(&cancel),
            self.poll_loop(&health, &cancel)
        );
        polled
    }
}

pub struct TelegramListenerFactory {
    token: String,
    dispatcher: Arc<Mutex<Dispatcher>>,
    replay: PendingReplay,
    settings: ListenerSettings,
}

impl TelegramListenerFactory {
    pub fn new(
        token: String,
        dispatcher: Arc<Mutex<Dispatcher>>,
        replay_since: Option<DateTime<Utc>>,
        settings: ListenerSettings,
    ) -> Self {
        Self {
            token,
            dispatcher,
            replay: Arc::new(std::sync::Mutex::new(replay_since)),
            settings,
        }
    }
}

impl IdentityFactory for TelegramListenerFactory {
    fn role(&self) -> Role {
        Role::Listener
    }

    fn build(&self) -> Result<Box<dyn Identity>> {
        Ok(Box::new(TelegramListener::new(
            Bot::new(self.token.clone()),
            self.dispatcher.clone(),
            self.replay.clone(),
            self.settings,
        )))
    }
}
