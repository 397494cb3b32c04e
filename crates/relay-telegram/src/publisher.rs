//! Publisher identity: owns the sending bot and drains the publisher inbox.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use teloxide::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_core::{
    errors::Error,
    identity::{HealthCell, Identity, IdentityFactory, Role},
    messaging::{
        mailbox::PublisherInbox,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    Result,
};

use crate::TelegramMessenger;

/// Consecutive failed liveness probes before the connection is given up.
const MAX_PROBE_FAILURES: u32 = 3;

pub struct TelegramPublisher {
    messenger: TelegramMessenger,
    inbox: PublisherInbox,
    throttle: ThrottleConfig,
    probe_every: Duration,
}

impl TelegramPublisher {
    pub fn new(bot: Bot, inbox: PublisherInbox, throttle: ThrottleConfig, probe_every: Duration) -> Self {
        Self {
            messenger: TelegramMessenger::new(bot),
            inbox,
            throttle,
            probe_every,
        }
    }

    /// `getMe` at a fixed cadence; each success is a heartbeat.
    async fn probe(&self, health: &HealthCell, stop: &CancellationToken) -> Result<()> {
        let bot = self.messenger.bot();
        let mut failures = 0u32;
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.probe_every) => {}
            }
            match bot.get_me().await {
                Ok(_) => {
                    failures = 0;
                    health.beat();
                }
                Err(e) => {
                    failures += 1;
                    warn!(target: "relay::tx", failures, "publisher probe failed: {e}");
                    if failures >= MAX_PROBE_FAILURES {
                        return Err(Error::Closed(format!("publisher unreachable: {e}")));
                    }
                }
            }
        }
    }
}

#[async_trait(?Send)]
impl Identity for TelegramPublisher {
    fn role(&self) -> Role {
        Role::Publisher
    }

    async fn run(self: Box<Self>, health: Arc<HealthCell>, cancel: CancellationToken) -> Result<()> {
        let me = self
            .messenger
            .bot()
            .get_me()
            .await
            .map_err(|e| Error::Closed(format!("publisher login failed: {e}")))?;
        info!(target: "relay::tx", user = %me.username(), "publisher connected");
        health.mark_ready();

        let messenger = Arc::new(self.messenger.clone());
        let throttled = ThrottledMessenger::new(messenger.clone(), self.throttle).with_threads(messenger);
        let local = cancel.child_token();

        let serve = async {
            let served = self.inbox.serve(&throttled, &throttled, &local).await;
            local.cancel();
            served
        };
        let probe = async {
            let res = self.probe(&health, &local).await;
            local.cancel();
            res
        };
        let (served, probed) = tokio::join!(serve, probe);

        info!(target: "relay::tx", served, "publisher stopped");
        probed
    }
}

pub struct TelegramPublisherFactory {
    token: String,
    inbox: PublisherInbox,
    throttle: ThrottleConfig,
    probe_every: Duration,
}

impl TelegramPublisherFactory {
    pub fn new(token: String, inbox: PublisherInbox, throttle: ThrottleConfig, probe_every: Duration) -> Self {
        Self {
            token,
            inbox,
            throttle,
            probe_every,
        }
    }
}

impl IdentityFactory for TelegramPublisherFactory {
    fn role(&self) -> Role {
        Role::Publisher
    }

    fn build(&self) -> Result<Box<dyn Identity>> {
        Ok(Box::new(TelegramPublisher::new(
            Bot::new(self.token.clone()),
            self.inbox.clone(),
            self.throttle,
            self.probe_every,
        )))
    }
}
