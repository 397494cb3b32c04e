//! Dispatcher: routes one inbound message to its deliveries and call-out.
//!
//! Lives on the listener identity's loop. Transformation and tracker ingest
//! happen inline; outbound calls are handed to background tasks whose results
//! are collected on later calls. Nothing here is retried.

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, warn};

use crate::{
    domain::{AuthorId, ChannelId},
    messaging::{
        port::{MessagingPort, ThreadingPort, WebhookTransport},
        types::{DeliveryTarget, InboundMessage, OutboundDelivery},
        webhook::redact_webhook_url,
    },
    positions::{apply_effects, IngestOutcome, PositionEffect, PositionTracker, ThreadRefs},
    routing::{CallOutMode, RoutingTable},
    transform::{transform, TransformContext, TransformSettings},
    Result,
};

/// Text handed to the position tracker for one message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallOut {
    pub author: AuthorId,
    pub text: String,
    pub thread_channel: Option<ChannelId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchPlan {
    pub deliveries: Vec<OutboundDelivery>,
    /// Set by the first accepting call-out route; a message is tracked once.
    pub call_out: Option<CallOut>,
}

impl DispatchPlan {
    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty() && self.call_out.is_none()
    }
}

/// What one call did on the loop. Delivery results arrive later.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub dispatched: usize,
    pub tracked: bool,
}

/// Delivery results collected from finished background sends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryTally {
    pub delivered: usize,
    pub failed: usize,
}

/// Live messages and replayed history enter the dispatcher through this seam.
#[async_trait]
pub trait InboundSink: Send {
    async fn on_inbound(&mut self, msg: InboundMessage) -> DispatchReport;
    async fn on_replay(&mut self, msg: InboundMessage) -> DispatchReport;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum TargetKey {
    Channel(ChannelId),
    Webhook(String),
}

type DeliveryResult = (String, Result<()>);

pub struct Dispatcher {
    table: RoutingTable,
    settings: TransformSettings,
    messenger: Arc<dyn MessagingPort>,
    webhooks: Arc<dyn WebhookTransport>,
    threads: Arc<dyn ThreadingPort>,
    tracker: PositionTracker,
    in_flight: JoinSet<DeliveryResult>,
    /// Last queued batch of thread effects; each batch waits for the one before it.
    thread_work: Option<JoinHandle<ThreadRefs>>,
}

impl Dispatcher {
    pub fn new(
        table: RoutingTable,
        settings: TransformSettings,
        messenger: Arc<dyn MessagingPort>,
        webhooks: Arc<dyn WebhookTransport>,
        threads: Arc<dyn ThreadingPort>,
        tracker: PositionTracker,
    ) -> Self {
        Self {
            table,
            settings,
            messenger,
            webhooks,
            threads,
            tracker,
            in_flight: JoinSet::new(),
            thread_work: None,
        }
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Work for `msg` without performing any of it.
    ///
    /// Routes are walked in configured order; a target already served by an
    /// earlier route on this channel is skipped. Webhook targets replace the
    /// route's channel targets when both are configured.
    pub fn plan(&self, msg: &InboundMessage, now: DateTime<Utc>, replay: bool) -> DispatchPlan {
        let routes = self.table.routes_for(msg.channel_id);
        if routes.is_empty() {
            debug!(target: "relay::rx", channel = %msg.channel_id, "no route for channel");
            return DispatchPlan::default();
        }

        let ctx = TransformContext {
            glyphs: self.table.glyphs(),
            aliases: self.table.aliases(),
            settings: &self.settings,
            now,
        };

        let mut plan = DispatchPlan::default();
        let mut served: HashSet<TargetKey> = HashSet::new();

        for route in routes {
            if replay && route.ignore_history {
                continue;
            }
            if !route.accepts(msg.author.id) {
                continue;
            }

            if route.call_outs != CallOutMode::Off && plan.call_out.is_none() {
                plan.call_out = Some(CallOut {
                    author: msg.author.id,
                    text: ctx.glyphs.apply(msg.author.id, &msg.raw_content),
                    thread_channel: route.thread_channel(),
                });
            }
            if route.call_outs == CallOutMode::Only {
                continue;
            }

            let message = transform(msg, route, &ctx);
            if route.webhook_targets.is_empty() {
                for channel in &route.target_channel_ids {
                    if served.insert(TargetKey::Channel(*channel)) {
                        plan.deliveries.push(OutboundDelivery {
                            target: DeliveryTarget::Channel(*channel),
                            message: message.clone(),
                        });
                    }
                }
            } else {
                let display = route.display_name_for(&msg.author, ctx.aliases);
                for hook in &route.webhook_targets {
                    if served.insert(TargetKey::Webhook(hook.url.clone())) {
                        plan.deliveries.push(OutboundDelivery {
                            target: DeliveryTarget::Webhook {
                                url: hook.url.clone(),
                                identity: hook.identity_for(&msg.author, display.as_deref()),
                            },
                            message: message.clone(),
                        });
                    }
                }
            }
        }
        plan
    }

    pub async fn on_inbound_at(&mut self, msg: &InboundMessage, now: DateTime<Utc>) -> DispatchReport {
        let plan = self.plan(msg, now, false);
        self.execute(plan, now).await
    }

    pub async fn replay_at(&mut self, msg: &InboundMessage, now: DateTime<Utc>) -> DispatchReport {
        let plan = self.plan(msg, now, true);
        self.execute(plan, now).await
    }

    /// Collect finished deliveries and thread work without waiting.
    pub async fn reap(&mut self) -> DeliveryTally {
        let mut tally = DeliveryTally::default();
        while let Some(joined) = self.in_flight.try_join_next() {
            record(joined, &mut tally);
        }
        if self.thread_work.as_ref().is_some_and(JoinHandle::is_finished) {
            if let Some(work) = self.thread_work.take() {
                self.attach(work.await);
            }
        }
        tally
    }

    /// Wait for every outstanding delivery and thread batch.
    pub async fn settle(&mut self) -> DeliveryTally {
        let mut tally = DeliveryTally::default();
        while let Some(joined) = self.in_flight.join_next().await {
            record(joined, &mut tally);
        }
        if let Some(work) = self.thread_work.take() {
            self.attach(work.await);
        }
        tally
    }

    async fn execute(&mut self, plan: DispatchPlan, now: DateTime<Utc>) -> DispatchReport {
        let finished = self.reap().await;
        if finished != DeliveryTally::default() {
            debug!(target: "relay::rx", delivered = finished.delivered, failed = finished.failed, "deliveries finished");
        }

        let mut report = DispatchReport::default();
        for delivery in plan.deliveries {
            let messenger = self.messenger.clone();
            let webhooks = self.webhooks.clone();
            self.in_flight.spawn(async move {
                let target = describe_target(&delivery.target);
                let res = deliver(messenger.as_ref(), webhooks.as_ref(), &delivery).await;
                (target, res)
            });
            report.dispatched += 1;
        }

        if let Some(call_out) = plan.call_out {
            let outcome = self.tracker.ingest_at(call_out.author, &call_out.text, now);
            match &outcome {
                IngestOutcome::Created(p) => {
                    debug!(target: "relay::rx", symbol = %p.key.symbol, "position created")
                }
                IngestOutcome::Updated(p) => {
                    debug!(target: "relay::rx", symbol = %p.key.symbol, "position updated")
                }
                IngestOutcome::Orphan => debug!(target: "relay::rx", "update matched no position"),
                IngestOutcome::NoOp => {}
            }
            report.tracked = outcome != IngestOutcome::NoOp;

            let effects = self.tracker.take_effects();
            match call_out.thread_channel {
                Some(channel) if !effects.is_empty() => self.queue_thread_work(channel, effects),
                _ => {}
            }
        }

        report
    }

    /// Chain a batch of thread effects behind the previous one so a create
    /// always lands before the appends that follow it.
    fn queue_thread_work(&mut self, channel: ChannelId, effects: Vec<PositionEffect>) {
        let previous = self.thread_work.take();
        let mut known = self.tracker.thread_refs();
        let threads = self.threads.clone();
        self.thread_work = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                match previous.await {
                    Ok(refs) => known.extend(refs),
                    Err(e) => debug!(target: "relay::rx", "earlier thread work lost: {e}"),
                }
            }
            apply_effects(effects, threads.as_ref(), channel, &mut known).await;
            known
        }));
    }

    fn attach(&mut self, joined: std::result::Result<ThreadRefs, JoinError>) {
        match joined {
            Ok(refs) => self.tracker.attach_threads(refs),
            Err(e) => debug!(target: "relay::rx", "thread work lost: {e}"),
        }
    }
}

async fn deliver(
    messenger: &dyn MessagingPort,
    webhooks: &dyn WebhookTransport,
    delivery: &OutboundDelivery,
) -> Result<()> {
    match &delivery.target {
        DeliveryTarget::Channel(channel) => messenger
            .send(*channel, &delivery.message.content, &delivery.message.embeds)
            .await
            .map(|_| ()),
        DeliveryTarget::Webhook { url, identity } => {
            webhooks
                .deliver(url, &delivery.message, identity.as_ref())
                .await
        }
    }
}

fn record(joined: std::result::Result<DeliveryResult, JoinError>, tally: &mut DeliveryTally) {
    match joined {
        Ok((_, Ok(()))) => tally.delivered += 1,
        Ok((target, Err(e))) => {
            tally.failed += 1;
            if e.is_transient() {
                warn!(target: "relay::rx", %target, "delivery failed: {e}");
            } else {
                error!(target: "relay::rx", %target, "delivery failed: {e}");
            }
        }
        Err(e) => {
            tally.failed += 1;
            warn!(target: "relay::rx", "delivery task lost: {e}");
        }
    }
}

#[async_trait]
impl InboundSink for Dispatcher {
    async fn on_inbound(&mut self, msg: InboundMessage) -> DispatchReport {
        self.on_inbound_at(&msg, Utc::now()).await
    }

    async fn on_replay(&mut self, msg: InboundMessage) -> DispatchReport {
        self.replay_at(&msg, Utc::now()).await
    }
}

fn describe_target(target: &DeliveryTarget) -> String {
    match target {
        DeliveryTarget::Channel(id) => format!("channel {id}"),
        DeliveryTarget::Webhook { url, .. } => format!("webhook {}", redact_webhook_url(url)),
    }
}
