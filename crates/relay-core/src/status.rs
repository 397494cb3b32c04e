//! Heartbeat / status reporter.
//!
//! Keeps a status message fresh while the listener is up, posts the
//! cross-check ping another bot watches, and turns supervisor events into
//! alerts.

use std::{path::PathBuf, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{mpsc, watch},
    time::{Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::KeepAliveSettings,
    domain::{ChannelId, MessageId, MessageRef},
    formatting::timestamp_markup,
    messaging::{
        port::{AlertSink, MessagingPort},
        types::Severity,
    },
    supervisor::{ListenerStatus, StatusEvent, SupervisorState},
    Result,
};

pub const STATUS_EDIT_INTERVAL: Duration = Duration::from_secs(59);

pub fn status_text(now: DateTime<Utc>) -> String {
    format!(
        "Last heartbeat: {}, {}",
        timestamp_markup(now, None),
        timestamp_markup(now, Some('R'))
    )
}

pub fn cross_check_text(prefix: &str, now: DateTime<Utc>) -> String {
    format!("{prefix} heartbeat: {}", timestamp_markup(now, None))
}

pub fn alert_for(event: StatusEvent) -> (Severity, &'static str) {
    match event {
        StatusEvent::ListenerConnected => (Severity::Info, "Relay listener connected."),
        StatusEvent::ListenerDegraded => (
            Severity::Warning,
            "Listener heartbeat lapsed, waiting for it to resume.",
        ),
        StatusEvent::ListenerRecovered { restarted: false } => {
            (Severity::Info, "Listener resumed.")
        }
        StatusEvent::ListenerRecovered { restarted: true } => {
            (Severity::Info, "Listener is back up after a restart.")
        }
        StatusEvent::ListenerRestarting => (
            Severity::Critical,
            "Listener did not resume in time, forcing a restart.",
        ),
        StatusEvent::PublisherRestarted => {
            (Severity::Warning, "Publisher connection was restarted.")
        }
    }
}

/// Waits forever when the ticker is not configured.
async fn next_tick(tick: &mut Option<Interval>) {
    match tick {
        Some(tick) => {
            tick.tick().await;
        }
        None => std::future::pending().await,
    }
}

pub struct StatusReporter {
    settings: KeepAliveSettings,
    settings_path: PathBuf,
    messenger: Arc<dyn MessagingPort>,
    alerts: Option<Arc<dyn AlertSink>>,
    state: watch::Receiver<SupervisorState>,
    events: mpsc::Receiver<StatusEvent>,
    status_message: Option<MessageRef>,
}

impl StatusReporter {
    pub fn new(
        settings: KeepAliveSettings,
        settings_path: PathBuf,
        messenger: Arc<dyn MessagingPort>,
        alerts: Option<Arc<dyn AlertSink>>,
        state: watch::Receiver<SupervisorState>,
        events: mpsc::Receiver<StatusEvent>,
    ) -> Self {
        let status_message = match (settings.status_message_channel_id, settings.status_message_id) {
            (Some(channel), Some(id)) => Some(MessageRef {
                channel_id: ChannelId(channel),
                message_id: MessageId(id),
            }),
            _ => None,
        };
        Self {
            settings,
            settings_path,
            messenger,
            alerts,
            state,
            events,
            status_message,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut status_tick = tokio::time::interval(STATUS_EDIT_INTERVAL);
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let cross_check = self
            .settings
            .cross_check_heartbeat
            .clone()
            .zip(self.settings.cross_check_interval());
        let mut ping_tick = cross_check.as_ref().map(|(_, every)| {
            let mut tick = tokio::time::interval(*every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick
        });

        info!(target: "relay::status", "status reporter started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.alert(event).await,
                    None => {
                        warn!(target: "relay::status", "supervisor event stream closed");
                        break;
                    }
                },
                _ = status_tick.tick() => {
                    if self.listener_up() {
                        self.refresh_status(Utc::now()).await;
                    }
                }
                _ = next_tick(&mut ping_tick) => {
                    if let (true, Some((ping, _))) = (self.listener_up(), cross_check.as_ref()) {
                        let text = cross_check_text(&ping.message_prefix, Utc::now());
                        if let Err(e) = self.messenger.send(ChannelId(ping.channel_id), &text, &[]).await {
                            warn!(target: "relay::status", "cross-check ping failed: {e}");
                        }
                    }
                }
            }
        }
        info!(target: "relay::status", "status reporter stopped");
        Ok(())
    }

    fn listener_up(&self) -> bool {
        self.state.borrow().listener == ListenerStatus::Up
    }

    /// Edit the status message, creating it first when only a channel is configured.
    pub async fn refresh_status(&mut self, now: DateTime<Utc>) {
        let text = status_text(now);
        match self.status_message {
            Some(msg) => {
                if let Err(e) = self.messenger.edit(msg, &text).await {
                    warn!(target: "relay::status", "status message edit failed: {e}");
                }
            }
            None => {
                let Some(channel) = self.settings.status_message_channel_id else {
                    return;
                };
                match self.messenger.send(ChannelId(channel), &text, &[]).await {
                    Ok(created) => {
                        self.status_message = Some(created);
                        self.settings.status_message_id = Some(created.message_id.0);
                        match self.settings.save(&self.settings_path) {
                            Ok(()) => info!(
                                target: "relay::status",
                                id = created.message_id.0,
                                "status message created and saved"
                            ),
                            Err(e) => warn!(target: "relay::status", "could not persist status message id: {e}"),
                        }
                    }
                    Err(e) => warn!(target: "relay::status", "status message create failed: {e}"),
                }
            }
        }
    }

    async fn alert(&self, event: StatusEvent) {
        let Some(sink) = &self.alerts else {
            return;
        };
        let (severity, text) = alert_for(event);
        if let Err(e) = sink.notify(severity, text).await {
            warn!(target: "relay::status", "alert delivery failed: {e}");
        }
    }
}
