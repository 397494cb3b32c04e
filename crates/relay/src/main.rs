use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use tracing::{info, warn};

use relay_core::{
    config::{Config, KeepAliveSettings},
    dispatcher::Dispatcher,
    history::{parse_since_arg, HistorySettings},
    messaging::{
        mailbox::publisher_channel,
        port::{AlertSink, WebhookTransport},
        throttled::ThrottleConfig,
        webhook::{HttpWebhookTransport, WebhookAlertSink},
    },
    positions::{PositionTracker, TrackerSettings},
    routing::RoutingTable,
    status::StatusReporter,
    supervisor::{Supervisor, SupervisorSettings},
    transform::TransformSettings,
};
use relay_telegram::{
    listener::ListenerSettings, TelegramListenerFactory, TelegramPublisherFactory,
};

const ALERT_USERNAME: &str = "Relay Status";

/// `key=value` launch arguments.
#[derive(Debug, Default, PartialEq, Eq)]
struct LaunchArgs {
    pull_since: Option<String>,
}

fn parse_launch_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<LaunchArgs> {
    let mut out = LaunchArgs::default();
    for arg in args {
        let Some((key, value)) = arg.split_once('=') else {
            bail!("expected key=value, got {arg:?}");
        };
        match key.trim() {
            "pull_since" => out.pull_since = Some(value.trim().to_string()),
            other => warn!("unknown launch argument {other:?} ignored"),
        }
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> Result<(), relay_core::Error> {
    relay_core::logging::init("relay")?;

    let cfg = Config::load()?;
    let args = parse_launch_args(std::env::args().skip(1)).context("invalid launch arguments")?;
    let replay_since = args
        .pull_since
        .as_deref()
        .and_then(|v| match parse_since_arg(v, Utc::now()) {
            Ok(since) => Some(since),
            Err(e) => {
                warn!("{e}; history replay disabled");
                None
            }
        });

    let table = RoutingTable::load(&cfg.routes_file)?;
    info!(
        routes = table.route_count(),
        channels = table.channels().len(),
        "routing table loaded from {}",
        cfg.routes_file.display()
    );

    let keepalive = match KeepAliveSettings::load(&cfg.keepalive_file) {
        Ok(Some(k)) => Some(k),
        Ok(None) => {
            warn!("{} not found, status reporting disabled", cfg.keepalive_file.display());
            None
        }
        Err(e) => {
            warn!("keep-alive settings unreadable, status reporting disabled: {e}");
            None
        }
    };

    let (mailbox, inbox) = publisher_channel(relay_telegram::capabilities());
    let mailbox = Arc::new(mailbox);
    let webhooks: Arc<dyn WebhookTransport> = Arc::new(HttpWebhookTransport::new()?);

    let tracker = PositionTracker::new(TrackerSettings::from_config(&cfg))
        .with_author_names(table.aliases().clone());
    let dispatcher = Dispatcher::new(
        table,
        TransformSettings::from_config(&cfg),
        mailbox.clone(),
        webhooks.clone(),
        mailbox.clone(),
        tracker,
    );
    let dispatcher = Arc::new(tokio::sync::Mutex::new(dispatcher));

    let mut supervision = SupervisorSettings::from_config(&cfg);
    if let Some(every) = keepalive
        .as_ref()
        .and_then(KeepAliveSettings::cross_check_interval)
    {
        supervision.heartbeat_interval = every;
    }

    let publisher = Arc::new(TelegramPublisherFactory::new(
        cfg.publisher_token.clone(),
        inbox,
        ThrottleConfig::default(),
        cfg.heartbeat_interval,
    ));
    let listener = Arc::new(TelegramListenerFactory::new(
        cfg.listener_token.clone(),
        dispatcher,
        replay_since,
        ListenerSettings {
            history: HistorySettings::from_config(&cfg),
            ..ListenerSettings::default()
        },
    ));
    let supervisor = Supervisor::new(supervision, publisher, listener);

    let reporter = match (keepalive, supervisor.take_events()) {
        (Some(keepalive), Some(events)) => {
            let alerts = keepalive.alert_webhook.clone().map(|url| {
                Arc::new(WebhookAlertSink::new(
                    webhooks.clone(),
                    url,
                    ALERT_USERNAME.to_string(),
                )) as Arc<dyn AlertSink>
            });
            let reporter = StatusReporter::new(
                keepalive,
                cfg.keepalive_file.clone(),
                mailbox.clone(),
                alerts,
                supervisor.subscribe(),
                events,
            );
            Some(tokio::spawn(reporter.run(supervisor.cancellation())))
        }
        _ => None,
    };

    let monitor = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.start().await })
    };

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    supervisor.shutdown().await;

    monitor
        .await
        .map_err(|e| relay_core::Error::External(format!("supervisor task failed: {e}")))??;
    if let Some(reporter) = reporter {
        reporter
            .await
            .map_err(|e| relay_core::Error::External(format!("status reporter failed: {e}")))??;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pull_since_is_read_from_key_value_args() {
        let parsed = parse_launch_args(args(&["pull_since=-1d", "verbose=1"])).unwrap();
        assert_eq!(parsed.pull_since.as_deref(), Some("-1d"));
        assert_eq!(parse_launch_args(args(&[])).unwrap(), LaunchArgs::default());
    }

    #[test]
    fn bare_arguments_are_rejected() {
        assert!(parse_launch_args(args(&["pull_since"])).is_err());
    }
}
