//! History replay: re-dispatch messages posted while the relay was away.

use std::{sync::OnceLock, time::Duration};

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::Config, dispatcher::InboundSink, domain::ChannelId, errors::Error,
    messaging::port::HistorySource, Result,
};

pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Clone, Copy, Debug)]
pub struct HistorySettings {
    pub page_size: usize,
    /// Pause after each replayed message.
    pub delay: Duration,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            delay: Duration::from_secs(1),
        }
    }
}

impl HistorySettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            page_size: cfg.history_page_size,
            delay: cfg.history_delay,
        }
    }
}

/// Replay `channel_id` after `after`, oldest first, returning how many
/// messages were handed to the sink.
///
/// Stops on an empty page, a fetch error or cancellation.
pub async fn forward_history(
    source: &dyn HistorySource,
    sink: &mut dyn InboundSink,
    channel_id: ChannelId,
    after: DateTime<Utc>,
    settings: HistorySettings,
    cancel: &CancellationToken,
) -> usize {
    if !source.supports_history() {
        warn!(target: "relay::rx", channel = %channel_id, "history is not available on this platform, skipped");
        return 0;
    }

    let page_size = settings.page_size.clamp(1, MAX_PAGE_SIZE);
    let mut cursor = after;
    let mut forwarded = 0;

    loop {
        let page = tokio::select! {
            biased;
            _ = cancel.cancelled() => return forwarded,
            page = source.fetch_history(channel_id, cursor, page_size) => page,
        };
        let messages = match page {
            Ok(page) => page.messages,
            Err(e) => {
                warn!(target: "relay::rx", channel = %channel_id, "history fetch failed: {e}");
                return forwarded;
            }
        };
        let Some(last) = messages.last() else {
            break;
        };
        // one tick past the boundary message so it is not fetched again
        cursor = last.created_at + chrono::Duration::milliseconds(1);

        for msg in messages {
            sink.on_replay(msg).await;
            forwarded += 1;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return forwarded,
                _ = tokio::time::sleep(settings.delay) => {}
            }
        }
    }

    info!(target: "relay::rx", channel = %channel_id, forwarded, "history replay finished");
    forwarded
}

/// Replay every channel in `channels`, in order.
pub async fn forward_history_all(
    source: &dyn HistorySource,
    sink: &mut dyn InboundSink,
    channels: &[ChannelId],
    after: DateTime<Utc>,
    settings: HistorySettings,
    cancel: &CancellationToken,
) -> usize {
    let mut total = 0;
    for channel in channels {
        if cancel.is_cancelled() {
            break;
        }
        total += forward_history(source, sink, *channel, after, settings, cancel).await;
    }
    total
}

fn relative_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^-(?:(\d+)d)?(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").expect("valid regex")
    })
}

/// Parse a `pull_since` value: `YYYY-MM-DD HH:MM:SS` (UTC) or a relative
/// offset such as `-1d12h` or `-90m`.
pub fn parse_since_arg(value: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }

    let invalid = || Error::Config(format!("invalid pull_since value: {value:?}"));
    let caps = relative_regex().captures(value).ok_or_else(invalid)?;
    let mut seconds: i64 = 0;
    let mut any = false;
    for (idx, unit) in [(1, 86_400), (2, 3_600), (3, 60), (4, 1)] {
        if let Some(m) = caps.get(idx) {
            let n: i64 = m.as_str().parse().map_err(|_| invalid())?;
            seconds = n
                .checked_mul(unit)
                .and_then(|s| seconds.checked_add(s))
                .ok_or_else(invalid)?;
            any = true;
        }
    }
    if !any {
        return Err(invalid());
    }
    let offset = chrono::Duration::try_seconds(seconds).ok_or_else(invalid)?;
    now.checked_sub_signed(offset).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::{
        dispatcher::{tests::inbound, DispatchReport},
        messaging::types::{HistoryPage, InboundMessage},
    };

    /// Serves pages of the given sizes in turn, then empty pages.
    struct PagedSource {
        sizes: Vec<usize>,
        calls: Mutex<Vec<(DateTime<Utc>, usize)>>,
        supported: bool,
    }

    impl PagedSource {
        fn new(sizes: Vec<usize>) -> Self {
            Self {
                sizes,
                calls: Mutex::new(Vec::new()),
                supported: true,
            }
        }
    }

    #[async_trait]
    impl HistorySource for PagedSource {
        fn supports_history(&self) -> bool {
            self.supported
        }

        async fn fetch_history(&self, channel_id: ChannelId, after: DateTime<Utc>, limit: usize) -> Result<HistoryPage> {
            let mut calls = self.calls.lock().unwrap();
            let size = self.sizes.get(calls.len()).copied().unwrap_or(0);
            calls.push((after, limit));
            let messages = (0..size)
                .map(|i| {
                    let mut m = inbound(channel_id.0, 7, "old");
                    m.created_at = after + chrono::Duration::seconds(i as i64 + 1);
                    m
                })
                .collect();
            Ok(HistoryPage { messages })
        }
    }

    #[derive(Default)]
    struct CountingSink {
        replayed: usize,
    }

    #[async_trait]
    impl InboundSink for CountingSink {
        async fn on_inbound(&mut self, _msg: InboundMessage) -> DispatchReport {
            DispatchReport::default()
        }

        async fn on_replay(&mut self, _msg: InboundMessage) -> DispatchReport {
            self.replayed += 1;
            DispatchReport::default()
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn replay_terminates_and_counts_every_page() {
        let source = PagedSource::new(vec![100, 40, 3]);
        let mut sink = CountingSink::default();
        let n = forward_history(
            &source,
            &mut sink,
            ChannelId(1),
            t0(),
            HistorySettings::default(),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(n, 143);
        assert_eq!(sink.replayed, 143);

        let calls = source.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0], (t0(), 100));
        // cursor moves one millisecond past the last message of the page
        assert_eq!(
            calls[1].0,
            t0() + chrono::Duration::seconds(100) + chrono::Duration::milliseconds(1)
        );
    }

    #[tokio::test]
    async fn unsupported_history_forwards_nothing() {
        let mut source = PagedSource::new(vec![5]);
        source.supported = false;
        let mut sink = CountingSink::default();
        let n = forward_history(
            &source,
            &mut sink,
            ChannelId(1),
            t0(),
            HistorySettings::default(),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(n, 0);
        assert!(source.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_between_messages() {
        let source = PagedSource::new(vec![10]);
        let mut sink = CountingSink::default();
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            stopper.cancel();
        });
        let n = forward_history(
            &source,
            &mut sink,
            ChannelId(1),
            t0(),
            HistorySettings::default(),
            &cancel,
        )
        .await;
        assert_eq!(n, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn replays_all_channels() {
        let source = PagedSource::new(vec![2, 0, 5]);
        let mut sink = CountingSink::default();
        let n = forward_history_all(
            &source,
            &mut sink,
            &[ChannelId(1), ChannelId(2)],
            t0(),
            HistorySettings::default(),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(n, 7);
    }

    #[test]
    fn since_accepts_absolute_and_relative_values() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(
            parse_since_arg("2026-03-09 08:30:00", now).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 9, 8, 30, 0).unwrap()
        );
        assert_eq!(
            parse_since_arg("-1d2h", now).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 9, 10, 0, 0).unwrap()
        );
        assert_eq!(
            parse_since_arg("-90m", now).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 10, 10, 30, 0).unwrap()
        );
        assert!(parse_since_arg("-", now).is_err());
        assert!(parse_since_arg("yesterday", now).is_err());
        assert!(parse_since_arg("-5x", now).is_err());
    }
}
