//! Position tracker: correlates call-out announcements and their follow-ups.
//!
//! The tracker owns its position list and performs no I/O. Thread work is
//! queued as [`PositionEffect`]s and carried out by [`apply_effects`].

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{
    config::Config,
    domain::{AuthorId, ChannelId, ThreadRef},
    formatting::strip_markup,
    messaging::port::ThreadingPort,
    parsing::{
        parse_announcement, parse_price_update, split_at_marker, Announcement, InstrumentType,
        PriceKind,
    },
};

/// Identity of a position. Symbol is upper-cased and strike kept in cents
/// so equal call-outs compare equal regardless of spelling.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PositionKey {
    pub author: AuthorId,
    pub symbol: String,
    pub strike_cents: i64,
    pub instrument: InstrumentType,
}

impl PositionKey {
    fn new(author: AuthorId, announcement: &Announcement) -> Self {
        Self {
            author,
            symbol: announcement.symbol.to_uppercase(),
            strike_cents: (announcement.strike * 100.0).round() as i64,
            instrument: announcement.instrument,
        }
    }

    pub fn strike(&self) -> f64 {
        self.strike_cents as f64 / 100.0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Position {
    pub key: PositionKey,
    pub open_price: Option<f64>,
    pub last_price: Option<f64>,
    pub stop_price: Option<f64>,
    /// Every text applied to this position, announcement first.
    pub updates: Vec<String>,
    pub thread: Option<ThreadRef>,
    pub last_updated: DateTime<Utc>,
}

impl Position {
    /// Profit/loss in percent of the open price, 0 until both prices are known.
    pub fn pnl_percent(&self) -> f64 {
        match (self.open_price, self.last_price) {
            (Some(open), Some(last)) if open > 0.0 => (last - open) / open * 100.0,
            _ => 0.0,
        }
    }

    pub fn title(&self, author_name: &str) -> String {
        format!(
            "{author_name}: {} ${} {} @ {} | {} | {:.2}%",
            self.key.symbol,
            format_price(self.key.strike()),
            self.key.instrument,
            price_or_na(self.open_price),
            price_or_na(self.last_price),
            self.pnl_percent()
        )
    }
}

fn format_price(p: f64) -> String {
    format!("{p:.2}")
}

fn price_or_na(p: Option<f64>) -> String {
    p.map(|p| format!("${}", format_price(p)))
        .unwrap_or_else(|| "$N/A".to_string())
}

#[derive(Clone, Debug, PartialEq)]
pub enum IngestOutcome {
    NoOp,
    Created(Position),
    Updated(Position),
    Orphan,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PositionEffect {
    CreateThread {
        key: PositionKey,
        title: String,
        seed_text: String,
    },
    AppendAndRetitle {
        key: PositionKey,
        text: String,
        title: String,
    },
}

#[derive(Clone, Copy, Debug)]
pub struct TrackerSettings {
    /// Relative deviation above which a price update is ignored (3.0 = 300%).
    pub price_deviation_limit: f64,
    /// Positions not updated for this long are dropped.
    pub ttl: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            price_deviation_limit: 3.0,
            ttl: Duration::from_secs(72 * 3600),
        }
    }
}

impl TrackerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            price_deviation_limit: cfg.price_deviation_limit,
            ttl: cfg.position_ttl,
        }
    }
}

#[derive(Debug, Default)]
pub struct PositionTracker {
    settings: TrackerSettings,
    /// Insertion order doubles as correlation priority.
    positions: Vec<Position>,
    author_names: HashMap<AuthorId, String>,
    effects: Vec<PositionEffect>,
}

impl PositionTracker {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Names used in thread titles; authors without one show their id.
    pub fn with_author_names(mut self, names: HashMap<AuthorId, String>) -> Self {
        self.author_names = names;
        self
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn get(&self, key: &PositionKey) -> Option<&Position> {
        self.positions.iter().find(|p| &p.key == key)
    }

    pub fn ingest(&mut self, author: AuthorId, text: &str) -> IngestOutcome {
        self.ingest_at(author, text, Utc::now())
    }

    pub fn ingest_at(&mut self, author: AuthorId, text: &str, now: DateTime<Utc>) -> IngestOutcome {
        self.evict_stale(now);

        let (before, from_marker) = split_at_marker(text);
        let Some(announcement_text) = from_marker else {
            if !is_meaningful(text) {
                return IngestOutcome::NoOp;
            }
            return self.apply_update(author, text, now);
        };

        let leading = if is_meaningful(before) {
            Some(self.apply_update(author, before.trim(), now))
        } else {
            None
        };

        match parse_announcement(announcement_text) {
            Some(announcement) => self.announce(author, announcement, announcement_text, now),
            None => {
                debug!(target: "relay::rx", author = %author, "marker without a readable announcement");
                leading.unwrap_or(IngestOutcome::NoOp)
            }
        }
    }

    /// Take the queued thread effects, oldest first.
    pub fn take_effects(&mut self) -> Vec<PositionEffect> {
        std::mem::take(&mut self.effects)
    }

    pub fn attach_thread(&mut self, key: &PositionKey, thread: ThreadRef) {
        if let Some(position) = self.positions.iter_mut().find(|p| &p.key == key) {
            position.thread = Some(thread);
        }
    }

    /// Record threads created off the loop. Refs for evicted positions are dropped.
    pub fn attach_threads(&mut self, refs: ThreadRefs) {
        for (key, thread) in refs {
            self.attach_thread(&key, thread);
        }
    }

    pub fn thread_refs(&self) -> ThreadRefs {
        self.positions
            .iter()
            .filter_map(|p| p.thread.map(|thread| (p.key.clone(), thread)))
            .collect()
    }

    fn author_name(&self, author: AuthorId) -> String {
        self.author_names
            .get(&author)
            .cloned()
            .unwrap_or_else(|| author.to_string())
    }

    fn evict_stale(&mut self, now: DateTime<Utc>) {
        let Ok(ttl) = chrono::Duration::from_std(self.settings.ttl) else {
            return;
        };
        let before = self.positions.len();
        self.positions.retain(|p| now.signed_duration_since(p.last_updated) <= ttl);
        let evicted = before - self.positions.len();
        if evicted > 0 {
            debug!(target: "relay::rx", evicted, "expired positions evicted");
        }
    }

    fn announce(
        &mut self,
        author: AuthorId,
        announcement: Announcement,
        text: &str,
        now: DateTime<Utc>,
    ) -> IngestOutcome {
        let key = PositionKey::new(author, &announcement);
        let text = text.trim().to_string();

        if let Some(idx) = self.positions.iter().position(|p| p.key == key) {
            let position = &mut self.positions[idx];
            if position.open_price.is_none() {
                position.open_price = announcement.open_price;
            }
            if position.stop_price.is_none() {
                position.stop_price = announcement.stop_price;
            }
            position.updates.push(text.clone());
            position.last_updated = now;
            let snapshot = position.clone();
            self.queue_append(&snapshot, text);
            return IngestOutcome::Updated(snapshot);
        }

        let position = Position {
            key: key.clone(),
            open_price: announcement.open_price,
            last_price: None,
            stop_price: announcement.stop_price,
            updates: vec![text.clone()],
            thread: None,
            last_updated: now,
        };
        self.effects.push(PositionEffect::CreateThread {
            key,
            title: position.title(&self.author_name(author)),
            seed_text: text,
        });
        self.positions.push(position.clone());
        IngestOutcome::Created(position)
    }

    fn apply_update(&mut self, author: AuthorId, text: &str, now: DateTime<Utc>) -> IngestOutcome {
        let haystack = text.to_uppercase();
        let Some(idx) = self
            .positions
            .iter()
            .position(|p| p.key.author == author && haystack.contains(&p.key.symbol))
        else {
            return IngestOutcome::Orphan;
        };

        let limit = self.settings.price_deviation_limit;
        let position = &mut self.positions[idx];
        if let Some(update) = parse_price_update(text, position.key.strike()) {
            let current = match update.kind {
                PriceKind::Last => position.last_price,
                PriceKind::Stop => position.stop_price,
            };
            if within_deviation(current.or(position.open_price), update.price, limit) {
                match update.kind {
                    PriceKind::Last => position.last_price = Some(update.price),
                    PriceKind::Stop => position.stop_price = Some(update.price),
                }
            } else {
                warn!(
                    target: "relay::rx",
                    symbol = %position.key.symbol,
                    price = update.price,
                    "price update deviates too far from reference, ignored"
                );
            }
        }
        position.updates.push(text.to_string());
        position.last_updated = now;

        let snapshot = position.clone();
        self.queue_append(&snapshot, text.to_string());
        IngestOutcome::Updated(snapshot)
    }

    fn queue_append(&mut self, position: &Position, text: String) {
        self.effects.push(PositionEffect::AppendAndRetitle {
            key: position.key.clone(),
            text,
            title: position.title(&self.author_name(position.key.author)),
        });
    }
}

fn within_deviation(reference: Option<f64>, price: f64, limit: f64) -> bool {
    match reference {
        Some(reference) if reference > 0.0 => ((price - reference) / reference).abs() <= limit,
        _ => true,
    }
}

fn is_meaningful(text: &str) -> bool {
    strip_markup(text).chars().any(char::is_alphanumeric)
}

/// Run queued effects against the threading port. Threads are created in
/// `channel`. Failures are logged; the position keeps tracking without a thread.
/// Thread refs known for open positions, keyed by position.
pub type ThreadRefs = HashMap<PositionKey, ThreadRef>;

/// Carry out `effects` in order against `channel`.
///
/// Threads created here are recorded in `known` so later appends in the same
/// or a following batch find them before the tracker has been told.
pub async fn apply_effects(
    effects: Vec<PositionEffect>,
    threads: &dyn ThreadingPort,
    channel: ChannelId,
    known: &mut ThreadRefs,
) -> usize {
    let mut applied = 0;
    for effect in effects {
        match effect {
            PositionEffect::CreateThread {
                key,
                title,
                seed_text,
            } => match threads.create_thread(channel, &title, &seed_text).await {
                Ok(thread) => {
                    known.insert(key, thread);
                    applied += 1;
                }
                Err(e) => warn!(target: "relay::rx", symbol = %key.symbol, "create thread failed: {e}"),
            },
            PositionEffect::AppendAndRetitle { key, text, title } => {
                let Some(thread) = known.get(&key).copied() else {
                    debug!(target: "relay::rx", symbol = %key.symbol, "no thread for position, update kept locally");
                    continue;
                };
                if let Err(e) = threads.post_to_thread(thread, &text).await {
                    warn!(target: "relay::rx", symbol = %key.symbol, "post to thread failed: {e}");
                    continue;
                }
                if let Err(e) = threads.rename_thread(thread, &title).await {
                    warn!(target: "relay::rx", symbol = %key.symbol, "rename thread failed: {e}");
                }
                applied += 1;
            }
        }
    }
    applied
}
