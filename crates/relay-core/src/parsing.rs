//! Best-effort extraction of option call-outs from free text.
//!
//! Every function here returns `None`/empty on anything it cannot read;
//! unparseable text is normal traffic, not an error.

use std::{fmt, sync::OnceLock};

use regex::Regex;

use crate::transform::NEW_MARKER;

/// Raw emoji accepted as the new-position marker alongside [`NEW_MARKER`].
pub const NEW_MARKER_EMOJI: &str = "🆕";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstrumentType {
    Call,
    Put,
}

impl fmt::Display for InstrumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentType::Call => f.write_str("CALL"),
            InstrumentType::Put => f.write_str("PUT"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Announcement {
    pub symbol: String,
    pub strike: f64,
    pub instrument: InstrumentType,
    pub open_price: Option<f64>,
    pub stop_price: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PriceKind {
    Last,
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PriceUpdate {
    pub kind: PriceKind,
    pub price: f64,
}

fn symbol_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // leading icon: `:name:` / `<a:name:id>` / a pictographic emoji
        Regex::new(r"(?::[^:\s]+:(?:\d+>)?|[\p{Emoji_Presentation}\p{Extended_Pictographic}])\s*(\w+)")
            .expect("valid regex")
    })
}

fn dollar_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$(\d+(?:\.\d{1,2})?)|(?:^|\s)\.(\d+)").expect("valid regex"))
}

fn instrument_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(call|put)s?\b").expect("valid regex"))
}

fn stop_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bstop(?:\s*loss)?\b|\bsl\b").expect("valid regex"))
}

/// Split `text` at the first new-position marker.
///
/// Returns `(before, from_marker)`; `from_marker` is `None` when no marker is present.
pub fn split_at_marker(text: &str) -> (&str, Option<&str>) {
    let found = [NEW_MARKER, NEW_MARKER_EMOJI]
        .iter()
        .filter_map(|m| text.find(m))
        .min();
    match found {
        Some(idx) => (&text[..idx], Some(&text[idx..])),
        None => (text, None),
    }
}

/// All `$X`, `$X.XX` and ` .XX` amounts in order of appearance.
pub fn parse_dollar_amounts(text: &str) -> Vec<f64> {
    dollar_regex()
        .captures_iter(text)
        .filter_map(|caps| {
            if let Some(whole) = caps.get(1) {
                whole.as_str().parse().ok()
            } else {
                caps.get(2)
                    .and_then(|frac| format!("0.{}", frac.as_str()).parse().ok())
            }
        })
        .collect()
}

pub fn parse_instrument(text: &str) -> Option<InstrumentType> {
    let caps = instrument_regex().captures(text)?;
    match caps.get(1)?.as_str().to_ascii_lowercase().as_str() {
        "call" => Some(InstrumentType::Call),
        "put" => Some(InstrumentType::Put),
        _ => None,
    }
}

/// Parse an announcement starting at (or containing) its leading icon.
///
/// Strike is the largest amount; open and stop are the largest of what remains.
pub fn parse_announcement(text: &str) -> Option<Announcement> {
    let symbol = symbol_regex().captures(text)?.get(1)?.as_str().to_string();
    let instrument = parse_instrument(text)?;

    let mut amounts = parse_dollar_amounts(text);
    amounts.sort_by(|a, b| b.total_cmp(a));
    let strike = *amounts.first()?;

    Some(Announcement {
        symbol,
        strike,
        instrument,
        open_price: amounts.get(1).copied(),
        stop_price: amounts.get(2).copied(),
    })
}

/// First price in an update, ignoring amounts equal to the position's strike.
pub fn parse_price_update(text: &str, strike: f64) -> Option<PriceUpdate> {
    let price = parse_dollar_amounts(text)
        .into_iter()
        .find(|p| (p - strike).abs() >= 0.005)?;
    let kind = if stop_regex().is_match(text) {
        PriceKind::Stop
    } else {
        PriceKind::Last
    };
    Some(PriceUpdate { kind, price })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_emoji_marker_announcement() {
        let a = parse_announcement("🆕 AAPL $5.00 call $1.23").unwrap();
        assert_eq!(a.symbol, "AAPL");
        assert_eq!(a.strike, 5.0);
        assert_eq!(a.instrument, InstrumentType::Call);
        assert_eq!(a.open_price, Some(1.23));
        assert_eq!(a.stop_price, None);
    }

    #[test]
    fn parses_canonical_marker_with_stop() {
        let a = parse_announcement(":new: NVDA - $120 PUTS @ $2.50 stop .90").unwrap();
        assert_eq!(a.symbol, "NVDA");
        assert_eq!(a.strike, 120.0);
        assert_eq!(a.instrument, InstrumentType::Put);
        assert_eq!(a.open_price, Some(2.5));
        assert_eq!(a.stop_price, Some(0.9));
    }

    #[test]
    fn incomplete_announcements_are_rejected() {
        assert_eq!(parse_announcement(":new: AAPL $5 looking good"), None);
        assert_eq!(parse_announcement(":new: AAPL calls"), None);
        assert_eq!(parse_announcement("AAPL $5 calls"), None);
    }

    #[test]
    fn dollar_amounts_support_shorthand() {
        assert_eq!(parse_dollar_amounts("$12 then $3.5 and .75"), vec![12.0, 3.5, 0.75]);
        assert!(parse_dollar_amounts("no prices 4.50").is_empty());
    }

    #[test]
    fn splits_on_either_marker() {
        assert_eq!(split_at_marker("trim AAPL :new: TSLA"), ("trim AAPL ", Some(":new: TSLA")));
        assert_eq!(split_at_marker("🆕 MSFT"), ("", Some("🆕 MSFT")));
        assert_eq!(split_at_marker("nothing"), ("nothing", None));
    }

    #[test]
    fn price_updates_skip_the_strike_and_detect_stops() {
        assert_eq!(
            parse_price_update("AAPL $5 calls now $1.80", 5.0),
            Some(PriceUpdate { kind: PriceKind::Last, price: 1.8 })
        );
        assert_eq!(
            parse_price_update("AAPL move stop to $1.10", 5.0),
            Some(PriceUpdate { kind: PriceKind::Stop, price: 1.1 })
        );
        assert_eq!(parse_price_update("AAPL still holding", 5.0), None);
    }
}
