//! Text helpers shared by the transform pipeline and the status reporter.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

/// Truncate to at most `max` characters (not bytes).
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Truncate to at most `max` characters, ending in `…` when shortened.
pub fn truncate_with_ellipsis(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    if max == 0 {
        return String::new();
    }
    format!("{}…", truncate_chars(text, max - 1))
}

fn markup_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // user / role / channel mentions and custom emoji
        Regex::new(r"<@[!&]?\d+>|<#\d+>|<a?:\w+:\d+>").expect("valid regex")
    })
}

/// Remove mentions, custom emoji and inline markdown, collapsing whitespace.
pub fn strip_markup(text: &str) -> String {
    let no_mentions = markup_regex().replace_all(text, "");
    let no_md: String = no_mentions
        .chars()
        .filter(|c| !matches!(c, '*' | '_' | '~' | '`' | '|' | '>'))
        .collect();
    no_md.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// "N days/hours/minutes/seconds ago" using the coarsest unit that is ≥ 1.
pub fn relative_age(elapsed_secs: i64) -> String {
    let secs = elapsed_secs.max(0);
    let (n, unit) = if secs >= 86_400 {
        (secs / 86_400, "day")
    } else if secs >= 3_600 {
        (secs / 3_600, "hour")
    } else if secs >= 60 {
        (secs / 60, "minute")
    } else {
        (secs, "second")
    };
    let plural = if n == 1 { "" } else { "s" };
    format!("{n} {unit}{plural} ago")
}

pub fn format_utc(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Platform timestamp markup rendered client-side (`<t:EPOCH>` / `<t:EPOCH:R>`).
pub fn timestamp_markup(ts: DateTime<Utc>, style: Option<char>) -> String {
    match style {
        Some(s) => format!("<t:{}:{s}>", ts.timestamp()),
        None => format!("<t:{}>", ts.timestamp()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn truncation_counts_characters() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_with_ellipsis("abcdef", 4), "abc…");
        assert_eq!(truncate_with_ellipsis("abc", 4), "abc");
    }

    #[test]
    fn strips_mentions_and_markdown() {
        assert_eq!(
            strip_markup("<@123> **look** at <#55> <a:fire:999> now"),
            "look at now"
        );
        assert_eq!(strip_markup("<@!1> <@&2>"), "");
    }

    #[test]
    fn relative_age_uses_coarsest_unit() {
        assert_eq!(relative_age(5), "5 seconds ago");
        assert_eq!(relative_age(60), "1 minute ago");
        assert_eq!(relative_age(7_300), "2 hours ago");
        assert_eq!(relative_age(3 * 86_400 + 10), "3 days ago");
        assert_eq!(relative_age(-4), "0 seconds ago");
    }

    #[test]
    fn timestamp_markup_formats() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_utc(ts), "2026-01-02 03:04:05 UTC");
        assert_eq!(timestamp_markup(ts, None), format!("<t:{}>", ts.timestamp()));
        assert_eq!(timestamp_markup(ts, Some('R')), format!("<t:{}:R>", ts.timestamp()));
    }
}
