//! Transform pipeline: inbound message + route → display-ready content.
//!
//! Pure and total: no I/O, no shared state. The caller supplies `now`.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use regex::{NoExpand, Regex};
use serde::Deserialize;

use crate::{
    config::Config,
    domain::AuthorId,
    errors::Error,
    formatting::{format_utc, relative_age, strip_markup, truncate_chars, truncate_with_ellipsis},
    messaging::types::{Attachment, InboundMessage, OutboundMessage, ReplyTarget},
    routing::Route,
    Result,
};

/// Canonical "new position" marker every author-specific glyph is normalized to.
pub const NEW_MARKER: &str = ":new:";

const TRUNCATION_MARKER: &str = "… (truncated)";

/// Tokens removed from every message regardless of author.
const STRIPPED_TOKENS: &[&str] = &["@c2.ini"];

/// Custom emoji normalized for every author.
const COMMON_GLYPHS: &[(&str, &str)] = &[
    ("9655_eyesshaking_new", ":eyes:"),
    ("pngwing", ":red_circle:"),
    ("verifyblue", ":white_check_mark:"),
];

/// A custom emoji name and what it becomes, e.g. `RedAlert` → `:new:`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct GlyphRule {
    pub name: String,
    pub replacement: String,
}

#[derive(Clone, Debug)]
struct CompiledGlyph {
    pattern: Regex,
    replacement: String,
}

impl CompiledGlyph {
    fn compile(name: &str, replacement: &str) -> Result<Self> {
        let name = regex::escape(name);
        // Animated/static custom emoji first so no `<a` remnant is left behind.
        let pattern = Regex::new(&format!(r"<a?:{name}:\d+>|:{name}:"))
            .map_err(|e| Error::Config(format!("invalid glyph name {name}: {e}")))?;
        Ok(Self {
            pattern,
            replacement: replacement.to_string(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct GlyphTable {
    common: Vec<CompiledGlyph>,
    per_author: HashMap<AuthorId, Vec<CompiledGlyph>>,
}

impl Default for GlyphTable {
    fn default() -> Self {
        let common = COMMON_GLYPHS
            .iter()
            .map(|(name, replacement)| {
                CompiledGlyph::compile(name, replacement).expect("valid regex")
            })
            .collect();
        Self {
            common,
            per_author: HashMap::new(),
        }
    }
}

impl GlyphTable {
    pub fn set_author_rules(&mut self, author: AuthorId, rules: &[GlyphRule]) -> Result<()> {
        let compiled = rules
            .iter()
            .map(|r| CompiledGlyph::compile(&r.name, &r.replacement))
            .collect::<Result<Vec<_>>>()?;
        self.per_author.insert(author, compiled);
        Ok(())
    }

    /// Strip fixed tokens, then apply common and author-specific substitutions.
    pub fn apply(&self, author: AuthorId, text: &str) -> String {
        let mut out = text.to_string();
        for token in STRIPPED_TOKENS {
            out = out.replace(token, "");
        }
        let author_rules = self.per_author.get(&author).into_iter().flatten();
        for glyph in self.common.iter().chain(author_rules) {
            out = glyph
                .pattern
                .replace_all(&out, NoExpand(&glyph.replacement))
                .into_owned();
        }
        out
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TransformSettings {
    /// Messages older than this get a relative-age annotation.
    pub stale_after: Duration,
    /// Platform length ceiling, in characters.
    pub max_len: usize,
    pub reply_excerpt_len: usize,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(5),
            max_len: 2000,
            reply_excerpt_len: 100,
        }
    }
}

impl TransformSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            stale_after: cfg.stale_after,
            max_len: cfg.message_limit,
            reply_excerpt_len: cfg.reply_excerpt_len,
        }
    }
}

pub struct TransformContext<'a> {
    pub glyphs: &'a GlyphTable,
    pub aliases: &'a HashMap<AuthorId, String>,
    pub settings: &'a TransformSettings,
    pub now: DateTime<Utc>,
}

pub fn transform(msg: &InboundMessage, route: &Route, ctx: &TransformContext<'_>) -> OutboundMessage {
    let body = ctx.glyphs.apply(msg.author.id, &msg.raw_content);

    let mut head = String::new();
    if let Some(age) = age_annotation(msg.created_at, ctx.now, ctx.settings.stale_after) {
        head.push_str(&age);
        head.push('\n');
    }
    if let Some(quote) = msg
        .reply_target
        .as_ref()
        .and_then(|r| reply_quote(r, ctx.settings.reply_excerpt_len))
    {
        head.push_str(&quote);
        head.push('\n');
    }
    if let Some(name) = route.display_name_for(&msg.author, ctx.aliases) {
        head.push_str(&format!("【{name}】"));
    }
    head.push_str(&body);

    let mut tail = attachment_suffix(&body, &msg.attachments);
    if route.show_credit {
        if let Some(link) = &msg.link {
            tail.push_str(&format!(" | 👉{link}"));
        }
    }

    OutboundMessage {
        content: fit_to_limit(&head, &tail, ctx.settings.max_len),
        embeds: msg.embeds.clone(),
    }
}

/// Attachment URLs to append after the body.
///
/// On an empty body the URLs become the whole content; URLs the body
/// already contains are not repeated.
fn attachment_suffix(body: &str, attachments: &[Attachment]) -> String {
    let urls: Vec<&str> = attachments
        .iter()
        .map(|a| a.url.as_str())
        .filter(|url| !body.contains(url))
        .collect();
    if urls.is_empty() {
        return String::new();
    }
    if body.trim().is_empty() {
        return urls.join(" ");
    }
    format!(" {}", urls.join(" "))
}

fn reply_quote(reply: &ReplyTarget, excerpt_len: usize) -> Option<String> {
    let excerpt = truncate_with_ellipsis(&strip_markup(&reply.content), excerpt_len);
    match (excerpt.is_empty(), &reply.link) {
        (true, None) => None,
        (true, Some(link)) => Some(format!("↩ {link}")),
        (false, link) => {
            let who = reply
                .author_name
                .as_deref()
                .map(|n| format!("{n}: "))
                .unwrap_or_default();
            let back = link.as_deref().map(|l| format!(" ({l})")).unwrap_or_default();
            Some(format!("> {who}{excerpt}{back}"))
        }
    }
}

fn age_annotation(created_at: DateTime<Utc>, now: DateTime<Utc>, stale_after: Duration) -> Option<String> {
    let elapsed = now.signed_duration_since(created_at);
    let stale_after = chrono::Duration::from_std(stale_after).ok()?;
    if elapsed <= stale_after {
        return None;
    }
    Some(format!(
        "-# {} ({})",
        format_utc(created_at),
        relative_age(elapsed.num_seconds())
    ))
}

/// Cut `head` so that `head + marker + tail` fits `max_len`; `tail` is kept whole.
fn fit_to_limit(head: &str, tail: &str, max_len: usize) -> String {
    let head_len = head.chars().count();
    let tail_len = tail.chars().count();
    if head_len + tail_len <= max_len {
        return format!("{head}{tail}");
    }

    let marker_len = TRUNCATION_MARKER.chars().count();
    match max_len.checked_sub(tail_len + marker_len) {
        Some(budget) if budget > 0 => {
            format!("{}{TRUNCATION_MARKER}{tail}", truncate_chars(head, budget))
        }
        _ => {
            // The suffix alone does not fit; fall back to a hard cut.
            let joined = format!("{head}{tail}");
            if max_len <= marker_len {
                return truncate_chars(&joined, max_len);
            }
            let budget = max_len - marker_len;
            format!("{}{TRUNCATION_MARKER}", truncate_chars(&joined, budget))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{ChannelId, MessageId},
        messaging::types::Author,
        routing::{CallOutMode, DisplayNamePolicy},
    };
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn msg(content: &str) -> InboundMessage {
        InboundMessage {
            id: MessageId(1),
            author: Author {
                id: AuthorId(7),
                display_name: "Ashley".to_string(),
                avatar_url: None,
            },
            channel_id: ChannelId(100),
            raw_content: content.to_string(),
            attachments: Vec::new(),
            embeds: Vec::new(),
            created_at: now(),
            reply_target: None,
            link: Some("https://chat/100/1".to_string()),
        }
    }

    fn route() -> Route {
        Route {
            source_channel_id: ChannelId(100),
            target_channel_ids: vec![ChannelId(200)],
            webhook_targets: Vec::new(),
            author_filter: None,
            display_name: DisplayNamePolicy::Hidden,
            show_credit: false,
            ignore_history: false,
            call_outs: CallOutMode::Off,
            thread_channel_id: None,
        }
    }

    fn run(m: &InboundMessage, r: &Route, settings: &TransformSettings) -> String {
        let glyphs = GlyphTable::default();
        let aliases = HashMap::new();
        let ctx = TransformContext {
            glyphs: &glyphs,
            aliases: &aliases,
            settings,
            now: now(),
        };
        transform(m, r, &ctx).content
    }

    fn attach(m: &mut InboundMessage, urls: &[&str]) {
        m.attachments = urls
            .iter()
            .map(|u| Attachment { url: u.to_string() })
            .collect();
    }

    #[test]
    fn common_glyphs_are_normalized_for_every_author() {
        let out = run(
            &msg("@c2.ini <a:9655_eyesshaking_new:123> :pngwing: :verifyblue:"),
            &route(),
            &TransformSettings::default(),
        );
        assert_eq!(out, " :eyes: :red_circle: :white_check_mark:");
    }

    #[test]
    fn author_glyphs_map_to_the_canonical_marker() {
        let mut glyphs = GlyphTable::default();
        glyphs
            .set_author_rules(
                AuthorId(7),
                &[GlyphRule {
                    name: "8375_siren_blue".to_string(),
                    replacement: NEW_MARKER.to_string(),
                }],
            )
            .unwrap();
        assert_eq!(glyphs.apply(AuthorId(7), "<a:8375_siren_blue:42> TSLA"), ":new: TSLA");
        assert_eq!(glyphs.apply(AuthorId(8), ":8375_siren_blue: TSLA"), ":8375_siren_blue: TSLA");
    }

    #[test]
    fn lone_attachment_replaces_empty_body() {
        let mut m = msg("");
        attach(&mut m, &["https://cdn/a.png"]);
        assert_eq!(run(&m, &route(), &TransformSettings::default()), "https://cdn/a.png");
    }

    #[test]
    fn attachments_are_appended_without_repeating_inline_urls() {
        let mut m = msg("chart https://cdn/a.png");
        attach(&mut m, &["https://cdn/a.png"]);
        assert_eq!(run(&m, &route(), &TransformSettings::default()), "chart https://cdn/a.png");

        let mut m = msg("");
        attach(&mut m, &["https://cdn/a.png", "https://cdn/b.png"]);
        assert_eq!(
            run(&m, &route(), &TransformSettings::default()),
            "https://cdn/a.png https://cdn/b.png"
        );
    }

    #[test]
    fn name_prefix_and_credit_suffix() {
        let mut r = route();
        r.display_name = DisplayNamePolicy::Shown { literal: None };
        r.show_credit = true;
        assert_eq!(
            run(&msg("hello"), &r, &TransformSettings::default()),
            "【Ashley】hello | 👉https://chat/100/1"
        );
    }

    #[test]
    fn reply_quote_is_stripped_and_truncated() {
        let mut m = msg("agreed");
        m.reply_target = Some(ReplyTarget {
            message_id: MessageId(0),
            author_name: Some("Bob".to_string()),
            content: format!("<@1> **{}**", "x".repeat(150)),
            link: Some("https://chat/100/0".to_string()),
        });
        let out = run(&m, &route(), &TransformSettings::default());
        let first = out.lines().next().unwrap();
        assert!(first.starts_with("> Bob: xxx"));
        assert!(first.ends_with("… (https://chat/100/0)"));
        assert_eq!(first.matches('x').count(), 99);
        assert!(out.ends_with("\nagreed"));
    }

    #[test]
    fn reply_without_text_falls_back_to_back_link() {
        let mut m = msg("ok");
        m.reply_target = Some(ReplyTarget {
            message_id: MessageId(0),
            author_name: None,
            content: "<@123>".to_string(),
            link: Some("https://chat/100/0".to_string()),
        });
        assert_eq!(
            run(&m, &route(), &TransformSettings::default()),
            "↩ https://chat/100/0\nok"
        );
    }

    #[test]
    fn stale_messages_get_age_annotation() {
        let mut m = msg("late");
        m.created_at = now() - chrono::Duration::hours(3);
        assert_eq!(
            run(&m, &route(), &TransformSettings::default()),
            "-# 2026-03-01 09:00:00 UTC (3 hours ago)\nlate"
        );

        let mut fresh = msg("now");
        fresh.created_at = now() - chrono::Duration::seconds(2);
        assert_eq!(run(&fresh, &route(), &TransformSettings::default()), "now");
    }

    #[test]
    fn limits_shorter_than_the_marker_are_still_honoured() {
        let out = fit_to_limit("a long body", " | 👉link", 5);
        assert_eq!(out, "a lon");
        assert_eq!(fit_to_limit("abc", "", 0), "");

        let marker_len = TRUNCATION_MARKER.chars().count();
        let out = fit_to_limit("a long body", " | 👉link", marker_len + 2);
        assert_eq!(out, format!("a {TRUNCATION_MARKER}"));
    }

    #[test]
    fn truncation_keeps_attachment_and_credit_suffix() {
        let mut r = route();
        r.show_credit = true;
        let mut m = msg(&"y".repeat(500));
        attach(&mut m, &["https://cdn/a.png"]);
        let settings = TransformSettings {
            max_len: 100,
            ..TransformSettings::default()
        };
        let out = run(&m, &r, &settings);
        assert_eq!(out.chars().count(), 100);
        assert!(out.ends_with(" https://cdn/a.png | 👉https://chat/100/1"));
        assert!(out.contains(TRUNCATION_MARKER));
    }

    #[test]
    fn embeds_pass_through() {
        let mut m = msg("x");
        m.embeds = vec![crate::messaging::types::Embed {
            title: Some("t".to_string()),
            ..Default::default()
        }];
        let glyphs = GlyphTable::default();
        let aliases = HashMap::new();
        let settings = TransformSettings::default();
        let ctx = TransformContext {
            glyphs: &glyphs,
            aliases: &aliases,
            settings: &settings,
            now: now(),
        };
        assert_eq!(transform(&m, &route(), &ctx).embeds.len(), 1);
    }
}
