//! Routing table: source channel → ordered routes.
//!
//! Built once from the JSON routing settings. Names are resolved to ids at
//! load time; every unresolved reference is reported once as a warning and
//! simply left out, and a route left with no delivery target is dropped.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use tracing::warn;

use crate::{
    domain::{AuthorId, ChannelId},
    errors::Error,
    messaging::types::{Author, WebhookIdentity},
    transform::{GlyphRule, GlyphTable},
    Result,
};

// ============== Settings file schema ==============

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RoutingSettings {
    #[serde(default)]
    pub channels: HashMap<String, IdValue>,
    #[serde(default)]
    pub users: HashMap<String, UserSettings>,
    #[serde(default)]
    pub webhooks: HashMap<String, WebhookSettings>,
    #[serde(default)]
    pub repost_settings: HashMap<String, Vec<RouteSettings>>,
    #[serde(default)]
    pub test_mode: Option<TestModeSettings>,
    /// Author-specific glyph substitutions, keyed by user name.
    #[serde(default)]
    pub glyphs: HashMap<String, Vec<GlyphRule>>,
}

/// Ids appear both as JSON numbers and as strings in hand-written files.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum IdValue {
    Num(i64),
    Text(String),
}

impl IdValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            IdValue::Num(n) => Some(*n),
            IdValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct UserSettings {
    pub id: IdValue,
    /// Display override (literal name or emoji alias) used when names are shown.
    #[serde(default)]
    pub display: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum WebhookSettings {
    Url(String),
    Full {
        url: String,
        #[serde(default)]
        use_dynamic_identity: bool,
    },
}

/// One string or a list of strings.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn names(&self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s.clone()],
            OneOrMany::Many(v) => v.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RouteSettings {
    #[serde(default)]
    pub authors: Option<Vec<String>>,
    #[serde(default)]
    pub target_channel: Option<OneOrMany>,
    #[serde(default)]
    pub webhook: Option<OneOrMany>,
    #[serde(default)]
    pub show_name: bool,
    #[serde(default)]
    pub author_name_override: Option<String>,
    #[serde(default)]
    pub show_credit: bool,
    #[serde(default)]
    pub ignore_history: bool,
    #[serde(default)]
    pub trade_call_out: CallOutMode,
    /// Channel that hosts one discussion thread per tracked position.
    #[serde(default)]
    pub thread_channel: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TestModeSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub target_channel: Option<String>,
    #[serde(default)]
    pub webhook: Option<String>,
}

// ============== Resolved routes ==============

/// Whether a route feeds the position tracker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutMode {
    #[default]
    Off,
    /// Track positions in addition to normal delivery.
    Also,
    /// Track positions instead of normal delivery.
    Only,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookTarget {
    pub name: String,
    pub url: String,
    pub use_dynamic_identity: bool,
}

impl WebhookTarget {
    pub fn identity_for(&self, author: &Author, display: Option<&str>) -> Option<WebhookIdentity> {
        if !self.use_dynamic_identity {
            return None;
        }
        Some(WebhookIdentity {
            username: display.unwrap_or(&author.display_name).to_string(),
            avatar_url: author.avatar_url.clone(),
        })
    }
}

/// Allowed authors, each with an optional display override.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthorFilter {
    allowed: HashMap<AuthorId, Option<String>>,
}

impl AuthorFilter {
    pub fn new(allowed: HashMap<AuthorId, Option<String>>) -> Self {
        Self { allowed }
    }

    pub fn allows(&self, author: AuthorId) -> bool {
        self.allowed.contains_key(&author)
    }

    pub fn display_override(&self, author: AuthorId) -> Option<&str> {
        self.allowed.get(&author).and_then(|o| o.as_deref())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisplayNamePolicy {
    Hidden,
    /// Prefix a name: route literal, else the author's alias, else the platform name.
    Shown { literal: Option<String> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub source_channel_id: ChannelId,
    pub target_channel_ids: Vec<ChannelId>,
    pub webhook_targets: Vec<WebhookTarget>,
    pub author_filter: Option<AuthorFilter>,
    pub display_name: DisplayNamePolicy,
    pub show_credit: bool,
    pub ignore_history: bool,
    pub call_outs: CallOutMode,
    pub thread_channel_id: Option<ChannelId>,
}

impl Route {
    pub fn accepts(&self, author: AuthorId) -> bool {
        self.author_filter
            .as_ref()
            .map(|f| f.allows(author))
            .unwrap_or(true)
    }

    /// Name to prefix, or `None` when names are hidden.
    pub fn display_name_for(&self, author: &Author, aliases: &HashMap<AuthorId, String>) -> Option<String> {
        let DisplayNamePolicy::Shown { literal } = &self.display_name else {
            return None;
        };
        if let Some(literal) = literal {
            return Some(literal.clone());
        }
        let from_filter = self
            .author_filter
            .as_ref()
            .and_then(|f| f.display_override(author.id));
        Some(
            from_filter
                .or_else(|| aliases.get(&author.id).map(String::as_str))
                .unwrap_or(&author.display_name)
                .to_string(),
        )
    }

    /// Channel that receives position threads for this route.
    pub fn thread_channel(&self) -> Option<ChannelId> {
        self.thread_channel_id
            .or_else(|| self.target_channel_ids.first().copied())
    }

    fn is_inert(&self) -> bool {
        let delivers = !self.target_channel_ids.is_empty() || !self.webhook_targets.is_empty();
        let tracks = self.call_outs != CallOutMode::Off && self.thread_channel().is_some();
        match self.call_outs {
            CallOutMode::Only => !tracks,
            _ => !delivers,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RoutingTable {
    routes: HashMap<ChannelId, Vec<Route>>,
    /// Channel ids in configuration order, for history replay.
    order: Vec<ChannelId>,
    /// Author alias map (user id → display override) from `users`.
    aliases: HashMap<AuthorId, String>,
    glyphs: GlyphTable,
}

impl RoutingTable {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let settings: RoutingSettings = crate::config::load_json_file(path)?;
        Self::from_settings(&settings)
    }

    pub fn from_settings(settings: &RoutingSettings) -> Result<Self> {
        let test_mode = settings.test_mode.as_ref().filter(|t| t.enabled);

        let mut channel_ids: HashMap<&str, ChannelId> = HashMap::new();
        for (name, id) in &settings.channels {
            match id.as_i64() {
                Some(id) => {
                    channel_ids.insert(name.as_str(), ChannelId(id));
                }
                None => warn!(channel = %name, "channel id is not numeric, ignored"),
            }
        }

        let mut users: HashMap<&str, (AuthorId, Option<String>)> = HashMap::new();
        let mut aliases = HashMap::new();
        for (name, user) in &settings.users {
            let Some(id) = user.id.as_i64() else {
                warn!(user = %name, "user id is not numeric, ignored");
                continue;
            };
            if let Some(display) = &user.display {
                aliases.insert(AuthorId(id), display.clone());
            }
            users.insert(name.as_str(), (AuthorId(id), user.display.clone()));
        }

        let mut unused_channels: HashSet<&str> = channel_ids.keys().copied().collect();
        let mut unused_users: HashSet<&str> = users.keys().copied().collect();
        let mut unused_webhooks: HashSet<&str> =
            settings.webhooks.keys().map(String::as_str).collect();

        let resolve_channel = |name: &str, unused: &mut HashSet<&str>| -> Option<ChannelId> {
            match channel_ids.get(name) {
                Some(id) => {
                    unused.remove(name);
                    Some(*id)
                }
                None => {
                    warn!(channel = %name, "channel not found in channels list");
                    None
                }
            }
        };
        let resolve_webhook = |name: &str, unused: &mut HashSet<&str>| -> Option<WebhookTarget> {
            match settings.webhooks.get(name) {
                Some(w) => {
                    unused.remove(name);
                    let (url, use_dynamic_identity) = match w {
                        WebhookSettings::Url(url) => (url.clone(), false),
                        WebhookSettings::Full {
                            url,
                            use_dynamic_identity,
                        } => (url.clone(), *use_dynamic_identity),
                    };
                    Some(WebhookTarget {
                        name: name.to_string(),
                        url,
                        use_dynamic_identity,
                    })
                }
                None => {
                    warn!(webhook = %name, "webhook not found in webhooks list");
                    None
                }
            }
        };

        // Sorted for determinism.
        let mut sources: Vec<&String> = settings.repost_settings.keys().collect();
        sources.sort();

        let mut table = RoutingTable {
            aliases,
            ..RoutingTable::default()
        };

        for source_name in sources {
            let Some(source) = resolve_channel(source_name.as_str(), &mut unused_channels) else {
                warn!(channel = %source_name, "source channel unknown, its routes are ignored");
                continue;
            };

            for entry in &settings.repost_settings[source_name] {
                // An empty list means no filter.
                let author_filter = entry
                    .authors
                    .as_ref()
                    .filter(|names| !names.is_empty())
                    .map(|names| {
                        let mut allowed = HashMap::new();
                        for name in names {
                            match users.get(name.as_str()) {
                                Some((id, display)) => {
                                    unused_users.remove(name.as_str());
                                    allowed.insert(*id, display.clone());
                                }
                                None => warn!(author = %name, "author not found in users list"),
                            }
                        }
                        AuthorFilter::new(allowed)
                    });

                let (target_channel_ids, webhook_targets) = match test_mode {
                    Some(t) => (
                        t.target_channel
                            .iter()
                            .filter_map(|n| resolve_channel(n.as_str(), &mut unused_channels))
                            .collect(),
                        t.webhook
                            .iter()
                            .filter_map(|n| resolve_webhook(n.as_str(), &mut unused_webhooks))
                            .collect(),
                    ),
                    None => (
                        entry
                            .target_channel
                            .iter()
                            .flat_map(OneOrMany::names)
                            .filter_map(|n| resolve_channel(n.as_str(), &mut unused_channels))
                            .collect::<Vec<_>>(),
                        entry
                            .webhook
                            .iter()
                            .flat_map(OneOrMany::names)
                            .filter_map(|n| resolve_webhook(n.as_str(), &mut unused_webhooks))
                            .collect::<Vec<_>>(),
                    ),
                };

                let thread_channel_id = entry
                    .thread_channel
                    .as_deref()
                    .and_then(|n| resolve_channel(n, &mut unused_channels));

                let route = Route {
                    source_channel_id: source,
                    target_channel_ids: dedup_in_order(target_channel_ids),
                    webhook_targets: dedup_in_order(webhook_targets),
                    author_filter,
                    display_name: if entry.show_name {
                        DisplayNamePolicy::Shown {
                            literal: entry.author_name_override.clone(),
                        }
                    } else {
                        DisplayNamePolicy::Hidden
                    },
                    show_credit: entry.show_credit,
                    ignore_history: entry.ignore_history,
                    call_outs: entry.trade_call_out,
                    thread_channel_id,
                };

                if route.is_inert() {
                    warn!(channel = %source_name, "route has no usable target, dropped");
                    continue;
                }
                if !route.webhook_targets.is_empty() && !route.target_channel_ids.is_empty() {
                    warn!(
                        channel = %source_name,
                        "route has both webhooks and target channels; webhooks take precedence"
                    );
                }
                table.push(route);
            }
        }

        for (name, rules) in &settings.glyphs {
            match users.get(name.as_str()) {
                Some((id, _)) => table.glyphs.set_author_rules(*id, rules)?,
                None => warn!(author = %name, "glyph rules for unknown author ignored"),
            }
        }

        if test_mode.is_none() {
            warn_unused("channels", unused_channels);
            warn_unused("authors", unused_users);
            warn_unused("webhooks", unused_webhooks);
        }

        Ok(table)
    }

    fn push(&mut self, route: Route) {
        let source = route.source_channel_id;
        if !self.routes.contains_key(&source) {
            self.order.push(source);
        }
        self.routes.entry(source).or_default().push(route);
    }

    pub fn from_routes(routes: Vec<Route>) -> Result<Self> {
        let mut table = RoutingTable::default();
        for route in routes {
            if route.is_inert() {
                return Err(Error::Config(format!(
                    "route from {} has no usable target",
                    route.source_channel_id
                )));
            }
            table.push(route);
        }
        Ok(table)
    }

    pub fn routes_for(&self, channel_id: ChannelId) -> &[Route] {
        self.routes
            .get(&channel_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn channels(&self) -> &[ChannelId] {
        &self.order
    }

    pub fn aliases(&self) -> &HashMap<AuthorId, String> {
        &self.aliases
    }

    pub fn glyphs(&self) -> &GlyphTable {
        &self.glyphs
    }

    pub fn route_count(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }
}

fn dedup_in_order<T: PartialEq>(items: Vec<T>) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

fn warn_unused(kind: &str, names: HashSet<&str>) {
    if names.is_empty() {
        return;
    }
    let mut names: Vec<&str> = names.into_iter().collect();
    names.sort_unstable();
    warn!("the following {kind} are not used: {names:?}");
}
