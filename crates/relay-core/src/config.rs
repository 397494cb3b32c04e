use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{errors::Error, Result};

/// Typed runtime configuration, loaded once at startup from the environment.
///
/// Routing rules live in a separate JSON file (see [`crate::routing`]).
#[derive(Clone, Debug)]
pub struct Config {
    // Identities
    pub publisher_token: String,
    pub listener_token: String,

    // Files
    pub routes_file: PathBuf,
    pub keepalive_file: PathBuf,

    // Supervision
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub auto_resume_window: Duration,
    pub restart_join_bound: Duration,
    pub monitor_interval: Duration,
    pub monitor_backoff: Duration,
    pub publisher_backoff_max: Duration,
    pub shutdown_grace: Duration,
    pub connect_grace: Duration,

    // Transform
    pub stale_after: Duration,
    pub message_limit: usize,
    pub reply_excerpt_len: usize,

    // History replay
    pub history_page_size: usize,
    pub history_delay: Duration,

    // Position tracking
    pub price_deviation_limit: f64,
    pub position_ttl: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let publisher_token = env_str("RELAY_PUBLISHER_TOKEN")
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config("RELAY_PUBLISHER_TOKEN environment variable is required".to_string())
            })?;
        let listener_token = env_str("RELAY_LISTENER_TOKEN")
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config("RELAY_LISTENER_TOKEN environment variable is required".to_string())
            })?;

        let routes_file = PathBuf::from(
            env_str("RELAY_ROUTES_FILE").unwrap_or_else(|| "config.json".to_string()),
        );
        let keepalive_file = PathBuf::from(
            env_str("RELAY_KEEPALIVE_FILE").unwrap_or_else(|| "keepalive.config.json".to_string()),
        );

        let price_deviation_limit = env_f64("RELAY_PRICE_DEVIATION").unwrap_or(3.0);
        if !(price_deviation_limit > 0.0) {
            return Err(Error::Config(
                "RELAY_PRICE_DEVIATION must be a positive ratio".to_string(),
            ));
        }

        Ok(Self {
            publisher_token,
            listener_token,
            routes_file,
            keepalive_file,
            heartbeat_interval: env_ms("RELAY_HEARTBEAT_INTERVAL_MS", 5_000),
            heartbeat_timeout: env_ms("RELAY_HEARTBEAT_TIMEOUT_MS", 5_000),
            auto_resume_window: env_ms("RELAY_AUTO_RESUME_MS", 5_000),
            restart_join_bound: env_ms("RELAY_RESTART_JOIN_MS", 1_000),
            monitor_interval: env_ms("RELAY_MONITOR_INTERVAL_MS", 1_000),
            monitor_backoff: env_ms("RELAY_MONITOR_BACKOFF_MS", 1_000),
            publisher_backoff_max: env_ms("RELAY_PUBLISHER_BACKOFF_MAX_MS", 60_000),
            shutdown_grace: env_ms("RELAY_SHUTDOWN_GRACE_MS", 5_000),
            connect_grace: env_ms("RELAY_CONNECT_GRACE_MS", 30_000),
            stale_after: env_ms("RELAY_STALE_AFTER_MS", 5_000),
            message_limit: env_usize("RELAY_MESSAGE_LIMIT").unwrap_or(2_000),
            reply_excerpt_len: env_usize("RELAY_REPLY_EXCERPT_LEN").unwrap_or(100),
            history_page_size: env_usize("RELAY_HISTORY_PAGE_SIZE")
                .unwrap_or(100)
                .clamp(1, 100),
            history_delay: env_ms("RELAY_HISTORY_DELAY_MS", 1_000),
            price_deviation_limit,
            position_ttl: Duration::from_secs(
                env_u64("RELAY_POSITION_TTL_HOURS").unwrap_or(72) * 3600,
            ),
        })
    }
}

// ============== Keep-alive settings ==============

/// Optional status-report / cross-check heartbeat settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KeepAliveSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message_channel_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_check_heartbeat: Option<CrossCheckSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_webhook: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrossCheckSettings {
    pub channel_id: i64,
    #[serde(default = "default_cross_check_prefix")]
    pub message_prefix: String,
    #[serde(default = "default_cross_check_interval")]
    pub interval: u64,
}

fn default_cross_check_prefix() -> String {
    "VF".to_string()
}

fn default_cross_check_interval() -> u64 {
    30
}

impl KeepAliveSettings {
    /// A missing file disables the keep-alive features; it is not an error.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        load_json_file(path).map(Some)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let txt = serde_json::to_string_pretty(self)?;
        fs::write(path, txt)?;
        Ok(())
    }

    pub fn cross_check_interval(&self) -> Option<Duration> {
        self.cross_check_heartbeat
            .as_ref()
            .map(|c| Duration::from_secs(c.interval.max(1)))
    }
}

pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let txt = fs::read_to_string(path).map_err(|e| Error::InvalidPath {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(serde_json::from_str(&txt)?)
}

// ============== Env helpers ==============

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    env_str(key).and_then(|s| s.trim().parse::<f64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_u64(key).unwrap_or(default_ms))
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
