use std::path::PathBuf;

/// Core error type for the relay.
///
/// Adapter crates map their specific errors into this type so the core can
/// classify failures consistently (log and drop vs. fatal at startup).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("transport error ({target}): {reason}")]
    Transport { target: String, reason: String },

    #[error("rate limited ({target})")]
    RateLimited { target: String },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Failures the transport collaborator may succeed on later.
    ///
    /// The core never retries on its own; this only picks the log severity.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Transport { .. } | Error::RateLimited { .. } | Error::Closed(_)
        )
    }
}

/// Adapters build `anyhow` chains internally; the whole chain becomes the message.
impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::External(format!("{e:#}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
