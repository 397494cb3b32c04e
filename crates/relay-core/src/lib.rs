//! Core domain + application logic for the channel relay.
//!
//! Framework-agnostic: platform connections live behind ports (traits)
//! implemented in adapter crates.

pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod history;
pub mod identity;
pub mod logging;
pub mod messaging;
pub mod parsing;
pub mod positions;
pub mod routing;
pub mod status;
pub mod supervisor;
pub mod transform;

pub use errors::{Error, Result};
