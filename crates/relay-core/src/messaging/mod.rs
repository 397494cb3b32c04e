//! Cross-platform messaging abstractions (ports, payload types, decorators).

pub mod mailbox;
pub mod port;
pub mod throttled;
pub mod types;
pub mod webhook;
