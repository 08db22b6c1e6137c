//! # lib_session
//!
//! Session and stream-lifecycle coordination for interactive market-data
//! providers: per-channel stream registries, deterministic rejections,
//! paginated dictionary delivery, tunnel stream negotiation and ordered
//! channel teardown.

pub mod configs;
pub mod core;
pub mod dictionary;
pub mod transport;

pub use configs::{ConfigError, SessionConfig};
pub use crate::core::*;
