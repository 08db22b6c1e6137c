//! # Configuration Modules
//!
//! Session-level settings shared by the coordinator and the provider binary.

/// Capacities, message sizes, service identity and run-time limits.
pub mod session_config;

pub use session_config::{ConfigError, SessionConfig};
