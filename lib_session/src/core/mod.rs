//! # Session Core
//!
//! Stream-lifecycle coordination for an interactive market-data provider.
//! Everything in here runs on one logical thread; the surrounding shell
//! serializes calls into [`SessionCoordinator`].
//!
//! ## Core Components:
//!
//! - **`types`**: Channel handles, domains, and the wire status tuple.
//!
//! - **`reject_policy`**: The fixed mapping from a reject reason to the status
//!   sent back on the offending stream.
//!
//! - **`registry`**: Per-domain stream tables that enforce capacity and slot
//!   reuse.
//!
//! - **`multipart`**: Splits oversized refreshes into ordered parts and sends
//!   them one at a time.
//!
//! - **`tunnel`**: Class-of-service negotiation for tunnel streams.
//!
//! - **`channel_session`**: All registries and tunnel state of one channel.
//!
//! - **`coordinator`**: Owns every channel session and routes lifecycle
//!   events, domain messages and ticks.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Shared value types.
pub mod types;
/// Reject reason to wire status mapping.
pub mod reject_policy;
/// Per-domain stream registries.
pub mod registry;
/// Paginated refresh encoding.
pub mod multipart;
/// Tunnel stream class-of-service negotiation.
pub mod tunnel;
/// Per-channel session state.
pub mod channel_session;
/// Top-level event routing.
pub mod coordinator;

// --- Public API Re-exports ---
pub use channel_session::{ChannelSession, DomainMessage, RequestMsg, SessionLimits};
pub use coordinator::{LifecycleEvent, RunTimer, SessionCoordinator, TeardownReport, TickOutcome};
pub use multipart::{MultiPartCursor, MultiPartResponseEncoder, PaginatedSend, PartOutcome, PayloadSource, SendError};
pub use registry::{StreamRegistration, StreamRegistry};
pub use reject_policy::{RejectReason, RejectReasonPolicy};
pub use tunnel::{ClassOfService, TunnelNegotiation, TunnelSessionNegotiator, TunnelState};
pub use types::{ChannelHandle, DataState, Domain, StateCode, StreamId, StreamState, WireStatus};
