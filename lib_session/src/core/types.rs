//! # Session Vocabulary
//!
//! The small value types every other module in `core` speaks: channel handles,
//! the five domains multiplexed over a channel, and the wire status tuple
//! (`StreamState`, `DataState`, `StateCode`) that ends up in every status
//! message the provider sends.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-channel stream identifier. Each domain shares the channel's numbering space.
pub type StreamId = i32;

/// # Channel Handle
///
/// Opaque key for one connected peer channel. The transport owns the channel
/// itself; the session core only ever holds this key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelHandle(pub u64);

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel#{}", self.0)
    }
}

/// Message categories multiplexed over one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Domain {
    /// Login stream. One per channel.
    Login,
    /// Source directory stream.
    Directory,
    /// Field and enum-type dictionary downloads.
    Dictionary,
    /// Market data items.
    Item,
    /// Tunnel streams carrying a negotiated class of service.
    Tunnel,
}

impl Domain {
    /// Order in which a channel's registries are cleared on teardown.
    ///
    /// Items reference directory state, so they go first. Login closure is the
    /// "you are logged off" signal and follows everything that depends on it.
    /// Tunnel sub-streams are independent and go last.
    pub const TEARDOWN_ORDER: [Domain; 5] = [
        Domain::Item,
        Domain::Directory,
        Domain::Dictionary,
        Domain::Login,
        Domain::Tunnel,
    ];

    /// Lower-case label used in logs and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Login => "login",
            Domain::Directory => "directory",
            Domain::Dictionary => "dictionary",
            Domain::Item => "item",
            Domain::Tunnel => "tunnel",
        }
    }

    /// Parses a wire label; `None` for domains this provider does not serve.
    pub fn from_label(label: &str) -> Option<Domain> {
        match label {
            "login" => Some(Domain::Login),
            "directory" => Some(Domain::Directory),
            "dictionary" => Some(Domain::Dictionary),
            "item" | "marketPrice" => Some(Domain::Item),
            "tunnel" => Some(Domain::Tunnel),
            _ => None,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the stream as reported to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamState {
    /// Stream is open and will receive updates.
    Open,
    /// Stream delivers one refresh and then closes.
    NonStreaming,
    /// Stream closed; the peer may re-request later.
    ClosedRecover,
    /// Stream closed; re-requesting on this connection will not help.
    Closed,
    /// Peer should retry with different parameters.
    Redirected,
}

/// Health of the data carried on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataState {
    /// Data is current.
    Ok,
    /// Data may be stale or unavailable.
    Suspect,
}

/// Machine-readable code attached to a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StateCode {
    /// No additional information.
    None,
    /// Requested name is unknown.
    NotFound,
    /// A per-channel request limit was hit.
    TooManyItems,
    /// The request is malformed or violates protocol usage.
    UsageError,
    /// The same item is already open on another stream.
    AlreadyOpen,
}

/// # Wire Status
///
/// The status tuple encoded into every status message. `text_template` may
/// contain a `{stream_id}` placeholder, filled in by [`WireStatus::render_text`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireStatus {
    /// Stream state to report.
    pub stream_state: StreamState,
    /// Data state to report.
    pub data_state: DataState,
    /// Status code to report.
    pub code: StateCode,
    /// Human-readable reason.
    pub text_template: &'static str,
}

impl WireStatus {
    /// Returns a copy with the stream state replaced, for reasons whose stream
    /// state is chosen by the caller.
    pub fn with_stream_state(mut self, stream_state: StreamState) -> Self {
        self.stream_state = stream_state;
        self
    }

    /// Renders the text template for one stream.
    pub fn render_text(&self, stream_id: StreamId) -> String {
        self.text_template.replace("{stream_id}", &stream_id.to_string())
    }
}
