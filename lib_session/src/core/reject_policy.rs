//! # Reject Reason Policy
//!
//! Pure mapping from a policy violation to the status tuple sent back on the
//! offending stream. Every rejection the provider issues goes through
//! [`RejectReasonPolicy::classify`], so the same reason always produces the
//! same wire status.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::types::{DataState, Domain, StateCode, StreamState, WireStatus};

/// Why an inbound request cannot be honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    /// Dictionary request names neither the field nor the enum dictionary.
    UnknownDictionaryName,
    /// The domain's per-channel capacity is exhausted.
    MaxRequestsReached,
    /// The request could not be decoded.
    DecoderFailed,
    /// The provider does not serve the requested domain.
    DomainNotSupported,
    /// Directory request lacks the Info, State and Group filter bits.
    IncorrectFilterFlags,
    /// Login request carries no user name.
    NoUserNameInRequest,
    /// Item request targets a service this provider does not offer.
    InvalidServiceId,
    /// Item request has no usable name.
    ItemNotSupported,
    /// The same item is already open on another stream of this channel.
    ItemAlreadyOpened,
    /// The stream id is already open for a different key or domain.
    StreamAlreadyInUse,
    /// A reissue flips the private-stream flag of an open item.
    PrivateStreamMismatch,
    /// Tunnel request's class of service is not compatible with the provider's.
    ClassOfServiceMismatch,
}

impl RejectReason {
    /// Every reason, for exhaustive checks.
    pub const ALL: [RejectReason; 12] = [
        RejectReason::UnknownDictionaryName,
        RejectReason::MaxRequestsReached,
        RejectReason::DecoderFailed,
        RejectReason::DomainNotSupported,
        RejectReason::IncorrectFilterFlags,
        RejectReason::NoUserNameInRequest,
        RejectReason::InvalidServiceId,
        RejectReason::ItemNotSupported,
        RejectReason::ItemAlreadyOpened,
        RejectReason::StreamAlreadyInUse,
        RejectReason::PrivateStreamMismatch,
        RejectReason::ClassOfServiceMismatch,
    ];
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RejectReason::UnknownDictionaryName => "UNKNOWN_DICTIONARY_NAME",
            RejectReason::MaxRequestsReached => "MAX_REQUESTS_REACHED",
            RejectReason::DecoderFailed => "DECODER_FAILED",
            RejectReason::DomainNotSupported => "DOMAIN_NOT_SUPPORTED",
            RejectReason::IncorrectFilterFlags => "INCORRECT_FILTER_FLAGS",
            RejectReason::NoUserNameInRequest => "NO_USER_NAME_IN_REQUEST",
            RejectReason::InvalidServiceId => "INVALID_SERVICE_ID",
            RejectReason::ItemNotSupported => "ITEM_NOT_SUPPORTED",
            RejectReason::ItemAlreadyOpened => "ITEM_ALREADY_OPENED",
            RejectReason::StreamAlreadyInUse => "STREAM_ALREADY_IN_USE",
            RejectReason::PrivateStreamMismatch => "PRIVATE_STREAM_MISMATCH",
            RejectReason::ClassOfServiceMismatch => "CLASS_OF_SERVICE_MISMATCH",
        };
        f.write_str(label)
    }
}

/// Deterministic reason-to-status lookup.
pub struct RejectReasonPolicy;

impl RejectReasonPolicy {
    /// Maps a reject reason to its wire status.
    ///
    /// `DecoderFailed` reports `ClosedRecover`; callers that know better
    /// override it with [`WireStatus::with_stream_state`].
    pub fn classify(reason: RejectReason) -> WireStatus {
        let (stream_state, code, text_template) = match reason {
            RejectReason::UnknownDictionaryName => (
                StreamState::Closed,
                StateCode::NotFound,
                "Dictionary request rejected for stream id {stream_id} - dictionary name unknown",
            ),
            RejectReason::MaxRequestsReached => (
                StreamState::ClosedRecover,
                StateCode::TooManyItems,
                "Request rejected for stream id {stream_id} - max request count reached",
            ),
            RejectReason::DecoderFailed => (
                StreamState::ClosedRecover,
                StateCode::UsageError,
                "Request rejected for stream id {stream_id} - decoding failure",
            ),
            RejectReason::DomainNotSupported => (
                StreamState::Closed,
                StateCode::UsageError,
                "Request rejected for stream id {stream_id} - domain not supported",
            ),
            RejectReason::IncorrectFilterFlags => (
                StreamState::Closed,
                StateCode::UsageError,
                "Source directory request rejected for stream id {stream_id} - request must minimally have INFO, STATE and GROUP filter flags",
            ),
            RejectReason::NoUserNameInRequest => (
                StreamState::ClosedRecover,
                StateCode::UsageError,
                "Login request rejected for stream id {stream_id} - request does not contain user name",
            ),
            RejectReason::InvalidServiceId => (
                StreamState::Closed,
                StateCode::UsageError,
                "Item request rejected for stream id {stream_id} - service id invalid",
            ),
            RejectReason::ItemNotSupported => (
                StreamState::Closed,
                StateCode::UsageError,
                "Item request rejected for stream id {stream_id} - item not supported",
            ),
            RejectReason::ItemAlreadyOpened => (
                StreamState::Closed,
                StateCode::AlreadyOpen,
                "Item request rejected for stream id {stream_id} - item already open with exact same key on another stream",
            ),
            RejectReason::StreamAlreadyInUse => (
                StreamState::Closed,
                StateCode::UsageError,
                "Request rejected for stream id {stream_id} - stream already in use with a different key",
            ),
            RejectReason::PrivateStreamMismatch => (
                StreamState::Closed,
                StateCode::UsageError,
                "Item request rejected for stream id {stream_id} - private stream flag does not match the open stream",
            ),
            RejectReason::ClassOfServiceMismatch => (
                StreamState::Redirected,
                StateCode::None,
                "Tunnel stream request rejected for stream id {stream_id} - retry with the expected class of service",
            ),
        };

        WireStatus {
            stream_state,
            data_state: DataState::Suspect,
            code,
            text_template,
        }
    }

    /// Status sent on every open stream of a channel being torn down.
    pub fn close_status(domain: Domain) -> WireStatus {
        let text_template = match domain {
            Domain::Login => "Login stream {stream_id} closed by provider",
            Domain::Directory => "Source directory stream {stream_id} closed by provider",
            Domain::Dictionary => "Dictionary stream {stream_id} closed by provider",
            Domain::Item => "Item stream {stream_id} closed by provider",
            Domain::Tunnel => "Tunnel stream {stream_id} closed by provider",
        };

        WireStatus {
            stream_state: StreamState::ClosedRecover,
            data_state: DataState::Suspect,
            code: StateCode::None,
            text_template,
        }
    }
}
