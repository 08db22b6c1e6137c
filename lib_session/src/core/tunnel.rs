//! # Tunnel Session Negotiation
//!
//! A tunnel stream is accepted only when the peer's requested class of
//! service is compatible with what this provider supports. Compatibility is
//! decided by [`COMPATIBILITY`], one row per compared field; adding a field
//! means adding a row.
//!
//! ```text
//!   Pending --evaluate ok--> Open --close / non-Open status--> Closed
//!      |                                                          ^
//!      +--evaluate mismatch--> Rejected --------close-------------+
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::types::{DataState, StreamId, StreamState};

/// Class-of-service filter bits.
pub mod cos_filter {
    /// Common properties block.
    pub const COMMON: u32 = 0x01;
    /// Authentication block.
    pub const AUTHENTICATION: u32 = 0x02;
    /// Flow control block.
    pub const FLOW_CONTROL: u32 = 0x04;
    /// Data integrity block.
    pub const DATA_INTEGRITY: u32 = 0x08;
    /// Guarantee block. Not offered by this provider.
    pub const GUARANTEE: u32 = 0x10;
}

/// Authentication required before a tunnel carries data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthenticationType {
    /// No authentication exchange.
    NotRequired,
    /// Login-message based authentication inside the tunnel.
    OmmLogin,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowControlType {
    /// No flow control.
    None,
    /// Window-based flow control in both directions.
    Bidirectional,
}

/// Delivery reliability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataIntegrityType {
    /// Messages may be lost.
    BestEffort,
    /// Messages are delivered in order without loss.
    Reliable,
}

/// Persistence guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GuaranteeType {
    /// No persistence.
    None,
    /// Messages are persisted to a queue.
    PersistentQueue,
}

/// # Class of Service
///
/// Tunnel stream properties exchanged in the open request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassOfService {
    /// Bitmask of the blocks present, see [`cos_filter`].
    pub filter: u32,
    /// Largest message the tunnel carries.
    pub max_msg_size: u32,
    /// Protocol carried inside the tunnel.
    pub protocol_type: u32,
    /// Protocol major version.
    pub protocol_major_version: u32,
    /// Protocol minor version.
    pub protocol_minor_version: u32,
    /// Authentication mode.
    pub authentication_type: AuthenticationType,
    /// Flow control mode.
    pub flow_control_type: FlowControlType,
    /// Receive window advertised by the requester. Not compared.
    pub recv_window_size: i32,
    /// Delivery reliability.
    pub data_integrity_type: DataIntegrityType,
    /// Persistence guarantee.
    pub guarantee_type: GuaranteeType,
}

impl Default for ClassOfService {
    fn default() -> Self {
        Self {
            filter: cos_filter::COMMON
                | cos_filter::AUTHENTICATION
                | cos_filter::FLOW_CONTROL
                | cos_filter::DATA_INTEGRITY,
            max_msg_size: 6144,
            protocol_type: 0,
            protocol_major_version: 14,
            protocol_minor_version: 1,
            authentication_type: AuthenticationType::NotRequired,
            flow_control_type: FlowControlType::Bidirectional,
            recv_window_size: 12288,
            data_integrity_type: DataIntegrityType::Reliable,
            guarantee_type: GuaranteeType::None,
        }
    }
}

/// Class-of-service property that failed the compatibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CosField {
    /// Flow control or data integrity missing, or guarantee present.
    Filter,
    /// Maximum message size.
    MaxMsgSize,
    /// Protocol type.
    ProtocolType,
    /// Protocol major version.
    ProtocolMajorVersion,
    /// Protocol minor version.
    ProtocolMinorVersion,
    /// Authentication type.
    AuthenticationType,
    /// Flow control type.
    FlowControlType,
    /// Data integrity type.
    DataIntegrityType,
    /// Guarantee type.
    GuaranteeType,
}

impl fmt::Display for CosField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CosField::Filter => "filter",
            CosField::MaxMsgSize => "maxMsgSize",
            CosField::ProtocolType => "protocolType",
            CosField::ProtocolMajorVersion => "protocolMajorVersion",
            CosField::ProtocolMinorVersion => "protocolMinorVersion",
            CosField::AuthenticationType => "authenticationType",
            CosField::FlowControlType => "flowControlType",
            CosField::DataIntegrityType => "dataIntegrityType",
            CosField::GuaranteeType => "guaranteeType",
        };
        f.write_str(name)
    }
}

/// Compares a requested class of service against the supported one.
pub type FieldCheck = fn(requested: &ClassOfService, supported: &ClassOfService) -> bool;

fn filter_ok(requested: &ClassOfService, _: &ClassOfService) -> bool {
    let required = cos_filter::FLOW_CONTROL | cos_filter::DATA_INTEGRITY;
    requested.filter & required == required && requested.filter & cos_filter::GUARANTEE == 0
}

fn max_msg_size_ok(requested: &ClassOfService, supported: &ClassOfService) -> bool {
    requested.max_msg_size == supported.max_msg_size
}

fn protocol_type_ok(requested: &ClassOfService, supported: &ClassOfService) -> bool {
    requested.protocol_type == supported.protocol_type
}

fn protocol_major_ok(requested: &ClassOfService, supported: &ClassOfService) -> bool {
    requested.protocol_major_version == supported.protocol_major_version
}

fn protocol_minor_ok(requested: &ClassOfService, supported: &ClassOfService) -> bool {
    requested.protocol_minor_version == supported.protocol_minor_version
}

// A provider that needs no authentication accepts either mode.
fn authentication_ok(requested: &ClassOfService, supported: &ClassOfService) -> bool {
    requested.authentication_type == supported.authentication_type
        || supported.authentication_type == AuthenticationType::NotRequired
}

fn flow_control_ok(requested: &ClassOfService, supported: &ClassOfService) -> bool {
    requested.flow_control_type == supported.flow_control_type
}

fn data_integrity_ok(requested: &ClassOfService, supported: &ClassOfService) -> bool {
    requested.data_integrity_type == supported.data_integrity_type
}

fn guarantee_ok(requested: &ClassOfService, supported: &ClassOfService) -> bool {
    requested.guarantee_type == supported.guarantee_type
}

/// Field-by-field compatibility table, checked in order.
pub static COMPATIBILITY: &[(CosField, FieldCheck)] = &[
    (CosField::Filter, filter_ok),
    (CosField::MaxMsgSize, max_msg_size_ok),
    (CosField::ProtocolType, protocol_type_ok),
    (CosField::ProtocolMajorVersion, protocol_major_ok),
    (CosField::ProtocolMinorVersion, protocol_minor_ok),
    (CosField::AuthenticationType, authentication_ok),
    (CosField::FlowControlType, flow_control_ok),
    (CosField::DataIntegrityType, data_integrity_ok),
    (CosField::GuaranteeType, guarantee_ok),
];

/// Lifecycle of one tunnel stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TunnelState {
    /// Requested, not yet evaluated.
    Pending,
    /// Accepted; carries the accepted class of service.
    Open,
    /// Refused on a class-of-service mismatch.
    Rejected,
    /// Closed. Terminal.
    Closed,
}

/// One tunnel stream's negotiation record.
#[derive(Debug, Clone)]
pub struct TunnelNegotiation {
    stream_id: StreamId,
    requested: ClassOfService,
    accepted: Option<ClassOfService>,
    mismatch: Option<CosField>,
    state: TunnelState,
}

impl TunnelNegotiation {
    /// Starts a negotiation in `Pending`.
    pub fn new(stream_id: StreamId, requested: ClassOfService) -> Self {
        Self {
            stream_id,
            requested,
            accepted: None,
            mismatch: None,
            state: TunnelState::Pending,
        }
    }

    /// Stream carrying the tunnel.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Current state.
    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Class of service the peer asked for.
    pub fn requested(&self) -> &ClassOfService {
        &self.requested
    }

    /// Class of service pinned on acceptance.
    pub fn accepted(&self) -> Option<&ClassOfService> {
        self.accepted.as_ref()
    }

    /// First field that failed the compatibility check, if rejected.
    pub fn mismatch(&self) -> Option<CosField> {
        self.mismatch
    }

    /// `true` once the tunnel can no longer carry data.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, TunnelState::Rejected | TunnelState::Closed)
    }

    /// Evaluates a pending negotiation. Other states are returned unchanged.
    pub fn evaluate(&mut self, negotiator: &TunnelSessionNegotiator) -> TunnelState {
        if self.state != TunnelState::Pending {
            return self.state;
        }
        match negotiator.check(&self.requested) {
            Ok(()) => {
                self.accepted = Some(negotiator.supported().clone());
                self.state = TunnelState::Open;
                log::info!("tunnel stream {} accepted", self.stream_id);
            }
            Err(field) => {
                self.mismatch = Some(field);
                self.state = TunnelState::Rejected;
                log::warn!(
                    "tunnel stream {} rejected: class of service mismatch on {}",
                    self.stream_id,
                    field
                );
            }
        }
        self.state
    }

    /// Applies a status event for the tunnel. An open tunnel closes on any
    /// status that is not Open/Ok. Returns `true` when this event closed it.
    pub fn on_status(&mut self, stream_state: StreamState, data_state: DataState) -> bool {
        if self.state != TunnelState::Open {
            return false;
        }
        if stream_state == StreamState::Open && data_state == DataState::Ok {
            return false;
        }
        log::info!(
            "tunnel stream {} closed on status {:?}/{:?}",
            self.stream_id,
            stream_state,
            data_state
        );
        self.state = TunnelState::Closed;
        true
    }

    /// Closes the tunnel. Returns `false` if it was already closed.
    pub fn close(&mut self) -> bool {
        if self.state == TunnelState::Closed {
            return false;
        }
        self.state = TunnelState::Closed;
        true
    }
}

/// Holds the provider's supported class of service and judges requests against it.
#[derive(Debug, Clone)]
pub struct TunnelSessionNegotiator {
    supported: ClassOfService,
}

impl TunnelSessionNegotiator {
    /// Creates a negotiator for the given supported class of service.
    pub fn new(supported: ClassOfService) -> Self {
        Self { supported }
    }

    /// Class of service this provider offers. Sent back on a redirect.
    pub fn supported(&self) -> &ClassOfService {
        &self.supported
    }

    /// Runs the compatibility table, returning the first failing field.
    pub fn check(&self, requested: &ClassOfService) -> Result<(), CosField> {
        match COMPATIBILITY
            .iter()
            .find(|(_, ok)| !ok(requested, &self.supported))
        {
            Some((field, _)) => Err(*field),
            None => Ok(()),
        }
    }

    /// Creates and evaluates a negotiation for `stream_id`.
    pub fn negotiate(&self, stream_id: StreamId, requested: ClassOfService) -> TunnelNegotiation {
        let mut negotiation = TunnelNegotiation::new(stream_id, requested);
        negotiation.evaluate(self);
        negotiation
    }
}

impl Default for TunnelSessionNegotiator {
    fn default() -> Self {
        Self::new(ClassOfService::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_request_opens() {
        let negotiator = TunnelSessionNegotiator::default();
        let negotiation = negotiator.negotiate(7, ClassOfService::default());
        assert_eq!(negotiation.state(), TunnelState::Open);
        assert_eq!(negotiation.accepted(), Some(negotiator.supported()));
    }

    #[test]
    fn test_each_field_flip_rejects() {
        let negotiator = TunnelSessionNegotiator::default();
        let flips: [(CosField, fn(&mut ClassOfService)); 10] = [
            (CosField::MaxMsgSize, |c| c.max_msg_size += 1),
            (CosField::ProtocolType, |c| c.protocol_type = 127),
            (CosField::ProtocolMajorVersion, |c| c.protocol_major_version += 1),
            (CosField::ProtocolMinorVersion, |c| c.protocol_minor_version += 1),
            (CosField::FlowControlType, |c| c.flow_control_type = FlowControlType::None),
            (CosField::DataIntegrityType, |c| {
                c.data_integrity_type = DataIntegrityType::BestEffort
            }),
            (CosField::GuaranteeType, |c| c.guarantee_type = GuaranteeType::PersistentQueue),
            (CosField::Filter, |c| c.filter &= !cos_filter::FLOW_CONTROL),
            (CosField::Filter, |c| c.filter &= !cos_filter::DATA_INTEGRITY),
            (CosField::Filter, |c| c.filter |= cos_filter::GUARANTEE),
        ];

        for (field, flip) in flips {
            let mut requested = ClassOfService::default();
            flip(&mut requested);
            let negotiation = negotiator.negotiate(1, requested);
            assert_eq!(negotiation.state(), TunnelState::Rejected, "{field} flip accepted");
            assert_eq!(negotiation.mismatch(), Some(field));
            assert!(negotiation.accepted().is_none());
        }
    }

    #[test]
    fn test_recv_window_is_not_compared() {
        let negotiator = TunnelSessionNegotiator::default();
        let requested = ClassOfService {
            recv_window_size: 1,
            ..ClassOfService::default()
        };
        assert_eq!(negotiator.negotiate(1, requested).state(), TunnelState::Open);
    }

    #[test]
    fn test_authentication_rule() {
        let lenient = TunnelSessionNegotiator::default();
        let login_auth = ClassOfService {
            authentication_type: AuthenticationType::OmmLogin,
            ..ClassOfService::default()
        };
        assert!(lenient.check(&login_auth).is_ok());

        let strict = TunnelSessionNegotiator::new(login_auth.clone());
        assert_eq!(
            strict.check(&ClassOfService::default()),
            Err(CosField::AuthenticationType)
        );
        assert!(strict.check(&login_auth).is_ok());
    }

    #[test]
    fn test_non_open_status_closes_open_tunnel() {
        let negotiator = TunnelSessionNegotiator::default();
        let mut negotiation = negotiator.negotiate(2, ClassOfService::default());

        assert!(!negotiation.on_status(StreamState::Open, DataState::Ok));
        assert_eq!(negotiation.state(), TunnelState::Open);

        assert!(negotiation.on_status(StreamState::Open, DataState::Suspect));
        assert_eq!(negotiation.state(), TunnelState::Closed);
        assert!(!negotiation.on_status(StreamState::Closed, DataState::Suspect));
    }

    #[test]
    fn test_closed_is_terminal() {
        let negotiator = TunnelSessionNegotiator::default();
        let mut negotiation = negotiator.negotiate(2, ClassOfService::default());
        assert!(negotiation.close());
        assert!(!negotiation.close());
        assert_eq!(negotiation.evaluate(&negotiator), TunnelState::Closed);
        assert!(negotiation.is_finished());
    }
}
