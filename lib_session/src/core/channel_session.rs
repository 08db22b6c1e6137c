//! # Channel Session
//!
//! Everything the provider knows about one connected channel: a
//! [`StreamRegistry`] per domain, the tunnel negotiations, and transient
//! per-connection flags. Inbound requests are validated and registered here;
//! the coordinator turns the outcome into wire messages.
//!
//! Teardown clears the registries in [`Domain::TEARDOWN_ORDER`] and is
//! idempotent.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::configs::SessionConfig;
use crate::core::registry::{StreamRegistration, StreamRegistry};
use crate::core::reject_policy::RejectReason;
use crate::core::tunnel::{ClassOfService, TunnelNegotiation, TunnelSessionNegotiator, TunnelState};
use crate::core::types::{ChannelHandle, DataState, Domain, StreamId, StreamState};

/// Directory filter bits every request must carry: INFO, STATE and GROUP.
pub const DIRECTORY_REQUIRED_FILTER: u32 = 0x1 | 0x2 | 0x4;

/// Per-channel limits and service identity, taken from [`SessionConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLimits {
    pub login_capacity: usize,
    pub directory_capacity: usize,
    pub item_capacity: usize,
    pub tunnel_capacity: usize,
    pub service_id: u16,
    pub service_name: String,
}

impl From<&SessionConfig> for SessionLimits {
    fn from(config: &SessionConfig) -> Self {
        Self {
            login_capacity: config.login_capacity,
            directory_capacity: config.directory_capacity,
            item_capacity: config.item_capacity,
            tunnel_capacity: config.tunnel_capacity,
            service_id: config.service_id,
            service_name: config.service_name.clone(),
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

/// A decoded open or reissue request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestMsg {
    pub stream_id: StreamId,
    /// User name, dictionary name, item name or tunnel name.
    pub name: Option<String>,
    pub filter: u32,
    pub service_id: Option<u16>,
    pub private_stream: bool,
    pub no_refresh: bool,
    pub class_of_service: Option<ClassOfService>,
}

impl RequestMsg {
    pub fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_filter(mut self, filter: u32) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_service(mut self, service_id: u16) -> Self {
        self.service_id = Some(service_id);
        self
    }

    pub fn private(mut self) -> Self {
        self.private_stream = true;
        self
    }

    pub fn without_refresh(mut self) -> Self {
        self.no_refresh = true;
        self
    }

    pub fn with_class_of_service(mut self, cos: ClassOfService) -> Self {
        self.class_of_service = Some(cos);
        self
    }

    fn name_or_empty(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}

/// Inbound message on one domain of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainMessage {
    /// Open or reissue.
    Request(RequestMsg),
    /// Peer closes the stream.
    Close { stream_id: StreamId },
    /// Status event for a stream (tunnel streams react to it).
    Status {
        stream_id: StreamId,
        stream_state: StreamState,
        data_state: DataState,
    },
    /// The shell could not decode a message addressed to this stream.
    /// `stream_state` overrides the stream state of the rejection when set.
    Undecodable {
        stream_id: StreamId,
        stream_state: Option<StreamState>,
    },
}

/// Flags that only make sense for the current physical connection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransientState {
    /// Streams still owed (the rest of) a refresh.
    pub pending_refreshes: BTreeSet<(Domain, StreamId)>,
    /// Service ids the peer asked the directory about.
    pub requested_services: BTreeSet<u16>,
}

impl TransientState {
    pub fn is_empty(&self) -> bool {
        self.pending_refreshes.is_empty() && self.requested_services.is_empty()
    }
}

/// Session state for one channel.
#[derive(Debug)]
pub struct ChannelSession {
    channel: ChannelHandle,
    limits: SessionLimits,
    logins: StreamRegistry,
    directories: StreamRegistry,
    dictionaries: StreamRegistry,
    items: StreamRegistry,
    tunnels: StreamRegistry,
    negotiations: BTreeMap<StreamId, TunnelNegotiation>,
    negotiator: TunnelSessionNegotiator,
    transient: TransientState,
}

impl ChannelSession {
    pub fn new(channel: ChannelHandle, limits: SessionLimits, negotiator: TunnelSessionNegotiator) -> Self {
        Self {
            channel,
            logins: StreamRegistry::new(Domain::Login, limits.login_capacity),
            directories: StreamRegistry::new(Domain::Directory, limits.directory_capacity),
            dictionaries: StreamRegistry::new(Domain::Dictionary, crate::core::registry::DICTIONARY_NAMES.len()),
            items: StreamRegistry::new(Domain::Item, limits.item_capacity),
            tunnels: StreamRegistry::new(Domain::Tunnel, limits.tunnel_capacity),
            negotiations: BTreeMap::new(),
            negotiator,
            transient: TransientState::default(),
            limits,
        }
    }

    pub fn channel(&self) -> ChannelHandle {
        self.channel
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    pub fn registry(&self, domain: Domain) -> &StreamRegistry {
        match domain {
            Domain::Login => &self.logins,
            Domain::Directory => &self.directories,
            Domain::Dictionary => &self.dictionaries,
            Domain::Item => &self.items,
            Domain::Tunnel => &self.tunnels,
        }
    }

    fn registry_mut(&mut self, domain: Domain) -> &mut StreamRegistry {
        match domain {
            Domain::Login => &mut self.logins,
            Domain::Directory => &mut self.directories,
            Domain::Dictionary => &mut self.dictionaries,
            Domain::Item => &mut self.items,
            Domain::Tunnel => &mut self.tunnels,
        }
    }

    /// Streams open across every domain.
    pub fn open_stream_count(&self) -> usize {
        Domain::TEARDOWN_ORDER.iter().map(|d| self.registry(*d).len()).sum()
    }

    /// Validates and registers an open or reissue request.
    pub fn on_request(&mut self, domain: Domain, req: &RequestMsg) -> Result<StreamRegistration, RejectReason> {
        let stream_id = req.stream_id;
        let taken_elsewhere = Domain::TEARDOWN_ORDER
            .iter()
            .filter(|d| **d != domain)
            .any(|d| self.registry(*d).find(stream_id).is_some());
        if taken_elsewhere {
            return Err(RejectReason::StreamAlreadyInUse);
        }

        match domain {
            Domain::Login => self.logins.register(stream_id, req.name_or_empty(), false),
            Domain::Directory => {
                if req.filter & DIRECTORY_REQUIRED_FILTER != DIRECTORY_REQUIRED_FILTER {
                    return Err(RejectReason::IncorrectFilterFlags);
                }
                let registration = self.directories.register(stream_id, &self.limits.service_name, false)?;
                self.transient
                    .requested_services
                    .insert(req.service_id.unwrap_or(self.limits.service_id));
                Ok(registration)
            }
            Domain::Dictionary => self.dictionaries.register(stream_id, req.name_or_empty(), false),
            Domain::Item => self.register_item(req),
            Domain::Tunnel => self.open_tunnel(req),
        }
    }

    fn register_item(&mut self, req: &RequestMsg) -> Result<StreamRegistration, RejectReason> {
        if req.service_id != Some(self.limits.service_id) {
            return Err(RejectReason::InvalidServiceId);
        }
        let name = req.name_or_empty();
        if name.is_empty() {
            return Err(RejectReason::ItemNotSupported);
        }

        match self.items.find(req.stream_id) {
            Some(existing) if existing.owner_key != name => return Err(RejectReason::StreamAlreadyInUse),
            Some(existing) if existing.private_stream != req.private_stream => {
                return Err(RejectReason::PrivateStreamMismatch)
            }
            Some(_) => {}
            None => {
                let open_elsewhere = self
                    .items
                    .iter()
                    .any(|r| r.owner_key == name && !r.private_stream);
                if open_elsewhere && !req.private_stream {
                    return Err(RejectReason::ItemAlreadyOpened);
                }
            }
        }

        self.items.register(req.stream_id, name, req.private_stream)
    }

    fn open_tunnel(&mut self, req: &RequestMsg) -> Result<StreamRegistration, RejectReason> {
        let requested = req.class_of_service.clone().ok_or(RejectReason::DecoderFailed)?;
        if self.tunnels.find(req.stream_id).is_some() {
            return Err(RejectReason::StreamAlreadyInUse);
        }

        // Finished negotiations are kept only until the next tunnel request.
        self.negotiations.retain(|_, n| !n.is_finished());
        let mut negotiation = self.negotiator.negotiate(req.stream_id, requested);
        if negotiation.state() == TunnelState::Rejected {
            self.negotiations.insert(req.stream_id, negotiation);
            return Err(RejectReason::ClassOfServiceMismatch);
        }

        let owner = match req.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("tunnel-{}", req.stream_id),
        };
        match self.tunnels.register(req.stream_id, &owner, false) {
            Ok(registration) => {
                self.negotiations.insert(req.stream_id, negotiation);
                Ok(registration)
            }
            Err(reason) => {
                negotiation.close();
                Err(reason)
            }
        }
    }

    /// Peer closed `stream_id`. Returns `false` if it was not open.
    pub fn on_close(&mut self, domain: Domain, stream_id: StreamId) -> bool {
        self.transient.pending_refreshes.remove(&(domain, stream_id));
        if domain == Domain::Tunnel {
            if let Some(mut negotiation) = self.negotiations.remove(&stream_id) {
                negotiation.close();
            }
        }
        self.registry_mut(domain).close(stream_id)
    }

    /// Feeds a status event to a tunnel. Returns `true` if it closed the tunnel.
    pub fn on_tunnel_status(&mut self, stream_id: StreamId, stream_state: StreamState, data_state: DataState) -> bool {
        let closed = self
            .negotiations
            .get_mut(&stream_id)
            .is_some_and(|n| n.on_status(stream_state, data_state));
        if closed {
            self.tunnels.close(stream_id);
        }
        closed
    }

    pub fn negotiation(&self, stream_id: StreamId) -> Option<&TunnelNegotiation> {
        self.negotiations.get(&stream_id)
    }

    /// Class of service this channel's tunnels are judged against.
    pub fn supported_class_of_service(&self) -> &ClassOfService {
        self.negotiator.supported()
    }

    /// `true` when no tunnel on this channel can still carry data.
    pub fn all_tunnels_closed(&self) -> bool {
        self.negotiations.values().all(TunnelNegotiation::is_finished)
    }

    /// Releases every stream in teardown order and returns what was open.
    /// A second call returns an empty list.
    pub fn teardown(&mut self) -> Vec<StreamRegistration> {
        let mut cleared = Vec::new();
        for domain in Domain::TEARDOWN_ORDER {
            cleared.extend(self.registry_mut(domain).close_all());
        }
        for negotiation in self.negotiations.values_mut() {
            negotiation.close();
        }
        self.clear_transient();
        if !cleared.is_empty() {
            log::info!("{}: released {} streams", self.channel, cleared.len());
        }
        cleared
    }

    pub fn transient(&self) -> &TransientState {
        &self.transient
    }

    pub fn mark_refresh_pending(&mut self, domain: Domain, stream_id: StreamId) {
        self.transient.pending_refreshes.insert((domain, stream_id));
    }

    pub fn mark_refresh_done(&mut self, domain: Domain, stream_id: StreamId) {
        self.transient.pending_refreshes.remove(&(domain, stream_id));
    }

    /// Drops per-connection flags. Registrations are left alone.
    pub fn clear_transient(&mut self) {
        self.transient = TransientState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::{ENUM_DICTIONARY_NAME, FIELD_DICTIONARY_NAME};
    use crate::core::tunnel::cos_filter;

    fn session() -> ChannelSession {
        ChannelSession::new(ChannelHandle(1), SessionLimits::default(), TunnelSessionNegotiator::default())
    }

    fn item(stream_id: StreamId, name: &str) -> RequestMsg {
        RequestMsg::new(stream_id).with_name(name).with_service(1)
    }

    #[test]
    fn test_login_missing_user_name() {
        let mut s = session();
        assert_eq!(
            s.on_request(Domain::Login, &RequestMsg::new(1)),
            Err(RejectReason::NoUserNameInRequest)
        );
        assert_eq!(
            s.on_request(Domain::Login, &RequestMsg::new(1).with_name("")),
            Err(RejectReason::NoUserNameInRequest)
        );
    }

    #[test]
    fn test_directory_filter_flags() {
        let mut s = session();
        assert_eq!(
            s.on_request(Domain::Directory, &RequestMsg::new(2).with_filter(0x3)),
            Err(RejectReason::IncorrectFilterFlags)
        );
        assert!(s.on_request(Domain::Directory, &RequestMsg::new(2).with_filter(0x3F)).is_ok());
        assert!(s.transient().requested_services.contains(&1));
    }

    #[test]
    fn test_dictionary_named_slots() {
        let mut s = session();
        assert_eq!(
            s.on_request(Domain::Dictionary, &RequestMsg::new(3).with_name("Bogus")),
            Err(RejectReason::UnknownDictionaryName)
        );
        s.on_request(Domain::Dictionary, &RequestMsg::new(3).with_name(FIELD_DICTIONARY_NAME))
            .unwrap();
        s.on_request(Domain::Dictionary, &RequestMsg::new(4).with_name(ENUM_DICTIONARY_NAME))
            .unwrap();

        let replaced = s
            .on_request(Domain::Dictionary, &RequestMsg::new(5).with_name(FIELD_DICTIONARY_NAME))
            .unwrap();
        assert_eq!(replaced.reissues, 1);
        assert!(s.registry(Domain::Dictionary).find(3).is_none());
        assert_eq!(s.registry(Domain::Dictionary).len(), 2);
    }

    #[test]
    fn test_item_validation_order() {
        let mut s = session();
        assert_eq!(
            s.on_request(Domain::Item, &RequestMsg::new(5).with_name("IBM.N").with_service(9)),
            Err(RejectReason::InvalidServiceId)
        );
        assert_eq!(
            s.on_request(Domain::Item, &RequestMsg::new(5).with_service(1)),
            Err(RejectReason::ItemNotSupported)
        );

        s.on_request(Domain::Item, &item(5, "IBM.N")).unwrap();
        assert_eq!(
            s.on_request(Domain::Item, &item(5, "TRI.N")),
            Err(RejectReason::StreamAlreadyInUse)
        );
        assert_eq!(
            s.on_request(Domain::Item, &item(6, "IBM.N")),
            Err(RejectReason::ItemAlreadyOpened)
        );
        assert_eq!(
            s.on_request(Domain::Item, &item(5, "IBM.N").private()),
            Err(RejectReason::PrivateStreamMismatch)
        );

        let reissue = s.on_request(Domain::Item, &item(5, "IBM.N")).unwrap();
        assert_eq!(reissue.reissues, 1);
        assert_eq!(s.registry(Domain::Item).len(), 1);
    }

    #[test]
    fn test_private_stream_may_duplicate_key() {
        let mut s = session();
        s.on_request(Domain::Item, &item(5, "IBM.N")).unwrap();
        assert!(s.on_request(Domain::Item, &item(6, "IBM.N").private()).is_ok());
        assert_eq!(s.registry(Domain::Item).len(), 2);
    }

    #[test]
    fn test_item_capacity() {
        let limits = SessionLimits {
            item_capacity: 2,
            ..SessionLimits::default()
        };
        let mut s = ChannelSession::new(ChannelHandle(1), limits, TunnelSessionNegotiator::default());
        s.on_request(Domain::Item, &item(5, "A")).unwrap();
        s.on_request(Domain::Item, &item(6, "B")).unwrap();
        assert_eq!(
            s.on_request(Domain::Item, &item(7, "C")),
            Err(RejectReason::MaxRequestsReached)
        );
    }

    #[test]
    fn test_stream_id_unique_across_domains() {
        let mut s = session();
        s.on_request(Domain::Login, &RequestMsg::new(1).with_name("alice")).unwrap();
        assert_eq!(
            s.on_request(Domain::Item, &item(1, "IBM.N")),
            Err(RejectReason::StreamAlreadyInUse)
        );
    }

    #[test]
    fn test_tunnel_open_reject_and_status_close() {
        let mut s = session();
        let good = RequestMsg::new(10).with_class_of_service(ClassOfService::default());
        s.on_request(Domain::Tunnel, &good).unwrap();
        assert_eq!(s.negotiation(10).map(|n| n.state()), Some(TunnelState::Open));
        assert!(!s.all_tunnels_closed());

        let bad = RequestMsg::new(11).with_class_of_service(ClassOfService {
            filter: cos_filter::COMMON,
            ..ClassOfService::default()
        });
        assert_eq!(
            s.on_request(Domain::Tunnel, &bad),
            Err(RejectReason::ClassOfServiceMismatch)
        );
        assert_eq!(s.negotiation(11).map(|n| n.state()), Some(TunnelState::Rejected));
        assert!(s.registry(Domain::Tunnel).find(11).is_none());

        assert_eq!(
            s.on_request(Domain::Tunnel, &RequestMsg::new(12)),
            Err(RejectReason::DecoderFailed)
        );

        assert!(s.on_tunnel_status(10, StreamState::ClosedRecover, DataState::Suspect));
        assert!(s.registry(Domain::Tunnel).is_empty());
        assert!(s.all_tunnels_closed());
    }

    #[test]
    fn test_rejected_negotiations_do_not_accumulate() {
        let mut s = session();
        let mismatched = ClassOfService {
            filter: cos_filter::COMMON,
            ..ClassOfService::default()
        };
        for stream_id in 20..120 {
            let req = RequestMsg::new(stream_id).with_class_of_service(mismatched.clone());
            assert_eq!(s.on_request(Domain::Tunnel, &req), Err(RejectReason::ClassOfServiceMismatch));
        }
        assert_eq!(s.negotiation(119).map(|n| n.state()), Some(TunnelState::Rejected));
        assert!(s.negotiation(20).is_none());

        s.on_request(Domain::Tunnel, &RequestMsg::new(10).with_class_of_service(ClassOfService::default()))
            .unwrap();
        assert!(s.negotiation(119).is_none());
        assert_eq!(s.negotiation(10).map(|n| n.state()), Some(TunnelState::Open));
        assert!(!s.all_tunnels_closed());
    }

    #[test]
    fn test_directory_second_stream_rejected_first_kept() {
        let mut s = session();
        s.on_request(Domain::Directory, &RequestMsg::new(2).with_filter(0x7)).unwrap();
        assert_eq!(
            s.on_request(Domain::Directory, &RequestMsg::new(3).with_filter(0x7)),
            Err(RejectReason::MaxRequestsReached)
        );
        assert!(s.registry(Domain::Directory).find(2).is_some());
        assert!(s.on_request(Domain::Directory, &RequestMsg::new(2).with_filter(0x3F)).is_ok());
    }

    #[test]
    fn test_teardown_order_and_idempotence() {
        let mut s = session();
        s.on_request(Domain::Tunnel, &RequestMsg::new(10).with_class_of_service(ClassOfService::default()))
            .unwrap();
        s.on_request(Domain::Login, &RequestMsg::new(1).with_name("alice")).unwrap();
        s.on_request(Domain::Dictionary, &RequestMsg::new(3).with_name(FIELD_DICTIONARY_NAME))
            .unwrap();
        s.on_request(Domain::Directory, &RequestMsg::new(2).with_filter(0x7)).unwrap();
        s.on_request(Domain::Item, &item(5, "IBM.N")).unwrap();

        let cleared: Vec<Domain> = s.teardown().iter().map(|r| r.domain).collect();
        assert_eq!(cleared, Domain::TEARDOWN_ORDER.to_vec());
        assert_eq!(s.open_stream_count(), 0);
        assert!(s.all_tunnels_closed());
        assert!(s.transient().is_empty());
        assert!(s.teardown().is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut s = session();
        s.on_request(Domain::Item, &item(5, "IBM.N")).unwrap();
        s.mark_refresh_pending(Domain::Item, 5);
        assert!(s.on_close(Domain::Item, 5));
        assert!(!s.on_close(Domain::Item, 5));
        assert!(s.transient().pending_refreshes.is_empty());
    }

    #[test]
    fn test_clear_transient_keeps_registrations() {
        let mut s = session();
        s.on_request(Domain::Directory, &RequestMsg::new(2).with_filter(0x7)).unwrap();
        s.mark_refresh_pending(Domain::Directory, 2);
        s.clear_transient();
        assert!(s.transient().is_empty());
        assert_eq!(s.registry(Domain::Directory).len(), 1);
    }
}
