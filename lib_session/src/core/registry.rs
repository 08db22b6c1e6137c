//! # Stream Registry
//!
//! Per-domain, per-channel table of open streams. Each registry enforces its
//! domain's capacity and the rules for reusing a slot:
//!
//! - **Single** domains (login) keep one logical slot per owner and overwrite
//!   it on reissue rather than growing.
//! - **Named** domains (dictionary) only accept a fixed set of owner keys, one
//!   slot each.
//! - **Keyed** domains (directory, item, tunnel) hold one entry per stream id; the
//!   owning [`ChannelSession`](crate::core::channel_session::ChannelSession)
//!   applies the item-specific duplicate checks on top.
//!
//! A registration failure never changes the table.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::core::reject_policy::RejectReason;
use crate::core::types::{Domain, StreamId};

/// Field dictionary name accepted by the dictionary domain.
pub const FIELD_DICTIONARY_NAME: &str = "RWFFld";
/// Enum-type dictionary name accepted by the dictionary domain.
pub const ENUM_DICTIONARY_NAME: &str = "RWFEnum";
/// Every dictionary name the provider serves.
pub const DICTIONARY_NAMES: &[&str] = &[FIELD_DICTIONARY_NAME, ENUM_DICTIONARY_NAME];

/// How a registry treats an owner that already holds a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPolicy {
    /// Same owner or same stream id reuses the existing slot.
    Single,
    /// Only the listed owner keys are accepted, one slot per key.
    Named(&'static [&'static str]),
    /// One entry per stream id.
    Keyed,
}

impl SlotPolicy {
    /// Slot policy each domain uses.
    pub fn for_domain(domain: Domain) -> Self {
        match domain {
            Domain::Login => SlotPolicy::Single,
            Domain::Dictionary => SlotPolicy::Named(DICTIONARY_NAMES),
            Domain::Directory | Domain::Item | Domain::Tunnel => SlotPolicy::Keyed,
        }
    }
}

/// One open stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRegistration {
    /// Domain the stream belongs to.
    pub domain: Domain,
    /// Peer-assigned stream id.
    pub stream_id: StreamId,
    /// Domain key: user name, dictionary name, item name, service name.
    pub owner_key: String,
    /// Item private-stream flag as requested.
    pub private_stream: bool,
    /// `false` only on records handed back by `close_all`.
    pub in_use: bool,
    /// Number of accepted reissues on this slot. Zero for a fresh open.
    pub reissues: u32,
    /// When the slot was first taken.
    pub registered_at: Instant,
}

/// Open streams of one domain on one channel.
#[derive(Debug)]
pub struct StreamRegistry {
    domain: Domain,
    policy: SlotPolicy,
    capacity: usize,
    entries: BTreeMap<StreamId, StreamRegistration>,
}

impl StreamRegistry {
    /// Creates an empty registry with the domain's default slot policy.
    pub fn new(domain: Domain, capacity: usize) -> Self {
        Self::with_policy(domain, SlotPolicy::for_domain(domain), capacity)
    }

    /// Creates an empty registry with an explicit slot policy.
    pub fn with_policy(domain: Domain, policy: SlotPolicy, capacity: usize) -> Self {
        Self {
            domain,
            policy,
            capacity,
            entries: BTreeMap::new(),
        }
    }

    /// Domain served by this registry.
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live registrations in stream id order.
    pub fn iter(&self) -> impl Iterator<Item = &StreamRegistration> {
        self.entries.values()
    }

    /// Registers `owner_key` on `stream_id`, or reissues the slot it already holds.
    ///
    /// Owner validation runs before capacity is counted, so a malformed
    /// request on a full registry still reports the validation failure.
    pub fn register(
        &mut self,
        stream_id: StreamId,
        owner_key: &str,
        private_stream: bool,
    ) -> Result<StreamRegistration, RejectReason> {
        if owner_key.is_empty() {
            return Err(self.missing_owner_reason());
        }
        if let SlotPolicy::Named(names) = self.policy {
            if !names.contains(&owner_key) {
                return Err(RejectReason::UnknownDictionaryName);
            }
        }

        if let Some(existing) = self.entries.get_mut(&stream_id) {
            if existing.owner_key != owner_key && self.policy != SlotPolicy::Single {
                return Err(RejectReason::StreamAlreadyInUse);
            }
            existing.owner_key = owner_key.to_string();
            existing.private_stream = private_stream;
            existing.reissues += 1;
            log::debug!(
                "{} stream {} reissued by '{}' ({} reissues)",
                self.domain,
                stream_id,
                owner_key,
                existing.reissues
            );
            return Ok(existing.clone());
        }

        if self.policy != SlotPolicy::Keyed {
            let previous = self.find_by_owner(owner_key).map(|r| r.stream_id);
            if let Some(mut moved) = previous.and_then(|id| self.entries.remove(&id)) {
                log::debug!(
                    "{} slot '{}' moved from stream {} to {}",
                    self.domain,
                    owner_key,
                    moved.stream_id,
                    stream_id
                );
                moved.stream_id = stream_id;
                moved.private_stream = private_stream;
                moved.reissues += 1;
                self.entries.insert(stream_id, moved.clone());
                return Ok(moved);
            }
        }

        if self.entries.len() >= self.capacity {
            log::debug!(
                "{} stream {} rejected: {} of {} slots in use",
                self.domain,
                stream_id,
                self.entries.len(),
                self.capacity
            );
            return Err(RejectReason::MaxRequestsReached);
        }

        let registration = StreamRegistration {
            domain: self.domain,
            stream_id,
            owner_key: owner_key.to_string(),
            private_stream,
            in_use: true,
            reissues: 0,
            registered_at: Instant::now(),
        };
        self.entries.insert(stream_id, registration.clone());
        log::info!("{} stream {} opened for '{}'", self.domain, stream_id, owner_key);
        Ok(registration)
    }

    /// Looks up the registration on `stream_id`.
    pub fn find(&self, stream_id: StreamId) -> Option<&StreamRegistration> {
        self.entries.get(&stream_id)
    }

    /// Looks up the lowest-numbered stream held by `owner_key`.
    pub fn find_by_owner(&self, owner_key: &str) -> Option<&StreamRegistration> {
        self.entries.values().find(|r| r.owner_key == owner_key)
    }

    /// Releases `stream_id`. Returns `false` when nothing was registered there.
    pub fn close(&mut self, stream_id: StreamId) -> bool {
        match self.entries.remove(&stream_id) {
            Some(reg) => {
                log::info!("{} stream {} closed ('{}')", self.domain, stream_id, reg.owner_key);
                true
            }
            None => false,
        }
    }

    /// Releases every registration and returns what was cleared.
    ///
    /// A second call returns an empty list.
    pub fn close_all(&mut self) -> Vec<StreamRegistration> {
        let cleared: Vec<StreamRegistration> = std::mem::take(&mut self.entries)
            .into_values()
            .map(|mut reg| {
                reg.in_use = false;
                reg
            })
            .collect();
        if !cleared.is_empty() {
            log::debug!("{} registry cleared {} streams", self.domain, cleared.len());
        }
        cleared
    }

    fn missing_owner_reason(&self) -> RejectReason {
        match self.domain {
            Domain::Login => RejectReason::NoUserNameInRequest,
            Domain::Dictionary => RejectReason::UnknownDictionaryName,
            Domain::Item => RejectReason::ItemNotSupported,
            Domain::Directory | Domain::Tunnel => RejectReason::DecoderFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_slot_login_rejects_second_user() {
        let mut logins = StreamRegistry::new(Domain::Login, 1);
        let alice = logins.register(1, "alice", false).unwrap();
        assert_eq!(alice.reissues, 0);
        assert!(alice.in_use);

        assert_eq!(logins.register(2, "bob", false), Err(RejectReason::MaxRequestsReached));
        assert_eq!(logins.len(), 1);
        assert_eq!(logins.find(1).unwrap().owner_key, "alice");
    }

    #[test]
    fn test_single_slot_reissue_reuses_slot() {
        let mut logins = StreamRegistry::new(Domain::Login, 1);
        logins.register(1, "alice", false).unwrap();

        let again = logins.register(1, "alice", false).unwrap();
        assert_eq!(again.reissues, 1);

        let moved = logins.register(3, "alice", false).unwrap();
        assert_eq!(moved.stream_id, 3);
        assert_eq!(moved.reissues, 2);
        assert!(logins.find(1).is_none());
        assert_eq!(logins.len(), 1);
    }

    #[test]
    fn test_directory_second_stream_counts_against_capacity() {
        let mut directories = StreamRegistry::new(Domain::Directory, 1);
        directories.register(2, "DIRECT_FEED", false).unwrap();
        assert_eq!(directories.register(2, "DIRECT_FEED", false).unwrap().reissues, 1);

        assert_eq!(
            directories.register(3, "DIRECT_FEED", false),
            Err(RejectReason::MaxRequestsReached)
        );
        assert!(directories.find(2).is_some());
        assert!(directories.find(3).is_none());

        let mut wider = StreamRegistry::new(Domain::Directory, 2);
        wider.register(2, "DIRECT_FEED", false).unwrap();
        wider.register(3, "DIRECT_FEED", false).unwrap();
        assert_eq!(wider.len(), 2);
    }

    #[test]
    fn test_validation_precedes_capacity() {
        let mut logins = StreamRegistry::new(Domain::Login, 1);
        logins.register(1, "alice", false).unwrap();
        assert_eq!(logins.register(2, "", false), Err(RejectReason::NoUserNameInRequest));
    }

    #[test]
    fn test_zero_capacity_rejects_everything() {
        let mut items = StreamRegistry::new(Domain::Item, 0);
        assert_eq!(items.register(5, "IBM.N", false), Err(RejectReason::MaxRequestsReached));
        assert!(items.is_empty());
    }

    #[test]
    fn test_keyed_stream_already_in_use() {
        let mut items = StreamRegistry::new(Domain::Item, 10);
        items.register(5, "IBM.N", false).unwrap();
        assert_eq!(items.register(5, "TRI.N", false), Err(RejectReason::StreamAlreadyInUse));
        assert_eq!(items.find(5).unwrap().owner_key, "IBM.N");
    }

    #[test]
    fn test_named_slots_only_accept_known_names() {
        let mut dictionaries = StreamRegistry::new(Domain::Dictionary, 2);
        assert_eq!(
            dictionaries.register(3, "Unknown", false),
            Err(RejectReason::UnknownDictionaryName)
        );
        dictionaries.register(3, FIELD_DICTIONARY_NAME, false).unwrap();
        dictionaries.register(4, ENUM_DICTIONARY_NAME, false).unwrap();
        assert_eq!(
            dictionaries.register(4, FIELD_DICTIONARY_NAME, false),
            Err(RejectReason::StreamAlreadyInUse)
        );
        assert_eq!(dictionaries.len(), 2);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut items = StreamRegistry::new(Domain::Item, 10);
        items.register(5, "IBM.N", false).unwrap();
        assert!(items.close(5));
        assert!(!items.close(5));
        assert!(!items.close(99));
    }

    #[test]
    fn test_close_all_twice() {
        let mut items = StreamRegistry::new(Domain::Item, 10);
        items.register(5, "IBM.N", false).unwrap();
        items.register(6, "TRI.N", true).unwrap();

        let cleared = items.close_all();
        assert_eq!(cleared.len(), 2);
        assert!(cleared.iter().all(|r| !r.in_use));
        assert!(items.close_all().is_empty());
        assert!(items.is_empty());
    }

    #[test]
    fn test_find_by_owner() {
        let mut items = StreamRegistry::new(Domain::Item, 10);
        items.register(8, "IBM.N", false).unwrap();
        assert_eq!(items.find_by_owner("IBM.N").map(|r| r.stream_id), Some(8));
        assert!(items.find_by_owner("TRI.N").is_none());
    }
}
