//! Channel directory: membership and the key-exchange mailbox
//!
//! The directory hosts channel metadata: the wrapped DEK, the manager and
//! member sets, and one `ecdh_request` slot per member. A member posts its
//! static ECDH public key into its slot; a manager fulfils the slot with the
//! channel KEK sealed to that key; the member accepts and clears the slot.
//!
//! ```text
//!   slot absent ──request──► Requested ──manager wraps KEK──► Fulfilled
//!        ▲                                                        │
//!        └───────────────────── member accepts ───────────────────┘
//! ```

mod memory;

use std::collections::{BTreeMap, BTreeSet};

use dmsg_crypto::{EcdhRemote, PUBLIC_KEY_SIZE};
pub use memory::MemoryChannelDirectory;
use serde::{Deserialize, Serialize};

use crate::{
    error::StoreError,
    id::{ChannelId, Principal},
};

/// Role a principal holds in a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberRole {
    /// May add, remove and update members, and services key requests
    Manager,
    /// Reads and writes messages
    Member,
}

/// One member's key-exchange slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcdhRequest {
    /// Static ECDH public key of the requesting member
    pub ecdh_pub: [u8; PUBLIC_KEY_SIZE],
    /// KEK sealed to `ecdh_pub` by a manager, once serviced
    pub ecdh_remote: Option<EcdhRemote>,
}

impl EcdhRequest {
    /// A fresh, unserviced request.
    pub fn new(ecdh_pub: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self { ecdh_pub, ecdh_remote: None }
    }

    /// Current state of the exchange.
    pub fn state(&self) -> ExchangeState {
        if self.ecdh_remote.is_some() { ExchangeState::Fulfilled } else { ExchangeState::Requested }
    }
}

/// Per-member exchange state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// No slot for this member
    None,
    /// Member posted a public key, waiting for a manager
    Requested,
    /// A manager sealed the KEK, waiting for the member to accept
    Fulfilled,
}

/// Channel metadata as the directory returns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Channel id
    pub id: ChannelId,
    /// Display name
    pub name: String,
    /// DEK encrypted under the channel KEK
    pub dek: Vec<u8>,
    /// Principals holding [`MemberRole::Manager`]
    pub managers: BTreeSet<Principal>,
    /// Principals holding [`MemberRole::Member`]
    pub members: BTreeSet<Principal>,
    /// Key-exchange slots keyed by member
    pub ecdh_request: BTreeMap<Principal, EcdhRequest>,
}

impl ChannelInfo {
    /// Whether `principal` manages this channel.
    pub fn is_manager(&self, principal: &Principal) -> bool {
        self.managers.contains(principal)
    }

    /// Whether `principal` belongs to this channel in any role.
    pub fn is_member(&self, principal: &Principal) -> bool {
        self.managers.contains(principal) || self.members.contains(principal)
    }

    /// Role of `principal`, if any.
    pub fn role_of(&self, principal: &Principal) -> Option<MemberRole> {
        if self.managers.contains(principal) {
            Some(MemberRole::Manager)
        } else if self.members.contains(principal) {
            Some(MemberRole::Member)
        } else {
            None
        }
    }

    /// Exchange state of `principal`'s slot.
    pub fn exchange_state(&self, principal: &Principal) -> ExchangeState {
        self.ecdh_request.get(principal).map_or(ExchangeState::None, EcdhRequest::state)
    }

    /// Requests still waiting for a manager, in principal order.
    pub fn pending_requests(&self) -> impl Iterator<Item = (&Principal, &EcdhRequest)> {
        self.ecdh_request.iter().filter(|(_, request)| request.ecdh_remote.is_none())
    }
}

/// A principal being added to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMember {
    /// Principal to add
    pub principal: Principal,
    /// Role to grant
    pub role: MemberRole,
    /// Pre-filled exchange slot, when the adder already sealed the KEK
    pub ecdh: Option<EcdhRequest>,
}

/// Everything needed to create a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelInput {
    /// Display name
    pub name: String,
    /// DEK encrypted under the new KEK
    pub dek: Vec<u8>,
    /// Initial members besides the creator, who always becomes a manager
    pub members: Vec<NewMember>,
}

/// Remote channel directory.
///
/// Every call names its `caller`, which the directory uses for
/// authorisation: only members read a channel, only managers change
/// membership or fulfil another member's slot, and each member writes only
/// its own slot.
#[async_trait::async_trait]
pub trait ChannelDirectory: Send + Sync {
    /// Create a channel with `caller` as manager.
    async fn create_channel(
        &self,
        caller: &Principal,
        input: CreateChannelInput,
    ) -> Result<ChannelId, StoreError>;

    /// Fetch channel metadata.
    async fn get_channel(
        &self,
        caller: &Principal,
        channel: &ChannelId,
    ) -> Result<ChannelInfo, StoreError>;

    /// Channels `caller` belongs to.
    async fn my_channels(&self, caller: &Principal) -> Result<Vec<ChannelId>, StoreError>;

    /// Post (`Some`) or clear (`None`) the caller's own exchange slot.
    ///
    /// Posting replaces any earlier request, serviced or not.
    async fn update_my_setting(
        &self,
        caller: &Principal,
        channel: &ChannelId,
        ecdh_pub: Option<[u8; PUBLIC_KEY_SIZE]>,
    ) -> Result<(), StoreError>;

    /// Set `member`'s role and, with `ecdh_remote`, fulfil its pending slot.
    async fn update_member(
        &self,
        caller: &Principal,
        channel: &ChannelId,
        member: &Principal,
        role: MemberRole,
        ecdh_remote: Option<EcdhRemote>,
    ) -> Result<(), StoreError>;

    /// Add principals to a channel.
    async fn add_members(
        &self,
        caller: &Principal,
        channel: &ChannelId,
        members: Vec<NewMember>,
    ) -> Result<(), StoreError>;

    /// Remove `member` and its exchange slot. Members may remove themselves.
    async fn remove_member(
        &self,
        caller: &Principal,
        channel: &ChannelId,
        member: &Principal,
    ) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ChannelInfo {
        let alice = Principal::from_slice(b"alice");
        let bob = Principal::from_slice(b"bob");
        let carol = Principal::from_slice(b"carol");

        let mut ecdh_request = BTreeMap::new();
        ecdh_request.insert(bob.clone(), EcdhRequest::new([9; 32]));
        ecdh_request.insert(
            carol.clone(),
            EcdhRequest {
                ecdh_pub: [8; 32],
                ecdh_remote: Some(EcdhRemote { public_key: [7; 32], payload: vec![1] }),
            },
        );

        ChannelInfo {
            id: ChannelId::new(Principal::from_slice(b"canister"), 1),
            name: "general".to_string(),
            dek: Vec::new(),
            managers: BTreeSet::from([alice]),
            members: BTreeSet::from([bob, carol]),
            ecdh_request,
        }
    }

    #[test]
    fn roles() {
        let info = info();
        assert_eq!(info.role_of(&Principal::from_slice(b"alice")), Some(MemberRole::Manager));
        assert_eq!(info.role_of(&Principal::from_slice(b"bob")), Some(MemberRole::Member));
        assert!(!info.is_member(&Principal::from_slice(b"mallory")));
    }

    #[test]
    fn exchange_states() {
        let info = info();
        assert_eq!(info.exchange_state(&Principal::from_slice(b"alice")), ExchangeState::None);
        assert_eq!(info.exchange_state(&Principal::from_slice(b"bob")), ExchangeState::Requested);
        assert_eq!(
            info.exchange_state(&Principal::from_slice(b"carol")),
            ExchangeState::Fulfilled
        );
    }

    #[test]
    fn only_unserviced_requests_are_pending() {
        let info = info();
        let pending: Vec<_> = info.pending_requests().map(|(p, _)| p.clone()).collect();
        assert_eq!(pending, vec![Principal::from_slice(b"bob")]);
    }
}
