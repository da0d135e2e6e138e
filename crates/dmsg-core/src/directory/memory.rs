//! In-memory channel directory for testing and simulation

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard},
};

use dmsg_crypto::{EcdhRemote, PUBLIC_KEY_SIZE};

use super::{
    ChannelDirectory, ChannelInfo, CreateChannelInput, EcdhRequest, MemberRole, NewMember,
};
use crate::{
    error::StoreError,
    id::{ChannelId, Principal},
};

/// In-memory channel directory hosted by a single canister.
///
/// Enforces the same authorisation the remote directory does. Clones share
/// state.
#[derive(Clone)]
pub struct MemoryChannelDirectory {
    canister: Principal,
    inner: Arc<Mutex<DirectoryInner>>,
}

#[derive(Default)]
struct DirectoryInner {
    channels: BTreeMap<u32, ChannelInfo>,
    next_id: u32,
}

impl MemoryChannelDirectory {
    /// Create an empty directory hosted by `canister`.
    pub fn new(canister: Principal) -> Self {
        Self { canister, inner: Arc::new(Mutex::new(DirectoryInner::default())) }
    }

    /// Canister hosting this directory.
    pub fn canister(&self) -> &Principal {
        &self.canister
    }

    /// Replace a channel's stored metadata, bypassing authorisation.
    ///
    /// Lets tests stage tampered or inconsistent directory state.
    pub fn overwrite_channel(&self, info: ChannelInfo) -> Result<(), StoreError> {
        self.lock()?.channels.insert(info.id.id, info);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, DirectoryInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("directory lock poisoned: {e}")))
    }
}

impl DirectoryInner {
    fn channel_mut(
        &mut self,
        canister: &Principal,
        channel: &ChannelId,
    ) -> Result<&mut ChannelInfo, StoreError> {
        if &channel.canister != canister {
            return Err(not_found(channel));
        }
        self.channels.get_mut(&channel.id).ok_or_else(|| not_found(channel))
    }
}

fn not_found(channel: &ChannelId) -> StoreError {
    StoreError::NotFound { namespace: "channel".to_string(), key: channel.to_string() }
}

fn require_manager(info: &ChannelInfo, caller: &Principal) -> Result<(), StoreError> {
    if info.is_manager(caller) {
        Ok(())
    } else {
        Err(StoreError::Rejected(format!("{caller} is not a manager of {}", info.id)))
    }
}

fn insert_member(info: &mut ChannelInfo, member: NewMember) {
    match member.role {
        MemberRole::Manager => {
            info.members.remove(&member.principal);
            info.managers.insert(member.principal.clone());
        },
        MemberRole::Member => {
            info.managers.remove(&member.principal);
            info.members.insert(member.principal.clone());
        },
    }
    if let Some(request) = member.ecdh {
        info.ecdh_request.insert(member.principal, request);
    }
}

#[async_trait::async_trait]
impl ChannelDirectory for MemoryChannelDirectory {
    async fn create_channel(
        &self,
        caller: &Principal,
        input: CreateChannelInput,
    ) -> Result<ChannelId, StoreError> {
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let id = ChannelId::new(self.canister.clone(), inner.next_id);

        let mut info = ChannelInfo {
            id: id.clone(),
            name: input.name,
            dek: input.dek,
            managers: BTreeSet::from([caller.clone()]),
            members: BTreeSet::new(),
            ecdh_request: BTreeMap::new(),
        };
        for member in input.members {
            if &member.principal != caller {
                insert_member(&mut info, member);
            }
        }

        inner.channels.insert(id.id, info);
        Ok(id)
    }

    async fn get_channel(
        &self,
        caller: &Principal,
        channel: &ChannelId,
    ) -> Result<ChannelInfo, StoreError> {
        let mut inner = self.lock()?;
        let info = inner.channel_mut(&self.canister, channel)?;
        if !info.is_member(caller) {
            return Err(StoreError::Rejected(format!("{caller} is not a member of {channel}")));
        }
        Ok(info.clone())
    }

    async fn my_channels(&self, caller: &Principal) -> Result<Vec<ChannelId>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .channels
            .values()
            .filter(|info| info.is_member(caller))
            .map(|info| info.id.clone())
            .collect())
    }

    async fn update_my_setting(
        &self,
        caller: &Principal,
        channel: &ChannelId,
        ecdh_pub: Option<[u8; PUBLIC_KEY_SIZE]>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let info = inner.channel_mut(&self.canister, channel)?;
        if !info.is_member(caller) {
            return Err(StoreError::Rejected(format!("{caller} is not a member of {channel}")));
        }

        match ecdh_pub {
            Some(key) => {
                info.ecdh_request.insert(caller.clone(), EcdhRequest::new(key));
            },
            None => {
                info.ecdh_request.remove(caller);
            },
        }
        Ok(())
    }

    async fn update_member(
        &self,
        caller: &Principal,
        channel: &ChannelId,
        member: &Principal,
        role: MemberRole,
        ecdh_remote: Option<EcdhRemote>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let info = inner.channel_mut(&self.canister, channel)?;
        require_manager(info, caller)?;
        if !info.is_member(member) {
            return Err(StoreError::Rejected(format!("{member} is not a member of {channel}")));
        }

        if let Some(remote) = ecdh_remote {
            let request = info.ecdh_request.get_mut(member).ok_or_else(|| {
                StoreError::Rejected(format!("{member} has no key request in {channel}"))
            })?;
            request.ecdh_remote = Some(remote);
        }

        insert_member(info, NewMember { principal: member.clone(), role, ecdh: None });
        Ok(())
    }

    async fn add_members(
        &self,
        caller: &Principal,
        channel: &ChannelId,
        members: Vec<NewMember>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let info = inner.channel_mut(&self.canister, channel)?;
        require_manager(info, caller)?;

        for member in members {
            insert_member(info, member);
        }
        Ok(())
    }

    async fn remove_member(
        &self,
        caller: &Principal,
        channel: &ChannelId,
        member: &Principal,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let info = inner.channel_mut(&self.canister, channel)?;
        if caller != member {
            require_manager(info, caller)?;
        }

        info.managers.remove(member);
        info.members.remove(member);
        info.ecdh_request.remove(member);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ExchangeState;

    fn principal(name: &str) -> Principal {
        Principal::from_slice(name.as_bytes())
    }

    async fn setup() -> (MemoryChannelDirectory, ChannelId) {
        let dir = MemoryChannelDirectory::new(principal("canister"));
        let id = dir
            .create_channel(
                &principal("alice"),
                CreateChannelInput {
                    name: "general".to_string(),
                    dek: vec![1, 2, 3],
                    members: vec![NewMember {
                        principal: principal("bob"),
                        role: MemberRole::Member,
                        ecdh: None,
                    }],
                },
            )
            .await
            .unwrap();
        (dir, id)
    }

    #[tokio::test]
    async fn creator_is_manager() {
        let (dir, id) = setup().await;
        let info = dir.get_channel(&principal("alice"), &id).await.unwrap();
        assert!(info.is_manager(&principal("alice")));
        assert_eq!(info.role_of(&principal("bob")), Some(MemberRole::Member));
        assert_eq!(info.dek, vec![1, 2, 3]);
        assert_eq!(dir.my_channels(&principal("bob")).await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn outsiders_cannot_read() {
        let (dir, id) = setup().await;
        let err = dir.get_channel(&principal("mallory"), &id).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert!(dir.my_channels(&principal("mallory")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn request_fulfil_clear() {
        let (dir, id) = setup().await;
        let bob = principal("bob");

        dir.update_my_setting(&bob, &id, Some([5; 32])).await.unwrap();
        let info = dir.get_channel(&bob, &id).await.unwrap();
        assert_eq!(info.exchange_state(&bob), ExchangeState::Requested);

        let remote = EcdhRemote { public_key: [6; 32], payload: vec![9] };
        dir.update_member(&principal("alice"), &id, &bob, MemberRole::Member, Some(remote))
            .await
            .unwrap();
        let info = dir.get_channel(&bob, &id).await.unwrap();
        assert_eq!(info.exchange_state(&bob), ExchangeState::Fulfilled);

        dir.update_my_setting(&bob, &id, None).await.unwrap();
        let info = dir.get_channel(&bob, &id).await.unwrap();
        assert_eq!(info.exchange_state(&bob), ExchangeState::None);
    }

    #[tokio::test]
    async fn members_cannot_fulfil_requests() {
        let (dir, id) = setup().await;
        let bob = principal("bob");
        dir.update_my_setting(&bob, &id, Some([5; 32])).await.unwrap();

        let remote = EcdhRemote { public_key: [6; 32], payload: vec![9] };
        let err = dir
            .update_member(&bob, &id, &bob, MemberRole::Manager, Some(remote))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn fulfilling_without_request_is_rejected() {
        let (dir, id) = setup().await;
        let remote = EcdhRemote { public_key: [6; 32], payload: vec![9] };
        let err = dir
            .update_member(&principal("alice"), &id, &principal("bob"), MemberRole::Member, Some(remote))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn promotion_moves_between_sets() {
        let (dir, id) = setup().await;
        let bob = principal("bob");
        dir.update_member(&principal("alice"), &id, &bob, MemberRole::Manager, None)
            .await
            .unwrap();

        let info = dir.get_channel(&bob, &id).await.unwrap();
        assert!(info.is_manager(&bob));
        assert!(!info.members.contains(&bob));
    }

    #[tokio::test]
    async fn members_may_leave_but_not_kick() {
        let (dir, id) = setup().await;
        let bob = principal("bob");

        let err = dir.remove_member(&bob, &id, &principal("alice")).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));

        dir.remove_member(&bob, &id, &bob).await.unwrap();
        assert!(dir.get_channel(&bob, &id).await.is_err());
    }

    #[tokio::test]
    async fn foreign_canister_is_not_found() {
        let (dir, id) = setup().await;
        let foreign = ChannelId::new(principal("elsewhere"), id.id);
        let err = dir.get_channel(&principal("alice"), &foreign).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
