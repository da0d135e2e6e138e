//! Group key exchange
//!
//! Delivers a channel KEK to a member's static ECDH key without the KEK ever
//! appearing in plaintext outside the two clients:
//!
//! 1. Member posts its static public key in its `ecdh_request` slot.
//! 2. A manager with an opened master key seals the KEK to that key with a
//!    one-time ephemeral key and writes it to the slot.
//! 3. Member unseals the KEK, re-wraps it under its own master key, saves it
//!    and clears the slot.
//!
//! A slot that already carries a sealed KEK is skipped by every manager, so
//! concurrent managers do not overwrite each other's deliveries.

use dmsg_crypto::SymmetricKey;

use super::KeySession;
use crate::{
    channel_key::{CHANNEL_KEY_AAD, MemberKey, open_sealed_kek, seal_kek_for},
    directory::{ChannelDirectory, ChannelInfo, EcdhRequest, ExchangeState, MemberRole, NewMember},
    env::Environment,
    error::KeyError,
    event::KeyEvent,
    id::{ChannelId, Principal},
    store::{CustodialStore, LocalKeyStore},
};

/// Outcome of [`KeySession::sync_channel`] for this user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelAccess {
    /// KEK already held
    Ready,
    /// A delivered KEK was accepted during this call
    Accepted,
    /// A request was posted during this call
    Requested,
    /// A request is pending and no manager has serviced it yet
    Waiting,
}

impl<E: Environment, S: CustodialStore, L: LocalKeyStore> KeySession<E, S, L> {
    /// Post this user's static public key as a KEK request on `channel`.
    ///
    /// # Errors
    ///
    /// - `NotReady`: static key not loaded
    pub async fn request_channel_kek<D: ChannelDirectory>(
        &self,
        directory: &D,
        channel: &ChannelId,
    ) -> Result<(), KeyError> {
        let public_key = self.static_key.as_ref().ok_or(KeyError::STATIC_KEY_NOT_READY)?.public_key();
        directory.update_my_setting(&self.principal, channel, Some(public_key)).await?;

        tracing::info!(channel = %channel, "KEK requested");
        Ok(())
    }

    /// Fulfil every pending request on a channel this user manages.
    ///
    /// Requests already carrying a sealed KEK are skipped. Requests with an
    /// unusable public key are logged and skipped. Returns the members served.
    ///
    /// # Errors
    ///
    /// - `NotReady`: master key not opened; nothing is written
    pub async fn service_ecdh_requests<D: ChannelDirectory>(
        &self,
        directory: &D,
        info: &ChannelInfo,
    ) -> Result<Vec<Principal>, KeyError> {
        if !info.is_manager(&self.principal) {
            tracing::debug!(channel = %info.id, "not a manager, skipping requests");
            return Ok(Vec::new());
        }

        let pending: Vec<(Principal, EcdhRequest)> =
            info.pending_requests().map(|(p, r)| (p.clone(), r.clone())).collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        self.ready_master_key()?;
        let kek = self.channel_kek(&info.id).await?;

        let mut served = Vec::with_capacity(pending.len());
        for (member, request) in pending {
            let remote = match seal_kek_for(&self.env, &request.ecdh_pub, &kek) {
                Ok(remote) => remote,
                Err(err) => {
                    tracing::warn!(channel = %info.id, member = %member, error = %err, "skipping unusable KEK request");
                    continue;
                },
            };

            let role = info.role_of(&member).unwrap_or(MemberRole::Member);
            directory.update_member(&self.principal, &info.id, &member, role, Some(remote)).await?;

            tracing::info!(channel = %info.id, member = %member, "KEK request serviced");
            self.emit(KeyEvent::RequestServiced { channel: info.id.clone(), member: member.clone() });
            served.push(member);
        }
        Ok(served)
    }

    /// Accept a KEK a manager delivered to this user.
    ///
    /// Returns `false` when there is nothing to accept.
    ///
    /// # Errors
    ///
    /// - `NotReady`: static key or master key not available
    /// - `PublicKeyMismatch`: the delivery targets a different static key
    /// - `AuthenticationFailed`: the sealed KEK does not open
    pub async fn accept_channel_kek<D: ChannelDirectory>(
        &mut self,
        directory: &D,
        info: &ChannelInfo,
    ) -> Result<bool, KeyError> {
        let Some(request) = info.ecdh_request.get(&self.principal) else {
            return Ok(false);
        };
        let Some(remote) = request.ecdh_remote.as_ref() else {
            return Ok(false);
        };

        let static_key = self.static_key.as_ref().ok_or(KeyError::STATIC_KEY_NOT_READY)?;
        let master = self.ready_master_key()?;
        if request.ecdh_pub != static_key.public_key() {
            tracing::warn!(channel = %info.id, "KEK delivered to a different static key");
            return Err(KeyError::PublicKeyMismatch);
        }

        let kek = open_sealed_kek(static_key, remote)?;
        let encrypted = master.encrypt(kek.as_bytes(), CHANNEL_KEY_AAD, self.env.random_array())?;
        self.save_channel_kek(&info.id, &encrypted).await?;
        directory.update_my_setting(&self.principal, &info.id, None).await?;

        self.invalidate_channel(&info.id);
        tracing::info!(channel = %info.id, "KEK accepted");
        self.emit(KeyEvent::KekAccepted { channel: info.id.clone() });
        Ok(true)
    }

    /// Add members, sealing the KEK to each one with a known public key.
    pub async fn admin_add_members<D: ChannelDirectory>(
        &self,
        directory: &D,
        channel: &ChannelId,
        members: &[MemberKey],
    ) -> Result<(), KeyError> {
        self.admin_add(directory, channel, members, MemberRole::Member).await
    }

    /// Add managers, sealing the KEK to each one with a known public key.
    pub async fn admin_add_managers<D: ChannelDirectory>(
        &self,
        directory: &D,
        channel: &ChannelId,
        managers: &[MemberKey],
    ) -> Result<(), KeyError> {
        self.admin_add(directory, channel, managers, MemberRole::Manager).await
    }

    async fn admin_add<D: ChannelDirectory>(
        &self,
        directory: &D,
        channel: &ChannelId,
        members: &[MemberKey],
        role: MemberRole,
    ) -> Result<(), KeyError> {
        let kek: Option<SymmetricKey> = if members.iter().any(|m| m.ecdh_pub.is_some()) {
            Some(self.channel_kek(channel).await?)
        } else {
            None
        };

        let mut additions = Vec::with_capacity(members.len());
        for member in members {
            let ecdh = match (member.ecdh_pub, kek.as_ref()) {
                (Some(ecdh_pub), Some(kek)) => Some(EcdhRequest {
                    ecdh_pub,
                    ecdh_remote: Some(seal_kek_for(&self.env, &ecdh_pub, kek)?),
                }),
                _ => None,
            };
            additions.push(NewMember { principal: member.principal.clone(), role, ecdh });
        }

        directory.add_members(&self.principal, channel, additions).await?;
        tracing::info!(channel = %channel, count = members.len(), ?role, "members added");
        Ok(())
    }

    /// Drive the exchange for one channel from this user's side.
    ///
    /// Services pending requests when this user manages the channel (failures
    /// are logged), then makes sure this user holds the KEK: accepts a
    /// delivery, or posts a request if there is neither a KEK nor a request.
    pub async fn sync_channel<D: ChannelDirectory>(
        &mut self,
        directory: &D,
        channel: &ChannelId,
    ) -> Result<ChannelAccess, KeyError> {
        let info = directory.get_channel(&self.principal, channel).await?;

        if info.is_manager(&self.principal) && self.is_ready() {
            if let Err(err) = self.service_ecdh_requests(directory, &info).await {
                tracing::warn!(channel = %channel, error = %err, "servicing KEK requests failed");
            }
        }

        match info.exchange_state(&self.principal) {
            ExchangeState::Fulfilled => {
                self.accept_channel_kek(directory, &info).await?;
                Ok(ChannelAccess::Accepted)
            },
            ExchangeState::Requested => Ok(ChannelAccess::Waiting),
            ExchangeState::None => match self.channel_kek(channel).await {
                Ok(_) => Ok(ChannelAccess::Ready),
                Err(err) if err.is_not_found() || err == KeyError::AuthenticationFailed => {
                    self.request_channel_kek(directory, channel).await?;
                    Ok(ChannelAccess::Requested)
                },
                Err(err) => Err(err),
            },
        }
    }
}
