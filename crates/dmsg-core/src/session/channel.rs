//! Channel KEK storage, DEK cache and message encryption.

use dmsg_crypto::SymmetricKey;

use super::{CachedDek, KeySession};
use crate::{
    channel_key::{
        CHANNEL_KEY_AAD, GeneratedChannelKey, MemberKey, generate_channel_key, kek_setting_key,
        open_channel_dek, open_channel_kek,
    },
    directory::{ChannelDirectory, ChannelInfo, CreateChannelInput, MemberRole, NewMember},
    env::Environment,
    error::{KeyError, StoreError},
    event::KeyEvent,
    id::ChannelId,
    store::{CustodialStore, LocalKeyStore, SettingInput},
};

impl<E: Environment, S: CustodialStore, L: LocalKeyStore> KeySession<E, S, L> {
    /// Encrypted KEK for `channel` from the custodial store.
    ///
    /// Falls back to the device cache when the store has no entry or is
    /// unreachable.
    pub async fn load_channel_kek(&self, channel: &ChannelId) -> Result<Vec<u8>, KeyError> {
        let path = self.setting_path(kek_setting_key(channel)?);
        let remote = self.store.get(&path, false).await;

        match remote {
            Ok(setting) => {
                if let Some(payload) = setting.payload {
                    return Ok(payload);
                }
            },
            Err(StoreError::NotFound { .. }) => {},
            Err(err) => {
                tracing::debug!(channel = %channel, error = %err, "KEK fetch failed, trying device cache");
                return self
                    .local
                    .load_channel_kek(&self.principal, channel)?
                    .ok_or_else(|| KeyError::from(err));
            },
        }

        self.local
            .load_channel_kek(&self.principal, channel)?
            .ok_or_else(|| KeyError::NotFound(format!("channel KEK for {channel}")))
    }

    /// Store an encrypted KEK remotely and in the device cache.
    pub async fn save_channel_kek(
        &self,
        channel: &ChannelId,
        encrypted_kek: &[u8],
    ) -> Result<(), KeyError> {
        let path = self.setting_path(kek_setting_key(channel)?);
        let input = SettingInput {
            payload: Some(encrypted_kek.to_vec()),
            desc: Some(format!("KEK for channel {channel}")),
            ..SettingInput::default()
        };
        self.store.upsert(&path, input).await?;
        self.local.store_channel_kek(&self.principal, channel, encrypted_kek)?;

        tracing::debug!(channel = %channel, "channel KEK saved");
        self.emit(KeyEvent::ChannelKekSaved { channel: channel.clone() });
        Ok(())
    }

    /// Decrypted KEK for `channel`.
    ///
    /// Tries the device cache first, then the custodial store. Each copy is
    /// tried against every opened master key, newest first.
    ///
    /// # Errors
    ///
    /// - `NotReady`: master key not opened
    /// - `NotFound`: no KEK stored for this user and channel
    /// - `AuthenticationFailed`: no opened master key decrypts it
    pub async fn channel_kek(&self, channel: &ChannelId) -> Result<SymmetricKey, KeyError> {
        self.ready_master_key()?;

        if let Some(cached) = self.local.load_channel_kek(&self.principal, channel)? {
            match open_channel_kek(self.master_keys.opened_newest_first(), &cached) {
                Ok(kek) => return Ok(kek),
                Err(err) => {
                    tracing::debug!(channel = %channel, error = %err, "cached KEK unusable, fetching");
                },
            }
        }

        let path = self.setting_path(kek_setting_key(channel)?);
        let setting = self.store.get(&path, false).await?;
        let encrypted = setting
            .payload
            .ok_or_else(|| KeyError::NotFound(format!("channel KEK for {channel}")))?;

        let kek = open_channel_kek(self.master_keys.opened_newest_first(), &encrypted)?;
        self.local.store_channel_kek(&self.principal, channel, &encrypted)?;
        Ok(kek)
    }

    /// Decrypted DEK for a channel, cached for the session.
    ///
    /// The cache entry is tied to the wrapped DEK on the channel record, so a
    /// re-keyed channel is decrypted afresh.
    pub async fn decrypt_channel_dek(
        &mut self,
        info: &ChannelInfo,
    ) -> Result<SymmetricKey, KeyError> {
        if let Some(cached) = self.dek_cache.get(&info.id) {
            if cached.wrapped == info.dek {
                tracing::debug!(channel = %info.id, "DEK cache hit");
                return Ok(cached.key.clone());
            }
        }

        let kek = self.channel_kek(&info.id).await?;
        let dek = open_channel_dek(&kek, &info.dek)?;

        tracing::debug!(channel = %info.id, "DEK cache miss, decrypted");
        self.dek_cache
            .insert(info.id.clone(), CachedDek { wrapped: info.dek.clone(), key: dek.clone() });
        Ok(dek)
    }

    /// Drop the cached DEK for `channel`.
    pub fn invalidate_channel(&mut self, channel: &ChannelId) {
        if self.dek_cache.remove(channel).is_some() {
            self.emit(KeyEvent::DekInvalidated { channel: channel.clone() });
        }
    }

    /// Generate keys for a new channel under the active master key.
    pub fn generate_channel_key(
        &self,
        managers: &[MemberKey],
    ) -> Result<GeneratedChannelKey, KeyError> {
        let master = self.ready_master_key()?;
        generate_channel_key(&self.env, master, managers)
    }

    /// Create a channel with fresh keys.
    ///
    /// `managers` with a known static key get the KEK sealed to them on the
    /// channel record. The creator's own KEK copy is saved and the DEK cached.
    pub async fn create_channel<D: ChannelDirectory>(
        &mut self,
        directory: &D,
        name: &str,
        managers: &[MemberKey],
    ) -> Result<ChannelId, KeyError> {
        let mut generated = self.generate_channel_key(managers)?;

        let members = managers
            .iter()
            .map(|manager| NewMember {
                principal: manager.principal.clone(),
                role: MemberRole::Manager,
                ecdh: generated.ecdh_requests.remove(&manager.principal),
            })
            .collect();
        let input = CreateChannelInput {
            name: name.to_string(),
            dek: generated.wrapped_dek.clone(),
            members,
        };

        let channel = directory.create_channel(&self.principal, input).await?;
        self.save_channel_kek(&channel, &generated.encrypted_kek).await?;
        self.dek_cache.insert(
            channel.clone(),
            CachedDek { wrapped: generated.wrapped_dek.clone(), key: generated.dek.clone() },
        );

        tracing::info!(channel = %channel, managers = managers.len(), "channel created");
        Ok(channel)
    }

    /// Encrypt a message for a channel under its DEK.
    pub async fn encrypt_message(
        &mut self,
        info: &ChannelInfo,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, KeyError> {
        let dek = self.decrypt_channel_dek(info).await?;
        Ok(dek.encrypt(plaintext, CHANNEL_KEY_AAD, Some(self.env.random_array()))?)
    }

    /// Decrypt a channel message.
    pub async fn decrypt_message(
        &mut self,
        info: &ChannelInfo,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KeyError> {
        let dek = self.decrypt_channel_dek(info).await?;
        Ok(dek.decrypt(ciphertext, CHANNEL_KEY_AAD)?)
    }
}
