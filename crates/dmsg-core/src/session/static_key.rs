//! Static ECDH identity key
//!
//! A long-lived X25519 key pair per user. The private half is stored in the
//! custodial store wrapped under the active master key (AAD = principal); the
//! public half is published so managers can seal KEKs to it.

use dmsg_crypto::{EcdhKeyPair, PUBLIC_KEY_SIZE};
use zeroize::Zeroizing;

use super::KeySession;
use crate::{
    env::Environment,
    error::{KeyError, StoreError},
    event::KeyEvent,
    id::Principal,
    store::{CustodialStore, LocalKeyStore, SettingInput, SettingPath},
};

/// Custodial key of the wrapped static private key.
const STATIC_KEY_KEY: &[u8] = b"ecdh_static";

/// Custodial key of the published static public key.
const STATIC_PUB_KEY: &[u8] = b"ecdh_pub";

/// How the stored static key was recovered.
pub(super) enum Recovered {
    /// Decrypted under the active master key
    Current(EcdhKeyPair),
    /// Decrypted under an older master key, needs re-wrapping
    Previous(EcdhKeyPair),
    /// Absent or undecryptable
    Missing,
}

impl<E: Environment, S: CustodialStore, L: LocalKeyStore> KeySession<E, S, L> {
    /// Load the static key, creating or rotating it as needed.
    ///
    /// A key wrapped under an older opened master key is re-wrapped under the
    /// active one. A key no master key in the ring can decrypt is replaced by
    /// a new one and the new public key published. Returns the public key.
    ///
    /// # Errors
    ///
    /// - `NotReady`: master key not opened, or the stored key does not open
    ///   under any opened key while older keys are still closed. Nothing is
    ///   rotated; open them with [`Self::open_previous_master_keys`].
    pub async fn load_static_key(&mut self) -> Result<[u8; PUBLIC_KEY_SIZE], KeyError> {
        let recovered = self.recover_static_key().await?;

        let pair = match recovered {
            Recovered::Current(pair) => pair,
            Recovered::Previous(pair) => {
                self.save_static_key(&pair).await?;
                tracing::info!(principal = %self.principal, "static key re-wrapped under active master key");
                pair
            },
            Recovered::Missing => {
                let pair = EcdhKeyPair::from_secret_bytes(self.env.random_array());
                self.save_static_key(&pair).await?;
                tracing::info!(principal = %self.principal, "static key rotated");
                self.emit(KeyEvent::StaticKeyRotated { public_key: pair.public_key() });
                pair
            },
        };

        let public_key = pair.public_key();
        self.static_key = Some(pair);
        Ok(public_key)
    }

    pub(super) async fn recover_static_key(&self) -> Result<Recovered, KeyError> {
        let active = self.ready_master_key()?;

        let payload = match self.store.get(&self.setting_path(STATIC_KEY_KEY), false).await {
            Ok(setting) => setting.payload,
            Err(StoreError::NotFound { .. }) => None,
            Err(err) => return Err(err.into()),
        };
        let Some(payload) = payload else {
            return Ok(Recovered::Missing);
        };

        let aad = self.principal.as_slice();
        match active.decrypt(&payload, aad) {
            Ok(secret) => {
                let secret = Zeroizing::new(secret);
                return Ok(Recovered::Current(EcdhKeyPair::from_secret_slice(&secret)?));
            },
            Err(KeyError::AuthenticationFailed) => {},
            Err(err) => return Err(err),
        }

        for older in self.master_keys.opened_newest_first().skip(1) {
            if let Ok(secret) = older.decrypt(&payload, aad) {
                let secret = Zeroizing::new(secret);
                return Ok(Recovered::Previous(EcdhKeyPair::from_secret_slice(&secret)?));
            }
        }

        if self.master_keys.closed_older().next().is_some() {
            tracing::debug!(principal = %self.principal, "static key may be under a closed older master key");
            return Err(KeyError::PREVIOUS_MASTER_KEY_NOT_READY);
        }

        tracing::warn!(principal = %self.principal, "stored static key undecryptable under every master key");
        Ok(Recovered::Missing)
    }

    /// Wrap `pair` under the active master key and publish its public half.
    pub(super) async fn save_static_key(&self, pair: &EcdhKeyPair) -> Result<(), KeyError> {
        let active = self.ready_master_key()?;
        let secret = pair.secret_bytes();
        let wrapped =
            active.encrypt(secret.as_slice(), self.principal.as_slice(), self.env.random_array())?;

        self.store
            .upsert(&self.setting_path(STATIC_KEY_KEY), SettingInput::payload(wrapped))
            .await?;
        self.store
            .upsert(
                &self.setting_path(STATIC_PUB_KEY),
                SettingInput::payload(pair.public_key().to_vec()),
            )
            .await?;
        Ok(())
    }

    /// This user's static public key, if loaded.
    pub fn static_public_key(&self) -> Option<[u8; PUBLIC_KEY_SIZE]> {
        self.static_key.as_ref().map(EcdhKeyPair::public_key)
    }

    /// Published static public key of `user`, if any.
    pub async fn fetch_static_public_key(
        &self,
        user: &Principal,
    ) -> Result<Option<[u8; PUBLIC_KEY_SIZE]>, KeyError> {
        let path = SettingPath::new(self.config.namespace.clone(), STATIC_PUB_KEY, user);
        let payload = match self.store.get(&path, false).await {
            Ok(setting) => setting.payload,
            Err(StoreError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        payload
            .map(|bytes| {
                <[u8; PUBLIC_KEY_SIZE]>::try_from(bytes.as_slice()).map_err(|_| {
                    KeyError::Protocol(format!("{user} published a malformed static key"))
                })
            })
            .transpose()
    }
}
