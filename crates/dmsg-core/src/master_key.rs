//! Master keys: the user's root symmetric key
//!
//! A master key is a random AES key stored wrapped (`encrypted_secret`) under
//! a KEK derived from two inputs:
//!
//! ```text
//!   KEK = HKDF(ikm = myIV, salt = passwordSecret, info = CBOR[A256GCM, 256, keyId])
//! ```
//!
//! | kind   | passwordSecret        | myIV                                   |
//! |--------|-----------------------|----------------------------------------|
//! | Local  | Argon2id(password)    | random per-device IV (local store)     |
//! | ECDH   | Argon2id(password)    | custodian secret via one-shot ECDH     |
//! | VetKey | empty                 | threshold-derived VetKey output        |
//!
//! The wrapped secret is bound to its owner: AAD is the principal's raw bytes.
//! Keys are never partially mutated. Opening fills the transient key, closing
//! drops it, and replacement happens by appending to the [`MasterKeyRing`].

use std::fmt;

use dmsg_crypto::{
    KEY_SIZE, NONCE_SIZE, PasswordParams, SymmetricKey, derive_a256gcm_key, stretch_password,
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::{error::KeyError, id::Principal};

/// Size of the per-device IV used by Local master keys.
pub const DEVICE_IV_SIZE: usize = 16;

/// How a master key's KEK is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MasterKeyKind {
    /// Password plus a random device IV
    Local,
    /// Password plus a custodian-held secret fetched over ECDH
    Ecdh,
    /// Threshold-derived key material, no password
    VetKey,
}

impl MasterKeyKind {
    /// Whether opening this kind needs a password.
    pub fn uses_password(self) -> bool {
        !matches!(self, Self::VetKey)
    }
}

impl fmt::Display for MasterKeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "Local",
            Self::Ecdh => "ECDH",
            Self::VetKey => "VetKey",
        })
    }
}

/// Inputs to the KEK derivation, one variant per [`MasterKeyKind`].
#[derive(Clone, Copy)]
pub enum KekSource<'a> {
    /// Stretched password and the device IV
    Local {
        /// Argon2id output
        password_secret: &'a [u8],
        /// Per-device random IV
        device_iv: &'a [u8],
    },
    /// Stretched password and the custodian secret
    Ecdh {
        /// Argon2id output
        password_secret: &'a [u8],
        /// Secret released by the custodian
        remote_secret: &'a [u8],
    },
    /// VetKey output
    VetKey {
        /// Threshold-derived key material
        vetkey: &'a [u8],
    },
}

impl<'a> KekSource<'a> {
    /// Source for `kind` from its two derivation inputs. `password_secret`
    /// is ignored for [`MasterKeyKind::VetKey`].
    pub fn new(kind: MasterKeyKind, password_secret: &'a [u8], iv: &'a [u8]) -> Self {
        match kind {
            MasterKeyKind::Local => Self::Local { password_secret, device_iv: iv },
            MasterKeyKind::Ecdh => Self::Ecdh { password_secret, remote_secret: iv },
            MasterKeyKind::VetKey => Self::VetKey { vetkey: iv },
        }
    }

    /// Master key kind this source opens.
    pub fn kind(&self) -> MasterKeyKind {
        match self {
            Self::Local { .. } => MasterKeyKind::Local,
            Self::Ecdh { .. } => MasterKeyKind::Ecdh,
            Self::VetKey { .. } => MasterKeyKind::VetKey,
        }
    }

    /// Password half of the derivation. Empty for VetKey.
    pub fn password_secret(&self) -> &'a [u8] {
        match self {
            Self::Local { password_secret, .. } | Self::Ecdh { password_secret, .. } => {
                password_secret
            },
            Self::VetKey { .. } => &[],
        }
    }

    /// `myIV` half of the derivation.
    pub fn iv(&self) -> &'a [u8] {
        match self {
            Self::Local { device_iv, .. } => device_iv,
            Self::Ecdh { remote_secret, .. } => remote_secret,
            Self::VetKey { vetkey } => vetkey,
        }
    }

    fn derive_kek(&self, key_id: &[u8]) -> Result<SymmetricKey, KeyError> {
        Ok(derive_a256gcm_key(self.iv(), self.password_secret(), key_id)?)
    }
}

impl fmt::Debug for KekSource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KekSource({})", self.kind())
    }
}

/// Stretch `password` in the `salt` namespace.
pub fn stretch(
    password: &str,
    salt: &str,
    params: &PasswordParams,
) -> Result<Zeroizing<[u8; 32]>, KeyError> {
    Ok(stretch_password(password.as_bytes(), salt.as_bytes(), params)?)
}

/// Lifecycle state of the active master key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterKeyState {
    /// No master key on this device
    Uninitialized,
    /// Wrapped secret present, key not in memory
    Closed,
    /// Key in memory, channel operations may proceed
    Opened,
}

/// A master key and its transient opened state.
pub struct MasterKey {
    kind: MasterKeyKind,
    key_id: Vec<u8>,
    version: u32,
    encrypted_secret: Vec<u8>,
    aad: Vec<u8>,
    password_expire_at: u64,
    password_secret: Option<Zeroizing<Vec<u8>>>,
    key: Option<SymmetricKey>,
}

impl MasterKey {
    /// Wrap `material` as a new master key owned by `owner`. The key is
    /// returned opened.
    ///
    /// `password_expire_at` > 0 keeps the stretched password cached until that
    /// wall-clock time. `nonce` must be fresh.
    pub fn create(
        source: KekSource<'_>,
        key_id: &[u8],
        owner: &Principal,
        material: [u8; KEY_SIZE],
        nonce: [u8; NONCE_SIZE],
        password_expire_at: u64,
    ) -> Result<Self, KeyError> {
        let kek = source.derive_kek(key_id)?;
        let secret = Zeroizing::new(material);
        let encrypted_secret = kek.encrypt(secret.as_slice(), owner.as_slice(), Some(nonce))?;

        let mut key = Self {
            kind: source.kind(),
            key_id: key_id.to_vec(),
            version: 1,
            encrypted_secret,
            aad: owner.as_slice().to_vec(),
            password_expire_at: 0,
            password_secret: None,
            key: Some(SymmetricKey::from_bytes(*secret).with_kid(key_id.to_vec())),
        };
        key.cache_password(source, password_expire_at);
        Ok(key)
    }

    /// Rebuild a closed master key from its stored record.
    pub fn from_record(record: &MasterKeyRecord) -> Self {
        let password_secret = if record.password_expire_at > 0 {
            record.cached_password.clone().map(Zeroizing::new)
        } else {
            None
        };

        Self {
            kind: record.kind,
            key_id: record.key_id.clone(),
            version: record.version,
            encrypted_secret: record.encrypted_secret.clone(),
            aad: record.aad.clone(),
            password_expire_at: record.password_expire_at,
            password_secret,
            key: None,
        }
    }

    /// Persistent form. Carries the stretched password only while caching is
    /// enabled.
    pub fn to_record(&self) -> MasterKeyRecord {
        MasterKeyRecord {
            kind: self.kind,
            key_id: self.key_id.clone(),
            version: self.version,
            encrypted_secret: self.encrypted_secret.clone(),
            aad: self.aad.clone(),
            password_expire_at: self.password_expire_at,
            cached_password: self
                .password_secret
                .as_ref()
                .filter(|_| self.password_expire_at > 0)
                .map(|secret| secret.to_vec()),
        }
    }

    /// Unwrap the secret with `source`.
    ///
    /// Opening twice with the same inputs yields the same key.
    ///
    /// # Errors
    ///
    /// - `Protocol`: `source` is for a different kind
    /// - `AuthenticationFailed`: wrong password or IV
    pub fn open(&mut self, source: KekSource<'_>, password_expire_at: u64) -> Result<(), KeyError> {
        if source.kind() != self.kind {
            return Err(KeyError::Protocol(format!(
                "{} master key cannot be opened with a {} source",
                self.kind,
                source.kind()
            )));
        }

        let kek = source.derive_kek(&self.key_id)?;
        let secret = Zeroizing::new(kek.decrypt(&self.encrypted_secret, &self.aad)?);
        self.key = Some(SymmetricKey::from_slice(&secret)?.with_kid(self.key_id.clone()));
        self.cache_password(source, password_expire_at);
        Ok(())
    }

    /// Open with the cached stretched password if it has not expired.
    ///
    /// Returns `Ok(false)` when there is no usable cache; an expired cache is
    /// discarded. `iv` is the kind's `myIV`.
    pub fn try_open(&mut self, iv: &[u8], now_ms: u64) -> Result<bool, KeyError> {
        if !self.has_cached_password(now_ms) {
            self.forget_password();
            return Ok(false);
        }
        let Some(cached) = self.password_secret.clone() else {
            return Ok(false);
        };

        self.open(KekSource::new(self.kind, &cached, iv), self.password_expire_at)?;
        Ok(true)
    }

    /// Whether a stretched password is cached and unexpired at `now_ms`.
    pub fn has_cached_password(&self, now_ms: u64) -> bool {
        self.password_secret.is_some() && now_ms < self.password_expire_at
    }

    /// Discard the cached stretched password.
    pub fn forget_password(&mut self) {
        self.password_secret = None;
        self.password_expire_at = 0;
    }

    /// Drop the opened key. The password cache is kept.
    pub fn close(&mut self) {
        self.key = None;
    }

    fn cache_password(&mut self, source: KekSource<'_>, password_expire_at: u64) {
        if password_expire_at > 0 && source.kind().uses_password() {
            self.password_secret = Some(Zeroizing::new(source.password_secret().to_vec()));
            self.password_expire_at = password_expire_at;
        } else {
            self.password_secret = None;
            self.password_expire_at = 0;
        }
    }

    /// Master key kind.
    pub fn kind(&self) -> MasterKeyKind {
        self.kind
    }

    /// Key id, also the kid of every envelope the key produces.
    pub fn key_id(&self) -> &[u8] {
        &self.key_id
    }

    /// Position in the ring, starting at 1.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    /// Wrapped secret.
    pub fn encrypted_secret(&self) -> &[u8] {
        &self.encrypted_secret
    }

    /// Wall-clock expiry of the password cache, 0 if not cached.
    pub fn password_expire_at(&self) -> u64 {
        self.password_expire_at
    }

    /// Whether this key belongs to `principal`.
    pub fn is_user(&self, principal: &Principal) -> bool {
        self.aad == principal.as_slice()
    }

    /// Whether the key is in memory.
    pub fn is_opened(&self) -> bool {
        self.key.is_some()
    }

    /// The opened key.
    pub fn key(&self) -> Result<&SymmetricKey, KeyError> {
        self.key.as_ref().ok_or(KeyError::MASTER_KEY_NOT_READY)
    }

    /// Encrypt under the opened key.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        aad: &[u8],
        nonce: [u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, KeyError> {
        Ok(self.key()?.encrypt(plaintext, aad, Some(nonce))?)
    }

    /// Decrypt under the opened key.
    pub fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, KeyError> {
        Ok(self.key()?.decrypt(ciphertext, aad)?)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("kind", &self.kind)
            .field("key_id", &String::from_utf8_lossy(&self.key_id))
            .field("version", &self.version)
            .field("opened", &self.is_opened())
            .field("password_expire_at", &self.password_expire_at)
            .finish_non_exhaustive()
    }
}

/// Stored form of a [`MasterKey`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterKeyRecord {
    /// Master key kind
    pub kind: MasterKeyKind,
    /// Key id
    #[serde(with = "serde_bytes")]
    pub key_id: Vec<u8>,
    /// Position in the ring
    pub version: u32,
    /// Wrapped secret
    #[serde(with = "serde_bytes")]
    pub encrypted_secret: Vec<u8>,
    /// Owner's principal bytes
    #[serde(with = "serde_bytes")]
    pub aad: Vec<u8>,
    /// Password cache expiry, 0 if not cached
    pub password_expire_at: u64,
    /// Stretched password, present only while cached
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub cached_password: Option<Vec<u8>>,
}

impl MasterKeyRecord {
    /// CBOR encoding, used when the record is stored remotely.
    pub fn to_cbor(&self) -> Result<Vec<u8>, KeyError> {
        let mut out = Vec::new();
        ciborium::into_writer(self, &mut out)?;
        Ok(out)
    }

    /// Decode a record produced by [`Self::to_cbor`].
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, KeyError> {
        Ok(ciborium::from_reader(bytes)?)
    }
}

impl Drop for MasterKeyRecord {
    fn drop(&mut self) {
        if let Some(cached) = self.cached_password.as_mut() {
            cached.zeroize();
        }
    }
}

impl fmt::Debug for MasterKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKeyRecord")
            .field("kind", &self.kind)
            .field("version", &self.version)
            .field("password_expire_at", &self.password_expire_at)
            .field("cached_password", &self.cached_password.is_some())
            .finish_non_exhaustive()
    }
}

/// Ordered, append-only list of a user's master keys.
///
/// The last key is authoritative for new wraps. Older keys stay so content
/// wrapped before a migration can still be decrypted.
#[derive(Debug, Default)]
pub struct MasterKeyRing {
    keys: Vec<MasterKey>,
}

impl MasterKeyRing {
    /// Empty ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ring of closed keys from stored records, oldest first.
    pub fn from_records(records: &[MasterKeyRecord]) -> Self {
        Self { keys: records.iter().map(MasterKey::from_record).collect() }
    }

    /// Stored form of every key, oldest first.
    pub fn to_records(&self) -> Vec<MasterKeyRecord> {
        self.keys.iter().map(MasterKey::to_record).collect()
    }

    /// Append `key` as the new active key.
    pub fn push(&mut self, mut key: MasterKey) {
        key.set_version(self.keys.last().map_or(1, |last| last.version() + 1));
        self.keys.push(key);
    }

    /// Discard every key and install `key` as the only one.
    pub fn reset(&mut self, key: MasterKey) {
        self.keys.clear();
        self.push(key);
    }

    /// Authoritative key.
    pub fn active(&self) -> Option<&MasterKey> {
        self.keys.last()
    }

    /// Authoritative key, mutably.
    pub fn active_mut(&mut self) -> Option<&mut MasterKey> {
        self.keys.last_mut()
    }

    /// Keys from newest to oldest.
    pub fn iter_newest_first(&self) -> impl Iterator<Item = &MasterKey> {
        self.keys.iter().rev()
    }

    /// Older keys (all but the active one), newest first, mutably.
    pub fn older_mut(&mut self) -> impl Iterator<Item = &mut MasterKey> {
        let older = self.keys.len().saturating_sub(1);
        self.keys[..older].iter_mut().rev()
    }

    /// Older keys still closed, newest first.
    pub fn closed_older(&self) -> impl Iterator<Item = &MasterKey> {
        let older = self.keys.len().saturating_sub(1);
        self.keys[..older].iter().rev().filter(|key| !key.is_opened())
    }

    /// Opened keys from newest to oldest.
    pub fn opened_newest_first(&self) -> impl Iterator<Item = &MasterKey> {
        self.iter_newest_first().filter(|key| key.is_opened())
    }

    /// State of the active key.
    pub fn state(&self) -> MasterKeyState {
        match self.active() {
            None => MasterKeyState::Uninitialized,
            Some(key) if key.is_opened() => MasterKeyState::Opened,
            Some(_) => MasterKeyState::Closed,
        }
    }

    /// Active key exists, belongs to `principal` and is opened.
    pub fn is_ready(&self, principal: &Principal) -> bool {
        self.active().is_some_and(|key| key.is_user(principal) && key.is_opened())
    }

    /// The active key if [`Self::is_ready`].
    pub fn ready_key(&self, principal: &Principal) -> Result<&MasterKey, KeyError> {
        self.active()
            .filter(|key| key.is_user(principal) && key.is_opened())
            .ok_or(KeyError::MASTER_KEY_NOT_READY)
    }

    /// Close every key.
    pub fn close_all(&mut self) {
        self.keys.iter_mut().for_each(MasterKey::close);
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the ring holds no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
