//! Storage abstractions for key material
//!
//! Two stores with different trust and latency profiles:
//!
//! - [`CustodialStore`]: the remote key-value service holding wrapped secrets
//!   on the user's behalf. Async, because every call is a remote round trip.
//!   Every response is untrusted input and is AEAD-authenticated before use.
//! - [`LocalKeyStore`]: on-device persistence for master key records, the
//!   device IV and cached channel KEKs. Synchronous, like any local storage
//!   backend.

mod chaotic;
mod memory;

pub use chaotic::ChaoticStore;
use dmsg_crypto::{EcdhRemote, NONCE_SIZE, PUBLIC_KEY_SIZE};
pub use memory::{MemoryCustodialStore, MemoryKeyStore};

use crate::{
    error::StoreError,
    id::{ChannelId, Principal},
    master_key::MasterKeyRecord,
};

/// Address of a custodial setting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SettingPath {
    /// Namespace the setting lives in
    pub namespace: String,
    /// Raw setting key
    pub key: Vec<u8>,
    /// Owner of the setting. `None` addresses a namespace-wide setting.
    pub subject: Option<Principal>,
    /// Version to fetch when reading versioned. 0 means latest.
    pub version: u32,
}

impl SettingPath {
    /// Path to the latest version of `key` owned by `subject`.
    pub fn new(namespace: impl Into<String>, key: impl Into<Vec<u8>>, subject: &Principal) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
            subject: Some(subject.clone()),
            version: 0,
        }
    }

    /// Same path pinned to a specific version.
    #[must_use]
    pub fn at_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}

/// A stored setting as returned by [`CustodialStore::get`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Setting {
    /// Wrapped data key, if the setting carries one
    pub dek: Option<Vec<u8>>,
    /// Setting payload
    pub payload: Option<Vec<u8>>,
    /// Version of this value (starts at 1)
    pub version: u32,
}

/// Value written by [`CustodialStore::create`] and [`CustodialStore::upsert`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SettingInput {
    /// Wrapped data key
    pub dek: Option<Vec<u8>>,
    /// Setting payload
    pub payload: Option<Vec<u8>>,
    /// Free-form tags
    pub tags: Vec<(String, String)>,
    /// Human-readable description
    pub desc: Option<String>,
}

impl SettingInput {
    /// Input carrying only a payload.
    pub fn payload(payload: impl Into<Vec<u8>>) -> Self {
        Self { payload: Some(payload.into()), ..Self::default() }
    }
}

/// Client half of the one-shot ECDH exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcdhInput {
    /// Client's ephemeral public key
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// Fresh nonce, used as HKDF salt by both sides
    pub nonce: [u8; NONCE_SIZE],
}

/// Remote custodial key-value store.
///
/// "Not found" is reported as [`StoreError::NotFound`] and is a recoverable
/// condition: callers use it to trigger first-time initialisation.
#[async_trait::async_trait]
pub trait CustodialStore: Send + Sync {
    /// Fetch a setting. With `versioned` set, `path.version` selects the
    /// version (0 still means latest).
    async fn get(&self, path: &SettingPath, versioned: bool) -> Result<Setting, StoreError>;

    /// First write of a setting.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` if the key is already present
    async fn create(&self, path: &SettingPath, input: SettingInput) -> Result<u32, StoreError>;

    /// Create or replace a setting. Returns the new version.
    async fn upsert(&self, path: &SettingPath, input: SettingInput) -> Result<u32, StoreError>;

    /// One-shot ECDH exchange for a custodian-held secret.
    ///
    /// The custodian agrees with `input.public_key` using a fresh ephemeral
    /// key and returns its public half with the secret sealed under a key
    /// derived from the shared point and `input.nonce`.
    async fn ecdh_cose_encrypted_key(
        &self,
        path: &SettingPath,
        input: EcdhInput,
    ) -> Result<EcdhRemote, StoreError>;

    /// Threshold-derived key material for `path`.
    async fn vetkey(&self, path: &SettingPath) -> Result<Vec<u8>, StoreError>;
}

/// On-device key storage.
///
/// Must be Clone (shared between sessions of the same device), Send + Sync,
/// and synchronous. Implementations typically share internal state via Arc,
/// so clones access the same underlying storage.
pub trait LocalKeyStore: Clone + Send + Sync + 'static {
    /// Master key records for `user`, oldest first. Empty if none.
    fn load_master_keys(&self, user: &Principal) -> Result<Vec<MasterKeyRecord>, StoreError>;

    /// Replace all master key records for `user`.
    fn store_master_keys(
        &self,
        user: &Principal,
        records: &[MasterKeyRecord],
    ) -> Result<(), StoreError>;

    /// Device IV for `user`, if one was created on this device.
    fn load_device_iv(&self, user: &Principal) -> Result<Option<Vec<u8>>, StoreError>;

    /// Persist the device IV. Called once per device and user.
    fn store_device_iv(&self, user: &Principal, iv: &[u8]) -> Result<(), StoreError>;

    /// Cached encrypted KEK for a channel.
    fn load_channel_kek(
        &self,
        user: &Principal,
        channel: &ChannelId,
    ) -> Result<Option<Vec<u8>>, StoreError>;

    /// Cache an encrypted KEK, overwriting any previous entry.
    fn store_channel_kek(
        &self,
        user: &Principal,
        channel: &ChannelId,
        encrypted_kek: &[u8],
    ) -> Result<(), StoreError>;
}
