//! In-memory stores for testing and simulation
//!
//! [`MemoryCustodialStore`] plays the remote custodian: versioned settings,
//! the ECDH exchange and per-path VetKeys. Custodian-held secrets are derived
//! from a root secret with HMAC, so every call for the same path returns the
//! same secret, as a real custodian would.
//!
//! [`MemoryKeyStore`] is the on-device store.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use dmsg_crypto::{EcdhKeyPair, EcdhRemote, ecdh};
use hmac::{Hmac, Mac};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha2::Sha256;

use super::{CustodialStore, EcdhInput, LocalKeyStore, Setting, SettingInput, SettingPath};
use crate::{
    error::StoreError,
    id::{ChannelId, Principal},
    master_key::MasterKeyRecord,
};

type HmacSha256 = Hmac<Sha256>;

/// Settings map key: namespace, subject, raw key.
type SettingKey = (String, Option<Principal>, Vec<u8>);

/// In-memory custodial store.
///
/// All state is wrapped in `Arc<Mutex<>>`, so clones share one custodian.
/// Writes are versioned: every `create`/`upsert` appends a version and `get`
/// returns the latest unless a version is requested.
#[derive(Clone)]
pub struct MemoryCustodialStore {
    inner: Arc<Mutex<CustodialInner>>,
}

struct CustodialInner {
    /// Setting history per key, oldest first. Version n is at index n - 1.
    settings: HashMap<SettingKey, Vec<Setting>>,

    /// Root of every custodian-held secret
    root_secret: [u8; 32],

    /// Ephemeral keys and response nonces for the ECDH exchange
    rng: ChaCha20Rng,

    /// Fail every call with `Unavailable`
    offline: bool,

    /// Number of calls served, failed or not
    call_count: usize,
}

impl MemoryCustodialStore {
    /// Create a custodian whose secrets and ephemeral keys derive from `seed`.
    pub fn with_seed(seed: u64) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let mut root_secret = [0u8; 32];
        rng.fill_bytes(&mut root_secret);

        Self {
            inner: Arc::new(Mutex::new(CustodialInner {
                settings: HashMap::new(),
                root_secret,
                rng,
                offline: false,
                call_count: 0,
            })),
        }
    }

    /// Simulate a network partition: while offline every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.offline = offline;
        }
    }

    /// Number of calls made against this store.
    pub fn call_count(&self) -> usize {
        self.inner.lock().map_or(0, |inner| inner.call_count)
    }

    /// Number of versions stored under `path`, 0 if absent.
    pub fn version_count(&self, path: &SettingPath) -> usize {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.settings.get(&setting_key(path)).map(Vec::len))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, CustodialInner>, StoreError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("custodian lock poisoned: {e}")))?;

        inner.call_count += 1;
        if inner.offline {
            return Err(StoreError::Unavailable("custodian offline".to_string()));
        }
        Ok(inner)
    }
}

impl CustodialInner {
    /// Deterministic custodian secret for `path` under `label`.
    fn derive_secret(&self, label: &[u8], path: &SettingPath) -> [u8; 32] {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.root_secret) else {
            unreachable!("HMAC accepts keys of any length");
        };

        for part in [
            label,
            path.namespace.as_bytes(),
            path.subject.as_ref().map_or(&[][..], Principal::as_slice),
            &path.key,
        ] {
            mac.update(&(part.len() as u32).to_be_bytes());
            mac.update(part);
        }

        let mut secret = [0u8; 32];
        secret.copy_from_slice(&mac.finalize().into_bytes());
        secret
    }

    fn push_version(&mut self, path: &SettingPath, input: SettingInput) -> u32 {
        let history = self.settings.entry(setting_key(path)).or_default();
        let version = history.len() as u32 + 1;
        history.push(Setting { dek: input.dek, payload: input.payload, version });
        version
    }
}

fn setting_key(path: &SettingPath) -> SettingKey {
    (path.namespace.clone(), path.subject.clone(), path.key.clone())
}

fn not_found(path: &SettingPath) -> StoreError {
    StoreError::NotFound { namespace: path.namespace.clone(), key: hex::encode(&path.key) }
}

#[async_trait::async_trait]
impl CustodialStore for MemoryCustodialStore {
    async fn get(&self, path: &SettingPath, versioned: bool) -> Result<Setting, StoreError> {
        let inner = self.lock()?;
        let history = inner.settings.get(&setting_key(path)).ok_or_else(|| not_found(path))?;

        let setting = if versioned && path.version > 0 {
            history.get(path.version as usize - 1)
        } else {
            history.last()
        };

        setting.cloned().ok_or_else(|| not_found(path))
    }

    async fn create(&self, path: &SettingPath, input: SettingInput) -> Result<u32, StoreError> {
        let mut inner = self.lock()?;
        if inner.settings.contains_key(&setting_key(path)) {
            return Err(StoreError::AlreadyExists {
                namespace: path.namespace.clone(),
                key: hex::encode(&path.key),
            });
        }
        Ok(inner.push_version(path, input))
    }

    async fn upsert(&self, path: &SettingPath, input: SettingInput) -> Result<u32, StoreError> {
        let mut inner = self.lock()?;
        Ok(inner.push_version(path, input))
    }

    async fn ecdh_cose_encrypted_key(
        &self,
        path: &SettingPath,
        input: EcdhInput,
    ) -> Result<EcdhRemote, StoreError> {
        let mut inner = self.lock()?;
        let secret = inner.derive_secret(b"ecdh", path);

        let mut scalar = [0u8; 32];
        inner.rng.fill_bytes(&mut scalar);
        let ephemeral = EcdhKeyPair::from_secret_bytes(scalar);

        let mut nonce = [0u8; 12];
        inner.rng.fill_bytes(&mut nonce);

        ecdh::wrap_for(&input.public_key, &ephemeral, &input.nonce, &secret, &[], Some(nonce))
            .map_err(|e| StoreError::Rejected(format!("ecdh exchange: {e}")))
    }

    async fn vetkey(&self, path: &SettingPath) -> Result<Vec<u8>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.derive_secret(b"vetkey", path).to_vec())
    }
}

/// In-memory device store.
///
/// Clones share state, so two sessions built from clones behave like two app
/// launches on the same device.
#[derive(Clone, Default)]
pub struct MemoryKeyStore {
    inner: Arc<Mutex<LocalInner>>,
}

#[derive(Default)]
struct LocalInner {
    master_keys: HashMap<Principal, Vec<MasterKeyRecord>>,
    device_ivs: HashMap<Principal, Vec<u8>>,
    channel_keks: HashMap<(Principal, ChannelId), Vec<u8>>,
}

impl MemoryKeyStore {
    /// Create an empty device store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, LocalInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("local store lock poisoned: {e}")))
    }
}

impl LocalKeyStore for MemoryKeyStore {
    fn load_master_keys(&self, user: &Principal) -> Result<Vec<MasterKeyRecord>, StoreError> {
        Ok(self.lock()?.master_keys.get(user).cloned().unwrap_or_default())
    }

    fn store_master_keys(
        &self,
        user: &Principal,
        records: &[MasterKeyRecord],
    ) -> Result<(), StoreError> {
        self.lock()?.master_keys.insert(user.clone(), records.to_vec());
        Ok(())
    }

    fn load_device_iv(&self, user: &Principal) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock()?.device_ivs.get(user).cloned())
    }

    fn store_device_iv(&self, user: &Principal, iv: &[u8]) -> Result<(), StoreError> {
        self.lock()?.device_ivs.insert(user.clone(), iv.to_vec());
        Ok(())
    }

    fn load_channel_kek(
        &self,
        user: &Principal,
        channel: &ChannelId,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock()?.channel_keks.get(&(user.clone(), channel.clone())).cloned())
    }

    fn store_channel_kek(
        &self,
        user: &Principal,
        channel: &ChannelId,
        encrypted_kek: &[u8],
    ) -> Result<(), StoreError> {
        self.lock()?.channel_keks.insert((user.clone(), channel.clone()), encrypted_kek.to_vec());
        Ok(())
    }
}
