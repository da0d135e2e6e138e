//! Per-user key session
//!
//! A [`KeySession`] owns one user's key state on one device: the master key
//! ring, the in-memory DEK cache and the static ECDH identity key. It talks
//! to the custodial store, the local key store and (for channel operations)
//! a channel directory.
//!
//! Operations are grouped by concern:
//! - this module: master key lifecycle
//! - `channel`: channel KEK storage, DEK cache, message encryption
//! - `exchange`: group key-exchange protocol
//! - `static_key`: static ECDH identity key
//! - `migration`: moving all keys under a new master key

mod channel;
mod exchange;
mod migration;
mod static_key;

use std::collections::HashMap;

use dmsg_crypto::{
    EcdhKeyPair, KEY_SIZE, SymmetricKey, ecdh::unwrap_from, password_hash, verify_password_hash,
};
pub use exchange::ChannelAccess;
pub use migration::{MigrationReport, MigrationTarget};
use tokio::sync::broadcast;
use zeroize::Zeroizing;

use crate::{
    config::KeyConfig,
    env::Environment,
    error::{KeyError, StoreError},
    event::KeyEvent,
    id::{ChannelId, Principal},
    master_key::{
        DEVICE_IV_SIZE, KekSource, MasterKey, MasterKeyKind, MasterKeyRecord, MasterKeyRing,
        MasterKeyState, stretch,
    },
    store::{CustodialStore, EcdhInput, LocalKeyStore, SettingInput, SettingPath},
};

/// Capacity of the event channel. Slow subscribers lag rather than block.
const EVENT_CAPACITY: usize = 64;

/// Custodial key of the published password hash.
const PASSWORD_HASH_KEY: &[u8] = b"password_hash";

/// Custodial key of remotely stored master key records.
const MASTER_KEY_KEY: &[u8] = b"master_key";

/// How a new master key is being installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Install {
    /// First key on this device: must match a published password hash
    Create,
    /// Replaces every key: overwrites the password hash
    Reset,
    /// Appended by migration: overwrites the password hash
    Migrate,
}

/// Inputs that open a master key of one kind.
struct OpenInputs {
    kind: MasterKeyKind,
    iv: Zeroizing<Vec<u8>>,
    stretched: Option<Zeroizing<[u8; 32]>>,
}

impl OpenInputs {
    fn source(&self) -> KekSource<'_> {
        let password_secret = self.stretched.as_ref().map_or(&[][..], |s| &s[..]);
        KekSource::new(self.kind, password_secret, &self.iv)
    }
}

/// A DEK cache entry, valid only for the wrapped DEK it was decrypted from.
struct CachedDek {
    wrapped: Vec<u8>,
    key: SymmetricKey,
}

/// One user's key state on one device.
pub struct KeySession<E: Environment, S: CustodialStore, L: LocalKeyStore> {
    env: E,
    principal: Principal,
    config: KeyConfig,
    store: S,
    local: L,
    master_keys: MasterKeyRing,
    dek_cache: HashMap<ChannelId, CachedDek>,
    static_key: Option<EcdhKeyPair>,
    events: broadcast::Sender<KeyEvent>,
}

impl<E: Environment, S: CustodialStore, L: LocalKeyStore> KeySession<E, S, L> {
    /// Start a session, loading this device's master key records.
    ///
    /// Keys start closed. Call [`Self::open_master_key`] or
    /// [`Self::try_open_master_key`] before channel operations.
    pub fn load(
        env: E,
        principal: Principal,
        config: KeyConfig,
        store: S,
        local: L,
    ) -> Result<Self, KeyError> {
        let records = local.load_master_keys(&principal)?;
        let master_keys = MasterKeyRing::from_records(&records);
        tracing::debug!(principal = %principal, keys = master_keys.len(), "key session loaded");

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            env,
            principal,
            config,
            store,
            local,
            master_keys,
            dek_cache: HashMap::new(),
            static_key: None,
            events,
        })
    }

    /// Session owner.
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Session configuration.
    pub fn config(&self) -> &KeyConfig {
        &self.config
    }

    /// Custodial store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Local key store.
    pub fn local_store(&self) -> &L {
        &self.local
    }

    /// Master key ring.
    pub fn master_keys(&self) -> &MasterKeyRing {
        &self.master_keys
    }

    /// Subscribe to key-state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<KeyEvent> {
        self.events.subscribe()
    }

    /// State of the active master key.
    pub fn master_key_state(&self) -> MasterKeyState {
        self.master_keys.state()
    }

    /// Active master key exists, belongs to this user and is opened.
    pub fn is_ready(&self) -> bool {
        self.master_keys.is_ready(&self.principal)
    }

    /// Drop every opened key and cached DEK. Password caches are kept.
    pub fn lock(&mut self) {
        self.master_keys.close_all();
        self.dek_cache.clear();
        self.static_key = None;
        tracing::debug!(principal = %self.principal, "key session locked");
    }

    /// Create the first master key on this device.
    ///
    /// For ECDH and VetKey kinds an existing remote record is adopted and
    /// opened instead.
    ///
    /// The key is installed on this device only after it has been opened
    /// and published, so a failed call can be retried as is.
    ///
    /// # Errors
    ///
    /// - `InvalidPassword`: another device published a password hash this
    ///   password does not match. Nothing is written.
    /// - `AuthenticationFailed`: the adopted remote key does not open with
    ///   this password
    /// - `Protocol`: this device already has a master key
    pub async fn set_master_key(
        &mut self,
        kind: MasterKeyKind,
        password: &str,
    ) -> Result<(), KeyError> {
        if !self.master_keys.is_empty() {
            return Err(KeyError::Protocol(
                "master key already set; reset or migrate instead".to_string(),
            ));
        }

        if kind != MasterKeyKind::Local {
            if let Some(mut remote) = self.fetch_remote_master_key().await? {
                let inputs = self.open_inputs(remote.kind(), password).await?;
                remote.open(inputs.source(), self.password_expire_at())?;
                let kind = remote.kind();

                self.master_keys.push(remote);
                self.persist_master_keys()?;

                let version = self.master_keys.active().map_or(1, MasterKey::version);
                tracing::info!(principal = %self.principal, %kind, version, "adopted remote master key");
                self.emit(KeyEvent::MasterKeyOpened { kind, version });
                return Ok(());
            }
        }

        let material = Zeroizing::new(self.env.random_array::<KEY_SIZE>());
        let key = self.new_master_key(kind, password, *material, Install::Create).await?;
        self.publish_master_record(&key).await?;

        self.master_keys.push(key);
        self.persist_master_keys()?;

        let version = self.master_keys.active().map_or(1, MasterKey::version);
        tracing::info!(principal = %self.principal, %kind, version, "master key created");
        self.emit(KeyEvent::MasterKeyOpened { kind, version });
        Ok(())
    }

    /// Replace every master key with a new one.
    ///
    /// Channel KEKs wrapped under the discarded keys become undecryptable
    /// unless re-wrapped first. The static key, if loaded, is re-wrapped.
    pub async fn reset_master_key(
        &mut self,
        kind: MasterKeyKind,
        password: &str,
    ) -> Result<(), KeyError> {
        let material = Zeroizing::new(self.env.random_array::<KEY_SIZE>());
        let key = self.new_master_key(kind, password, *material, Install::Reset).await?;
        self.publish_master_record(&key).await?;

        self.master_keys.reset(key);
        self.dek_cache.clear();
        self.persist_master_keys()?;

        if let Some(pair) = self.static_key.as_ref() {
            if let Err(err) = self.save_static_key(pair).await {
                tracing::warn!(principal = %self.principal, error = %err, "static key not re-wrapped after reset");
            }
        }

        tracing::info!(principal = %self.principal, %kind, "master keys reset");
        self.emit(KeyEvent::MasterKeyReset { kind });
        Ok(())
    }

    /// Open the active master key.
    ///
    /// `password` is ignored for VetKey keys. Older keys of the same kind are
    /// opened too when they share the same inputs.
    ///
    /// # Errors
    ///
    /// - `NotReady`: no master key on this device or remotely
    /// - `AuthenticationFailed`: wrong password
    pub async fn open_master_key(&mut self, password: &str) -> Result<(), KeyError> {
        if self.master_keys.is_empty() {
            self.adopt_remote_master_key().await?;
        }
        let kind = self
            .master_keys
            .active()
            .map(MasterKey::kind)
            .ok_or(KeyError::MASTER_KEY_NOT_READY)?;

        let inputs = self.open_inputs(kind, password).await?;
        let source = inputs.source();
        let expire_at = self.password_expire_at();

        let Some(active) = self.master_keys.active_mut() else {
            return Err(KeyError::MASTER_KEY_NOT_READY);
        };
        active.open(source, expire_at)?;
        let version = active.version();

        for older in self.master_keys.older_mut().filter(|key| key.kind() == kind) {
            if let Err(err) = older.open(source, 0) {
                tracing::debug!(version = older.version(), error = %err, "older master key stays closed");
            }
        }

        self.persist_master_keys()?;
        tracing::info!(principal = %self.principal, %kind, version, "master key opened");
        self.emit(KeyEvent::MasterKeyOpened { kind, version });
        Ok(())
    }

    /// Open the active master key without user input.
    ///
    /// Uses the cached stretched password (Local, ECDH) or the VetKey. Every
    /// failure is logged and reported as `false`.
    pub async fn try_open_master_key(&mut self) -> bool {
        match self.try_open_inner().await {
            Ok(opened) => opened,
            Err(err) => {
                tracing::warn!(principal = %self.principal, error = %err, "opportunistic master key open failed");
                false
            },
        }
    }

    /// Open closed older master keys.
    ///
    /// After a restart only the active key and older keys of its kind are
    /// opened. Channels and the static key left under a key of another kind
    /// by an interrupted migration stay unreadable until this is called.
    /// `password` is ignored for VetKey keys. Returns how many keys were
    /// opened.
    ///
    /// # Errors
    ///
    /// - `NotReady`: active master key not opened
    /// - `AuthenticationFailed`: closed older keys exist and none opened
    pub async fn open_previous_master_keys(&mut self, password: &str) -> Result<usize, KeyError> {
        self.ready_master_key()?;
        let kinds = self.closed_older_kinds();
        if kinds.is_empty() {
            return Ok(0);
        }

        let expire_at = self.password_expire_at();
        let mut opened = 0;
        for kind in kinds {
            let inputs = self.open_inputs(kind, password).await?;
            let source = inputs.source();
            for older in self.master_keys.older_mut().filter(|key| key.kind() == kind) {
                if older.is_opened() {
                    continue;
                }
                match older.open(source, expire_at) {
                    Ok(()) => opened += 1,
                    Err(err) => {
                        tracing::debug!(version = older.version(), error = %err, "older master key stays closed");
                    },
                }
            }
        }

        if opened == 0 {
            return Err(KeyError::AuthenticationFailed);
        }
        self.persist_master_keys()?;
        tracing::info!(principal = %self.principal, opened, "previous master keys opened");
        Ok(opened)
    }

    async fn try_open_inner(&mut self) -> Result<bool, KeyError> {
        if self.master_keys.is_empty() && !self.adopt_remote_master_key().await? {
            return Ok(false);
        }
        let now = self.env.wall_clock_ms();
        if !self.try_open_active(now).await? {
            return Ok(false);
        }
        self.try_open_older(now).await;
        Ok(true)
    }

    async fn try_open_active(&mut self, now: u64) -> Result<bool, KeyError> {
        let Some(active) = self.master_keys.active() else {
            return Ok(false);
        };
        if active.is_opened() {
            return Ok(true);
        }

        let kind = active.kind();
        if kind.uses_password() && !active.has_cached_password(now) {
            if let Some(active) = self.master_keys.active_mut() {
                active.forget_password();
            }
            self.persist_master_keys()?;
            return Ok(false);
        }

        let iv = self.kind_iv(kind).await?;
        let Some(active) = self.master_keys.active_mut() else {
            return Ok(false);
        };
        let opened = if kind.uses_password() {
            active.try_open(&iv, now)?
        } else {
            active.open(KekSource::VetKey { vetkey: &iv }, 0)?;
            true
        };

        if opened {
            let version = active.version();
            tracing::info!(principal = %self.principal, %kind, version, "master key opened from cache");
            self.emit(KeyEvent::MasterKeyOpened { kind, version });
        }
        Ok(opened)
    }

    /// Open closed older keys that need no user input: VetKey keys and keys
    /// with an unexpired password cache. Failures leave them closed.
    async fn try_open_older(&mut self, now: u64) {
        for kind in self.closed_older_kinds() {
            let usable = self.master_keys.closed_older().any(|key| {
                key.kind() == kind && (!kind.uses_password() || key.has_cached_password(now))
            });
            if !usable {
                continue;
            }

            let iv = match self.kind_iv(kind).await {
                Ok(iv) => iv,
                Err(err) => {
                    tracing::debug!(%kind, error = %err, "older master keys stay closed");
                    continue;
                },
            };
            for older in self.master_keys.older_mut().filter(|key| key.kind() == kind) {
                if older.is_opened() {
                    continue;
                }
                let result = if kind.uses_password() {
                    older.try_open(&iv, now).map(|_| ())
                } else {
                    older.open(KekSource::VetKey { vetkey: &iv }, 0)
                };
                if let Err(err) = result {
                    tracing::debug!(version = older.version(), error = %err, "older master key stays closed");
                }
            }
        }

        if let Err(err) = self.persist_master_keys() {
            tracing::warn!(principal = %self.principal, error = %err, "master key records not persisted");
        }
    }

    /// Distinct kinds of the closed older keys, newest first.
    fn closed_older_kinds(&self) -> Vec<MasterKeyKind> {
        let mut kinds = Vec::new();
        for key in self.master_keys.closed_older() {
            if !kinds.contains(&key.kind()) {
                kinds.push(key.kind());
            }
        }
        kinds
    }

    /// Build a new opened master key of `kind` wrapping `material`.
    async fn new_master_key(
        &self,
        kind: MasterKeyKind,
        password: &str,
        material: [u8; KEY_SIZE],
        install: Install,
    ) -> Result<MasterKey, KeyError> {
        let stretched = self.stretch_for(kind, password)?;
        let published = match stretched {
            Some(_) => self.fetch_password_hash().await?,
            None => None,
        };

        if let (Some(stretched), Some(expected), Install::Create) =
            (stretched.as_ref(), published.as_ref(), install)
        {
            if !verify_password_hash(&stretched[..], &self.config.master_key_id, expected) {
                tracing::warn!(principal = %self.principal, "password does not match published hash");
                return Err(KeyError::InvalidPassword);
            }
        }

        let iv = self.kind_iv(kind).await?;
        let password_secret: &[u8] = stretched.as_ref().map_or(&[][..], |s| &s[..]);
        let key = MasterKey::create(
            KekSource::new(kind, password_secret, &iv),
            &self.config.master_key_id,
            &self.principal,
            material,
            self.env.random_array(),
            self.password_expire_at(),
        )?;

        if let Some(stretched) = stretched.as_ref() {
            if install != Install::Create || published.is_none() {
                self.publish_password_hash(&stretched[..]).await?;
            }
        }
        Ok(key)
    }

    fn stretch_for(
        &self,
        kind: MasterKeyKind,
        password: &str,
    ) -> Result<Option<Zeroizing<[u8; 32]>>, KeyError> {
        if !kind.uses_password() {
            return Ok(None);
        }
        stretch(password, &self.principal.to_text(), &self.config.password_params).map(Some)
    }

    async fn open_inputs(
        &self,
        kind: MasterKeyKind,
        password: &str,
    ) -> Result<OpenInputs, KeyError> {
        Ok(OpenInputs {
            kind,
            iv: self.kind_iv(kind).await?,
            stretched: self.stretch_for(kind, password)?,
        })
    }

    fn password_expire_at(&self) -> u64 {
        match self.config.password_ttl_ms {
            0 => 0,
            ttl => self.env.wall_clock_ms().saturating_add(ttl),
        }
    }

    /// `myIV` for a master key of `kind`.
    async fn kind_iv(&self, kind: MasterKeyKind) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        match kind {
            MasterKeyKind::Local => self.device_iv().map(Zeroizing::new),
            MasterKeyKind::Ecdh => self.fetch_remote_secret().await,
            MasterKeyKind::VetKey => {
                let path = self.setting_path(self.config.master_key_id.clone());
                Ok(Zeroizing::new(self.store.vetkey(&path).await?))
            },
        }
    }

    /// This device's IV, created on first use.
    fn device_iv(&self) -> Result<Vec<u8>, KeyError> {
        if let Some(iv) = self.local.load_device_iv(&self.principal)? {
            return Ok(iv);
        }
        let iv = self.env.random_array::<DEVICE_IV_SIZE>().to_vec();
        self.local.store_device_iv(&self.principal, &iv)?;
        tracing::debug!(principal = %self.principal, "device IV created");
        Ok(iv)
    }

    /// Custodian-held secret via the one-shot ECDH exchange.
    async fn fetch_remote_secret(&self) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        let ephemeral = EcdhKeyPair::from_secret_bytes(self.env.random_array());
        let nonce = self.env.random_array();
        let path = self.setting_path(self.config.master_key_id.clone());

        let remote = self
            .store
            .ecdh_cose_encrypted_key(&path, EcdhInput { public_key: ephemeral.public_key(), nonce })
            .await?;
        Ok(unwrap_from(&ephemeral, &remote, &nonce, &[])?)
    }

    async fn fetch_password_hash(&self) -> Result<Option<Vec<u8>>, KeyError> {
        match self.store.get(&self.setting_path(PASSWORD_HASH_KEY), false).await {
            Ok(setting) => Ok(setting.payload),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn publish_password_hash(&self, stretched: &[u8]) -> Result<(), KeyError> {
        let hash = password_hash(stretched, &self.config.master_key_id);
        self.store
            .upsert(&self.setting_path(PASSWORD_HASH_KEY), SettingInput::payload(hash.to_vec()))
            .await?;
        Ok(())
    }

    /// Write the active master record to the custodial store.
    async fn publish_master_key(&self) -> Result<(), KeyError> {
        match self.master_keys.active() {
            Some(active) => self.publish_master_record(active).await,
            None => Ok(()),
        }
    }

    /// Write an ECDH or VetKey master record to the custodial store. Local
    /// records stay on the device.
    async fn publish_master_record(&self, key: &MasterKey) -> Result<(), KeyError> {
        if key.kind() == MasterKeyKind::Local {
            return Ok(());
        }

        let mut record = key.to_record();
        record.cached_password = None;
        let input = SettingInput {
            payload: Some(record.to_cbor()?),
            desc: Some(format!("{} master key", key.kind())),
            ..SettingInput::default()
        };
        self.store.upsert(&self.setting_path(MASTER_KEY_KEY), input).await?;
        Ok(())
    }

    /// The remotely stored master record, closed.
    async fn fetch_remote_master_key(&self) -> Result<Option<MasterKey>, KeyError> {
        let setting = match self.store.get(&self.setting_path(MASTER_KEY_KEY), false).await {
            Ok(setting) => setting,
            Err(StoreError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Some(payload) = setting.payload else {
            return Ok(None);
        };

        let record = MasterKeyRecord::from_cbor(&payload)?;
        if record.aad != self.principal.as_slice() {
            return Err(KeyError::Protocol("remote master key belongs to another user".to_string()));
        }
        Ok(Some(MasterKey::from_record(&record)))
    }

    /// Install the remotely stored master record, if any, closed.
    async fn adopt_remote_master_key(&mut self) -> Result<bool, KeyError> {
        let Some(remote) = self.fetch_remote_master_key().await? else {
            return Ok(false);
        };
        let kind = remote.kind();

        self.master_keys.push(remote);
        self.persist_master_keys()?;
        tracing::info!(principal = %self.principal, %kind, "adopted remote master key");
        Ok(true)
    }

    fn persist_master_keys(&self) -> Result<(), KeyError> {
        self.local.store_master_keys(&self.principal, &self.master_keys.to_records())?;
        Ok(())
    }

    fn ready_master_key(&self) -> Result<&MasterKey, KeyError> {
        self.master_keys.ready_key(&self.principal)
    }

    fn setting_path(&self, key: impl Into<Vec<u8>>) -> SettingPath {
        SettingPath::new(self.config.namespace.clone(), key, &self.principal)
    }

    fn emit(&self, event: KeyEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
