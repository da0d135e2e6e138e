//! End-to-end self-test against in-memory collaborators.
//!
//! Runs the fixed-input key hierarchy scenario, then a two-user session flow:
//! Local master key, channel creation, key exchange, messaging and migration
//! to a VetKey master key.

use dmsg_core::{
    ChannelAccess, ChannelDirectory, Environment, KeyConfig, KeyError, KeySession, MasterKey,
    MasterKeyKind, MemoryChannelDirectory, MigrationTarget, Principal, SimEnv,
    channel_key::{CHANNEL_KEY_AAD, MemberKey, generate_channel_key, open_channel_dek},
    master_key::{KekSource, stretch},
    store::{MemoryCustodialStore, MemoryKeyStore},
};
use dmsg_crypto::PasswordParams;

/// A self-test step failed.
#[derive(Debug, thiserror::Error)]
pub enum SelftestError {
    /// A key operation returned an error
    #[error("{step}: {source}")]
    Key {
        /// Step that failed
        step: &'static str,
        /// Underlying error
        #[source]
        source: KeyError,
    },
    /// A check did not hold
    #[error("check failed: {0}")]
    Check(&'static str),
}

type Session = KeySession<SimEnv, MemoryCustodialStore, MemoryKeyStore>;

trait Step<T> {
    fn step(self, step: &'static str) -> Result<T, SelftestError>;
}

impl<T, E: Into<KeyError>> Step<T> for Result<T, E> {
    fn step(self, step: &'static str) -> Result<T, SelftestError> {
        self.map_err(|err| SelftestError::Key { step, source: err.into() })
    }
}

fn check(holds: bool, what: &'static str) -> Result<(), SelftestError> {
    if holds { Ok(()) } else { Err(SelftestError::Check(what)) }
}

/// Run every scenario.
pub async fn run(seed: u64, params: PasswordParams) -> Result<(), SelftestError> {
    hierarchy(seed, &params)?;
    tracing::info!("key hierarchy scenario passed");

    sessions(seed, params).await?;
    tracing::info!("session scenario passed");
    Ok(())
}

/// Fixed-input scenario: Local master key, channel keys, message roundtrip
/// and rejection under a foreign DEK.
fn hierarchy(seed: u64, params: &PasswordParams) -> Result<(), SelftestError> {
    let env = SimEnv::with_seed(seed);
    let owner = Principal::from_slice(b"alice");
    let mut device_iv = [0u8; 16];
    device_iv[15] = 0x01;

    let stretched = stretch("correct horse", "alice", params).step("stretch")?;
    let master = MasterKey::create(
        KekSource::Local { password_secret: &stretched[..], device_iv: &device_iv },
        b"v1",
        &owner,
        env.random_array(),
        env.random_array(),
        0,
    )
    .step("create master key")?;

    let channel = generate_channel_key(&env, &master, &[]).step("generate channel key")?;
    let dek = open_channel_dek(&channel.kek, &channel.wrapped_dek).step("open DEK")?;
    let sealed = dek.encrypt(b"hello", CHANNEL_KEY_AAD, None).step("encrypt")?;
    let opened = dek.decrypt(&sealed, CHANNEL_KEY_AAD).step("decrypt")?;
    check(opened == b"hello", "message roundtrip")?;

    let other = generate_channel_key(&env, &master, &[]).step("generate second channel key")?;
    let foreign = other.dek.decrypt(&sealed, CHANNEL_KEY_AAD).map_err(KeyError::from);
    check(
        matches!(foreign, Err(KeyError::AuthenticationFailed)),
        "foreign DEK must fail authentication",
    )
}

/// Two users exchange a channel KEK, message, then the owner migrates.
async fn sessions(seed: u64, params: PasswordParams) -> Result<(), SelftestError> {
    let store = MemoryCustodialStore::with_seed(seed);
    let dir = MemoryChannelDirectory::new(Principal::from_slice(b"canister"));
    let config = KeyConfig { password_params: params, ..KeyConfig::default() };

    let mut alice = session("alice", seed, &config, &store)?;
    alice.set_master_key(MasterKeyKind::Local, "correct horse").await.step("alice master key")?;
    alice.load_static_key().await.step("alice static key")?;

    let mut bob = session("bob", seed.wrapping_add(1), &config, &store)?;
    bob.set_master_key(MasterKeyKind::VetKey, "").await.step("bob master key")?;
    bob.load_static_key().await.step("bob static key")?;

    let channel = alice.create_channel(&dir, "selftest", &[]).await.step("create channel")?;
    let bob_key = MemberKey { principal: bob.principal().clone(), ecdh_pub: None };
    alice.admin_add_members(&dir, &channel, &[bob_key]).await.step("add bob")?;

    let access = bob.sync_channel(&dir, &channel).await.step("bob requests")?;
    check(access == ChannelAccess::Requested, "bob posts a request")?;
    alice.sync_channel(&dir, &channel).await.step("alice services")?;
    let access = bob.sync_channel(&dir, &channel).await.step("bob accepts")?;
    check(access == ChannelAccess::Accepted, "bob accepts the delivered KEK")?;

    let info = dir.get_channel(alice.principal(), &channel).await.step("fetch channel")?;
    let sealed = alice.encrypt_message(&info, b"hello bob").await.step("alice encrypts")?;
    let opened = bob.decrypt_message(&info, &sealed).await.step("bob decrypts")?;
    check(opened == b"hello bob", "bob reads alice's message")?;

    let report =
        alice.migrate_master_key(&dir, MigrationTarget::VetKey).await.step("migrate alice")?;
    check(report.is_complete(), "migration completes")?;

    // Reopen with the new key alone
    alice.lock();
    check(alice.try_open_master_key().await, "VetKey opens without a password")?;
    let opened = alice.decrypt_message(&info, &sealed).await.step("alice decrypts after migration")?;
    check(opened == b"hello bob", "alice reads after migration")
}

fn session(
    name: &str,
    seed: u64,
    config: &KeyConfig,
    store: &MemoryCustodialStore,
) -> Result<Session, SelftestError> {
    KeySession::load(
        SimEnv::with_seed(seed),
        Principal::from_slice(name.as_bytes()),
        config.clone(),
        store.clone(),
        MemoryKeyStore::new(),
    )
    .step("load session")
}
