//! Master key migration tests
//!
//! Migration appends a master key and re-wraps every channel KEK and the
//! static key under it. The chaos test runs the same flow against a store
//! that randomly fails calls and checks that repeated resumes converge.

use dmsg_core::{
    ChannelDirectory, ChannelId, KeyConfig, KeyError, KeyEvent, KeySession, MasterKeyKind,
    MemoryChannelDirectory, MigrationTarget, Principal, SimEnv,
    store::{ChaoticStore, CustodialStore, MemoryCustodialStore, MemoryKeyStore},
};

fn principal() -> Principal {
    Principal::from_slice(b"alice")
}

fn directory() -> MemoryChannelDirectory {
    MemoryChannelDirectory::new(Principal::from_slice(b"canister"))
}

type Session = KeySession<SimEnv, MemoryCustodialStore, MemoryKeyStore>;

fn session(store: &MemoryCustodialStore, local: &MemoryKeyStore) -> Session {
    KeySession::load(
        SimEnv::with_seed(21),
        principal(),
        KeyConfig::insecure_for_tests(),
        store.clone(),
        local.clone(),
    )
    .unwrap()
}

async fn with_channels<S: CustodialStore>(
    session: &mut KeySession<SimEnv, S, MemoryKeyStore>,
    dir: &MemoryChannelDirectory,
    count: usize,
) -> Vec<ChannelId> {
    let mut channels = Vec::with_capacity(count);
    for i in 0..count {
        channels.push(session.create_channel(dir, &format!("c{i}"), &[]).await.unwrap());
    }
    channels
}

#[tokio::test]
async fn local_to_vetkey_rewraps_everything() {
    let store = MemoryCustodialStore::with_seed(1);
    let local = MemoryKeyStore::new();
    let dir = directory();
    let mut alice = session(&store, &local);
    alice.set_master_key(MasterKeyKind::Local, "pw").await.unwrap();
    alice.load_static_key().await.unwrap();

    let a = alice.create_channel(&dir, "a", &[]).await.unwrap();
    let b = alice.create_channel(&dir, "b", &[]).await.unwrap();
    let info = dir.get_channel(alice.principal(), &a).await.unwrap();
    let sealed = alice.encrypt_message(&info, b"before migration").await.unwrap();
    let static_pub = alice.static_public_key();

    let mut events = alice.subscribe();
    let report = alice.migrate_master_key(&dir, MigrationTarget::VetKey).await.unwrap();
    assert_eq!(report.migrated, vec![a.clone(), b]);
    assert!(report.already_current.is_empty());
    assert!(report.is_complete());
    assert_eq!(alice.master_keys().len(), 2);
    assert_eq!(alice.master_keys().active().map(|k| k.kind()), Some(MasterKeyKind::VetKey));
    assert_eq!(
        events.try_recv().unwrap(),
        KeyEvent::MasterKeyOpened { kind: MasterKeyKind::VetKey, version: 2 }
    );

    // A device holding only the new key reads everything
    let mut other = session(&store, &MemoryKeyStore::new());
    other.set_master_key(MasterKeyKind::VetKey, "").await.unwrap();
    assert_eq!(other.load_static_key().await.unwrap(), static_pub.unwrap());
    assert_eq!(other.decrypt_message(&info, &sealed).await.unwrap(), b"before migration");
}

#[tokio::test]
async fn second_pass_finds_everything_current() {
    let store = MemoryCustodialStore::with_seed(1);
    let dir = directory();
    let mut alice = session(&store, &MemoryKeyStore::new());
    alice.set_master_key(MasterKeyKind::VetKey, "").await.unwrap();
    alice.load_static_key().await.unwrap();
    let channel = alice.create_channel(&dir, "a", &[]).await.unwrap();

    alice
        .migrate_master_key(&dir, MigrationTarget::Local { password: "pw" })
        .await
        .unwrap();
    let mut events = alice.subscribe();
    let report = alice.resume_migration(&dir).await.unwrap();

    assert!(report.migrated.is_empty());
    assert_eq!(report.already_current, vec![channel]);
    assert!(report.is_complete());
    assert_eq!(
        events.try_recv().unwrap(),
        KeyEvent::MigrationCompleted { migrated: 0, failed: 0 }
    );
}

#[tokio::test]
async fn ecdh_rotation_reuses_key_material() {
    let store = MemoryCustodialStore::with_seed(1);
    let dir = directory();
    let mut alice = session(&store, &MemoryKeyStore::new());
    alice.set_master_key(MasterKeyKind::Ecdh, "old").await.unwrap();
    let channel = alice.create_channel(&dir, "a", &[]).await.unwrap();
    let before = *alice.master_keys().active().unwrap().key().unwrap().as_bytes();

    let report = alice
        .migrate_master_key(&dir, MigrationTarget::Ecdh { password: "new" })
        .await
        .unwrap();

    let after = *alice.master_keys().active().unwrap().key().unwrap().as_bytes();
    assert_eq!(before, after);
    assert_eq!(report.already_current, vec![channel]);

    // The new password opens the key on a fresh device
    let mut other = session(&store, &MemoryKeyStore::new());
    other.set_master_key(MasterKeyKind::Ecdh, "new").await.unwrap();
    assert!(other.is_ready());
}

#[tokio::test]
async fn migration_requires_open_master_key() {
    let store = MemoryCustodialStore::with_seed(1);
    let dir = directory();
    let mut alice = session(&store, &MemoryKeyStore::new());
    alice.set_master_key(MasterKeyKind::VetKey, "").await.unwrap();
    alice.lock();

    assert_eq!(
        alice.migrate_master_key(&dir, MigrationTarget::VetKey).await.unwrap_err(),
        KeyError::MASTER_KEY_NOT_READY
    );
    assert_eq!(alice.master_keys().len(), 1);
}

#[tokio::test]
async fn missing_static_key_leaves_migration_incomplete() {
    let store = MemoryCustodialStore::with_seed(1);
    let dir = directory();
    let mut alice = session(&store, &MemoryKeyStore::new());
    alice.set_master_key(MasterKeyKind::VetKey, "").await.unwrap();
    with_channels(&mut alice, &dir, 1).await;

    let report = alice
        .migrate_master_key(&dir, MigrationTarget::Local { password: "pw" })
        .await
        .unwrap();
    assert!(report.failed.is_empty());
    assert!(!report.static_key_current);
    assert!(!report.is_complete());
}

#[tokio::test]
async fn chaotic_store_migration_resumes_to_completion() {
    let store = MemoryCustodialStore::with_seed(3);
    let local = MemoryKeyStore::new();
    let dir = directory();

    let mut setup = session(&store, &local);
    setup.set_master_key(MasterKeyKind::Local, "pw").await.unwrap();
    setup.load_static_key().await.unwrap();
    let channels = with_channels(&mut setup, &dir, 12).await;
    drop(setup);

    // Same device, flaky custodian. Local keys open from the device alone.
    let chaotic = ChaoticStore::with_seed(store.clone(), 0.3, 99);
    let mut alice = KeySession::load(
        SimEnv::with_seed(22),
        principal(),
        KeyConfig::insecure_for_tests(),
        chaotic.clone(),
        local.clone(),
    )
    .unwrap();
    assert!(alice.try_open_master_key().await);

    let mut attempts = 0;
    while alice.master_keys().len() == 1 {
        attempts += 1;
        assert!(attempts < 50, "migration never started");
        let _ = alice.migrate_master_key(&dir, MigrationTarget::VetKey).await;
    }

    let mut passes = 0;
    let report = loop {
        passes += 1;
        assert!(passes < 50, "migration never converged");
        let report = alice.resume_migration(&dir).await.unwrap();
        if report.is_complete() {
            break report;
        }
    };
    assert_eq!(report.migrated.len() + report.already_current.len(), channels.len());
    assert!(chaotic.failure_count() > 0);

    // Only the new key is needed from here on
    let mut fresh = KeySession::load(
        SimEnv::with_seed(23),
        principal(),
        KeyConfig::insecure_for_tests(),
        store.clone(),
        MemoryKeyStore::new(),
    )
    .unwrap();
    fresh.set_master_key(MasterKeyKind::VetKey, "").await.unwrap();
    for channel in &channels {
        assert!(fresh.channel_kek(channel).await.is_ok(), "{channel} still under the old key");
    }
}
