//! Group key exchange integration tests
//!
//! Several users share one custodial store and one channel directory. Each
//! has its own device store and a VetKey master key, so no password
//! stretching is involved.

use dmsg_core::{
    ChannelAccess, ChannelDirectory, ChannelId, KeyConfig, KeyError, KeyEvent, KeySession,
    MasterKeyKind, MemoryChannelDirectory, Principal, SimEnv,
    channel_key::MemberKey,
    directory::ExchangeState,
    store::{MemoryCustodialStore, MemoryKeyStore},
};

type Session = KeySession<SimEnv, MemoryCustodialStore, MemoryKeyStore>;

fn principal(name: &str) -> Principal {
    Principal::from_slice(name.as_bytes())
}

/// A ready user with a loaded static key.
async fn user(name: &str, seed: u64, store: &MemoryCustodialStore) -> Session {
    let mut session = KeySession::load(
        SimEnv::with_seed(seed),
        principal(name),
        KeyConfig::insecure_for_tests(),
        store.clone(),
        MemoryKeyStore::new(),
    )
    .unwrap();
    session.set_master_key(MasterKeyKind::VetKey, "").await.unwrap();
    session.load_static_key().await.unwrap();
    session
}

fn member(name: &str) -> MemberKey {
    MemberKey { principal: principal(name), ecdh_pub: None }
}

struct World {
    store: MemoryCustodialStore,
    dir: MemoryChannelDirectory,
}

impl World {
    fn new() -> Self {
        Self {
            store: MemoryCustodialStore::with_seed(11),
            dir: MemoryChannelDirectory::new(principal("canister")),
        }
    }

    async fn state_of(&self, channel: &ChannelId, who: &Principal) -> ExchangeState {
        let info = self.dir.get_channel(who, channel).await.unwrap();
        info.exchange_state(who)
    }
}

#[tokio::test]
async fn request_service_accept_converges() {
    let world = World::new();
    let mut alice = user("alice", 1, &world.store).await;
    let mut bob = user("bob", 2, &world.store).await;

    let channel = alice.create_channel(&world.dir, "general", &[]).await.unwrap();
    alice.admin_add_members(&world.dir, &channel, &[member("bob")]).await.unwrap();

    assert_eq!(bob.sync_channel(&world.dir, &channel).await.unwrap(), ChannelAccess::Requested);
    assert_eq!(bob.sync_channel(&world.dir, &channel).await.unwrap(), ChannelAccess::Waiting);
    assert_eq!(world.state_of(&channel, bob.principal()).await, ExchangeState::Requested);

    assert_eq!(alice.sync_channel(&world.dir, &channel).await.unwrap(), ChannelAccess::Ready);
    assert_eq!(world.state_of(&channel, bob.principal()).await, ExchangeState::Fulfilled);

    let mut events = bob.subscribe();
    assert_eq!(bob.sync_channel(&world.dir, &channel).await.unwrap(), ChannelAccess::Accepted);
    assert_eq!(world.state_of(&channel, bob.principal()).await, ExchangeState::None);
    assert_eq!(
        events.try_recv().unwrap(),
        KeyEvent::ChannelKekSaved { channel: channel.clone() }
    );
    assert_eq!(bob.sync_channel(&world.dir, &channel).await.unwrap(), ChannelAccess::Ready);

    let info = world.dir.get_channel(alice.principal(), &channel).await.unwrap();
    let sealed = alice.encrypt_message(&info, b"welcome bob").await.unwrap();
    assert_eq!(bob.decrypt_message(&info, &sealed).await.unwrap(), b"welcome bob");
}

#[tokio::test]
async fn known_static_key_gets_kek_on_add() {
    let world = World::new();
    let mut alice = user("alice", 1, &world.store).await;
    let mut bob = user("bob", 2, &world.store).await;

    let bob_pub = alice.fetch_static_public_key(bob.principal()).await.unwrap();
    assert_eq!(bob_pub, bob.static_public_key());

    let channel = alice.create_channel(&world.dir, "general", &[]).await.unwrap();
    let bob_key = MemberKey { principal: principal("bob"), ecdh_pub: bob_pub };
    alice.admin_add_members(&world.dir, &channel, &[bob_key]).await.unwrap();
    assert_eq!(world.state_of(&channel, bob.principal()).await, ExchangeState::Fulfilled);

    assert_eq!(bob.sync_channel(&world.dir, &channel).await.unwrap(), ChannelAccess::Accepted);
    assert_eq!(
        bob.channel_kek(&channel).await.unwrap().as_bytes(),
        alice.channel_kek(&channel).await.unwrap().as_bytes()
    );
}

#[tokio::test]
async fn managers_named_at_creation_receive_kek() {
    let world = World::new();
    let mut alice = user("alice", 1, &world.store).await;
    let mut bob = user("bob", 2, &world.store).await;

    let bob_key = MemberKey { principal: principal("bob"), ecdh_pub: bob.static_public_key() };
    let channel = alice.create_channel(&world.dir, "ops", &[bob_key]).await.unwrap();

    let info = world.dir.get_channel(bob.principal(), &channel).await.unwrap();
    assert!(info.is_manager(bob.principal()));
    assert_eq!(bob.sync_channel(&world.dir, &channel).await.unwrap(), ChannelAccess::Accepted);
    assert!(bob.channel_kek(&channel).await.is_ok());
}

#[tokio::test]
async fn serviced_requests_are_skipped_by_other_managers() {
    let world = World::new();
    let mut alice = user("alice", 1, &world.store).await;
    let mut bob = user("bob", 2, &world.store).await;
    let mut dave = user("dave", 4, &world.store).await;

    let channel = alice.create_channel(&world.dir, "general", &[]).await.unwrap();
    let dave_key = MemberKey { principal: principal("dave"), ecdh_pub: dave.static_public_key() };
    alice.admin_add_managers(&world.dir, &channel, &[dave_key]).await.unwrap();
    alice.admin_add_members(&world.dir, &channel, &[member("bob")]).await.unwrap();
    assert_eq!(dave.sync_channel(&world.dir, &channel).await.unwrap(), ChannelAccess::Accepted);

    bob.request_channel_kek(&world.dir, &channel).await.unwrap();

    let info = world.dir.get_channel(alice.principal(), &channel).await.unwrap();
    let served = alice.service_ecdh_requests(&world.dir, &info).await.unwrap();
    assert_eq!(served, vec![principal("bob")]);
    let delivered = world.dir.get_channel(alice.principal(), &channel).await.unwrap();

    let info = world.dir.get_channel(dave.principal(), &channel).await.unwrap();
    assert!(dave.service_ecdh_requests(&world.dir, &info).await.unwrap().is_empty());
    let after = world.dir.get_channel(dave.principal(), &channel).await.unwrap();
    assert_eq!(after.ecdh_request, delivered.ecdh_request);

    assert_eq!(bob.sync_channel(&world.dir, &channel).await.unwrap(), ChannelAccess::Accepted);
}

#[tokio::test]
async fn unusable_request_is_skipped() {
    let world = World::new();
    let mut alice = user("alice", 1, &world.store).await;
    let bob = user("bob", 2, &world.store).await;
    let carol = principal("carol");

    let channel = alice.create_channel(&world.dir, "general", &[]).await.unwrap();
    alice
        .admin_add_members(&world.dir, &channel, &[member("bob"), member("carol")])
        .await
        .unwrap();
    bob.request_channel_kek(&world.dir, &channel).await.unwrap();
    world.dir.update_my_setting(&carol, &channel, Some([0u8; 32])).await.unwrap();

    let info = world.dir.get_channel(alice.principal(), &channel).await.unwrap();
    let served = alice.service_ecdh_requests(&world.dir, &info).await.unwrap();

    assert_eq!(served, vec![principal("bob")]);
    assert_eq!(world.state_of(&channel, &carol).await, ExchangeState::Requested);
}

#[tokio::test]
async fn locked_manager_writes_nothing() {
    let world = World::new();
    let mut alice = user("alice", 1, &world.store).await;
    let bob = user("bob", 2, &world.store).await;

    let channel = alice.create_channel(&world.dir, "general", &[]).await.unwrap();
    alice.admin_add_members(&world.dir, &channel, &[member("bob")]).await.unwrap();
    bob.request_channel_kek(&world.dir, &channel).await.unwrap();

    alice.lock();
    let info = world.dir.get_channel(alice.principal(), &channel).await.unwrap();
    assert_eq!(
        alice.service_ecdh_requests(&world.dir, &info).await.unwrap_err(),
        KeyError::MASTER_KEY_NOT_READY
    );
    assert_eq!(world.state_of(&channel, bob.principal()).await, ExchangeState::Requested);
}

#[tokio::test]
async fn non_manager_services_nothing() {
    let world = World::new();
    let mut alice = user("alice", 1, &world.store).await;
    let mut bob = user("bob", 2, &world.store).await;
    let carol = user("carol", 3, &world.store).await;

    let channel = alice.create_channel(&world.dir, "general", &[]).await.unwrap();
    let bob_key = MemberKey { principal: principal("bob"), ecdh_pub: bob.static_public_key() };
    alice.admin_add_members(&world.dir, &channel, &[bob_key, member("carol")]).await.unwrap();
    bob.sync_channel(&world.dir, &channel).await.unwrap();
    carol.request_channel_kek(&world.dir, &channel).await.unwrap();

    let info = world.dir.get_channel(bob.principal(), &channel).await.unwrap();
    assert!(bob.service_ecdh_requests(&world.dir, &info).await.unwrap().is_empty());
    assert_eq!(world.state_of(&channel, carol.principal()).await, ExchangeState::Requested);
}

#[tokio::test]
async fn delivery_to_another_key_is_rejected() {
    let world = World::new();
    let mut alice = user("alice", 1, &world.store).await;
    let mut bob = user("bob", 2, &world.store).await;

    let channel = alice.create_channel(&world.dir, "general", &[]).await.unwrap();
    alice.admin_add_members(&world.dir, &channel, &[member("bob")]).await.unwrap();
    bob.request_channel_kek(&world.dir, &channel).await.unwrap();
    let info = world.dir.get_channel(alice.principal(), &channel).await.unwrap();
    alice.service_ecdh_requests(&world.dir, &info).await.unwrap();

    let mut tampered = world.dir.get_channel(alice.principal(), &channel).await.unwrap();
    if let Some(request) = tampered.ecdh_request.get_mut(bob.principal()) {
        request.ecdh_pub = [9u8; 32];
    }
    world.dir.overwrite_channel(tampered.clone()).unwrap();

    assert_eq!(
        bob.accept_channel_kek(&world.dir, &tampered).await.unwrap_err(),
        KeyError::PublicKeyMismatch
    );
    assert!(bob.channel_kek(&channel).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn request_requires_static_key() {
    let world = World::new();
    let mut alice = user("alice", 1, &world.store).await;
    let mut erin = KeySession::load(
        SimEnv::with_seed(5),
        principal("erin"),
        KeyConfig::insecure_for_tests(),
        world.store.clone(),
        MemoryKeyStore::new(),
    )
    .unwrap();
    erin.set_master_key(MasterKeyKind::VetKey, "").await.unwrap();

    let channel = alice.create_channel(&world.dir, "general", &[]).await.unwrap();
    alice.admin_add_members(&world.dir, &channel, &[member("erin")]).await.unwrap();

    assert_eq!(
        erin.request_channel_kek(&world.dir, &channel).await.unwrap_err(),
        KeyError::STATIC_KEY_NOT_READY
    );
    assert_eq!(world.state_of(&channel, erin.principal()).await, ExchangeState::None);
}
