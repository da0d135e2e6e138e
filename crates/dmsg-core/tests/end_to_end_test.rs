//! End-to-end key hierarchy tests
//!
//! Drive the pure building blocks (master key, channel key generation, DEK
//! unwrapping) directly with fixed inputs, without a session or stores.

use dmsg_core::{
    KeyError, MasterKey, MasterKeyKind, Principal, SimEnv,
    channel_key::{CHANNEL_KEY_AAD, generate_channel_key, open_channel_dek, open_channel_kek},
    master_key::{KekSource, stretch},
};
use dmsg_crypto::{NONCE_SIZE, PasswordParams};
use proptest::prelude::*;

const KEY_ID: &[u8] = b"v1";

fn device_iv() -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[15] = 0x01;
    iv
}

fn remote_secret() -> [u8; 16] {
    let mut secret = [0u8; 16];
    secret[15] = 0x02;
    secret
}

fn alice() -> Principal {
    Principal::from_slice(b"alice")
}

#[test]
fn local_master_key_protects_channel_messages() {
    let env = SimEnv::with_seed(42);
    let stretched =
        stretch("correct horse", "alice", &PasswordParams::insecure_for_tests()).unwrap();
    let iv = device_iv();

    // Step 1: Local master key from password and device IV
    let master = MasterKey::create(
        KekSource::Local { password_secret: &stretched[..], device_iv: &iv },
        KEY_ID,
        &alice(),
        [7u8; 32],
        [1u8; NONCE_SIZE],
        0,
    )
    .unwrap();
    assert_eq!(master.kind(), MasterKeyKind::Local);
    assert!(master.is_opened());

    // Step 2: channel keys with no managers
    let generated = generate_channel_key(&env, &master, &[]).unwrap();
    assert!(generated.ecdh_requests.is_empty());

    let kek = open_channel_kek([&master], &generated.encrypted_kek).unwrap();
    assert_eq!(kek.as_bytes(), generated.kek.as_bytes());
    let dek = open_channel_dek(&kek, &generated.wrapped_dek).unwrap();
    assert_eq!(dek.as_bytes(), generated.dek.as_bytes());

    // Steps 3 and 4: message roundtrip under the DEK with empty AAD
    let ciphertext = dek.encrypt(b"hello", CHANNEL_KEY_AAD, None).unwrap();
    assert_eq!(dek.decrypt(&ciphertext, CHANNEL_KEY_AAD).unwrap(), b"hello");

    // Step 5: another channel's DEK cannot read it
    let other = generate_channel_key(&env, &master, &[]).unwrap();
    assert_ne!(other.dek.as_bytes(), dek.as_bytes());
    let err = KeyError::from(other.dek.decrypt(&ciphertext, CHANNEL_KEY_AAD).unwrap_err());
    assert_eq!(err, KeyError::AuthenticationFailed);
}

#[test]
fn ecdh_master_key_needs_password_and_remote_secret() {
    let stretched =
        stretch("correct horse", "alice", &PasswordParams::insecure_for_tests()).unwrap();
    let secret = remote_secret();
    let source = KekSource::Ecdh { password_secret: &stretched[..], remote_secret: &secret };

    let created =
        MasterKey::create(source, KEY_ID, &alice(), [9u8; 32], [2u8; NONCE_SIZE], 0).unwrap();

    let mut reopened = MasterKey::from_record(&created.to_record());
    assert!(!reopened.is_opened());
    reopened.open(source, 0).unwrap();
    assert_eq!(reopened.key().unwrap().as_bytes(), &[9u8; 32]);

    let mut wrong_secret = MasterKey::from_record(&created.to_record());
    let other = device_iv();
    let err = wrong_secret
        .open(KekSource::Ecdh { password_secret: &stretched[..], remote_secret: &other }, 0)
        .unwrap_err();
    assert_eq!(err, KeyError::AuthenticationFailed);

    let mut wrong_kind = MasterKey::from_record(&created.to_record());
    let err = wrong_kind
        .open(KekSource::Local { password_secret: &stretched[..], device_iv: &secret }, 0)
        .unwrap_err();
    assert!(matches!(err, KeyError::Protocol(_)));
}

#[test]
fn kek_is_bound_to_its_master_key() {
    let env = SimEnv::with_seed(5);
    let vetkey_a = [1u8; 48];
    let vetkey_b = [2u8; 48];
    let a = MasterKey::create(
        KekSource::VetKey { vetkey: &vetkey_a },
        KEY_ID,
        &alice(),
        [3u8; 32],
        [3u8; NONCE_SIZE],
        0,
    )
    .unwrap();
    let b = MasterKey::create(
        KekSource::VetKey { vetkey: &vetkey_b },
        KEY_ID,
        &alice(),
        [4u8; 32],
        [4u8; NONCE_SIZE],
        0,
    )
    .unwrap();

    let generated = generate_channel_key(&env, &a, &[]).unwrap();
    assert_eq!(
        open_channel_kek([&b], &generated.encrypted_kek).unwrap_err(),
        KeyError::AuthenticationFailed
    );
    assert!(open_channel_kek([&b, &a], &generated.encrypted_kek).is_ok());
}

proptest! {
    #[test]
    fn prop_open_is_idempotent(
        material in any::<[u8; 32]>(),
        vetkey in prop::collection::vec(any::<u8>(), 16..64),
        nonce in any::<[u8; NONCE_SIZE]>(),
        plaintext in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let source = KekSource::VetKey { vetkey: &vetkey };
        let created = MasterKey::create(source, KEY_ID, &alice(), material, nonce, 0).unwrap();

        let mut key = MasterKey::from_record(&created.to_record());
        key.open(source, 0).unwrap();
        let first = key.encrypt(&plaintext, b"aad", nonce).unwrap();

        key.open(source, 0).unwrap();
        let second = key.encrypt(&plaintext, b"aad", nonce).unwrap();

        prop_assert_eq!(&first, &second);
        prop_assert_eq!(created.encrypt(&plaintext, b"aad", nonce).unwrap(), first);
        prop_assert_eq!(key.decrypt(&second, b"aad").unwrap(), plaintext);
    }
}
