//! Channel key hierarchy
//!
//! ```text
//!   MasterKey ──wraps──► KEK (per channel) ──wraps──► DEK (per channel) ──► messages
//! ```
//!
//! The KEK wrapped under a master key is stored per user. The DEK wrapped
//! under the KEK lives on the channel record and is shared by all members.
//! Both wraps use empty AAD. Members receive the KEK either wrapped under
//! their own master key or sealed to their static ECDH key by a manager.

use std::collections::BTreeMap;

use dmsg_crypto::{
    EcdhKeyPair, EcdhRemote, KEY_SIZE, PUBLIC_KEY_SIZE, SymmetricKey,
    ecdh::{unwrap_from, wrap_for},
};
use serde_bytes::Bytes;

use crate::{
    directory::EcdhRequest,
    env::Environment,
    error::KeyError,
    id::{ChannelId, Principal},
    master_key::MasterKey,
};

/// AAD for KEK and DEK wraps.
pub const CHANNEL_KEY_AAD: &[u8] = &[];

/// HKDF salt for KEKs sealed to a member's static key.
const KEK_SEAL_SALT: &[u8] = &[];

/// A principal and its static ECDH public key, if known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberKey {
    /// Principal
    pub principal: Principal,
    /// Published static ECDH public key
    pub ecdh_pub: Option<[u8; PUBLIC_KEY_SIZE]>,
}

/// Output of [`generate_channel_key`].
#[derive(Debug)]
pub struct GeneratedChannelKey {
    /// Plaintext DEK
    pub dek: SymmetricKey,
    /// Plaintext KEK
    pub kek: SymmetricKey,
    /// DEK wrapped under the KEK, for the channel record
    pub wrapped_dek: Vec<u8>,
    /// KEK wrapped under the creator's master key
    pub encrypted_kek: Vec<u8>,
    /// KEK sealed to each manager with a known public key
    pub ecdh_requests: BTreeMap<Principal, EcdhRequest>,
}

/// Generate a fresh DEK and KEK for a new channel.
///
/// Managers without a known public key get no sealed copy and must request
/// the KEK later.
pub fn generate_channel_key<E: Environment>(
    env: &E,
    master: &MasterKey,
    managers: &[MemberKey],
) -> Result<GeneratedChannelKey, KeyError> {
    let dek = SymmetricKey::from_bytes(env.random_array::<KEY_SIZE>());
    let kek = SymmetricKey::from_bytes(env.random_array::<KEY_SIZE>());

    let wrapped_dek = kek.encrypt(dek.as_bytes(), CHANNEL_KEY_AAD, Some(env.random_array()))?;
    let encrypted_kek = master.encrypt(kek.as_bytes(), CHANNEL_KEY_AAD, env.random_array())?;

    let mut ecdh_requests = BTreeMap::new();
    for manager in managers {
        if let Some(ecdh_pub) = manager.ecdh_pub {
            let remote = seal_kek_for(env, &ecdh_pub, &kek)?;
            ecdh_requests
                .insert(manager.principal.clone(), EcdhRequest { ecdh_pub, ecdh_remote: Some(remote) });
        }
    }

    Ok(GeneratedChannelKey { dek, kek, wrapped_dek, encrypted_kek, ecdh_requests })
}

/// Seal `kek` to a member's static public key with a one-time ephemeral key.
pub fn seal_kek_for<E: Environment>(
    env: &E,
    recipient_pub: &[u8; PUBLIC_KEY_SIZE],
    kek: &SymmetricKey,
) -> Result<EcdhRemote, KeyError> {
    let ephemeral = EcdhKeyPair::from_secret_bytes(env.random_array());
    Ok(wrap_for(
        recipient_pub,
        &ephemeral,
        KEK_SEAL_SALT,
        kek.as_bytes(),
        CHANNEL_KEY_AAD,
        Some(env.random_array()),
    )?)
}

/// Recover a KEK sealed by [`seal_kek_for`].
pub fn open_sealed_kek(
    static_key: &EcdhKeyPair,
    remote: &EcdhRemote,
) -> Result<SymmetricKey, KeyError> {
    let kek = unwrap_from(static_key, remote, KEK_SEAL_SALT, CHANNEL_KEY_AAD)?;
    Ok(SymmetricKey::from_slice(&kek)?)
}

/// Decrypt a KEK with the first opened master key that authenticates it.
///
/// # Errors
///
/// - `NotReady`: none of `keys` is opened
/// - `AuthenticationFailed`: no opened key decrypts it
pub fn open_channel_kek<'a>(
    keys: impl IntoIterator<Item = &'a MasterKey>,
    encrypted_kek: &[u8],
) -> Result<SymmetricKey, KeyError> {
    let mut tried = false;
    for key in keys.into_iter().filter(|key| key.is_opened()) {
        tried = true;
        if let Ok(kek) = key.decrypt(encrypted_kek, CHANNEL_KEY_AAD) {
            return Ok(SymmetricKey::from_slice(&kek)?);
        }
    }

    if tried { Err(KeyError::AuthenticationFailed) } else { Err(KeyError::MASTER_KEY_NOT_READY) }
}

/// Decrypt a channel's DEK under its KEK.
pub fn open_channel_dek(kek: &SymmetricKey, wrapped_dek: &[u8]) -> Result<SymmetricKey, KeyError> {
    let dek = kek.decrypt(wrapped_dek, CHANNEL_KEY_AAD)?;
    Ok(SymmetricKey::from_slice(&dek)?)
}

/// Custodial setting key of a channel's KEK: CBOR `[canister, id]`.
pub fn kek_setting_key(channel: &ChannelId) -> Result<Vec<u8>, KeyError> {
    let mut key = Vec::new();
    ciborium::into_writer(&(Bytes::new(channel.canister.as_slice()), channel.id), &mut key)?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{env::SimEnv, master_key::KekSource};

    fn master(env: &SimEnv, byte: u8) -> MasterKey {
        MasterKey::create(
            KekSource::VetKey { vetkey: &[byte; 32] },
            b"v1",
            &Principal::from_slice(b"alice"),
            env.random_array(),
            env.random_array(),
            0,
        )
        .unwrap()
    }

    #[test]
    fn generated_keys_unwrap_through_hierarchy() {
        let env = SimEnv::with_seed(1);
        let master = master(&env, 1);
        let generated = generate_channel_key(&env, &master, &[]).unwrap();

        let kek = open_channel_kek([&master], &generated.encrypted_kek).unwrap();
        assert_eq!(kek.as_bytes(), generated.kek.as_bytes());

        let dek = open_channel_dek(&kek, &generated.wrapped_dek).unwrap();
        assert_eq!(dek.as_bytes(), generated.dek.as_bytes());
        assert!(generated.ecdh_requests.is_empty());
    }

    #[test]
    fn managers_with_public_keys_get_sealed_copies() {
        let env = SimEnv::with_seed(2);
        let master = master(&env, 2);
        let bob_static = EcdhKeyPair::from_secret_bytes([9; 32]);
        let managers = [
            MemberKey {
                principal: Principal::from_slice(b"bob"),
                ecdh_pub: Some(bob_static.public_key()),
            },
            MemberKey { principal: Principal::from_slice(b"carol"), ecdh_pub: None },
        ];

        let generated = generate_channel_key(&env, &master, &managers).unwrap();
        assert_eq!(generated.ecdh_requests.len(), 1);

        let request = &generated.ecdh_requests[&Principal::from_slice(b"bob")];
        let remote = request.ecdh_remote.as_ref().unwrap();
        let kek = open_sealed_kek(&bob_static, remote).unwrap();
        assert_eq!(kek.as_bytes(), generated.kek.as_bytes());
    }

    #[test]
    fn kek_falls_back_to_older_keys() {
        let env = SimEnv::with_seed(3);
        let old = master(&env, 3);
        let new = master(&env, 4);
        let generated = generate_channel_key(&env, &old, &[]).unwrap();

        let kek = open_channel_kek([&new, &old], &generated.encrypted_kek).unwrap();
        assert_eq!(kek.as_bytes(), generated.kek.as_bytes());
        assert_eq!(
            open_channel_kek([&new], &generated.encrypted_kek).unwrap_err(),
            KeyError::AuthenticationFailed
        );
    }

    #[test]
    fn closed_keys_are_not_ready() {
        let env = SimEnv::with_seed(4);
        let mut key = master(&env, 5);
        let generated = generate_channel_key(&env, &key, &[]).unwrap();
        key.close();
        assert_eq!(
            open_channel_kek([&key], &generated.encrypted_kek).unwrap_err(),
            KeyError::MASTER_KEY_NOT_READY
        );
    }

    #[test]
    fn kek_setting_keys_differ_per_channel() {
        let canister = Principal::from_slice(b"canister");
        let a = kek_setting_key(&ChannelId::new(canister.clone(), 1)).unwrap();
        let b = kek_setting_key(&ChannelId::new(canister, 2)).unwrap();
        assert_ne!(a, b);
    }
}
