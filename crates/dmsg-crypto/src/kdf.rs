//! Key derivation: Argon2id password stretching, HKDF secret derivation and
//! HMAC password hashes.

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde_bytes::Bytes;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::{
    aead::{KEY_SIZE, SymmetricKey},
    error::CryptoError,
};

type HmacSha256 = Hmac<Sha256>;

/// COSE algorithm identifier for AES-256-GCM
pub const A256GCM: i64 = 3;

/// Output size of password stretching (32 bytes)
pub const STRETCHED_SIZE: usize = 32;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub time_cost: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for PasswordParams {
    /// Argon2id with t=2, m=19 MiB, p=1.
    fn default() -> Self {
        Self { memory_kib: 19 * 1024, time_cost: 2, parallelism: 1 }
    }
}

impl PasswordParams {
    /// Cheap parameters for tests that are not about stretching itself.
    ///
    /// Never use these for real passwords.
    pub const fn insecure_for_tests() -> Self {
        Self { memory_kib: 64, time_cost: 1, parallelism: 1 }
    }
}

/// Stretch a password into a 32-byte secret with Argon2id.
///
/// `salt` is the derivation namespace, typically the user's textual identity.
/// It is hashed with SHA-256 first so namespaces of any length are accepted
/// (Argon2 itself requires at least 8 salt bytes).
///
/// Deterministic: the same `(password, salt, params)` always yields the same
/// secret.
pub fn stretch_password(
    password: &[u8],
    salt: &[u8],
    params: &PasswordParams,
) -> Result<Zeroizing<[u8; STRETCHED_SIZE]>, CryptoError> {
    let argon_params = Params::new(
        params.memory_kib,
        params.time_cost,
        params.parallelism,
        Some(STRETCHED_SIZE),
    )
    .map_err(|e| CryptoError::KeyDerivation { reason: e.to_string() })?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);
    let salt = Sha256::digest(salt);

    let mut output = Zeroizing::new([0u8; STRETCHED_SIZE]);
    argon2
        .hash_password_into(password, &salt, &mut output[..])
        .map_err(|e| CryptoError::KeyDerivation { reason: e.to_string() })?;

    Ok(output)
}

/// Derive an AES-256-GCM key from a secret with HKDF-SHA-256.
///
/// The HKDF info is a CBOR context `[alg, key_bits, info]` so a key derived for
/// one algorithm or length can never collide with another.
pub fn derive_a256gcm_key(
    secret: &[u8],
    salt: &[u8],
    info: &[u8],
) -> Result<SymmetricKey, CryptoError> {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    let hkdf = Hkdf::<Sha256>::new(salt, secret);

    let context = (A256GCM, (KEY_SIZE * 8) as u16, Bytes::new(info));
    let mut encoded = Vec::with_capacity(info.len() + 8);
    ciborium::into_writer(&context, &mut encoded)
        .map_err(|e| CryptoError::Encoding { reason: e.to_string() })?;

    let mut okm = [0u8; KEY_SIZE];
    let Ok(()) = hkdf.expand(&encoded, &mut okm) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    Ok(SymmetricKey::from_bytes(okm))
}

/// HMAC-SHA-256 of `key_id` under a stretched password.
///
/// Published so another device can check a password before wrapping a new
/// master key under it.
pub fn password_hash(stretched: &[u8], key_id: &[u8]) -> [u8; 32] {
    let Ok(mut mac) = HmacSha256::new_from_slice(stretched) else {
        unreachable!("HMAC accepts keys of any length");
    };
    mac.update(key_id);
    mac.finalize().into_bytes().into()
}

/// Constant-time check of a password hash produced by [`password_hash`].
pub fn verify_password_hash(stretched: &[u8], key_id: &[u8], expected: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(stretched) else {
        unreachable!("HMAC accepts keys of any length");
    };
    mac.update(key_id);
    mac.verify_slice(expected).is_ok()
}
