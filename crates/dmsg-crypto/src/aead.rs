//! Authenticated encryption using AES-256-GCM
//!
//! Ciphertexts are CBOR envelopes carrying the nonce, the sealed bytes and an
//! optional key id. The key id sits outside the authenticated region and is
//! only a hint for picking among several keys.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// AES-256 key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// GCM nonce size (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// GCM tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

/// 256-bit AES-GCM key with an optional key identifier.
///
/// Key bytes are zeroized on drop. The identifier is copied into every
/// envelope this key produces but is never used to authenticate anything.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    key: [u8; KEY_SIZE],
    kid: Option<Vec<u8>>,
}

impl SymmetricKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(key: [u8; KEY_SIZE]) -> Self {
        Self { key, kid: None }
    }

    /// Wrap a key from a slice, rejecting anything but 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKeyLength { expected: KEY_SIZE, actual: bytes.len() }
        })?;
        Ok(Self::from_bytes(key))
    }

    /// Attach a key identifier.
    #[must_use]
    pub fn with_kid(mut self, kid: impl Into<Vec<u8>>) -> Self {
        self.kid = Some(kid.into());
        self
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Key identifier, if any.
    pub fn kid(&self) -> Option<&[u8]> {
        self.kid.as_deref()
    }

    /// Encrypt under this key. See [`encrypt`].
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        aad: &[u8],
        nonce: Option<[u8; NONCE_SIZE]>,
    ) -> Result<Vec<u8>, CryptoError> {
        encrypt(self, plaintext, aad, nonce)
    }

    /// Decrypt under this key. See [`decrypt`].
    pub fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        decrypt(self, ciphertext, aad)
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey").field("kid", &self.kid).finish_non_exhaustive()
    }
}

/// Wire form of a ciphertext.
#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kid: Option<ByteBuf>,
    nonce: ByteBuf,
    ciphertext: ByteBuf,
}

/// Random 96-bit nonce from the OS RNG.
fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `plaintext` under `key`, binding `aad`.
///
/// When `nonce` is `None` a fresh one is drawn from the OS RNG. A supplied
/// nonce must never have been used with this key before: GCM offers no
/// confidentiality or integrity once a (key, nonce) pair repeats.
pub fn encrypt(
    key: &SymmetricKey,
    plaintext: &[u8],
    aad: &[u8],
    nonce: Option<[u8; NONCE_SIZE]>,
) -> Result<Vec<u8>, CryptoError> {
    let nonce = nonce.unwrap_or_else(generate_nonce);
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let Ok(sealed) = cipher.encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
    else {
        unreachable!("AES-256-GCM encryption cannot fail for in-memory inputs");
    };

    let envelope = Envelope {
        kid: key.kid().map(|kid| ByteBuf::from(kid.to_vec())),
        nonce: ByteBuf::from(nonce.to_vec()),
        ciphertext: ByteBuf::from(sealed),
    };

    let mut out = Vec::with_capacity(plaintext.len() + TAG_SIZE + NONCE_SIZE + 32);
    ciborium::into_writer(&envelope, &mut out)
        .map_err(|e| CryptoError::Encoding { reason: e.to_string() })?;
    Ok(out)
}

/// Decrypt an envelope produced by [`encrypt`].
///
/// # Errors
///
/// - `DecryptionFailed`: wrong key, mismatched AAD, tampering, or a malformed
///   envelope. These cases are indistinguishable by design of the API.
pub fn decrypt(key: &SymmetricKey, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let envelope: Envelope =
        ciborium::from_reader(ciphertext).map_err(|_| CryptoError::DecryptionFailed)?;

    if envelope.nonce.len() != NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    cipher
        .decrypt(Nonce::from_slice(&envelope.nonce), Payload { msg: &envelope.ciphertext, aad })
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Key id carried by an envelope, without decrypting it.
///
/// Advisory only: an attacker controls this field.
pub fn envelope_kid(ciphertext: &[u8]) -> Option<Vec<u8>> {
    let envelope: Envelope = ciborium::from_reader(ciphertext).ok()?;
    envelope.kid.map(ByteBuf::into_vec)
}
