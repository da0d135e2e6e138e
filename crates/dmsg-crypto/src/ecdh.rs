//! X25519 key agreement and one-time ECDH wraps.
//!
//! A one-time wrap encrypts a secret for a recipient's public key: the sender
//! generates an ephemeral key pair, agrees with the recipient, derives an AES
//! key from the shared point and seals the secret. The ephemeral public key
//! travels with the ciphertext as an [`EcdhRemote`].

use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::{
    aead::{NONCE_SIZE, decrypt},
    error::CryptoError,
    kdf::derive_a256gcm_key,
};

/// X25519 public key size (32 bytes)
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 private scalar size (32 bytes)
pub const SECRET_KEY_SIZE: usize = 32;

/// HKDF info for keys derived from an ECDH wrap.
const ECDH_WRAP_INFO: &[u8] = b"dmsg-ecdh-wrap-v1";

/// Curve25519 key pair.
///
/// The private scalar is zeroized on drop.
pub struct EcdhKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EcdhKeyPair {
    /// Build a key pair from a 32-byte scalar.
    ///
    /// The scalar is clamped by X25519, so any 32 random bytes are valid.
    pub fn from_secret_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Build a key pair from a slice, rejecting anything but 32 bytes.
    pub fn from_secret_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let scalar: [u8; SECRET_KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKeyLength { expected: SECRET_KEY_SIZE, actual: bytes.len() }
        })?;
        Ok(Self::from_secret_bytes(scalar))
    }

    /// Public half, safe to publish.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Private scalar, for wrapping under another key.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; SECRET_KEY_SIZE]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Diffie-Hellman agreement with a peer public key.
    ///
    /// # Errors
    ///
    /// - `InvalidPublicKey`: the key is not 32 bytes or is a low-order point
    ///   (the agreement would be all zeros)
    pub fn agree(&self, their_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let bytes: [u8; PUBLIC_KEY_SIZE] =
            their_public.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;

        let shared = self.secret.diffie_hellman(&PublicKey::from(bytes));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }

        Ok(Zeroizing::new(shared.to_bytes()))
    }
}

impl std::fmt::Debug for EcdhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let public = self.public.as_bytes();
        write!(f, "EcdhKeyPair({:02x}{:02x}..)", public[0], public[1])
    }
}

/// Result of a one-time ECDH wrap: the sender's ephemeral public key and the
/// AEAD payload only the recipient can open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcdhRemote {
    /// Ephemeral public key of the sender
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// AEAD envelope sealed under the derived key
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Seal `plaintext` for `recipient_public` using `ephemeral` as the sender key.
///
/// `salt` feeds HKDF alongside the shared point; both sides must agree on it.
/// The ephemeral key pair must not be reused for another wrap.
pub fn wrap_for(
    recipient_public: &[u8],
    ephemeral: &EcdhKeyPair,
    salt: &[u8],
    plaintext: &[u8],
    aad: &[u8],
    nonce: Option<[u8; NONCE_SIZE]>,
) -> Result<EcdhRemote, CryptoError> {
    let shared = ephemeral.agree(recipient_public)?;
    let key = derive_a256gcm_key(shared.as_slice(), salt, ECDH_WRAP_INFO)?;
    let payload = key.encrypt(plaintext, aad, nonce)?;

    Ok(EcdhRemote { public_key: ephemeral.public_key(), payload })
}

/// Open a wrap produced by [`wrap_for`] with the recipient's key pair.
///
/// # Errors
///
/// - `InvalidPublicKey`: the ephemeral key in `remote` is unusable
/// - `DecryptionFailed`: wrong recipient, wrong salt or AAD, or tampering
pub fn unwrap_from(
    recipient: &EcdhKeyPair,
    remote: &EcdhRemote,
    salt: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let shared = recipient.agree(&remote.public_key)?;
    let key = derive_a256gcm_key(shared.as_slice(), salt, ECDH_WRAP_INFO)?;
    decrypt(&key, &remote.payload, aad).map(Zeroizing::new)
}
