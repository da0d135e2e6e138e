//! dMsg Cryptographic Primitives
//!
//! Cryptographic building blocks for dMsg end-to-end key management. Every
//! function here is synchronous and free of I/O. Randomness is either supplied
//! by the caller (nonces, key material) or, when omitted, drawn from the OS
//! RNG.
//!
//! # Key Hierarchy
//!
//! A user's secrets flow through a layered hierarchy. Every arrow is an AEAD
//! wrap with its own associated data, so a ciphertext produced at one layer
//! cannot be replayed at another.
//!
//! ```text
//! Password ──Argon2id──► Stretched Secret ─┐
//!                                          ├─HKDF─► Master KEK
//! Device IV / Custodian Secret / VetKey ───┘            │
//!                                                       ▼
//!                                           AES-256-GCM → MasterKey
//!                                                       │
//!                                                       ▼
//!                                           AES-256-GCM → Channel KEK
//!                                                       │
//!                                                       ▼
//!                                           AES-256-GCM → Channel DEK
//!                                                       │
//!                                                       ▼
//!                                           AES-256-GCM → Message
//! ```
//!
//! Channel KEKs travel between members through one-time ECDH wraps
//! ([`ecdh::wrap_for`]): an ephemeral X25519 key agrees with the recipient's
//! static key, HKDF turns the shared point into an AES key, and only the
//! holder of the recipient's private scalar can unwrap.
//!
//! # Security
//!
//! Confidentiality:
//! - AES-256-GCM with 96-bit nonces. Nonces are random per call unless the
//!   caller supplies one, in which case the caller owns uniqueness
//! - Nonce reuse under one key breaks GCM entirely and must never happen
//!
//! Authenticity:
//! - Associated data binds a ciphertext to its context (usually the owner's
//!   principal bytes)
//! - Every decryption failure surfaces as [`CryptoError::DecryptionFailed`],
//!   with no distinction between wrong key, wrong AAD and malformed input
//! - The envelope key id is advisory only and never authenticates anything
//!
//! Key derivation:
//! - Passwords are stretched with Argon2id (t=2, m=19 MiB, p=1)
//! - Shared values become keys through HKDF-SHA-256 with an explicit
//!   algorithm/length context

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
pub mod ecdh;
mod error;
pub mod kdf;

pub use aead::{KEY_SIZE, NONCE_SIZE, SymmetricKey, TAG_SIZE, decrypt, encrypt};
pub use ecdh::{EcdhKeyPair, EcdhRemote, PUBLIC_KEY_SIZE};
pub use error::CryptoError;
pub use kdf::{
    PasswordParams, derive_a256gcm_key, password_hash, stretch_password, verify_password_hash,
};
