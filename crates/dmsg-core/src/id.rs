//! Identity handles: principals and channel ids.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identity handle of a user or canister.
///
/// The raw bytes double as AEAD associated data for anything bound to this
/// identity, so two principals never share a ciphertext context.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Principal(#[serde(with = "serde_bytes")] Vec<u8>);

impl Principal {
    /// Build a principal from raw identity bytes.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Raw identity bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Textual form, used as the password-stretching namespace.
    pub fn to_text(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Principal({})", self.to_text())
    }
}

/// A channel is addressed by the canister hosting it and its id there.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId {
    /// Canister hosting the channel
    pub canister: Principal,
    /// Channel number within the canister
    pub id: u32,
}

impl ChannelId {
    /// Create a channel id.
    pub fn new(canister: Principal, id: u32) -> Self {
        Self { canister, id }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.canister, self.id)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({self})")
    }
}
