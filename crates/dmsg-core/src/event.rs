//! Key-state change notifications.

use dmsg_crypto::PUBLIC_KEY_SIZE;

use crate::{
    id::{ChannelId, Principal},
    master_key::MasterKeyKind,
};

/// Events a [`crate::KeySession`] broadcasts after a key-state change.
///
/// UI layers subscribe to refresh decrypted views. Delivery is best-effort: a
/// lagging subscriber misses events rather than blocking the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEvent {
    /// The active master key was created or opened.
    MasterKeyOpened {
        /// Kind of the active key
        kind: MasterKeyKind,
        /// Version of the active key
        version: u32,
    },

    /// All master keys were replaced by a new one.
    MasterKeyReset {
        /// Kind of the new key
        kind: MasterKeyKind,
    },

    /// A channel KEK was written under the active master key.
    ChannelKekSaved {
        /// Channel whose KEK changed
        channel: ChannelId,
    },

    /// A cached channel DEK was dropped.
    DekInvalidated {
        /// Channel whose DEK cache entry was removed
        channel: ChannelId,
    },

    /// A member's KEK request was fulfilled by this session.
    RequestServiced {
        /// Channel of the request
        channel: ChannelId,
        /// Member who received the KEK
        member: Principal,
    },

    /// This session accepted a KEK delivered by a manager.
    KekAccepted {
        /// Channel whose KEK was received
        channel: ChannelId,
    },

    /// A new static ECDH identity key was generated and published.
    StaticKeyRotated {
        /// New public key
        public_key: [u8; PUBLIC_KEY_SIZE],
    },

    /// A migration pass finished.
    MigrationCompleted {
        /// Channels re-wrapped under the new master key
        migrated: usize,
        /// Channels left under an older key
        failed: usize,
    },
}
