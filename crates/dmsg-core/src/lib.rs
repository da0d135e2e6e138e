//! dMsg Key Management
//!
//! Client-side key management for end-to-end encrypted dMsg channels. Holds a
//! user's master keys, derives and caches channel keys, runs the group key
//! exchange and migrates keys between custody modes.
//!
//! # Architecture
//!
//! All state lives in a [`KeySession`], one per user and device. The session
//! never touches the network or disk directly; it talks to three seams:
//!
//! - [`CustodialStore`]: remote versioned key/value store that also hands out
//!   custodian secrets and VetKeys
//! - [`LocalKeyStore`]: device-local persistence for master key records,
//!   the device IV and cached channel KEKs
//! - [`ChannelDirectory`]: channel records with member lists and pending
//!   key-exchange slots
//!
//! Time and randomness come from an [`Environment`], so the whole stack runs
//! deterministically under [`SimEnv`] with the in-memory stores.
//!
//! # Key Hierarchy
//!
//! ```text
//! MasterKey (Local | ECDH | VetKey)
//!     └── Channel KEK (per user, per channel)
//!             └── Channel DEK (shared, stored wrapped on the channel record)
//!                     └── Message
//! ```
//!
//! # Components
//!
//! - [`master_key`]: master key variants, records and the key ring
//! - [`channel_key`]: pure channel key generation and unwrapping
//! - [`KeySession`]: master key lifecycle, channel keys, key exchange and
//!   migration
//! - [`store`]: store traits plus in-memory and fault-injecting
//!   implementations
//! - [`directory`]: channel directory trait and in-memory implementation

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod channel_key;
pub mod config;
pub mod directory;
pub mod env;
mod error;
pub mod event;
pub mod id;
pub mod master_key;
mod session;
pub mod store;

pub use config::KeyConfig;
pub use directory::{ChannelDirectory, ChannelInfo, MemoryChannelDirectory};
pub use env::{Environment, SimEnv, SystemEnv};
pub use error::{ErrorKind, KeyError, StoreError};
pub use event::KeyEvent;
pub use id::{ChannelId, Principal};
pub use master_key::{MasterKey, MasterKeyKind, MasterKeyRecord, MasterKeyRing, MasterKeyState};
pub use session::{ChannelAccess, KeySession, MigrationReport, MigrationTarget};
pub use store::{CustodialStore, LocalKeyStore};
