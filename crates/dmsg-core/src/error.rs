//! Error types for key management.
//!
//! Two layers: [`StoreError`] for the remote collaborators (custodial store,
//! channel directory) and [`KeyError`] for key-management operations. Every
//! `KeyError` maps onto one [`ErrorKind`] of the propagation policy: explicit
//! user actions surface the error, best-effort batches log and skip it.

use dmsg_crypto::CryptoError;
use thiserror::Error;

/// Errors reported by a remote collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Key absent from the store
    ///
    /// Recoverable: callers treat this as "first use" and initialise.
    #[error("not found: {namespace}/{key}")]
    NotFound {
        /// Namespace that was searched
        namespace: String,
        /// Hex form of the missing key
        key: String,
    },

    /// `create` hit an existing key
    #[error("already exists: {namespace}/{key}")]
    AlreadyExists {
        /// Namespace of the existing entry
        namespace: String,
        /// Hex form of the existing key
        key: String,
    },

    /// Transport failure reaching the remote service
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// Remote refused the call (permission or malformed request)
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Classification of a [`KeyError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// AEAD tag mismatch or wrong key. Never more specific than that.
    AuthenticationFailure,
    /// Master key or static ECDH key not opened yet
    PreconditionNotReady,
    /// Remote custodial key absent
    NotFound,
    /// Invalid password, key mismatch, or a remote refusing a write
    ProtocolViolation,
    /// Transport failure calling a remote service
    RemoteUnavailable,
    /// Local failure unrelated to the peer (encoding, KDF parameters)
    Internal,
}

/// Errors from key-management operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// A ciphertext failed to authenticate
    #[error("authentication failed")]
    AuthenticationFailed,

    /// A key needed for the operation is not available
    #[error("{what} not ready")]
    NotReady {
        /// Which key is missing
        what: &'static str,
    },

    /// Remote entry absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Password does not match the published password hash
    #[error("invalid password")]
    InvalidPassword,

    /// A delivered ECDH exchange targets a different public key than ours
    #[error("ECDH public key mismatch")]
    PublicKeyMismatch,

    /// Remote or peer violated the protocol
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Remote service unreachable
    #[error("remote unavailable: {0}")]
    Remote(String),

    /// Cryptographic failure other than authentication
    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    /// Local serialization failure
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl KeyError {
    /// Master key is missing, closed, or belongs to someone else.
    pub const MASTER_KEY_NOT_READY: Self = Self::NotReady { what: "master key" };

    /// An older master key is needed but still closed.
    pub const PREVIOUS_MASTER_KEY_NOT_READY: Self = Self::NotReady { what: "previous master key" };

    /// Static ECDH identity key has not been loaded.
    pub const STATIC_KEY_NOT_READY: Self = Self::NotReady { what: "static ECDH key" };

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthenticationFailed => ErrorKind::AuthenticationFailure,
            Self::NotReady { .. } => ErrorKind::PreconditionNotReady,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidPassword | Self::PublicKeyMismatch | Self::Protocol(_) => {
                ErrorKind::ProtocolViolation
            },
            Self::Remote(_) => ErrorKind::RemoteUnavailable,
            Self::Crypto(_) | Self::Encoding(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if retrying the same call may succeed.
    ///
    /// Only transport failures are transient. Protocol violations are never
    /// retried automatically.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Returns true if this is a first-use condition rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<CryptoError> for KeyError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::DecryptionFailed => Self::AuthenticationFailed,
            other => Self::Crypto(other),
        }
    }
}

impl From<StoreError> for KeyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { namespace, key } => Self::NotFound(format!("{namespace}/{key}")),
            StoreError::Unavailable(reason) => Self::Remote(reason),
            err @ (StoreError::AlreadyExists { .. } | StoreError::Rejected(_)) => {
                Self::Protocol(err.to_string())
            },
        }
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for KeyError {
    fn from(err: ciborium::ser::Error<std::io::Error>) -> Self {
        Self::Encoding(err.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for KeyError {
    fn from(err: ciborium::de::Error<std::io::Error>) -> Self {
        Self::Encoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decryption_failure_maps_to_authentication() {
        let err = KeyError::from(CryptoError::DecryptionFailed);
        assert_eq!(err, KeyError::AuthenticationFailed);
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
    }

    #[test]
    fn other_crypto_errors_are_internal() {
        let err = KeyError::from(CryptoError::InvalidPublicKey);
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn store_not_found_is_recoverable() {
        let err = KeyError::from(StoreError::NotFound {
            namespace: "dmsg".to_string(),
            key: "6b6b".to_string(),
        });
        assert!(err.is_not_found());
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "not found: dmsg/6b6b");
    }

    #[test]
    fn only_remote_failures_are_transient() {
        assert!(KeyError::from(StoreError::Unavailable("timeout".to_string())).is_transient());
        assert!(!KeyError::InvalidPassword.is_transient());
        assert!(!KeyError::MASTER_KEY_NOT_READY.is_transient());
        assert!(!KeyError::AuthenticationFailed.is_transient());
    }

    #[test]
    fn protocol_violations() {
        assert_eq!(KeyError::InvalidPassword.kind(), ErrorKind::ProtocolViolation);
        assert_eq!(KeyError::PublicKeyMismatch.kind(), ErrorKind::ProtocolViolation);
        let rejected = KeyError::from(StoreError::Rejected("not a manager".to_string()));
        assert_eq!(rejected.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn not_ready_display() {
        assert_eq!(KeyError::MASTER_KEY_NOT_READY.to_string(), "master key not ready");
        assert_eq!(KeyError::STATIC_KEY_NOT_READY.kind(), ErrorKind::PreconditionNotReady);
    }
}
