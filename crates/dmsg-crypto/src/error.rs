//! Error types for cryptographic operations

use thiserror::Error;

/// Errors from cryptographic primitives.
///
/// Decryption deliberately has a single failure variant. Callers must not be
/// able to tell a wrong key from a tampered ciphertext or a mismatched AAD.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Authentication failed, the key was wrong, or the envelope was malformed
    #[error("decryption failed")]
    DecryptionFailed,

    /// Invalid key material length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length
        expected: usize,
        /// Actual key length
        actual: usize,
    },

    /// Peer public key is malformed or produced a non-contributory agreement
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Password stretching or key derivation rejected its parameters
    #[error("key derivation failed: {reason}")]
    KeyDerivation {
        /// Reason reported by the KDF
        reason: String,
    },

    /// Envelope could not be encoded
    #[error("encoding failed: {reason}")]
    Encoding {
        /// Reason reported by the encoder
        reason: String,
    },
}

impl CryptoError {
    /// Returns true if this error came from authenticating a ciphertext.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decryption_failure_is_generic() {
        assert_eq!(CryptoError::DecryptionFailed.to_string(), "decryption failed");
        assert!(CryptoError::DecryptionFailed.is_authentication_failure());
    }

    #[test]
    fn key_length_display() {
        let err = CryptoError::InvalidKeyLength { expected: 32, actual: 16 };
        assert_eq!(err.to_string(), "invalid key length: expected 32, got 16");
        assert!(!err.is_authentication_failure());
    }
}
