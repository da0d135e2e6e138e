//! Session configuration.

use dmsg_crypto::PasswordParams;

/// Default stretched-password cache lifetime (7 days).
pub const DEFAULT_PASSWORD_TTL_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Configuration for a [`crate::KeySession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyConfig {
    /// Custodial namespace holding this deployment's settings
    pub namespace: String,
    /// Fixed per-deployment master key id
    pub master_key_id: Vec<u8>,
    /// Stretched-password cache lifetime used by `open_master_key` when the
    /// caller does not pass one. 0 disables caching.
    pub password_ttl_ms: u64,
    /// Argon2id cost parameters
    pub password_params: PasswordParams,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            namespace: "dmsg".to_string(),
            master_key_id: b"v1".to_vec(),
            password_ttl_ms: DEFAULT_PASSWORD_TTL_MS,
            password_params: PasswordParams::default(),
        }
    }
}

impl KeyConfig {
    /// Default configuration with cheap Argon2 parameters, for tests.
    pub fn insecure_for_tests() -> Self {
        Self { password_params: PasswordParams::insecure_for_tests(), ..Self::default() }
    }
}
