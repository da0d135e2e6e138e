//! Environment abstraction for deterministic testing.
//!
//! Decouples key management from system resources (wall clock, randomness).
//! Every nonce, key and ephemeral scalar the core generates comes from here,
//! so a seeded [`SimEnv`] reproduces a whole session byte for byte while
//! [`SystemEnv`] uses the OS RNG and real time.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Abstract environment providing wall-clock time and randomness.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Methods are infallible except in exceptional circumstances (e.g., OS
///   entropy exhaustion)
pub trait Environment: Clone + Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    ///
    /// Used for password cache expiry, which is persisted across sessions and
    /// therefore needs wall-clock rather than monotonic time.
    fn wall_clock_ms(&self) -> u64;

    /// Fills the provided buffer with random bytes.
    ///
    /// # Invariants
    ///
    /// - Given the same RNG seed, this produces the same sequence of bytes
    /// - Uses cryptographically secure RNG
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Fixed-size random array, for nonces and key material.
    fn random_array<const N: usize>(&self) -> [u8; N] {
        let mut bytes = [0u8; N];
        self.random_bytes(&mut bytes);
        bytes
    }
}

/// Production environment using system time and the OS RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails. A client without functioning cryptographic
/// randomness would produce repeated nonces and predictable keys, so there is
/// nothing safe to fall back to.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::disallowed_methods)]
    fn wall_clock_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis() as u64)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - keys cannot be generated safely");
    }
}

/// Simulation environment with a seeded RNG and a manual clock.
///
/// Clones share the same RNG stream and clock, so handing a clone to every
/// component keeps the whole simulation on one deterministic sequence.
#[derive(Clone)]
pub struct SimEnv {
    rng: Arc<Mutex<ChaCha20Rng>>,
    clock_ms: Arc<AtomicU64>,
}

impl SimEnv {
    /// Default start time: 2024-01-01T00:00:00Z.
    pub const EPOCH_MS: u64 = 1_704_067_200_000;

    /// Create a simulation environment with a fixed seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            clock_ms: Arc::new(AtomicU64::new(Self::EPOCH_MS)),
        }
    }

    /// Move the clock forward.
    pub fn advance_ms(&self, delta: u64) {
        self.clock_ms.fetch_add(delta, Ordering::SeqCst);
    }

    /// Set the clock to an absolute time.
    pub fn set_clock_ms(&self, now: u64) {
        self.clock_ms.store(now, Ordering::SeqCst);
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl Environment for SimEnv {
    fn wall_clock_ms(&self) -> u64 {
        self.clock_ms.load(Ordering::SeqCst)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}
