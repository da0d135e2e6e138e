//! Chaotic custodial store for fault injection testing
//!
//! Wraps another [`CustodialStore`] and randomly fails calls with
//! [`StoreError::Unavailable`]. Used to check that best-effort batches (request
//! servicing, migration) log and skip failures and can be resumed.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use dmsg_crypto::EcdhRemote;

use super::{CustodialStore, EcdhInput, Setting, SettingInput, SettingPath};
use crate::error::StoreError;

/// Custodial store wrapper that randomly injects transport failures
///
/// Clones share the RNG state and counters.
#[derive(Clone)]
pub struct ChaoticStore<S> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    /// Calls attempted
    operation_count: Arc<AtomicUsize>,
    /// Calls failed by injection
    failure_count: Arc<AtomicUsize>,
}

/// Linear congruential generator, so chaos runs are reproducible per seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: CustodialStore> ChaoticStore<S> {
    /// Wrap `inner` with a fixed default seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Wrap `inner` with an explicit seed for reproducible chaos.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    #[allow(clippy::panic)]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
            failure_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying store (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of calls attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::SeqCst)
    }

    /// Number of calls failed by injection.
    pub fn failure_count(&self) -> usize {
        self.failure_count.load(Ordering::SeqCst)
    }

    /// Count the call and decide whether it fails.
    fn inject(&self, operation: &str) -> Result<(), StoreError> {
        self.operation_count.fetch_add(1, Ordering::SeqCst);

        let roll = self.rng.lock().unwrap_or_else(PoisonError::into_inner).next();
        if roll < self.failure_rate {
            self.failure_count.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable(format!("chaotic failure injection: {operation}")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: CustodialStore> CustodialStore for ChaoticStore<S> {
    async fn get(&self, path: &SettingPath, versioned: bool) -> Result<Setting, StoreError> {
        self.inject("get")?;
        self.inner.get(path, versioned).await
    }

    async fn create(&self, path: &SettingPath, input: SettingInput) -> Result<u32, StoreError> {
        self.inject("create")?;
        self.inner.create(path, input).await
    }

    async fn upsert(&self, path: &SettingPath, input: SettingInput) -> Result<u32, StoreError> {
        self.inject("upsert")?;
        self.inner.upsert(path, input).await
    }

    async fn ecdh_cose_encrypted_key(
        &self,
        path: &SettingPath,
        input: EcdhInput,
    ) -> Result<EcdhRemote, StoreError> {
        self.inject("ecdh_cose_encrypted_key")?;
        self.inner.ecdh_cose_encrypted_key(path, input).await
    }

    async fn vetkey(&self, path: &SettingPath) -> Result<Vec<u8>, StoreError> {
        self.inject("vetkey")?;
        self.inner.vetkey(path).await
    }
}
