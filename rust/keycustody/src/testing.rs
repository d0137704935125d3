//! Test doubles for the provider seam.
//!
//! [`StubProvider`] reports a chosen version, hands out a shared
//! [`RecordingAllocator`] instead of a real pool, and records which lifecycle
//! hooks it saw.

use crate::provider::{CryptoProvider, Version, SYSTEM_PROVIDER_VERSION};
use securepool::testing::RecordingAllocator;
use securepool::{Allocator, PoolError, SecureMode};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Deterministic [`CryptoProvider`] for tests.
///
/// Random bytes come from a counter, so two fills never repeat within one
/// provider but the output is reproducible across runs.
#[derive(Debug)]
pub struct StubProvider {
    version: Version,
    recorder: Arc<RecordingAllocator>,
    acquire_calls: AtomicUsize,
    finished: AtomicBool,
    fail_random: AtomicBool,
    fail_pool: AtomicBool,
    counter: AtomicU64,
}

impl Default for StubProvider {
    fn default() -> Self {
        Self::with_version(SYSTEM_PROVIDER_VERSION)
    }
}

impl StubProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(version: Version) -> Self {
        Self::with_allocator(version, RecordingAllocator::new())
    }

    /// Uses `allocator` as the pool, e.g. [`RecordingAllocator::pretending_secure`].
    pub fn with_allocator(version: Version, allocator: RecordingAllocator) -> Self {
        Self {
            version,
            recorder: Arc::new(allocator),
            acquire_calls: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            fail_random: AtomicBool::new(false),
            fail_pool: AtomicBool::new(false),
            counter: AtomicU64::new(1),
        }
    }

    /// The allocator returned from every `acquire_pool` call.
    pub fn recorder(&self) -> &Arc<RecordingAllocator> {
        &self.recorder
    }

    pub fn acquire_calls(&self) -> usize {
        self.acquire_calls.load(Ordering::SeqCst)
    }

    /// Whether `initialization_finished` has been called.
    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Makes `fill_random` fail until reset.
    pub fn fail_random(&self, fail: bool) {
        self.fail_random.store(fail, Ordering::SeqCst);
    }

    /// Makes `acquire_pool` fail until reset.
    pub fn fail_pool(&self, fail: bool) {
        self.fail_pool.store(fail, Ordering::SeqCst);
    }
}

impl CryptoProvider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    fn version(&self) -> Version {
        self.version
    }

    fn fill_random(&self, dest: &mut [u8]) -> Result<(), String> {
        if self.fail_random.load(Ordering::SeqCst) {
            return Err("stub random source disabled".into());
        }
        for chunk in dest.chunks_mut(8) {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let bytes = n.wrapping_mul(0x9E37_79B9_7F4A_7C15).to_be_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
        Ok(())
    }

    fn acquire_pool(&self, _mode: SecureMode, _budget: usize) -> Result<Arc<dyn Allocator>, PoolError> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_pool.load(Ordering::SeqCst) {
            return Err(PoolError::AllocationFailed("stub pool disabled".into()));
        }
        let allocator: Arc<dyn Allocator> = self.recorder.clone();
        Ok(allocator)
    }

    fn initialization_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}
