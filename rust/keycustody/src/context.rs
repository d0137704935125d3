use crate::config::Config;
use crate::error::{Error, Result};
use crate::provider::CryptoProvider;
use log::{debug, info, warn};
use securepool::{Allocator, SecureMode};
use std::sync::Arc;

/// Process-wide state for one initialized lifecycle.
///
/// Owns the allocator that key buffers come from and the provider that
/// supplies randomness. Built once by [`establish`](Self::establish) and torn
/// down once by [`teardown`](Self::teardown).
#[derive(Debug)]
pub(crate) struct CryptoContext {
    provider: Arc<dyn CryptoProvider>,
    allocator: Arc<dyn Allocator>,
    secure_mode: SecureMode,
    secure_memory_budget: usize,
}

impl CryptoContext {
    /// Checks the provider version, acquires the pool, and signals the
    /// provider that initialization is done.
    ///
    /// Allocator warnings stay suspended while the pool is configured and are
    /// resumed before returning. Nothing is left allocated on failure.
    pub(crate) fn establish(config: &Config, provider: Arc<dyn CryptoProvider>) -> Result<Self> {
        let required = config.min_provider_version;
        let found = provider.version();
        if !provider.is_compatible(&required) {
            return Err(Error::VersionMismatch { required, found });
        }

        let allocator = provider.acquire_pool(config.secure_mode, config.secure_memory_budget)?;
        allocator.suspend_warnings();

        if allocator.is_secure() {
            if let Err(e) = memcall::disable_core_dumps() {
                warn!("Could not disable core dumps: {}", e);
            }
        }

        allocator.resume_warnings();
        provider.initialization_finished();

        info!(
            "Initialized with provider {} {} ({} memory)",
            provider.name(),
            found,
            if allocator.is_secure() { "locked" } else { "heap" }
        );

        Ok(Self {
            provider,
            allocator,
            secure_mode: config.secure_mode,
            secure_memory_budget: config.secure_memory_budget,
        })
    }

    pub(crate) fn provider(&self) -> &dyn CryptoProvider {
        self.provider.as_ref()
    }

    pub(crate) fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    pub(crate) fn secure_mode(&self) -> SecureMode {
        self.secure_mode
    }

    pub(crate) fn secure_memory_budget(&self) -> usize {
        self.secure_memory_budget
    }

    /// Releases the allocator's backing memory. Every key must be gone first.
    pub(crate) fn teardown(self) -> Result<()> {
        debug!(
            "Tearing down {} allocator ({} outstanding)",
            self.secure_mode,
            self.allocator.outstanding()
        );
        self.allocator.teardown()?;
        Ok(())
    }
}
