use securepool::{Allocator, PoolError, SecureMode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// A `major.minor.patch` version reported by a [`CryptoProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Whether a provider at `self` satisfies a requirement of `required`.
    ///
    /// The major version must match and `self` must not be older. Below 1.0
    /// the minor version is treated as the compatibility boundary instead.
    pub fn satisfies(&self, required: &Version) -> bool {
        if self.major != required.major {
            return false;
        }
        if self.major == 0 && self.minor != required.minor {
            return false;
        }
        self >= required
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '.');
        let mut next = |name: &str| -> Result<u32, String> {
            match parts.next() {
                None => Ok(0),
                Some(p) => p
                    .parse::<u32>()
                    .map_err(|e| format!("invalid {name} component in version '{s}': {e}")),
            }
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        Ok(Version::new(major, minor, patch))
    }
}

impl TryFrom<String> for Version {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

/// The cryptographic library underneath the key lifecycle.
///
/// It supplies the version check, the secure memory pool, the random source,
/// and the "initialization finished" signal. [`SystemProvider`] is the
/// production implementation.
pub trait CryptoProvider: Send + Sync + fmt::Debug {
    /// Human-readable provider name, used in logs.
    fn name(&self) -> &str;

    /// Version of the provider.
    fn version(&self) -> Version;

    /// Whether this provider can serve callers that require `required`.
    fn is_compatible(&self, required: &Version) -> bool {
        self.version().satisfies(required)
    }

    /// Fills `dest` entirely with cryptographically secure random bytes.
    fn fill_random(&self, dest: &mut [u8]) -> Result<(), String>;

    /// Acquires the allocator for key buffers under `mode`.
    fn acquire_pool(&self, mode: SecureMode, budget: usize) -> Result<Arc<dyn Allocator>, PoolError> {
        securepool::acquire(mode, budget)
    }

    /// Signals that configuration is complete and the provider is ready for use.
    fn initialization_finished(&self) {}
}

const fn parse_component(s: &str) -> u32 {
    let bytes = s.as_bytes();
    let mut value = 0_u32;
    let mut i = 0;
    while i < bytes.len() {
        value = value * 10 + (bytes[i] - b'0') as u32;
        i += 1;
    }
    value
}

/// Version reported by [`SystemProvider`]: the version of this crate.
pub const SYSTEM_PROVIDER_VERSION: Version = Version::new(
    parse_component(env!("CARGO_PKG_VERSION_MAJOR")),
    parse_component(env!("CARGO_PKG_VERSION_MINOR")),
    parse_component(env!("CARGO_PKG_VERSION_PATCH")),
);

/// Provider backed by the operating system RNG (`getrandom`) and the locked
/// pool from `securepool`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

impl SystemProvider {
    pub fn new() -> Self {
        Self
    }
}

impl CryptoProvider for SystemProvider {
    fn name(&self) -> &str {
        "system"
    }

    fn version(&self) -> Version {
        SYSTEM_PROVIDER_VERSION
    }

    fn fill_random(&self, dest: &mut [u8]) -> Result<(), String> {
        getrandom::getrandom(dest).map_err(|e| format!("OS random source failed: {e}"))
    }
}
