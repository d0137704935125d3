use crate::error::{Error, Result};
use crate::provider::Version;
use crate::stream::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use securepool::{SecureMode, DEFAULT_SECURE_MEMORY_BUDGET};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default key size in bytes (AES-256).
pub const DEFAULT_KEY_SIZE: usize = 32;

/// Key sizes the stream cipher accepts: AES-128 and AES-256.
pub const SUPPORTED_KEY_SIZES: [usize; 2] = [16, 32];

/// Largest locked pool a config may ask for (1 GiB).
pub const MAX_SECURE_MEMORY_BUDGET: usize = 1 << 30;

/// Minimum provider version accepted by default.
pub const DEFAULT_MIN_PROVIDER_VERSION: Version = Version::new(0, 1, 0);

/// Settings for a [`KeyLifecycle`](crate::KeyLifecycle), fixed once it is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Whether key buffers must, may, or must not live in locked memory
    pub secure_mode: SecureMode,

    /// Upper bound for the locked pool in bytes
    pub secure_memory_budget: usize,

    /// Size of generated and loaded keys in bytes
    pub key_size: usize,

    /// Plaintext bytes per encrypted chunk
    pub chunk_size: usize,

    /// Oldest provider version the lifecycle will initialize against
    pub min_provider_version: Version,

    /// Enables debug diagnostics in the CLI
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            secure_mode: SecureMode::default(),
            secure_memory_budget: DEFAULT_SECURE_MEMORY_BUDGET,
            key_size: DEFAULT_KEY_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            min_provider_version: DEFAULT_MIN_PROVIDER_VERSION,
            debug: false,
        }
    }
}

impl Config {
    /// Creates a Config with default settings
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secure_mode(mut self, mode: SecureMode) -> Self {
        self.secure_mode = mode;
        self
    }

    pub fn with_secure_memory_budget(mut self, bytes: usize) -> Self {
        self.secure_memory_budget = bytes;
        self
    }

    pub fn with_key_size(mut self, bytes: usize) -> Self {
        self.key_size = bytes;
        self
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn with_min_provider_version(mut self, version: Version) -> Self {
        self.min_provider_version = version;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Parses a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("invalid config JSON: {e}")))
    }

    /// Reads and parses a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    /// Checks that the settings can be used together.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_KEY_SIZES.contains(&self.key_size) {
            return Err(Error::Config(format!(
                "key size {} is not supported (expected one of {:?})",
                self.key_size, SUPPORTED_KEY_SIZES
            )));
        }
        if self.secure_mode != SecureMode::Disabled && self.secure_memory_budget < self.key_size {
            return Err(Error::Config(format!(
                "secure memory budget of {} bytes cannot hold a {}-byte key",
                self.secure_memory_budget, self.key_size
            )));
        }
        if self.secure_mode != SecureMode::Disabled && self.secure_memory_budget > MAX_SECURE_MEMORY_BUDGET {
            return Err(Error::Config(format!(
                "secure memory budget of {} bytes exceeds the {} byte limit",
                self.secure_memory_budget, MAX_SECURE_MEMORY_BUDGET
            )));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::Config(format!(
                "chunk size {} must be between 1 and {} bytes",
                self.chunk_size, MAX_CHUNK_SIZE
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new();
        assert_eq!(config.secure_mode, SecureMode::Preferred);
        assert_eq!(config.secure_memory_budget, 65536);
        assert_eq!(config.key_size, 32);
        assert!(!config.debug);
        config.validate().unwrap();
    }

    #[test]
    fn test_builder() {
        let config = Config::new()
            .with_secure_mode(SecureMode::Required)
            .with_secure_memory_budget(4096)
            .with_key_size(16)
            .with_chunk_size(1024)
            .with_debug(true);
        assert_eq!(config.secure_mode, SecureMode::Required);
        assert_eq!(config.secure_memory_budget, 4096);
        assert_eq!(config.key_size, 16);
        assert_eq!(config.chunk_size, 1024);
        assert!(config.debug);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = Config::from_json_str(r#"{"secure_mode": "disabled", "key_size": 16}"#).unwrap();
        assert_eq!(config.secure_mode, SecureMode::Disabled);
        assert_eq!(config.key_size, 16);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_unknown_json_field_rejected() {
        let err = Config::from_json_str(r#"{"keysize": 32}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validation_failures() {
        assert!(Config::new().with_key_size(24).validate().is_err());
        assert!(Config::new().with_chunk_size(0).validate().is_err());
        assert!(Config::new().with_chunk_size(MAX_CHUNK_SIZE + 1).validate().is_err());
        assert!(Config::new().with_secure_memory_budget(8).validate().is_err());
        assert!(Config::new().with_secure_memory_budget(usize::MAX).validate().is_err());
        assert!(Config::new()
            .with_secure_memory_budget(MAX_SECURE_MEMORY_BUDGET + 1)
            .validate()
            .is_err());
        Config::new()
            .with_secure_memory_budget(MAX_SECURE_MEMORY_BUDGET)
            .validate()
            .unwrap();
        // The budget is irrelevant when secure memory is off.
        Config::new()
            .with_secure_mode(SecureMode::Disabled)
            .with_secure_memory_budget(0)
            .validate()
            .unwrap();
    }
}
