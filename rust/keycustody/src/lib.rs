//! # keycustody
//!
//! Custody of symmetric keys that protect files at rest.
//!
//! A [`KeyLifecycle`] verifies the crypto provider, configures the memory key
//! buffers come from, and then hands out [`KeyHandle`]s for generated or
//! loaded keys. Key bytes stay inside their buffer and are reachable only
//! through closures. Shutdown wipes every key before releasing its memory.
//!
//! ## Secure memory
//!
//! [`Config::secure_mode`] selects where key buffers live:
//!
//! - `Required`: locked, non-dumpable memory or initialization fails.
//! - `Preferred`: locked memory when the platform grants it, heap otherwise.
//! - `Disabled`: ordinary heap memory, still wiped on release.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use keycustody::{Config, KeyLifecycle};
//! use securepool::SecureMode;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::new()
//!     .with_secure_mode(SecureMode::Preferred)
//!     .with_key_size(32);
//! let lifecycle = KeyLifecycle::new(config)?;
//! lifecycle.initialize()?;
//!
//! let key = lifecycle.generate()?;
//! let mut sealed: Vec<u8> = Vec::new();
//! lifecycle.encrypt_stream(&key, &mut &b"hello world"[..], &mut sealed)?;
//!
//! let mut plain: Vec<u8> = Vec::new();
//! lifecycle.decrypt_stream(&key, &mut sealed.as_slice(), &mut plain)?;
//! assert_eq!(plain, b"hello world");
//!
//! lifecycle.shutdown()?;
//! # Ok(())
//! # }
//! ```

mod config;
mod context;
mod error;
mod key;
mod keyring;
mod lifecycle;
mod provider;
pub mod stream;
pub mod testing;

pub use config::{
    Config, DEFAULT_KEY_SIZE, DEFAULT_MIN_PROVIDER_VERSION, MAX_SECURE_MEMORY_BUDGET, SUPPORTED_KEY_SIZES,
};
pub use error::{Error, Result};
pub use key::{KeyId, KeyMaterial, Origin};
pub use keyring::KeyHandle;
pub use lifecycle::{KeyLifecycle, LifecycleState};
pub use provider::{CryptoProvider, SystemProvider, Version, SYSTEM_PROVIDER_VERSION};

// Re-export for convenience
pub use securepool::SecureMode;
