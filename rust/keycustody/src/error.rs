use crate::key::KeyId;
use crate::lifecycle::LifecycleState;
use crate::provider::Version;
use securepool::PoolError;
use thiserror::Error;

/// Result type for keycustody operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing or using key material
#[derive(Error, Debug)]
pub enum Error {
    /// The crypto provider is older than, or incompatible with, the configured minimum
    #[error("Provider version mismatch: required {required}, found {found}")]
    VersionMismatch { required: Version, found: Version },

    /// The allocator could not provide or manage memory for key material
    #[error("Secure memory error: {0}")]
    PoolAllocation(#[from] PoolError),

    /// The random source or the allocator failed while creating a key
    #[error("Key generation failed: {0}")]
    Generation(String),

    /// Supplied key bytes do not match the configured key size
    #[error("Invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    /// Encryption or decryption failed; any output written so far is invalid
    #[error("Cipher error: {0}")]
    Cipher(String),

    /// An operation was invoked in a state that does not allow it
    #[error("Lifecycle violation: {operation} is not allowed while {state}")]
    LifecycleViolation {
        operation: &'static str,
        state: LifecycleState,
    },

    /// Called from code this lifecycle lent key material to on the same thread
    #[error("{operation} was called while this thread is borrowing key material from the same lifecycle")]
    KeyBorrowed { operation: &'static str },

    /// The key behind a handle has already been destroyed
    #[error("Key not found: {0}")]
    KeyNotFound(KeyId),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),
}
