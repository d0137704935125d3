use crate::allocator::Allocator;
use crate::error::{PoolError, Result};
use crate::heap::HeapAllocator;
use crate::locked::LockedPool;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Default budget for the locked pool, in bytes.
pub const DEFAULT_SECURE_MEMORY_BUDGET: usize = 65536;

/// How strictly key material must be kept out of swappable memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecureMode {
    /// Always use ordinary heap memory. The pool is never touched.
    Disabled,
    /// Use a locked pool if the environment grants one, otherwise fall back to
    /// the heap with a warning.
    #[default]
    Preferred,
    /// Use a locked pool. A refusal is a fatal configuration error.
    Required,
}

impl fmt::Display for SecureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SecureMode::Disabled => "disabled",
            SecureMode::Preferred => "preferred",
            SecureMode::Required => "required",
        };
        f.write_str(name)
    }
}

impl FromStr for SecureMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" | "off" => Ok(SecureMode::Disabled),
            "preferred" => Ok(SecureMode::Preferred),
            "required" | "on" => Ok(SecureMode::Required),
            other => Err(format!("unknown secure mode '{other}'")),
        }
    }
}

/// Builds the allocator for `mode`.
///
/// A locked pool comes back with exhaustion warnings suspended. The caller
/// resumes them once the rest of its configuration has succeeded.
///
/// # Errors
///
/// Under `SecureMode::Required`, any failure to map or lock the pool is
/// returned. `SecureMode::Preferred` only fails for an invalid budget.
pub fn acquire(mode: SecureMode, budget: usize) -> Result<Arc<dyn Allocator>> {
    match mode {
        SecureMode::Disabled => {
            debug!("Secure memory disabled; using heap allocator");
            Ok(Arc::new(HeapAllocator::new()))
        }
        SecureMode::Required => Ok(Arc::new(LockedPool::acquire(budget)?)),
        SecureMode::Preferred => match LockedPool::acquire(budget) {
            Ok(pool) => Ok(Arc::new(pool)),
            Err(e @ PoolError::InvalidSize(_)) => Err(e),
            Err(e) => {
                warn!("Secure memory unavailable, falling back to heap: {}", e);
                Ok(Arc::new(HeapAllocator::new()))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Required".parse::<SecureMode>().unwrap(), SecureMode::Required);
        assert_eq!("off".parse::<SecureMode>().unwrap(), SecureMode::Disabled);
        assert!("sometimes".parse::<SecureMode>().is_err());
        assert_eq!(SecureMode::default(), SecureMode::Preferred);
        assert_eq!(SecureMode::Preferred.to_string(), "preferred");
    }

    #[test]
    fn test_mode_serde() {
        let json = serde_json::to_string(&SecureMode::Required).unwrap();
        assert_eq!(json, "\"required\"");
        let mode: SecureMode = serde_json::from_str("\"disabled\"").unwrap();
        assert_eq!(mode, SecureMode::Disabled);
    }

    #[test]
    fn test_disabled_never_locks() {
        let allocator = acquire(SecureMode::Disabled, DEFAULT_SECURE_MEMORY_BUDGET).unwrap();
        assert!(!allocator.is_secure());
    }

    #[test]
    #[serial]
    fn test_preferred_always_yields_allocator() {
        let allocator = acquire(SecureMode::Preferred, 4096).unwrap();
        let id = allocator.allocate(32).unwrap();
        allocator.release(id).unwrap();
        allocator.teardown().unwrap();
    }

    #[test]
    #[serial]
    fn test_required_is_secure_or_fails() {
        match acquire(SecureMode::Required, 4096) {
            Ok(allocator) => {
                assert!(allocator.is_secure());
                allocator.teardown().unwrap();
            }
            Err(e) => assert!(matches!(e, PoolError::LockFailed { .. }), "unexpected error {e}"),
        }
    }

    #[test]
    fn test_invalid_budget_is_not_masked_by_fallback() {
        assert!(matches!(acquire(SecureMode::Preferred, 0), Err(PoolError::InvalidSize(_))));
        assert!(matches!(
            acquire(SecureMode::Preferred, usize::MAX),
            Err(PoolError::InvalidSize(_))
        ));
    }
}
