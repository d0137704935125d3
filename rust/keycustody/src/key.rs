use crate::error::{Error, Result};
use crate::provider::CryptoProvider;
use log::{debug, error};
use securepool::{Allocator, SecureBuffer};
use std::fmt;
use std::sync::Arc;

/// Identifier of a key within one lifecycle. Assigned in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub(crate) u64);

impl KeyId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key-{}", self.0)
    }
}

/// Where a key's bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Generated,
    Loaded,
}

/// One symmetric key and its metadata.
///
/// The bytes live in a [`SecureBuffer`] owned by this value and are reachable
/// only through [`with_bytes`](Self::with_bytes). Destroying the key, or
/// dropping it, wipes the buffer and then releases it.
pub struct KeyMaterial {
    id: KeyId,
    buffer: SecureBuffer,
    origin: Origin,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("id", &self.id)
            .field("size_bytes", &self.size_bytes())
            .field("origin", &self.origin)
            .field("secure", &self.is_secure())
            .finish_non_exhaustive()
    }
}

impl KeyMaterial {
    /// Creates a key of `size` random bytes from `provider`.
    ///
    /// The buffer comes from `allocator`, so it is locked memory when the
    /// allocator is secure. On failure nothing stays allocated.
    ///
    /// # Errors
    ///
    /// * `Error::InvalidKeySize` if `size` is zero.
    /// * `Error::Generation` if allocation fails or the random source cannot
    ///   supply `size` bytes.
    pub fn generate(
        id: KeyId,
        size: usize,
        allocator: &Arc<dyn Allocator>,
        provider: &dyn CryptoProvider,
    ) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidKeySize {
                expected: 1,
                actual: 0,
            });
        }

        let mut buffer = SecureBuffer::allocate(allocator, size)
            .map_err(|e| Error::Generation(format!("could not allocate {size}-byte key buffer: {e}")))?;

        let filled = buffer
            .with_data_mut(|bytes| provider.fill_random(bytes))
            .map_err(|e| e.to_string())
            .and_then(|r| r);

        if let Err(reason) = filled {
            if let Err(e) = buffer.destroy() {
                error!("Failed to destroy buffer after generation failure: {}", e);
            }
            return Err(Error::Generation(format!(
                "random source could not supply {size} bytes: {reason}"
            )));
        }

        debug!(
            "Generated {} ({} bytes, {} memory)",
            id,
            size,
            if buffer.is_secure() { "locked" } else { "heap" }
        );

        Ok(Self {
            id,
            buffer,
            origin: Origin::Generated,
        })
    }

    /// Creates a key from externally supplied bytes.
    ///
    /// # Errors
    ///
    /// * `Error::InvalidKeySize` if `source` is not `expected_size` bytes long.
    ///   In that case nothing is allocated.
    /// * `Error::PoolAllocation` if the buffer cannot be allocated.
    pub fn load(
        id: KeyId,
        source: &[u8],
        expected_size: usize,
        allocator: &Arc<dyn Allocator>,
    ) -> Result<Self> {
        if source.len() != expected_size {
            return Err(Error::InvalidKeySize {
                expected: expected_size,
                actual: source.len(),
            });
        }

        let mut buffer = SecureBuffer::allocate(allocator, expected_size)?;
        buffer.with_data_mut(|bytes| bytes.copy_from_slice(source))?;

        debug!("Loaded {} ({} bytes)", id, expected_size);

        Ok(Self {
            id,
            buffer,
            origin: Origin::Loaded,
        })
    }

    pub fn id(&self) -> KeyId {
        self.id
    }

    pub fn size_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Whether the bytes live in locked memory.
    pub fn is_secure(&self) -> bool {
        self.buffer.is_secure()
    }

    /// Allocator holding the key, for state derived from it.
    pub(crate) fn allocator(&self) -> &Arc<dyn Allocator> {
        self.buffer.allocator()
    }

    /// Gives `action` read-only access to the raw key bytes.
    pub fn with_bytes<F, T>(&self, action: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> T,
    {
        Ok(self.buffer.with_data(action)?)
    }

    /// Wipes the key bytes and releases the buffer.
    pub fn destroy(mut self) -> Result<()> {
        self.buffer.destroy()?;
        debug!("Destroyed {}", self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubProvider;
    use securepool::testing::RecordingAllocator;
    use securepool::HeapAllocator;

    fn heap() -> Arc<dyn Allocator> {
        Arc::new(HeapAllocator::new())
    }

    #[test]
    fn test_generate_sizes_and_uniqueness() {
        let allocator = heap();
        let provider = StubProvider::new();
        for size in [16, 24, 32, 64] {
            let a = KeyMaterial::generate(KeyId(1), size, &allocator, &provider).unwrap();
            let b = KeyMaterial::generate(KeyId(2), size, &allocator, &provider).unwrap();
            assert_eq!(a.size_bytes(), size);
            assert_eq!(a.with_bytes(|k| k.len()).unwrap(), size);
            assert_eq!(a.origin(), Origin::Generated);
            let ka = a.with_bytes(|k| k.to_vec()).unwrap();
            let kb = b.with_bytes(|k| k.to_vec()).unwrap();
            assert_ne!(ka, kb, "two {size}-byte keys should differ");
            a.destroy().unwrap();
            b.destroy().unwrap();
        }
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn test_generate_random_failure_leaves_nothing() {
        let recorder = Arc::new(RecordingAllocator::new());
        let allocator: Arc<dyn Allocator> = recorder.clone();
        let provider = StubProvider::new();
        provider.fail_random(true);

        let err = KeyMaterial::generate(KeyId(1), 32, &allocator, &provider).unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
        assert_eq!(allocator.outstanding(), 0);
        assert_eq!(recorder.allocations(), 1);
        assert!(recorder.released_without_wipe().is_empty());
    }

    #[test]
    fn test_generate_allocation_failure_is_generation_error() {
        let recorder = Arc::new(RecordingAllocator::new());
        recorder.fail_allocations(true);
        let allocator: Arc<dyn Allocator> = recorder.clone();

        let err = KeyMaterial::generate(KeyId(1), 32, &allocator, &StubProvider::new()).unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
    }

    #[test]
    fn test_load_round_trip() {
        let allocator = heap();
        let source: Vec<u8> = (0..32).collect();
        let key = KeyMaterial::load(KeyId(7), &source, 32, &allocator).unwrap();
        assert_eq!(key.origin(), Origin::Loaded);
        assert_eq!(key.id(), KeyId(7));
        assert_eq!(key.with_bytes(|k| k.to_vec()).unwrap(), source);
        key.destroy().unwrap();
    }

    #[test]
    fn test_load_wrong_size_allocates_nothing() {
        let recorder = Arc::new(RecordingAllocator::new());
        let allocator: Arc<dyn Allocator> = recorder.clone();
        for len in [0, 1, 31, 33, 64] {
            let source = vec![0xAB; len];
            match KeyMaterial::load(KeyId(1), &source, 32, &allocator) {
                Err(Error::InvalidKeySize { expected, actual }) => {
                    assert_eq!(expected, 32);
                    assert_eq!(actual, len);
                }
                other => panic!("expected InvalidKeySize for {len} bytes, got {other:?}"),
            }
        }
        assert_eq!(recorder.allocations(), 0);
    }

    #[test]
    fn test_drop_wipes_before_release() {
        let recorder = Arc::new(RecordingAllocator::new());
        let allocator: Arc<dyn Allocator> = recorder.clone();
        {
            let _key = KeyMaterial::load(KeyId(1), &[0xFF; 16], 16, &allocator).unwrap();
        }
        assert_eq!(recorder.releases(), 1);
        assert!(recorder.released_without_wipe().is_empty());
    }

    #[test]
    fn test_debug_is_redacted() {
        let allocator = heap();
        let key = KeyMaterial::load(KeyId(3), b"0123456789abcdef", 16, &allocator).unwrap();
        let rendered = format!("{key:?}");
        assert!(rendered.contains("key-3"));
        assert!(!rendered.contains("0123456789abcdef"));
        assert!(!rendered.contains("48, 49"));
    }
}
