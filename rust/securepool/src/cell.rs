use crate::allocator::Allocator;
use crate::buffer::SecureBuffer;
use crate::error::{PoolError, Result};
use log::error;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::sync::Arc;

/// A value that lives inside an allocator buffer.
///
/// Meant for secrets derived from a key, such as an expanded cipher key
/// schedule, so they sit in the same locked memory as the key itself. On drop
/// the value is dropped in place and the buffer is wiped and released.
///
/// `T` must not rely on interior mutability. Moving `value` into
/// [`new`](Self::new) may leave a stale copy in the caller's stack frame,
/// which the cell cannot reach.
pub struct SecureCell<T> {
    buffer: SecureBuffer,
    offset: usize,
    _value: PhantomData<T>,
}

impl<T> fmt::Debug for SecureCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureCell")
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

impl<T> SecureCell<T> {
    /// Moves `value` into a buffer from `allocator`.
    pub fn new(allocator: &Arc<dyn Allocator>, value: T) -> Result<Self> {
        let len = (size_of::<T>() + align_of::<T>() - 1).max(1);
        let mut buffer = SecureBuffer::allocate(allocator, len)?;

        let placed = buffer.with_data_mut(|bytes| {
            let offset = bytes.as_ptr().align_offset(align_of::<T>());
            if offset.checked_add(size_of::<T>())? > bytes.len() {
                return None;
            }
            // SAFETY: `offset` is aligned for `T` and the value fits in the
            // buffer, which nothing else references yet.
            unsafe { bytes.as_mut_ptr().add(offset).cast::<T>().write(value) };
            Some(offset)
        })?;

        let offset = placed.ok_or_else(|| {
            PoolError::InvalidSize(format!("a {len}-byte buffer cannot hold an aligned value"))
        })?;
        Ok(Self {
            buffer,
            offset,
            _value: PhantomData,
        })
    }

    /// Gives `action` shared access to the value.
    pub fn with<F, R>(&self, action: F) -> Result<R>
    where
        F: FnOnce(&T) -> R,
    {
        let offset = self.offset;
        self.buffer.with_data(|bytes| {
            // SAFETY: `new` wrote a `T` at `offset`. It stays there, unaliased
            // by any `&mut`, until the cell is dropped.
            let value = unsafe { &*bytes.as_ptr().add(offset).cast::<T>() };
            action(value)
        })
    }

    pub fn is_secure(&self) -> bool {
        self.buffer.is_secure()
    }
}

impl<T> Drop for SecureCell<T> {
    fn drop(&mut self) {
        let offset = self.offset;
        let dropped = self.buffer.with_data_mut(|bytes| {
            // SAFETY: the value written by `new` is dropped exactly once, here.
            unsafe { std::ptr::drop_in_place(bytes.as_mut_ptr().add(offset).cast::<T>()) }
        });
        if let Err(e) = dropped {
            error!("Failed to drop value in buffer {}: {}", self.buffer.id(), e);
        }
        // The buffer's own drop wipes and releases it.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingAllocator;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[repr(align(16))]
    struct Aligned([u8; 24]);

    struct CountsDrops(Arc<AtomicUsize>);

    impl Drop for CountsDrops {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_value_round_trip() {
        let allocator: Arc<dyn Allocator> = Arc::new(RecordingAllocator::new());
        let cell = SecureCell::new(&allocator, [7_u64; 4]).unwrap();
        assert_eq!(cell.with(|v| v.iter().sum::<u64>()).unwrap(), 28);
        assert!(!cell.is_secure());
        assert_eq!(allocator.outstanding(), 1);
    }

    #[test]
    fn test_value_is_aligned() {
        let allocator: Arc<dyn Allocator> = Arc::new(RecordingAllocator::new());
        let cell = SecureCell::new(&allocator, Aligned([3; 24])).unwrap();
        let (addr, first) = cell.with(|v| (v as *const Aligned as usize, v.0[0])).unwrap();
        assert_eq!(addr % 16, 0);
        assert_eq!(first, 3);
    }

    #[test]
    fn test_drop_runs_value_drop_then_wipes() {
        let recorder = Arc::new(RecordingAllocator::new());
        let allocator: Arc<dyn Allocator> = recorder.clone();
        let drops = Arc::new(AtomicUsize::new(0));

        let cell = SecureCell::new(&allocator, CountsDrops(Arc::clone(&drops))).unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(cell);

        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.outstanding(), 0);
        assert_eq!(recorder.releases(), 1);
        assert!(recorder.released_without_wipe().is_empty());
    }

    #[test]
    fn test_allocation_failure_surfaces() {
        let recorder = Arc::new(RecordingAllocator::new());
        recorder.fail_allocations(true);
        let allocator: Arc<dyn Allocator> = recorder.clone();
        let drops = Arc::new(AtomicUsize::new(0));

        let err = SecureCell::new(&allocator, CountsDrops(Arc::clone(&drops))).unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
