use crate::error::Result;
use std::fmt;

/// Opaque handle for a buffer handed out by an [`Allocator`].
///
/// Ids are unique per allocator instance and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) u64);

impl BufferId {
    /// Numeric value of the id, for logging and test assertions.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Source of buffers for key material.
///
/// Implementations hand out buffers by id and give access to their bytes only
/// through the `read`/`write` callbacks. Wrap an id in a
/// [`SecureBuffer`](crate::SecureBuffer) rather than calling these directly.
///
/// Contract:
/// - `allocate` returns a buffer whose contents are unspecified.
/// - `wipe` zeroes the full length of a live buffer.
/// - `release` zeroes the full length again before the space is reused.
/// - `teardown` fails with [`PoolError::OutstandingBuffers`](crate::PoolError)
///   while any buffer is live. Once it succeeds, every further call fails with
///   [`PoolError::TornDown`](crate::PoolError).
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Whether buffers live in locked, non-dumpable memory.
    fn is_secure(&self) -> bool;

    /// Allocates a buffer of exactly `len` bytes.
    fn allocate(&self, len: usize) -> Result<BufferId>;

    /// Runs `f` over the bytes of a live buffer.
    fn read(&self, id: BufferId, f: &mut dyn FnMut(&[u8])) -> Result<()>;

    /// Runs `f` over the bytes of a live buffer, allowing mutation.
    fn write(&self, id: BufferId, f: &mut dyn FnMut(&mut [u8])) -> Result<()>;

    /// Overwrites the buffer with zeros without releasing it.
    fn wipe(&self, id: BufferId) -> Result<()>;

    /// Zeroes and reclaims the buffer. The id is invalid afterwards.
    fn release(&self, id: BufferId) -> Result<()>;

    /// Number of buffers allocated and not yet released.
    fn outstanding(&self) -> usize;

    /// Releases the allocator's backing memory.
    fn teardown(&self) -> Result<()>;

    /// Whether `teardown` has completed.
    fn is_torn_down(&self) -> bool;

    /// Stops exhaustion warnings from being logged.
    fn suspend_warnings(&self) {}

    /// Re-enables exhaustion warnings.
    fn resume_warnings(&self) {}
}
