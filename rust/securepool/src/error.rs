use crate::allocator::BufferId;
use thiserror::Error;

/// Errors raised by the allocators in this crate.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The environment refused to lock the pool into RAM.
    ///
    /// This usually means the process lacks `CAP_IPC_LOCK` or has a low
    /// `RLIMIT_MEMLOCK`. It is fatal under `SecureMode::Required` and triggers
    /// the heap fallback under `SecureMode::Preferred`.
    #[error("Failed to lock {bytes} bytes of secure memory (memlock limit: {limit}): {source}")]
    LockFailed {
        /// Size of the region that could not be locked.
        bytes: usize,
        /// Soft `RLIMIT_MEMLOCK` at the time of the failure, rendered for display.
        limit: String,
        /// Underlying system call failure.
        #[source]
        source: memcall::MemcallError,
    },

    /// The backing region could not be mapped.
    #[error("Failed to allocate secure memory: {0}")]
    AllocationFailed(String),

    /// The pool has no free span large enough for the request.
    #[error("Secure memory exhausted: requested {requested} bytes, {available} bytes free")]
    Exhausted {
        /// Bytes requested by the caller.
        requested: usize,
        /// Total free bytes left in the pool.
        available: usize,
    },

    /// A zero or otherwise unusable size was requested.
    #[error("Invalid size specified: {0}")]
    InvalidSize(String),

    /// The allocator has no live buffer with this id.
    #[error("Unknown buffer {0}")]
    UnknownBuffer(BufferId),

    /// The buffer handle was already wiped and released.
    #[error("Buffer {0} has already been released")]
    Released(BufferId),

    /// Teardown was refused because buffers are still allocated.
    #[error("Refusing to tear down pool with {0} outstanding buffer(s)")]
    OutstandingBuffers(usize),

    /// The allocator was torn down and can no longer be used.
    #[error("Secure memory pool has been torn down")]
    TornDown,

    /// A failure from the `memcall` layer.
    #[error("Memory system error: {0}")]
    Memcall(#[from] memcall::MemcallError),
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
