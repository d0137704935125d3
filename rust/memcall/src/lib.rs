//! # memcall
//!
//! Wrappers for the memory-related system calls that back a locked key pool:
//! - anonymous page-aligned mappings
//! - locking pages into RAM and excluding them from core dumps
//! - process resource limits
//!
//! Only unix targets implement the calls. Other targets compile, but every
//! call returns [`MemcallError::NotSupported`], so callers can fall back to
//! ordinary memory.

mod error;
mod types;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as platform;

#[cfg(not(unix))]
mod unsupported;
#[cfg(not(unix))]
use unsupported as platform;

pub use error::MemcallError;
pub use types::RlimitResource;

/// Maps a zero-filled, read-write region of `size` bytes.
///
/// The region is page aligned. Its length is exactly `size`, so callers that
/// want whole pages round up first.
pub fn alloc(size: usize) -> Result<&'static mut [u8], MemcallError> {
    if size == 0 {
        return Err(MemcallError::InvalidArgument(
            "<memcall> cannot allocate zero bytes".to_string(),
        ));
    }
    platform::alloc(size)
}

/// Wipes and unmaps a region previously returned by [`alloc`].
///
/// The slice must not be used after this returns `Ok`.
pub fn free(region: &mut [u8]) -> Result<(), MemcallError> {
    platform::free(region)
}

/// Locks a region into RAM and, where supported, excludes it from core dumps.
pub fn lock(region: &mut [u8]) -> Result<(), MemcallError> {
    platform::lock(region)
}

/// Unlocks a region previously locked with [`lock`].
pub fn unlock(region: &mut [u8]) -> Result<(), MemcallError> {
    platform::unlock(region)
}

/// Returns the system page size.
pub fn page_size() -> usize {
    platform::page_size()
}

/// Sets the core dump size limit of the current process to zero.
pub fn disable_core_dumps() -> Result<(), MemcallError> {
    platform::set_limit(RlimitResource::Core, 0)
}

/// Returns the soft limit for `resource`, or `None` when it is unlimited.
pub fn get_limit(resource: RlimitResource) -> Result<Option<u64>, MemcallError> {
    platform::get_limit(resource)
}
