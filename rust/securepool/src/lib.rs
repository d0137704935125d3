//! # securepool
//!
//! Memory for key material that should not reach swap or core dumps.
//!
//! - [`LockedPool`] maps one region up front, locks it into RAM, and carves
//!   buffers out of it.
//! - [`HeapAllocator`] is the ordinary-memory allocator for when secure mode is
//!   off or unavailable.
//! - [`SecureBuffer`] owns one buffer and always wipes it before releasing it.
//! - [`SecureCell`] keeps a typed value, such as a cipher key schedule, inside
//!   a buffer.
//! - [`acquire`] picks the allocator for a [`SecureMode`], making the fallback
//!   policy explicit.
//!
//! ```rust,no_run
//! use securepool::{acquire, SecureBuffer, SecureMode};
//!
//! let allocator = acquire(SecureMode::Preferred, 65536)?;
//! let mut key = SecureBuffer::allocate(&allocator, 32)?;
//! key.with_data_mut(|bytes| bytes.fill(0x42))?;
//! key.destroy()?;
//! allocator.teardown()?;
//! # Ok::<(), securepool::PoolError>(())
//! ```

mod allocator;
mod buffer;
mod cell;
mod error;
mod heap;
mod locked;
mod policy;
mod util;

pub mod testing;

pub use allocator::{Allocator, BufferId};
pub use buffer::SecureBuffer;
pub use cell::SecureCell;
pub use error::{PoolError, Result};
pub use heap::HeapAllocator;
pub use locked::LockedPool;
pub use policy::{acquire, SecureMode, DEFAULT_SECURE_MEMORY_BUDGET};
pub use util::{round_to_page_size, wipe};
