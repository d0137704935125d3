use crate::allocator::{Allocator, BufferId};
use crate::error::{PoolError, Result};
use log::error;
use std::fmt;
use std::sync::Arc;

/// An owned buffer obtained from an [`Allocator`].
///
/// The bytes are reachable only through [`with_data`](Self::with_data) and
/// [`with_data_mut`](Self::with_data_mut). [`destroy`](Self::destroy) always
/// wipes before it releases. Dropping a live buffer destroys it.
pub struct SecureBuffer {
    allocator: Arc<dyn Allocator>,
    id: BufferId,
    len: usize,
    alive: bool,
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureBuffer")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("secure", &self.is_secure())
            .field("alive", &self.alive)
            .finish_non_exhaustive()
    }
}

impl SecureBuffer {
    /// Allocates `len` bytes from `allocator`.
    ///
    /// The contents are unspecified until the caller writes them.
    pub fn allocate(allocator: &Arc<dyn Allocator>, len: usize) -> Result<Self> {
        let id = allocator.allocate(len)?;
        Ok(Self {
            allocator: Arc::clone(allocator),
            id,
            len,
            alive: true,
        })
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_secure(&self) -> bool {
        self.allocator.is_secure()
    }

    /// The allocator this buffer came from.
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Gives `action` read-only access to the bytes.
    pub fn with_data<F, T>(&self, action: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> T,
    {
        if !self.alive {
            return Err(PoolError::Released(self.id));
        }
        let mut action = Some(action);
        let mut out = None;
        self.allocator.read(self.id, &mut |bytes: &[u8]| {
            if let Some(f) = action.take() {
                out = Some(f(bytes));
            }
        })?;
        out.ok_or(PoolError::UnknownBuffer(self.id))
    }

    /// Gives `action` mutable access to the bytes.
    pub fn with_data_mut<F, T>(&mut self, action: F) -> Result<T>
    where
        F: FnOnce(&mut [u8]) -> T,
    {
        if !self.alive {
            return Err(PoolError::Released(self.id));
        }
        let mut action = Some(action);
        let mut out = None;
        self.allocator.write(self.id, &mut |bytes: &mut [u8]| {
            if let Some(f) = action.take() {
                out = Some(f(bytes));
            }
        })?;
        out.ok_or(PoolError::UnknownBuffer(self.id))
    }

    /// Wipes and then releases the buffer. Calling it again is a no-op.
    ///
    /// The buffer counts as dead afterwards even if a step failed. The allocator
    /// zeroes on release as well, so a failed wipe never leaves data behind in
    /// a reused span.
    pub fn destroy(&mut self) -> Result<()> {
        if !self.alive {
            return Ok(());
        }
        self.alive = false;
        let wiped = self.allocator.wipe(self.id);
        let released = self.allocator.release(self.id);
        wiped.and(released)
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            error!("Failed to destroy buffer {} on drop: {}", self.id, e);
        }
    }
}
