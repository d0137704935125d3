use crate::allocator::{Allocator, BufferId};
use crate::error::{PoolError, Result};
use crate::util::wipe;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

// `None` once the buffer has been released.
type Slot = Arc<RwLock<Option<Zeroizing<Vec<u8>>>>>;

#[derive(Default)]
struct HeapState {
    live: HashMap<BufferId, Slot>,
    next_id: u64,
    torn_down: bool,
}

/// Allocator backed by ordinary heap memory.
///
/// Used when secure mode is disabled, or as the fallback when locking is
/// refused under `SecureMode::Preferred`. Buffers can be swapped or dumped, but
/// they are still zeroed on wipe, release and drop, and outstanding buffers
/// still block teardown. Callbacks run under the buffer's own lock only.
#[derive(Default)]
pub struct HeapAllocator {
    state: Mutex<HeapState>,
}

impl fmt::Debug for HeapAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapAllocator")
            .field("outstanding", &self.outstanding())
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: BufferId) -> Result<Slot> {
        let state = self.state.lock();
        if state.torn_down {
            return Err(PoolError::TornDown);
        }
        state.live.get(&id).cloned().ok_or(PoolError::UnknownBuffer(id))
    }
}

impl Allocator for HeapAllocator {
    fn is_secure(&self) -> bool {
        false
    }

    fn allocate(&self, len: usize) -> Result<BufferId> {
        if len == 0 {
            return Err(PoolError::InvalidSize("cannot allocate a zero-length buffer".into()));
        }
        let mut state = self.state.lock();
        if state.torn_down {
            return Err(PoolError::TornDown);
        }
        state.next_id += 1;
        let id = BufferId(state.next_id);
        let bytes = Zeroizing::new(vec![0_u8; len]);
        state.live.insert(id, Arc::new(RwLock::new(Some(bytes))));
        Ok(id)
    }

    fn read(&self, id: BufferId, f: &mut dyn FnMut(&[u8])) -> Result<()> {
        let slot = self.slot(id)?;
        let guard = slot.read();
        let buf = guard.as_ref().ok_or(PoolError::Released(id))?;
        f(buf.as_slice());
        Ok(())
    }

    fn write(&self, id: BufferId, f: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        let slot = self.slot(id)?;
        let mut guard = slot.write();
        let buf = guard.as_mut().ok_or(PoolError::Released(id))?;
        f(buf.as_mut_slice());
        Ok(())
    }

    fn wipe(&self, id: BufferId) -> Result<()> {
        self.write(id, &mut |bytes: &mut [u8]| wipe(bytes))
    }

    fn release(&self, id: BufferId) -> Result<()> {
        let slot = self.slot(id)?;
        {
            let mut guard = slot.write();
            let mut buf = guard.take().ok_or(PoolError::Released(id))?;
            wipe(buf.as_mut_slice());
        }
        self.state.lock().live.remove(&id);
        Ok(())
    }

    fn outstanding(&self) -> usize {
        self.state.lock().live.len()
    }

    fn teardown(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.torn_down {
            return Ok(());
        }
        if !state.live.is_empty() {
            return Err(PoolError::OutstandingBuffers(state.live.len()));
        }
        state.torn_down = true;
        Ok(())
    }

    fn is_torn_down(&self) -> bool {
        self.state.lock().torn_down
    }
}
