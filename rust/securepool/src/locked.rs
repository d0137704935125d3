use crate::allocator::{Allocator, BufferId};
use crate::error::{PoolError, Result};
use crate::util::{round_to_page_size, round_up, wipe, GRANULE};
use log::{debug, error, warn};
use memcall::RlimitResource;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    offset: usize,
    len: usize,
}

impl Span {
    fn end(self) -> usize {
        self.offset + self.len
    }
}

#[derive(Debug, Clone, Copy)]
struct Allocation {
    span: Span,
    len: usize,
}

// Per-buffer lock. Holds `true` until the buffer is released.
type Gate = Arc<RwLock<bool>>;

struct Entry {
    alloc: Allocation,
    gate: Gate,
}

struct PoolState {
    // Sorted by offset, never adjacent (adjacent spans are merged on release).
    free: Vec<Span>,
    live: HashMap<BufferId, Entry>,
    next_id: u64,
    torn_down: bool,
}

impl PoolState {
    fn entry(&self, id: BufferId) -> Result<(Allocation, Gate)> {
        if self.torn_down {
            return Err(PoolError::TornDown);
        }
        self.live
            .get(&id)
            .map(|e| (e.alloc, Arc::clone(&e.gate)))
            .ok_or(PoolError::UnknownBuffer(id))
    }

    fn free_bytes(&self) -> usize {
        self.free.iter().map(|s| s.len).sum()
    }

    fn insert_free(&mut self, span: Span) {
        let idx = self.free.partition_point(|s| s.offset < span.offset);
        self.free.insert(idx, span);

        if idx + 1 < self.free.len() && self.free[idx].end() == self.free[idx + 1].offset {
            self.free[idx].len += self.free[idx + 1].len;
            self.free.remove(idx + 1);
        }
        if idx > 0 && self.free[idx - 1].end() == self.free[idx].offset {
            self.free[idx - 1].len += self.free[idx].len;
            self.free.remove(idx);
        }
    }
}

/// A fixed-size pool of locked memory that buffers are carved out of.
///
/// The pool maps its whole budget up front, locks it with `mlock`, and marks it
/// `MADV_DONTDUMP` on Linux. Buffers come from a first-fit free list with
/// 16-byte granularity. Released spans are zeroed and merged with their
/// neighbours.
///
/// The pool mutex only guards the free list and the buffer table. `read` and
/// `write` callbacks run under the buffer's own lock, so a callback may
/// allocate or release other buffers from the same pool.
pub struct LockedPool {
    region: NonNull<[u8]>,
    state: Mutex<PoolState>,
    capacity: usize,
    warnings_suspended: AtomicBool,
}

// SAFETY: the region is a private mapping owned by the pool. A buffer's bytes
// are only touched while holding its gate, and live spans never overlap.
unsafe impl Send for LockedPool {}
unsafe impl Sync for LockedPool {}

impl fmt::Debug for LockedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedPool")
            .field("capacity", &self.capacity)
            .field("outstanding", &self.outstanding())
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

impl LockedPool {
    /// Maps and locks at least `max_bytes` of memory, rounded up to whole pages.
    ///
    /// The returned pool starts with exhaustion warnings suspended. Call
    /// [`Allocator::resume_warnings`] once configuration is finished.
    ///
    /// # Errors
    ///
    /// * `PoolError::InvalidSize` if `max_bytes` is zero or too large to round
    ///   up to whole pages.
    /// * `PoolError::Memcall` if the region cannot be mapped.
    /// * `PoolError::LockFailed` if the environment refuses to lock the region.
    ///   In that case the mapping has already been released.
    pub fn acquire(max_bytes: usize) -> Result<Self> {
        if max_bytes == 0 {
            return Err(PoolError::InvalidSize("pool budget must be non-zero".into()));
        }

        let capacity = round_to_page_size(max_bytes).ok_or_else(|| {
            PoolError::InvalidSize(format!("pool budget of {max_bytes} bytes is too large"))
        })?;
        let region = memcall::alloc(capacity)?;

        if let Err(source) = memcall::lock(region) {
            let limit = match memcall::get_limit(RlimitResource::MemLock) {
                Ok(Some(bytes)) => bytes.to_string(),
                Ok(None) => "unlimited".to_string(),
                Err(_) => "unknown".to_string(),
            };
            if let Err(e) = memcall::free(region) {
                error!("Failed to unmap pool after lock failure: {}", e);
            }
            return Err(PoolError::LockFailed {
                bytes: capacity,
                limit,
                source,
            });
        }

        debug!("Locked secure memory pool of {} bytes", capacity);

        Ok(Self {
            region: NonNull::from(region),
            state: Mutex::new(PoolState {
                free: vec![Span {
                    offset: 0,
                    len: capacity,
                }],
                live: HashMap::new(),
                next_id: 1,
                torn_down: false,
            }),
            capacity,
            warnings_suspended: AtomicBool::new(true),
        })
    }

    /// Total size of the locked region in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes not currently handed out.
    pub fn available(&self) -> usize {
        self.state.lock().free_bytes()
    }

    /// Whether exhaustion warnings are currently suppressed.
    pub fn warnings_suspended(&self) -> bool {
        self.warnings_suspended.load(Ordering::SeqCst)
    }

    fn base(&self) -> *mut u8 {
        self.region.cast::<u8>().as_ptr()
    }

    // Wipes, unlocks and unmaps the region, reporting the first failure.
    //
    // Only called once the pool is marked torn down with no live buffers.
    fn unmap(&self) -> Result<()> {
        // SAFETY: with no live buffers and `torn_down` set, no gate grants
        // access to the region any more, so this is the only reference.
        let region = unsafe { &mut *self.region.as_ptr() };
        wipe(region);
        let unlocked = memcall::unlock(region);
        let freed = memcall::free(region);
        unlocked.and(freed).map_err(PoolError::from)
    }
}

impl Allocator for LockedPool {
    fn is_secure(&self) -> bool {
        true
    }

    fn allocate(&self, len: usize) -> Result<BufferId> {
        if len == 0 {
            return Err(PoolError::InvalidSize("cannot allocate a zero-length buffer".into()));
        }
        let needed = round_up(len, GRANULE)
            .ok_or_else(|| PoolError::InvalidSize(format!("{len} bytes cannot be allocated")))?;

        let mut state = self.state.lock();
        if state.torn_down {
            return Err(PoolError::TornDown);
        }

        let Some(idx) = state.free.iter().position(|s| s.len >= needed) else {
            let available = state.free_bytes();
            if !self.warnings_suspended() {
                warn!(
                    "Secure memory pool exhausted: requested {} bytes, {} free of {}",
                    len, available, self.capacity
                );
            }
            return Err(PoolError::Exhausted {
                requested: len,
                available,
            });
        };

        let span = Span {
            offset: state.free[idx].offset,
            len: needed,
        };
        if state.free[idx].len == needed {
            state.free.remove(idx);
        } else {
            state.free[idx].offset += needed;
            state.free[idx].len -= needed;
        }

        let id = BufferId(state.next_id);
        state.next_id += 1;
        state.live.insert(
            id,
            Entry {
                alloc: Allocation { span, len },
                gate: Arc::new(RwLock::new(true)),
            },
        );
        Ok(id)
    }

    fn read(&self, id: BufferId, f: &mut dyn FnMut(&[u8])) -> Result<()> {
        let (a, gate) = self.state.lock().entry(id)?;
        let live = gate.read();
        if !*live {
            return Err(PoolError::Released(id));
        }
        // SAFETY: a live gate keeps the span allocated and the region mapped,
        // and the shared lock excludes writers to this span.
        let bytes = unsafe { std::slice::from_raw_parts(self.base().add(a.span.offset), a.len) };
        f(bytes);
        Ok(())
    }

    fn write(&self, id: BufferId, f: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        let (a, gate) = self.state.lock().entry(id)?;
        let live = gate.write();
        if !*live {
            return Err(PoolError::Released(id));
        }
        // SAFETY: as in `read`, with the exclusive lock held.
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.base().add(a.span.offset), a.len) };
        f(bytes);
        Ok(())
    }

    fn wipe(&self, id: BufferId) -> Result<()> {
        let (a, gate) = self.state.lock().entry(id)?;
        let live = gate.write();
        if !*live {
            return Err(PoolError::Released(id));
        }
        // SAFETY: as in `write`, over the whole span.
        wipe(unsafe { std::slice::from_raw_parts_mut(self.base().add(a.span.offset), a.span.len) });
        Ok(())
    }

    fn release(&self, id: BufferId) -> Result<()> {
        let (a, gate) = self.state.lock().entry(id)?;
        {
            let mut live = gate.write();
            if !*live {
                return Err(PoolError::Released(id));
            }
            *live = false;
            // SAFETY: as in `wipe`. The entry stays in the table until the
            // span is zeroed, so teardown cannot unmap it underneath us.
            wipe(unsafe { std::slice::from_raw_parts_mut(self.base().add(a.span.offset), a.span.len) });
        }

        let mut state = self.state.lock();
        state.live.remove(&id);
        state.insert_free(a.span);
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
            error!(
                "Secure memory teardown refused: {} buffer(s) still allocated",
                state.live.len()
            );
            return Err(PoolError::OutstandingBuffers(state.live.len()));
        }
        state.torn_down = true;
        state.free.clear();
        self.unmap()?;
        debug!("Secure memory pool of {} bytes torn down", self.capacity);
        Ok(())
    }

    fn is_torn_down(&self) -> bool {
        self.state.lock().torn_down
    }

    fn suspend_warnings(&self) {
        self.warnings_suspended.store(true, Ordering::SeqCst);
    }

    fn resume_warnings(&self) {
        self.warnings_suspended.store(false, Ordering::SeqCst);
    }
}

impl Drop for LockedPool {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.torn_down {
            return;
        }
        if !state.live.is_empty() {
            error!(
                "Secure memory pool dropped with {} outstanding buffer(s); force-wiping",
                state.live.len()
            );
            state.live.clear();
        }
        state.torn_down = true;
        if let Err(e) = self.unmap() {
            error!("Failed to release secure memory pool on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn pool_or_skip(bytes: usize) -> Option<LockedPool> {
        match LockedPool::acquire(bytes) {
            Ok(pool) => Some(pool),
            Err(PoolError::LockFailed { .. }) => {
                eprintln!("mlock unavailable in this environment, skipping");
                None
            }
            Err(e) => panic!("unexpected acquire failure: {e}"),
        }
    }

    fn peek(pool: &LockedPool, offset: usize, len: usize) -> Vec<u8> {
        assert!(offset + len <= pool.capacity());
        unsafe { std::slice::from_raw_parts(pool.base().add(offset), len) }.to_vec()
    }

    #[test]
    #[serial]
    fn test_first_fit_and_coalescing() {
        let Some(pool) = pool_or_skip(4096) else { return };
        let capacity = pool.capacity();

        let a = pool.allocate(20).unwrap();
        let b = pool.allocate(16).unwrap();
        let c = pool.allocate(100).unwrap();
        assert_eq!(pool.available(), capacity - 32 - 16 - 112);

        // Free the middle span, then its left neighbour; they must merge.
        pool.release(b).unwrap();
        pool.release(a).unwrap();
        {
            let state = pool.state.lock();
            assert_eq!(state.free[0], Span { offset: 0, len: 48 });
        }

        // A 48-byte request fits exactly in the merged hole.
        let d = pool.allocate(48).unwrap();
        {
            let state = pool.state.lock();
            assert_eq!(state.live[&d].alloc.span.offset, 0);
        }

        pool.release(c).unwrap();
        pool.release(d).unwrap();
        assert_eq!(pool.available(), capacity);
        assert_eq!(pool.state.lock().free.len(), 1);
        pool.teardown().unwrap();
    }

    #[test]
    #[serial]
    fn test_release_zeroes_span() {
        let Some(pool) = pool_or_skip(4096) else { return };
        let id = pool.allocate(32).unwrap();
        pool.write(id, &mut |d: &mut [u8]| d.fill(0x5A)).unwrap();
        let offset = pool.state.lock().live[&id].alloc.span.offset;
        assert_eq!(peek(&pool, offset, 32), vec![0x5A; 32]);

        pool.release(id).unwrap();
        assert_eq!(peek(&pool, offset, 32), vec![0; 32]);
        assert!(matches!(pool.release(id), Err(PoolError::UnknownBuffer(_))));
        pool.teardown().unwrap();
    }

    #[test]
    #[serial]
    fn test_callback_can_use_the_pool() {
        let Some(pool) = pool_or_skip(4096) else { return };
        let key = pool.allocate(32).unwrap();

        let mut inner = None;
        pool.read(key, &mut |_: &[u8]| {
            let id = pool.allocate(64).unwrap();
            pool.write(id, &mut |d: &mut [u8]| d.fill(1)).unwrap();
            pool.release(id).unwrap();
            inner = Some(id);
        })
        .unwrap();
        assert!(inner.is_some());
        assert_eq!(pool.outstanding(), 1);

        pool.release(key).unwrap();
        pool.teardown().unwrap();
    }

    #[test]
    #[serial]
    fn test_exhaustion_is_reported_not_retried() {
        let Some(pool) = pool_or_skip(4096) else { return };
        pool.resume_warnings();
        let capacity = pool.capacity();

        let big = pool.allocate(capacity).unwrap();
        match pool.allocate(1) {
            Err(PoolError::Exhausted { requested, available }) => {
                assert_eq!(requested, 1);
                assert_eq!(available, 0);
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert!(matches!(pool.allocate(usize::MAX), Err(PoolError::InvalidSize(_))));
        pool.release(big).unwrap();
        pool.teardown().unwrap();
    }

    #[test]
    #[serial]
    fn test_teardown_refuses_outstanding_then_succeeds() {
        let Some(pool) = pool_or_skip(4096) else { return };
        let id = pool.allocate(32).unwrap();

        assert!(matches!(pool.teardown(), Err(PoolError::OutstandingBuffers(1))));
        assert!(!pool.is_torn_down());

        pool.release(id).unwrap();
        pool.teardown().unwrap();
        assert!(pool.is_torn_down());
        assert!(matches!(pool.allocate(8), Err(PoolError::TornDown)));
        // Idempotent.
        pool.teardown().unwrap();
    }

    #[test]
    #[serial]
    fn test_warnings_start_suspended() {
        let Some(pool) = pool_or_skip(4096) else { return };
        assert!(pool.warnings_suspended());
        pool.resume_warnings();
        assert!(!pool.warnings_suspended());
        pool.teardown().unwrap();
    }

    #[test]
    fn test_zero_budget_rejected() {
        assert!(matches!(LockedPool::acquire(0), Err(PoolError::InvalidSize(_))));
    }

    #[test]
    fn test_oversized_budget_rejected_before_mapping() {
        assert!(matches!(LockedPool::acquire(usize::MAX), Err(PoolError::InvalidSize(_))));
    }
}
