//! Test doubles for code that sits on top of an [`Allocator`].
//!
//! [`RecordingAllocator`] behaves like the heap allocator but keeps an ordered
//! log of every call. Tests use it to prove that key buffers are wiped before
//! they are released, and that refused operations never reach the allocator.

use crate::allocator::{Allocator, BufferId};
use crate::error::{PoolError, Result};
use crate::heap::HeapAllocator;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// One call observed by a [`RecordingAllocator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocatorEvent {
    Allocate { id: BufferId, len: usize },
    Wipe { id: BufferId },
    /// `zeroed` is whether every byte was zero when release was called.
    Release { id: BufferId, zeroed: bool },
    Teardown { outstanding: usize },
    SuspendWarnings,
    ResumeWarnings,
}

/// Heap-backed allocator that records every call it receives.
#[derive(Debug, Default)]
pub struct RecordingAllocator {
    inner: HeapAllocator,
    events: Mutex<Vec<AllocatorEvent>>,
    report_secure: bool,
    fail_allocations: AtomicBool,
}

impl RecordingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Like [`new`](Self::new), but reports itself as secure.
    pub fn pretending_secure() -> Self {
        Self {
            report_secure: true,
            ..Self::default()
        }
    }

    /// Makes every following `allocate` fail with `Exhausted`.
    pub fn fail_allocations(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::SeqCst);
    }

    /// All events so far, in call order.
    pub fn events(&self) -> Vec<AllocatorEvent> {
        self.events.lock().clone()
    }

    pub fn allocations(&self) -> usize {
        self.count(|e| matches!(e, AllocatorEvent::Allocate { .. }))
    }

    pub fn releases(&self) -> usize {
        self.count(|e| matches!(e, AllocatorEvent::Release { .. }))
    }

    /// Buffers whose release was not preceded by a wipe, or that still held
    /// non-zero bytes when released.
    pub fn released_without_wipe(&self) -> Vec<BufferId> {
        let events = self.events.lock();
        let mut offenders = Vec::new();
        for (pos, event) in events.iter().enumerate() {
            if let AllocatorEvent::Release { id, zeroed } = event {
                let wiped_first = events[..pos]
                    .iter()
                    .any(|e| matches!(e, AllocatorEvent::Wipe { id: w } if w == id));
                if !wiped_first || !zeroed {
                    offenders.push(*id);
                }
            }
        }
        offenders
    }

    fn count(&self, pred: impl Fn(&AllocatorEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    fn record(&self, event: AllocatorEvent) {
        self.events.lock().push(event);
    }
}

impl Allocator for RecordingAllocator {
    fn is_secure(&self) -> bool {
        self.report_secure
    }

    fn allocate(&self, len: usize) -> Result<BufferId> {
        if self.fail_allocations.load(Ordering::SeqCst) {
            return Err(PoolError::Exhausted {
                requested: len,
                available: 0,
            });
        }
        let id = self.inner.allocate(len)?;
        self.record(AllocatorEvent::Allocate { id, len });
        Ok(id)
    }

    fn read(&self, id: BufferId, f: &mut dyn FnMut(&[u8])) -> Result<()> {
        self.inner.read(id, f)
    }

    fn write(&self, id: BufferId, f: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        self.inner.write(id, f)
    }

    fn wipe(&self, id: BufferId) -> Result<()> {
        self.inner.wipe(id)?;
        self.record(AllocatorEvent::Wipe { id });
        Ok(())
    }

    fn release(&self, id: BufferId) -> Result<()> {
        let mut zeroed = false;
        self.inner
            .read(id, &mut |bytes: &[u8]| zeroed = bytes.iter().all(|&b| b == 0))?;
        self.inner.release(id)?;
        self.record(AllocatorEvent::Release { id, zeroed });
        Ok(())
    }

    fn outstanding(&self) -> usize {
        self.inner.outstanding()
    }

    fn teardown(&self) -> Result<()> {
        self.record(AllocatorEvent::Teardown {
            outstanding: self.inner.outstanding(),
        });
        self.inner.teardown()
    }

    fn is_torn_down(&self) -> bool {
        self.inner.is_torn_down()
    }

    fn suspend_warnings(&self) {
        self.record(AllocatorEvent::SuspendWarnings);
    }

    fn resume_warnings(&self) {
        self.record(AllocatorEvent::ResumeWarnings);
    }
}
