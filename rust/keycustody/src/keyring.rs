use crate::error::{Error, Result};
use crate::key::{KeyId, KeyMaterial};
use log::{debug, error};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;

pub(crate) type Slot = Arc<RwLock<Option<KeyMaterial>>>;

/// Reference to one keyring entry.
///
/// Handles are cheap to clone and stay valid after the key is destroyed;
/// using one then reports [`Error::KeyNotFound`].
#[derive(Clone)]
pub struct KeyHandle {
    id: KeyId,
    size: usize,
    slot: Slot,
}

impl fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHandle")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl KeyHandle {
    pub fn id(&self) -> KeyId {
        self.id
    }

    /// Key size recorded when the entry was created.
    pub fn size_bytes(&self) -> usize {
        self.size
    }

    pub(crate) fn slot(&self) -> &Slot {
        &self.slot
    }
}

struct Entry {
    id: KeyId,
    size: usize,
    slot: Slot,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    next_id: u64,
}

/// Owning collection of live keys, in creation order.
#[derive(Default)]
pub(crate) struct Keyring {
    inner: Mutex<Inner>,
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyring")
            .field("entries", &self.len())
            .finish()
    }
}

impl Keyring {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Creates a key with a fresh id via `make` and stores it.
    ///
    /// The keyring stays locked while `make` runs, so ids follow insertion
    /// order. Nothing is stored if `make` fails.
    pub(crate) fn insert_with<F>(&self, make: F) -> Result<KeyHandle>
    where
        F: FnOnce(KeyId) -> Result<KeyMaterial>,
    {
        let mut inner = self.inner.lock();
        let id = KeyId(inner.next_id + 1);
        let key = make(id)?;
        inner.next_id = id.0;

        let size = key.size_bytes();
        let slot = Arc::new(RwLock::new(Some(key)));
        inner.entries.push(Entry {
            id,
            size,
            slot: Arc::clone(&slot),
        });
        Ok(KeyHandle { id, size, slot })
    }

    fn contains(&self, id: KeyId) -> bool {
        self.inner.lock().entries.iter().any(|e| e.id == id)
    }

    /// Replaces the key behind `handle`.
    ///
    /// The old key is destroyed before `make` runs. If `make` fails the slot
    /// stays empty.
    pub(crate) fn rebind<F>(&self, handle: &KeyHandle, make: F) -> Result<()>
    where
        F: FnOnce(KeyId, usize) -> Result<KeyMaterial>,
    {
        let (id, size, slot) = {
            let inner = self.inner.lock();
            let entry = inner
                .entries
                .iter()
                .find(|e| e.id == handle.id)
                .ok_or(Error::KeyNotFound(handle.id))?;
            (entry.id, entry.size, Arc::clone(&entry.slot))
        };

        // Slot locks are never taken with the keyring mutex held. The entry may
        // have been removed while we waited for the write lock.
        let mut slot = slot.write();
        if !self.contains(id) {
            return Err(Error::KeyNotFound(id));
        }
        if let Some(old) = slot.take() {
            old.destroy()?;
        }
        *slot = Some(make(id, size)?);
        Ok(())
    }

    /// Removes the entry behind `handle` and returns its key, if any.
    ///
    /// Waits for readers of the entry to finish before taking the key.
    pub(crate) fn remove(&self, handle: &KeyHandle) -> Result<Option<KeyMaterial>> {
        let entry = {
            let mut inner = self.inner.lock();
            let pos = inner
                .entries
                .iter()
                .position(|e| e.id == handle.id)
                .ok_or(Error::KeyNotFound(handle.id))?;
            inner.entries.remove(pos)
        };
        let key = entry.slot.write().take();
        Ok(key)
    }

    /// Destroys every key and empties the keyring.
    ///
    /// Each entry is visited once, in creation order. A failure does not stop
    /// the walk. Returns the number of keys destroyed, or the first error.
    pub(crate) fn wipe_all(&self) -> Result<usize> {
        let entries = std::mem::take(&mut self.inner.lock().entries);

        let mut destroyed = 0;
        let mut first_error = None;
        for entry in &entries {
            let key = entry.slot.write().take();
            let Some(key) = key else { continue };
            match key.destroy() {
                Ok(()) => destroyed += 1,
                Err(e) => {
                    error!("Failed to destroy {}: {}", entry.id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        debug!("Wiped {} of {} keyring entries", destroyed, entries.len());

        match first_error {
            Some(e) => Err(e),
            None => Ok(destroyed),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub(crate) fn ids(&self) -> Vec<KeyId> {
        self.inner.lock().entries.iter().map(|e| e.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use securepool::testing::RecordingAllocator;
    use securepool::Allocator;

    fn loaded(allocator: &Arc<dyn Allocator>) -> impl FnOnce(KeyId) -> Result<KeyMaterial> + '_ {
        move |id| KeyMaterial::load(id, &[0x5A; 16], 16, allocator)
    }

    #[test]
    fn test_ids_follow_insertion_order() {
        let allocator: Arc<dyn Allocator> = Arc::new(RecordingAllocator::new());
        let ring = Keyring::new();
        let a = ring.insert_with(loaded(&allocator)).unwrap();
        let b = ring.insert_with(loaded(&allocator)).unwrap();
        assert!(a.id() < b.id());
        assert_eq!(ring.ids(), vec![a.id(), b.id()]);
        assert_eq!(a.size_bytes(), 16);
    }

    #[test]
    fn test_failed_insert_stores_nothing() {
        let ring = Keyring::new();
        let err = ring
            .insert_with(|_| Err(Error::Generation("no entropy".into())))
            .unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn test_wipe_all_for_zero_one_and_many() {
        for count in [0_usize, 1, 5] {
            let recorder = Arc::new(RecordingAllocator::new());
            let allocator: Arc<dyn Allocator> = recorder.clone();
            let ring = Keyring::new();
            for _ in 0..count {
                ring.insert_with(loaded(&allocator)).unwrap();
            }

            assert_eq!(ring.wipe_all().unwrap(), count);
            assert_eq!(ring.len(), 0);
            assert_eq!(recorder.releases(), count);
            assert!(recorder.released_without_wipe().is_empty());
            assert_eq!(allocator.outstanding(), 0);
        }
    }

    #[test]
    fn test_remove_then_handle_is_stale() {
        let allocator: Arc<dyn Allocator> = Arc::new(RecordingAllocator::new());
        let ring = Keyring::new();
        let h = ring.insert_with(loaded(&allocator)).unwrap();

        let key = ring.remove(&h).unwrap();
        assert!(key.is_some());
        assert!(h.slot().read().is_none());
        assert!(matches!(ring.remove(&h), Err(Error::KeyNotFound(_))));
    }

    #[test]
    fn test_rebind_destroys_old_key_first() {
        let recorder = Arc::new(RecordingAllocator::new());
        let allocator: Arc<dyn Allocator> = recorder.clone();
        let ring = Keyring::new();
        let h = ring.insert_with(loaded(&allocator)).unwrap();

        ring.rebind(&h, |id, size| {
            // old buffer already gone
            assert_eq!(recorder.releases(), 1);
            KeyMaterial::load(id, &vec![0x01; size], size, &allocator)
        })
        .unwrap();
        let bytes = h.slot().read().as_ref().map(|k| k.with_bytes(|b| b.to_vec()).unwrap());
        assert_eq!(bytes, Some(vec![0x01; 16]));

        let err = ring
            .rebind(&h, |_, _| Err(Error::Generation("boom".into())))
            .unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
        assert!(h.slot().read().is_none());
        assert_eq!(ring.len(), 1);
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn test_rebind_after_remove_is_refused() {
        let allocator: Arc<dyn Allocator> = Arc::new(RecordingAllocator::new());
        let ring = Keyring::new();
        let h = ring.insert_with(loaded(&allocator)).unwrap();
        let removed = ring.remove(&h).unwrap();

        let err = ring
            .rebind(&h, |id, size| KeyMaterial::load(id, &vec![0x02; size], size, &allocator))
            .unwrap_err();
        assert!(matches!(err, Error::KeyNotFound(_)));
        assert!(h.slot().read().is_none());

        drop(removed);
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn test_keyring_usable_while_entry_is_read() {
        let allocator: Arc<dyn Allocator> = Arc::new(RecordingAllocator::new());
        let ring = Keyring::new();
        let h = ring.insert_with(loaded(&allocator)).unwrap();

        let slot = h.slot().read();
        ring.insert_with(loaded(&allocator)).unwrap();
        assert_eq!(ring.len(), 2);
        drop(slot);
        assert_eq!(ring.wipe_all().unwrap(), 2);
    }
}
