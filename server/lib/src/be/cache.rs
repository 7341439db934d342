//! The in-memory entry cache. Each cached entry sits behind its own
//! single-writer-many-reader lock; a modify holds the write half for the
//! whole attempt and releases it on retry or completion. Guards are owned
//! (`write_arc`) so the driver can carry them across its state machine
//! without borrowing the cache.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};

use crate::be::StoreError;
use crate::prelude::*;

pub(crate) type EntryWriteGuard = ArcRwLockWriteGuard<RawRwLock, Entry>;

pub struct EntryCache {
    slots: Mutex<HashMap<u64, Arc<RwLock<Entry>>>>,
}

impl EntryCache {
    pub fn new() -> Self {
        EntryCache {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the cached slot for an id, loading the entry on a miss.
    pub(crate) fn get_or_load<F>(&self, id: u64, load: F) -> Result<Arc<RwLock<Entry>>, StoreError>
    where
        F: FnOnce() -> Result<Entry, StoreError>,
    {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(&id) {
            return Ok(slot.clone());
        }
        let entry = load()?;
        let slot = Arc::new(RwLock::new(entry));
        slots.insert(id, slot.clone());
        Ok(slot)
    }

    /// Acquire the entry's write lock as an owned guard. Blocks behind
    /// readers and the previous writer.
    pub(crate) fn write_lock(slot: &Arc<RwLock<Entry>>) -> EntryWriteGuard {
        RwLock::write_arc(slot)
    }

    /// Install a modified attribute list into the locked entry in place.
    pub(crate) fn cache_modify(guard: &mut EntryWriteGuard, attrs: Vec<Attr>, ocflags: u32) {
        guard.set_attrs(attrs);
        guard.set_ocflags(ocflags);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

impl Default for EntryCache {
    fn default() -> Self {
        Self::new()
    }
}
