//! An in-memory reference implementation of the storage-engine seam. Writes
//! buffer inside their transaction and land on the committed base only when
//! the top-level transaction commits; aborting a transaction drops its
//! buffer. Reads observe the committed base. The value index keeps one id
//! range per (attribute, normalised value) posting.
//!
//! Fault queues let tests script transient failures (deadlock, not-granted)
//! from name resolution and entry update, which is how the retry machinery
//! is exercised.

use std::collections::{BTreeMap, VecDeque};

use hashbrown::{HashMap, HashSet};
use idlset::v2::IDLBitRange;
use parking_lot::Mutex;

use crate::be::{EntryLookup, EntryStore, IndexOp, StoreError, TxnId};
use crate::prelude::*;

#[derive(Debug, Clone)]
enum WriteRec {
    Entry(Entry),
    Index {
        attr: AttrString,
        norm: String,
        id: u64,
        iop: IndexOp,
    },
}

#[derive(Debug, Default)]
struct TxnState {
    parent: Option<u64>,
    writes: Vec<WriteRec>,
}

#[derive(Default)]
struct MemStoreInner {
    id2entry: BTreeMap<u64, Entry>,
    dn2id: HashMap<String, u64>,
    postings: HashMap<(AttrString, String), IDLBitRange>,
    txns: HashMap<u64, TxnState>,
    next_txn: u64,
    checkpoints: u64,
}

pub struct MemStore {
    inner: Mutex<MemStoreInner>,
    indexed: HashSet<AttrString>,
    lookup_faults: Mutex<VecDeque<StoreError>>,
    update_faults: Mutex<VecDeque<StoreError>>,
}

impl MemStore {
    pub fn new<I>(indexed: I) -> Self
    where
        I: IntoIterator<Item = AttrString>,
    {
        MemStore {
            inner: Mutex::new(MemStoreInner::default()),
            indexed: indexed.into_iter().collect(),
            lookup_faults: Mutex::new(VecDeque::new()),
            update_faults: Mutex::new(VecDeque::new()),
        }
    }

    /// Seed the committed base with an entry, indexing its values.
    pub fn insert_entry(&self, e: Entry) {
        let mut inner = self.inner.lock();
        inner.dn2id.insert(e.ndn().to_string(), e.id());
        for a in e.attrs() {
            if self.indexed.contains(&a.name) {
                for v in a.vals.iter() {
                    inner
                        .postings
                        .entry((a.name.clone(), v.norm().to_string()))
                        .or_insert_with(IDLBitRange::new)
                        .insert_id(e.id());
                }
            }
        }
        inner.id2entry.insert(e.id(), e);
    }

    /// Script the next result of `dn2entry`.
    pub fn inject_lookup_fault(&self, e: StoreError) {
        self.lookup_faults.lock().push_back(e);
    }

    /// Script the next result of `id2entry_update`.
    pub fn inject_update_fault(&self, e: StoreError) {
        self.update_faults.lock().push_back(e);
    }

    /// The committed entry at this name, if any.
    pub fn entry_by_ndn(&self, ndn: &str) -> Option<Entry> {
        let inner = self.inner.lock();
        let id = inner.dn2id.get(ndn)?;
        inner.id2entry.get(id).cloned()
    }

    /// The committed postings for one attribute: normalised value to ids.
    pub fn index_snapshot(&self, attr: &str) -> BTreeMap<String, Vec<u64>> {
        let inner = self.inner.lock();
        let mut out = BTreeMap::new();
        for ((a, norm), idl) in inner.postings.iter() {
            if a.as_str() != attr {
                continue;
            }
            let ids: Vec<u64> = idl.into_iter().collect();
            if !ids.is_empty() {
                out.insert(norm.clone(), ids);
            }
        }
        out
    }

    pub fn checkpoints(&self) -> u64 {
        self.inner.lock().checkpoints
    }

    /// Count of transactions that are still open. Zero once every modify has
    /// settled.
    pub fn open_txns(&self) -> usize {
        self.inner.lock().txns.len()
    }

    fn apply_writes(inner: &mut MemStoreInner, writes: Vec<WriteRec>) {
        for rec in writes {
            match rec {
                WriteRec::Entry(e) => {
                    inner.dn2id.insert(e.ndn().to_string(), e.id());
                    inner.id2entry.insert(e.id(), e);
                }
                WriteRec::Index {
                    attr,
                    norm,
                    id,
                    iop,
                } => match iop {
                    IndexOp::Add => {
                        inner
                            .postings
                            .entry((attr, norm))
                            .or_insert_with(IDLBitRange::new)
                            .insert_id(id);
                    }
                    IndexOp::Delete => {
                        if let Some(idl) = inner.postings.get_mut(&(attr, norm)) {
                            idl.remove_id(id);
                        }
                    }
                },
            }
        }
    }
}

impl EntryStore for MemStore {
    fn txn_begin(&self, parent: Option<TxnId>) -> Result<TxnId, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(p) = parent {
            if !inner.txns.contains_key(&p.id) {
                return Err(StoreError::Io("unknown parent txn".to_string()));
            }
        }
        inner.next_txn += 1;
        let id = inner.next_txn;
        inner.txns.insert(
            id,
            TxnState {
                parent: parent.map(|t| t.id),
                writes: Vec::new(),
            },
        );
        Ok(TxnId { id })
    }

    fn txn_commit(&self, txn: TxnId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let state = inner
            .txns
            .remove(&txn.id)
            .ok_or_else(|| StoreError::Io("unknown txn".to_string()))?;
        match state.parent {
            Some(pid) => {
                let parent = inner
                    .txns
                    .get_mut(&pid)
                    .ok_or_else(|| StoreError::Io("parent txn gone".to_string()))?;
                parent.writes.extend(state.writes);
            }
            None => Self::apply_writes(&mut inner, state.writes),
        }
        Ok(())
    }

    fn txn_abort(&self, txn: TxnId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        // Dropping the state drops its buffered writes. Any unresolved child
        // buffers die with their parent ids and can never commit.
        inner
            .txns
            .remove(&txn.id)
            .map(|_| ())
            .ok_or_else(|| StoreError::Io("unknown txn".to_string()))
    }

    fn txn_checkpoint(&self, _kbyte: u32, _min: u32) -> Result<(), StoreError> {
        self.inner.lock().checkpoints += 1;
        Ok(())
    }

    fn dn2entry(&self, _txn: TxnId, ndn: &str) -> Result<EntryLookup, StoreError> {
        if let Some(e) = self.lookup_faults.lock().pop_front() {
            return Err(e);
        }
        let inner = self.inner.lock();
        if let Some(id) = inner.dn2id.get(ndn) {
            return Ok(EntryLookup::Found { id: *id });
        }
        // Walk up the tree for the closest existing ancestor.
        let mut rest = ndn;
        while let Some((_, up)) = rest.split_once(',') {
            if let Some(id) = inner.dn2id.get(up) {
                return Ok(EntryLookup::Ancestor { id: *id });
            }
            rest = up;
        }
        Err(StoreError::NotFound)
    }

    fn id2entry(&self, _txn: TxnId, id: u64) -> Result<Entry, StoreError> {
        self.inner
            .lock()
            .id2entry
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn id2entry_update(&self, txn: TxnId, entry: &Entry) -> Result<(), StoreError> {
        if let Some(e) = self.update_faults.lock().pop_front() {
            return Err(e);
        }
        let mut inner = self.inner.lock();
        let state = inner
            .txns
            .get_mut(&txn.id)
            .ok_or_else(|| StoreError::Io("unknown txn".to_string()))?;
        state.writes.push(WriteRec::Entry(entry.clone()));
        Ok(())
    }

    fn index_is_indexed(&self, attr: &str) -> bool {
        self.indexed.contains(attr)
    }

    fn index_values(
        &self,
        txn: TxnId,
        attr: &str,
        nvals: &[Value],
        id: u64,
        iop: IndexOp,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let state = inner
            .txns
            .get_mut(&txn.id)
            .ok_or_else(|| StoreError::Io("unknown txn".to_string()))?;
        for v in nvals {
            state.writes.push(WriteRec::Index {
                attr: AttrString::from(attr),
                norm: v.norm().to_string(),
                id,
                iop,
            });
        }
        Ok(())
    }
}
