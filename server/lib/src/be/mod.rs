//! The transactional backend. [`Backend`] owns a naming context and drives
//! modifies against an [`EntryStore`] - the storage engine seam covering
//! transactions, entry I/O and the secondary value index. The engine's
//! transient failures (`Deadlock`, `NotGranted`) are never surfaced; the
//! driver restarts the whole operation with backoff.

use std::sync::Arc;
use std::time::Duration;

use crate::be::cache::EntryCache;
use crate::prelude::*;

pub mod cache;
pub mod memory;
mod modify;

pub use self::modify::ModifySuccess;

/// Storage engine failures. `Deadlock` and `NotGranted` are transient and
/// drive a retry; everything else surfaces as an internal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Deadlock,
    NotGranted,
    NotFound,
    Busy,
    Io(String),
}

/// A transaction token. Parentage is tracked by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnId {
    pub(crate) id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOp {
    Add,
    Delete,
}

/// Name resolution result: the entry itself, or its closest existing
/// ancestor when the target is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryLookup {
    Found { id: u64 },
    Ancestor { id: u64 },
}

/// The consumed storage-engine contract.
pub trait EntryStore: Send + Sync {
    fn txn_begin(&self, parent: Option<TxnId>) -> Result<TxnId, StoreError>;
    fn txn_commit(&self, txn: TxnId) -> Result<(), StoreError>;
    fn txn_abort(&self, txn: TxnId) -> Result<(), StoreError>;
    fn txn_checkpoint(&self, kbyte: u32, min: u32) -> Result<(), StoreError>;

    fn dn2entry(&self, txn: TxnId, ndn: &str) -> Result<EntryLookup, StoreError>;
    fn id2entry(&self, txn: TxnId, id: u64) -> Result<Entry, StoreError>;
    fn id2entry_update(&self, txn: TxnId, entry: &Entry) -> Result<(), StoreError>;

    fn index_is_indexed(&self, attr: &str) -> bool;
    fn index_values(
        &self,
        txn: TxnId,
        attr: &str,
        nvals: &[Value],
        id: u64,
        iop: IndexOp,
    ) -> Result<(), StoreError>;
}

/// Engine-internal error carrier, keeping storage errors distinct from
/// operation errors until the driver decides between retry and surface.
#[derive(Debug)]
pub(crate) enum BackendError {
    Op(OperationError),
    Store(StoreError),
}

impl From<OperationError> for BackendError {
    fn from(e: OperationError) -> Self {
        BackendError::Op(e)
    }
}

impl From<StoreError> for BackendError {
    fn from(e: StoreError) -> Self {
        BackendError::Store(e)
    }
}

pub struct Backend {
    suffix_ndn: String,
    update_ndn: Option<String>,
    lastmod: bool,
    max_retries: u32,
    default_referral: Vec<String>,
    checkpoint: Option<CheckpointPolicy>,

    pub(crate) store: Arc<dyn EntryStore>,
    pub(crate) cache: EntryCache,
    pub(crate) schema: Arc<Schema>,
    pub(crate) acl: Arc<dyn AccessControl>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl Backend {
    pub fn new(
        cfg: BackendConfig,
        global: &ServerConfig,
        store: Arc<dyn EntryStore>,
        schema: Arc<Schema>,
        acl: Arc<dyn AccessControl>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Backend {
            suffix_ndn: dn_normalise(&cfg.suffix),
            update_ndn: cfg.update_ndn.as_deref().map(dn_normalise),
            lastmod: cfg.lastmod.unwrap_or(global.lastmod),
            max_retries: global.max_retries,
            default_referral: global.default_referral.clone(),
            checkpoint: cfg.checkpoint,
            store,
            cache: EntryCache::new(),
            schema,
            acl,
            clock,
        }
    }

    pub fn suffix_ndn(&self) -> &str {
        &self.suffix_ndn
    }

    pub fn update_ndn(&self) -> Option<&str> {
        self.update_ndn.as_deref()
    }

    pub(crate) fn lastmod_enabled(&self) -> bool {
        self.lastmod
    }

    pub(crate) fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub(crate) fn default_referral(&self) -> &[String] {
        &self.default_referral
    }

    pub(crate) fn checkpoint_policy(&self) -> Option<CheckpointPolicy> {
        self.checkpoint
    }
}

/// Sleep before re-entering the transaction loop. The schedule grows with the
/// attempt count and is capped.
pub(crate) fn trans_backoff(num_retries: u32) {
    let shift = num_retries.min(6);
    let delay = Duration::from_millis(5u64 << shift);
    trace!(num_retries, ?delay, "trans_backoff");
    std::thread::sleep(delay);
}
