//! The backend modify path. Two layers live here:
//!
//! * [`Backend::modify_internal`] - the per-entry modification engine. It
//!   applies a validated modification list to a working copy of the entry,
//!   enforces schema afterwards, and emits the index delete/add passes. On
//!   any failure the working copy's attribute list is restored exactly.
//!
//! * [`Backend::modify`] - the transaction driver. One attempt runs the
//!   steps `OPEN_OUTER -> LOOKUP -> OPEN_NESTED -> APPLY -> PERSIST ->
//!   COMMIT_NESTED -> POSTREAD -> COMMIT_OUTER`; the surrounding loop is the
//!   `RETRY` state, re-entered whenever the store reports a deadlock or an
//!   ungranted lock, after rolling the attempt back and backing off.

use std::sync::Arc;

use hashbrown::HashSet;
use parking_lot::RwLock;

use crate::be::cache::{EntryCache, EntryWriteGuard};
use crate::be::{trans_backoff, Backend, BackendError, IndexOp, StoreError, TxnId};
use crate::be::EntryLookup;
use crate::prelude::*;

/// A completed modify. `noop` marks the distinguished no-op outcome: the
/// operation validated fully, nothing was persisted, and the reply code is
/// `NoOperation` rather than `Success`.
#[derive(Debug)]
pub struct ModifySuccess {
    pub noop: bool,
    pub controls: Vec<ReadEntryControl>,
}

enum AttemptError {
    Retry,
    Fail(OperationError),
}

/// Map a storage failure according to the retry policy.
fn store_fail(e: StoreError, text: &str) -> AttemptError {
    match e {
        StoreError::Deadlock | StoreError::NotGranted => AttemptError::Retry,
        StoreError::Busy => AttemptError::Fail(OperationError::Busy),
        _ => AttemptError::Fail(OperationError::Other(text.to_string())),
    }
}

struct AttemptCtx {
    outer: Option<TxnId>,
    nested: Option<TxnId>,
    guard: Option<EntryWriteGuard>,
    root: Option<Entry>,
    fakeroot: bool,
    controls: Vec<ReadEntryControl>,
}

impl Backend {
    /// Apply `mods` to the working entry `e` under the nested transaction.
    /// The entry's attribute list is byte-identical to its pre-image on any
    /// error return, and on success when the operation is a no-op.
    pub(crate) fn modify_internal(
        &self,
        op: &Operation,
        txn: TxnId,
        mods: &ModifyList<ModifyValid>,
        e: &mut Entry,
    ) -> Result<(), BackendError> {
        trace!(id = e.id(), dn = %e.dn(), "modify_internal");

        if !self.acl.check_modlist(op, e, mods) {
            return Err(OperationError::AccessDenied.into());
        }

        let saved_attrs = e.dup_attrs();

        // A replace or add of structuralObjectClass away from "glue" promotes
        // the placeholder to a real entry: its user content is dropped first.
        let mut glue_attr_delete = false;
        for m in mods.iter() {
            if matches!(m.op, ModOp::Add | ModOp::Replace)
                && m.desc.name.as_str() == ATTR_STRUCTURAL_OBJECTCLASS
            {
                if let Some(first) = m.vals.first() {
                    if first.norm() != CLASS_GLUE {
                        glue_attr_delete = true;
                    }
                }
            }
            if glue_attr_delete {
                break;
            }
        }

        if glue_attr_delete {
            e.strip_non_operational(&self.schema);
        }

        let mut idx_del: HashSet<AttrString> = HashSet::new();
        let mut idx_add: HashSet<AttrString> = HashSet::new();

        for m in mods.iter() {
            debug!(op = m.op.as_str(), attr = %m.desc.name, "modify_internal: apply");
            let r = match m.op {
                ModOp::Add => e.apply_add(m, op.permissive),
                ModOp::Delete => {
                    if glue_attr_delete {
                        Ok(())
                    } else {
                        e.apply_delete(m, op.permissive)
                    }
                }
                ModOp::Replace => e.apply_replace(m, op.permissive),
                ModOp::Increment => e.apply_increment(m, op.permissive),
                ModOp::SoftAdd => e.apply_soft_add(m, op.permissive),
            };
            if let Err(err) = r {
                debug!(?err, "modify_internal: modification failed");
                e.set_attrs(saved_attrs);
                return Err(err.into());
            }

            // If objectClass was modified, reset the derived flags.
            if m.desc.name.as_str() == ATTR_OBJECTCLASS || glue_attr_delete {
                e.clear_ocflags();
            }

            // Track which attributes need index maintenance, but not for a
            // no-op - nothing will be written.
            if !op.noop && self.store.index_is_indexed(m.desc.name.as_str()) {
                idx_del.insert(m.desc.name.clone());
                idx_add.insert(m.desc.name.clone());
            }
        }

        // The entry must still obey the schema.
        if let Err(se) = self.schema.check_entry(e, op.manage_dit) {
            error!(err = ?se, "entry failed schema check");
            e.set_attrs(saved_attrs);
            return Err(OperationError::SchemaViolation(se).into());
        }

        // A no-op validates everything and silently reverts to the saved
        // attributes; the driver aborts the transaction.
        if op.noop {
            e.set_attrs(saved_attrs);
            return Ok(());
        }

        // Index maintenance: delete the old postings, then add the new.
        for name in idx_del.iter() {
            if let Some(ap) = saved_attrs.iter().find(|a| a.name == *name) {
                if let Err(serr) =
                    self.store
                        .index_values(txn, name.as_str(), &ap.vals, e.id(), IndexOp::Delete)
                {
                    error!("attribute index delete failure");
                    e.set_attrs(saved_attrs);
                    return Err(serr.into());
                }
            }
        }
        for name in idx_add.iter() {
            let vals = match e.attr_find(name.as_str()) {
                Some(ap) => ap.vals.clone(),
                None => continue,
            };
            if let Err(serr) =
                self.store
                    .index_values(txn, name.as_str(), &vals, e.id(), IndexOp::Add)
            {
                error!("attribute index add failure");
                e.set_attrs(saved_attrs);
                return Err(serr.into());
            }
        }

        Ok(())
    }

    /// Drive one modify to completion: stamp and validate the list, then
    /// attempt the transaction until it commits, fails permanently, or the
    /// operation is abandoned at a retry boundary.
    #[instrument(level = "debug", skip_all, fields(dn = %dn))]
    pub fn modify(
        &self,
        op: &Operation,
        dn: &str,
        ndn: &str,
        mut modlist: ModifyList<ModifyInvalid>,
    ) -> Result<ModifySuccess, OperationError> {
        // PREPARE: a write-accepting master stamps the operational
        // attributes before anything else; replicas pass the list through.
        if self.update_ndn().is_none() && self.lastmod_enabled() {
            modlist.stamp_op_attrs(op, &self.schema, &*self.clock)?;
        }
        let mods = modlist.validate(&self.schema)?;

        let saved_do_not_cache = op.do_not_cache();
        let mut num_retries = 0u32;

        let result = loop {
            match self.modify_attempt(op, dn, ndn, &mods) {
                Ok(success) => break Ok(success),
                Err(AttemptError::Fail(e)) => break Err(e),
                Err(AttemptError::Retry) => {
                    // RETRY: the attempt has been rolled back and the entry
                    // lock released. Restore the ACL cache flag, honour
                    // abandon, then back off before re-entering OPEN_OUTER.
                    trace!("modify: retrying...");
                    op.set_do_not_cache(saved_do_not_cache);
                    num_retries += 1;
                    if op.is_abandoned() {
                        return Err(OperationError::Abandoned);
                    }
                    if num_retries > self.max_retries() {
                        warn!(num_retries, "modify: retry limit exceeded");
                        break Err(OperationError::Other("internal error".to_string()));
                    }
                    std::thread::yield_now();
                    trans_backoff(num_retries);
                }
            }
        };

        if let Ok(success) = &result {
            if !success.noop {
                // The thresholds go straight through to the store; zero for
                // both means checkpoint on every call.
                if let Some(cp) = self.checkpoint_policy() {
                    std::thread::yield_now();
                    if let Err(e) = self.store.txn_checkpoint(cp.kbyte, cp.min) {
                        warn!(?e, "modify: checkpoint failed");
                    }
                }
            }
        }

        result
    }

    fn modify_attempt(
        &self,
        op: &Operation,
        dn: &str,
        ndn: &str,
        mods: &ModifyList<ModifyValid>,
    ) -> Result<ModifySuccess, AttemptError> {
        let mut ctx = AttemptCtx {
            outer: None,
            nested: None,
            guard: None,
            root: None,
            fakeroot: false,
            controls: Vec::new(),
        };
        let r = self.attempt_steps(op, dn, ndn, mods, &mut ctx);

        // DONE: whatever the outcome, no transaction stays open and the
        // entry lock is released before the caller sees the result.
        if let Some(t) = ctx.nested.take() {
            if let Err(e) = self.store.txn_abort(t) {
                warn!(?e, "modify: nested txn_abort failed");
            }
        }
        if let Some(t) = ctx.outer.take() {
            if let Err(e) = self.store.txn_abort(t) {
                warn!(?e, "modify: txn_abort failed");
            }
        }
        drop(ctx.guard.take());

        r
    }

    fn attempt_steps(
        &self,
        op: &Operation,
        dn: &str,
        ndn: &str,
        mods: &ModifyList<ModifyValid>,
        ctx: &mut AttemptCtx,
    ) -> Result<ModifySuccess, AttemptError> {
        // OPEN_OUTER
        let outer = self.store.txn_begin(None).map_err(|e| {
            error!(?e, "modify: txn_begin failed");
            AttemptError::Fail(OperationError::Other("internal error".to_string()))
        })?;
        ctx.outer = Some(outer);

        // LOOKUP: resolve the name and take the entry's write lock.
        match self.store.dn2entry(outer, ndn) {
            Ok(EntryLookup::Found { id }) => {
                let slot: Arc<RwLock<Entry>> = self
                    .cache
                    .get_or_load(id, || self.store.id2entry(outer, id))
                    .map_err(|e| store_fail(e, "internal error"))?;
                ctx.guard = Some(EntryCache::write_lock(&slot));
            }
            Ok(EntryLookup::Ancestor { id }) => {
                // The target does not exist; report the closest ancestor as
                // the matched name, with its own referrals when it has any.
                let anc = self
                    .store
                    .id2entry(outer, id)
                    .map_err(|e| store_fail(e, "internal error"))?;
                let refs = if anc.is_referral() {
                    anc.referral_urls()
                } else {
                    self.default_referral().to_vec()
                };
                return Err(AttemptError::Fail(OperationError::Referral {
                    matched: Some(anc.dn().to_string()),
                    refs,
                }));
            }
            Err(StoreError::Deadlock) | Err(StoreError::NotGranted) => {
                return Err(AttemptError::Retry)
            }
            Err(StoreError::NotFound) => {
                if ndn.is_empty() {
                    // Synthesise the root glue entry in memory only.
                    ctx.root = Some(self.fakeroot_entry().map_err(AttemptError::Fail)?);
                    ctx.fakeroot = true;
                } else if self.default_referral().is_empty() {
                    return Err(AttemptError::Fail(OperationError::NoSuchObject));
                } else {
                    return Err(AttemptError::Fail(OperationError::Referral {
                        matched: None,
                        refs: self.default_referral().to_vec(),
                    }));
                }
            }
            Err(StoreError::Busy) => return Err(AttemptError::Fail(OperationError::Busy)),
            Err(e) => {
                error!(?e, "modify: dn2entry failed");
                return Err(AttemptError::Fail(OperationError::Other(
                    "internal error".to_string(),
                )));
            }
        }

        {
            let e: &Entry = match (&ctx.guard, &ctx.root) {
                (Some(g), _) => &**g,
                (None, Some(r)) => r,
                (None, None) => {
                    return Err(AttemptError::Fail(OperationError::Other(
                        "internal error".to_string(),
                    )))
                }
            };

            // Glue and referral entries are not modified without manageDSAit;
            // the client is referred onwards instead.
            if !op.manage_dsa_it && e.is_glue() {
                let refs = if e.is_referral() {
                    e.referral_urls()
                } else {
                    self.default_referral().to_vec()
                };
                return Err(AttemptError::Fail(OperationError::Referral {
                    matched: Some(e.dn().to_string()),
                    refs,
                }));
            }
            if !op.manage_dsa_it && e.is_referral() {
                trace!("modify: entry is referral");
                return Err(AttemptError::Fail(OperationError::Referral {
                    matched: Some(e.dn().to_string()),
                    refs: e.referral_urls(),
                }));
            }

            if let Some(assertion) = &op.assertion {
                match assertion.evaluate(&self.schema, e) {
                    Ok(true) => {}
                    Ok(false) => {
                        return Err(AttemptError::Fail(OperationError::AssertionFailed))
                    }
                    Err(err) => return Err(AttemptError::Fail(err)),
                }
            }

            if op.preread {
                ctx.controls.push(ReadEntryControl {
                    kind: ReadControlKind::PreRead,
                    dn: e.dn().to_string(),
                    entry: e.to_proto_entry(),
                });
            }
        }

        // OPEN_NESTED
        let nested = self.store.txn_begin(Some(outer)).map_err(|e| {
            error!(?e, "modify: txn_begin(2) failed");
            AttemptError::Fail(OperationError::Other("internal error".to_string()))
        })?;
        ctx.nested = Some(nested);

        // APPLY: the engine works on a stack copy of the entry.
        let mut dummy: Entry = match (&ctx.guard, &ctx.root) {
            (Some(g), _) => (**g).clone(),
            (_, Some(r)) => r.clone(),
            _ => {
                return Err(AttemptError::Fail(OperationError::Other(
                    "internal error".to_string(),
                )))
            }
        };
        match self.modify_internal(op, nested, mods, &mut dummy) {
            Ok(()) => {}
            Err(BackendError::Store(StoreError::Deadlock))
            | Err(BackendError::Store(StoreError::NotGranted)) => {
                return Err(AttemptError::Retry)
            }
            Err(BackendError::Store(e)) => {
                error!(?e, "modify: modify_internal storage failure");
                return Err(AttemptError::Fail(OperationError::Other(
                    "internal error".to_string(),
                )));
            }
            Err(BackendError::Op(e)) => {
                debug!("modify: modify failed");
                return Err(AttemptError::Fail(e));
            }
        }

        // PERSIST: write the entry back. The fakeroot is never persisted.
        if !ctx.fakeroot {
            self.store
                .id2entry_update(nested, &dummy)
                .map_err(|e| store_fail(e, "entry update failed"))?;
        }

        // COMMIT_NESTED
        ctx.nested = None;
        if self.store.txn_commit(nested).is_err() {
            return Err(AttemptError::Fail(OperationError::Other(
                "txn_commit(2) failed".to_string(),
            )));
        }

        // POSTREAD
        if op.postread {
            ctx.controls.push(ReadEntryControl {
                kind: ReadControlKind::PostRead,
                dn: dummy.dn().to_string(),
                entry: dummy.to_proto_entry(),
            });
        }

        // COMMIT_OUTER
        if op.noop {
            ctx.outer = None;
            if self.store.txn_abort(outer).is_err() {
                return Err(AttemptError::Fail(OperationError::Other(
                    "txn_abort (no-op) failed".to_string(),
                )));
            }
            debug!(id = dummy.id(), dn = %dn, "modify: updated (no-op)");
            return Ok(ModifySuccess {
                noop: true,
                controls: std::mem::take(&mut ctx.controls),
            });
        }

        if ctx.fakeroot {
            // The synthesised root is dropped, not cached.
            ctx.root = None;
        } else if let Some(guard) = ctx.guard.as_mut() {
            EntryCache::cache_modify(guard, dummy.dup_attrs(), dummy.ocflags());
        }

        ctx.outer = None;
        if self.store.txn_commit(outer).is_err() {
            error!("modify: commit failed");
            return Err(AttemptError::Fail(OperationError::Other(
                "commit failed".to_string(),
            )));
        }

        debug!(id = dummy.id(), dn = %dn, "modify: updated");
        Ok(ModifySuccess {
            noop: false,
            controls: std::mem::take(&mut ctx.controls),
        })
    }

    fn fakeroot_entry(&self) -> Result<Entry, OperationError> {
        let mut e = Entry::new(0, "");
        let oc = self
            .schema
            .resolve(ATTR_OBJECTCLASS)
            .map_err(OperationError::SchemaViolation)?;
        e.add_ava(&oc, CLASS_GLUE)
            .map_err(OperationError::SchemaViolation)?;
        let soc = self
            .schema
            .resolve(ATTR_STRUCTURAL_OBJECTCLASS)
            .map_err(OperationError::SchemaViolation)?;
        e.add_ava(&soc, CLASS_GLUE)
            .map_err(OperationError::SchemaViolation)?;
        e.refresh_ocflags();
        Ok(e)
    }
}
