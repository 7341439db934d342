//! The access-control seam. Evaluation of access rules is an external
//! concern - the modify engine only asks a yes/no question about a full
//! modification list before it touches the entry.

use crate::prelude::*;

pub trait AccessControl: Send + Sync {
    /// May this operation apply this modification list to this entry?
    fn check_modlist(
        &self,
        op: &Operation,
        entry: &Entry,
        mods: &ModifyList<ModifyValid>,
    ) -> bool;
}

/// The permissive default used when no evaluator is wired in.
#[derive(Debug, Default)]
pub struct AllowAllAccess;

impl AccessControl for AllowAllAccess {
    fn check_modlist(
        &self,
        _op: &Operation,
        entry: &Entry,
        mods: &ModifyList<ModifyValid>,
    ) -> bool {
        trace!(dn = %entry.dn(), nmods = mods.len(), "access: allow all");
        true
    }
}

#[cfg(test)]
pub(crate) struct DenyAllAccess;

#[cfg(test)]
impl AccessControl for DenyAllAccess {
    fn check_modlist(
        &self,
        _op: &Operation,
        _entry: &Entry,
        _mods: &ModifyList<ModifyValid>,
    ) -> bool {
        false
    }
}
