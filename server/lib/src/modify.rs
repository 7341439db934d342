//! Modification lists. A [`ModifyList`] is an ordered sequence of
//! [`Modify`] directives applied atomically to one entry. Lists are parsed
//! from the wire in an unvalidated state and must pass [`ModifyList::validate`]
//! before the engine will apply them. The operational-attribute stamper also
//! lives here - it rewrites a list before validation.

use std::slice;
use std::sync::Arc;

use crate::event::Operation;
use crate::prelude::*;
use crate::time::format_generalized_time;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModOp {
    Add,
    Delete,
    Replace,
    /// Internal extension: add a signed delta to an integer attribute.
    Increment,
    /// Internal extension: add that tolerates already-present values.
    SoftAdd,
}

impl ModOp {
    pub fn as_str(self) -> &'static str {
        match self {
            ModOp::Add => "add",
            ModOp::Delete => "delete",
            ModOp::Replace => "replace",
            ModOp::Increment => "increment",
            ModOp::SoftAdd => "softadd",
        }
    }
}

/// One modification: an operation, a schema-resolved attribute description,
/// and the normalised values it applies.
#[derive(Debug, Clone)]
pub struct Modify {
    pub op: ModOp,
    pub desc: Arc<SchemaAttribute>,
    pub vals: Vec<Value>,
}

impl Modify {
    pub fn new(op: ModOp, desc: Arc<SchemaAttribute>, vals: Vec<Value>) -> Self {
        Modify { op, desc, vals }
    }

    /// Decode one wire change. Clients may only express add, delete and
    /// replace - the extension opcodes are produced internally and never
    /// accepted off the wire. A non-delete change must carry values.
    pub fn from_wire(pm: &ProtoModify, schema: &Schema) -> Result<Self, OperationError> {
        let op = match pm.op {
            cadastre_proto::v1::MOD_OP_ADD => ModOp::Add,
            cadastre_proto::v1::MOD_OP_DELETE => ModOp::Delete,
            cadastre_proto::v1::MOD_OP_REPLACE => ModOp::Replace,
            _ => {
                return Err(OperationError::ProtocolError(
                    "unrecognized modify operation".to_string(),
                ))
            }
        };
        if pm.vals.is_empty() && op != ModOp::Delete {
            return Err(OperationError::ProtocolError("no values given".to_string()));
        }
        let desc = schema
            .resolve(&pm.atype)
            .map_err(OperationError::SchemaViolation)?;
        let vals = pm
            .vals
            .iter()
            .map(|raw| desc.normalise_value(raw))
            .collect::<Result<Vec<_>, _>>()
            .map_err(OperationError::SchemaViolation)?;
        Ok(Modify { op, desc, vals })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModifyValid;
#[derive(Debug, Clone, Default)]
pub struct ModifyInvalid;

/// An ordered modification list. The order matters - each change is applied
/// in sequence, and the stamper's server-generated changes go to the front.
#[derive(Debug, Clone, Default)]
pub struct ModifyList<VALID> {
    // State marker only.
    #[allow(dead_code)]
    valid: VALID,
    mods: Vec<Modify>,
}

impl<'a, VALID> IntoIterator for &'a ModifyList<VALID> {
    type IntoIter = slice::Iter<'a, Modify>;
    type Item = &'a Modify;

    fn into_iter(self) -> Self::IntoIter {
        self.mods.iter()
    }
}

impl<VALID> ModifyList<VALID> {
    pub fn len(&self) -> usize {
        self.mods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mods.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, Modify> {
        self.mods.iter()
    }

    pub fn mods(&self) -> &[Modify] {
        &self.mods
    }
}

impl ModifyList<ModifyInvalid> {
    pub fn new() -> Self {
        ModifyList {
            valid: ModifyInvalid,
            mods: Vec::new(),
        }
    }

    pub fn new_list(mods: Vec<Modify>) -> Self {
        ModifyList {
            valid: ModifyInvalid,
            mods,
        }
    }

    pub fn push_mod(&mut self, modify: Modify) {
        self.mods.push(modify)
    }

    /// Decode a full request body into an unvalidated list.
    pub fn from_request(req: &ModifyRequest, schema: &Schema) -> Result<Self, OperationError> {
        let mods = req
            .changes
            .iter()
            .map(|pm| Modify::from_wire(pm, schema))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ModifyList {
            valid: ModifyInvalid,
            mods,
        })
    }

    /// Check every modification against the schema and promote the list. The
    /// increment extension is constrained here: single-valued integer
    /// attributes only, exactly one delta value.
    pub fn validate(&self, _schema: &Schema) -> Result<ModifyList<ModifyValid>, OperationError> {
        for m in self.mods.iter() {
            match m.op {
                ModOp::Delete => {}
                ModOp::Increment => {
                    if m.desc.syntax != SyntaxType::Integer || m.desc.multivalue {
                        return Err(OperationError::ConstraintViolation(format!(
                            "modify/increment: {}: requires a single-valued integer attribute",
                            m.desc.name
                        )));
                    }
                    if m.vals.len() != 1 {
                        return Err(OperationError::ConstraintViolation(format!(
                            "modify/increment: {}: exactly one delta required",
                            m.desc.name
                        )));
                    }
                }
                ModOp::Add | ModOp::Replace | ModOp::SoftAdd => {
                    if m.op != ModOp::Replace && m.vals.is_empty() {
                        return Err(OperationError::ProtocolError(
                            "no values given".to_string(),
                        ));
                    }
                }
            }
        }
        Ok(ModifyList {
            valid: ModifyValid,
            mods: self.mods.clone(),
        })
    }

    /// Strip client attempts on the lastmod attributes, then prepend the
    /// server's own `modifiersName` and `modifyTimestamp` replacements. The
    /// result is stable under re-stamping: a second pass removes the first
    /// pass's stamps and inserts fresh ones.
    pub fn stamp_op_attrs(
        &mut self,
        op: &Operation,
        schema: &Schema,
        clock: &dyn Clock,
    ) -> Result<(), OperationError> {
        self.mods.retain(|m| {
            let drop = LASTMOD_ATTRS.contains(&m.desc.name.as_str());
            if drop {
                trace!(attr = %m.desc.name, "stamp_op_attrs: dropping client lastmod attr");
            }
            !drop
        });

        let modifiers = op.ident.bind_dn().unwrap_or(NULL_DN);
        let desc = schema
            .resolve(ATTR_MODIFIERS_NAME)
            .map_err(OperationError::SchemaViolation)?;
        let v = desc
            .normalise_value(modifiers)
            .map_err(OperationError::SchemaViolation)?;
        self.mods.insert(0, Modify::new(ModOp::Replace, desc, vec![v]));

        let stamp = format_generalized_time(clock.now());
        let desc = schema
            .resolve(ATTR_MODIFY_TIMESTAMP)
            .map_err(OperationError::SchemaViolation)?;
        let v = desc
            .normalise_value(&stamp)
            .map_err(OperationError::SchemaViolation)?;
        self.mods.insert(0, Modify::new(ModOp::Replace, desc, vec![v]));

        Ok(())
    }
}
