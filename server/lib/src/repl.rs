//! The replication log sink. On a successful modify the dispatch layer
//! appends one record describing the change. The log itself is append-only
//! and externally synchronised - this module only defines the record shape
//! and the sink seam, plus an in-memory sink for embedding and tests.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::prelude::*;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReplOpType {
    Modify,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReplogMod {
    pub op: String,
    pub attr: String,
    pub vals: Vec<String>,
}

/// One replication log record: `(MODIFY, name, modlist)` with a time stamp.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReplogEntry {
    pub optype: ReplOpType,
    pub dn: String,
    pub at: String,
    pub mods: Vec<ReplogMod>,
}

impl ReplogEntry {
    pub fn new_modify<VALID>(dn: &str, ml: &ModifyList<VALID>, at: String) -> Self {
        let mods = ml
            .iter()
            .map(|m| ReplogMod {
                op: m.op.as_str().to_string(),
                attr: m.desc.name.to_string(),
                vals: m.vals.iter().map(|v| v.pres().to_string()).collect(),
            })
            .collect();
        ReplogEntry {
            optype: ReplOpType::Modify,
            dn: dn.to_string(),
            at,
            mods,
        }
    }

    pub fn to_json(&self) -> Result<String, OperationError> {
        serde_json::to_string(self)
            .map_err(|e| OperationError::Other(format!("replog serialise failed: {}", e)))
    }
}

pub trait ReplicationLog: Send + Sync {
    fn append(&self, line: &str) -> Result<(), OperationError>;
}

/// An in-memory line sink.
#[derive(Debug, Default)]
pub struct MemReplicationLog {
    lines: Mutex<Vec<String>>,
}

impl MemReplicationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl ReplicationLog for MemReplicationLog {
    fn append(&self, line: &str) -> Result<(), OperationError> {
        self.lines.lock().push(line.to_string());
        Ok(())
    }
}
