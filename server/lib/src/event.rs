//! The operation context. An [`Operation`] carries the requesting identity,
//! the request-level controls that shape modify semantics, and the abandon
//! flag a concurrent Abandon request may raise. The abandon and ACL-cache
//! flags use interior mutability - they are the only parts of an operation
//! touched from outside the owning worker.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::prelude::*;

#[derive(Debug, Clone)]
pub enum Identity {
    Anonymous,
    Authenticated { dn: String, ndn: String },
}

impl Identity {
    pub fn authenticated(dn: &str) -> Self {
        Identity::Authenticated {
            dn: dn.to_string(),
            ndn: dn_normalise(dn),
        }
    }

    pub fn bind_dn(&self) -> Option<&str> {
        match self {
            Identity::Anonymous => None,
            Identity::Authenticated { dn, .. } => Some(dn),
        }
    }

    pub fn bind_ndn(&self) -> Option<&str> {
        match self {
            Identity::Anonymous => None,
            Identity::Authenticated { ndn, .. } => Some(ndn),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Identity::Anonymous => write!(f, "anonymous"),
            Identity::Authenticated { dn, .. } => write!(f, "{}", dn),
        }
    }
}

/// The assertion control: the named attribute must hold the given value in
/// the entry's current state or the operation fails without effect.
#[derive(Debug, Clone)]
pub struct Assertion {
    pub attr: String,
    pub value: String,
}

impl Assertion {
    pub(crate) fn evaluate(&self, schema: &Schema, entry: &Entry) -> Result<bool, OperationError> {
        let desc = schema
            .resolve(&self.attr)
            .map_err(OperationError::SchemaViolation)?;
        let v = desc
            .normalise_value(&self.value)
            .map_err(OperationError::SchemaViolation)?;
        Ok(entry
            .attr_find(desc.name.as_str())
            .map(|a| a.vals.contains(&v))
            .unwrap_or(false))
    }
}

#[derive(Debug)]
pub struct Operation {
    pub conn_id: u64,
    pub op_id: u64,
    pub ident: Identity,

    /// Relax duplicate-value and missing-value errors to success.
    pub permissive: bool,
    /// Operate on referral and glue entries directly instead of chasing.
    pub manage_dsa_it: bool,
    /// Management context - may touch operational invariants.
    pub manage_dit: bool,
    /// Validate fully, persist nothing.
    pub noop: bool,
    pub assertion: Option<Assertion>,
    pub preread: bool,
    pub postread: bool,

    abandon: AtomicBool,
    do_not_cache: AtomicBool,
}

impl Operation {
    pub fn new(conn_id: u64, op_id: u64, ident: Identity) -> Self {
        Operation {
            conn_id,
            op_id,
            ident,
            permissive: false,
            manage_dsa_it: false,
            manage_dit: false,
            noop: false,
            assertion: None,
            preread: false,
            postread: false,
            abandon: AtomicBool::new(false),
            do_not_cache: AtomicBool::new(false),
        }
    }

    /// Raised by a concurrent Abandon request. Checked at retry boundaries
    /// only - a single attempt is never cancelled mid-flight.
    pub fn abandon(&self) {
        self.abandon.store(true, Ordering::Relaxed);
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandon.load(Ordering::Relaxed)
    }

    pub(crate) fn do_not_cache(&self) -> bool {
        self.do_not_cache.load(Ordering::Relaxed)
    }

    pub(crate) fn set_do_not_cache(&self, v: bool) {
        self.do_not_cache.store(v, Ordering::Relaxed);
    }
}
