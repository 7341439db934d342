//! The cadastred server library. This implements the internal components of
//! the directory server - entries, schema, the modify engine, the transactional
//! backend and the operation dispatch layer. The network front end and the BER
//! codec live elsewhere and hand this crate already-decoded requests.

#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]

#[macro_use]
extern crate tracing;

// This has to be before the other modules so the import order works
#[macro_use]
pub mod macros;

pub mod access;
pub mod be;
pub mod config;
pub mod constants;
pub mod entry;
pub mod event;
pub mod modify;
pub mod repl;
pub mod schema;
pub mod server;
#[cfg(test)]
mod testkit;
pub mod time;
pub mod value;

/// A prelude of imports that should be imported by all other modules to
/// help make imports cleaner.
pub mod prelude {
    pub use cadastre_proto::internal::{OperationError, SchemaError};
    pub use cadastre_proto::v1::{
        LdapResult, ModifyRequest, ProtoEntry, ProtoModify, ReadControlKind, ReadEntryControl,
        ResultCode,
    };
    pub use smartstring::alias::String as AttrString;
    pub use tracing::instrument;

    pub use crate::access::{AccessControl, AllowAllAccess};
    pub use crate::be::{Backend, EntryLookup, EntryStore, IndexOp, ModifySuccess, StoreError, TxnId};
    pub use crate::config::{BackendConfig, CheckpointPolicy, ServerConfig};
    pub use crate::constants::*;
    pub use crate::entry::{Attr, Entry};
    pub use crate::event::{Assertion, Identity, Operation};
    pub use crate::modify::{ModOp, Modify, ModifyInvalid, ModifyList, ModifyValid};
    pub use crate::repl::{MemReplicationLog, ReplicationLog, ReplogEntry};
    pub use crate::schema::{attr_normalise, Schema, SchemaAttribute, SchemaClass};
    pub use crate::server::{DirBackend, ReplySink, Server};
    pub use crate::time::{Clock, SystemClock};
    pub use crate::value::{dn_normalise, SyntaxType, Value};
}
