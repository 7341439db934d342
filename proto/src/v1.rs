//! The decoded Modify request and its reply, as handed to the server core by
//! the protocol decoder. The BER codec itself is not part of this crate - by
//! the time these types exist, the frame has already been parsed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Modify operation values as they appear on the wire. Only `0..=2` are
/// acceptable from clients - the increment and soft-add operations are
/// internal extensions and never decoded from a request.
pub const MOD_OP_ADD: i64 = 0;
pub const MOD_OP_DELETE: i64 = 1;
pub const MOD_OP_REPLACE: i64 = 2;

/// One decoded change from a ModifyRequest sequence. The op is carried as the
/// raw wire integer so that the dispatch layer can reject out-of-range values
/// as a protocol error rather than a decode failure.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProtoModify {
    pub op: i64,
    pub atype: String,
    pub vals: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub dn: String,
    pub changes: Vec<ProtoModify>,
}

/// A reduced entry representation, used by the pre and post read controls.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtoEntry {
    pub attrs: BTreeMap<String, Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadControlKind {
    PreRead,
    PostRead,
}

/// A materialised pre or post read control attached to a successful reply.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReadEntryControl {
    pub kind: ReadControlKind,
    pub dn: String,
    pub entry: ProtoEntry,
}

/// LDAP result codes used by the modify path. Discriminants follow RFC 4511,
/// with `NoOperation` taking the experimental code the noop control uses in
/// the wild.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResultCode {
    Success = 0,
    ProtocolError = 2,
    PartialResults = 9,
    Referral = 10,
    NoSuchAttribute = 16,
    UndefinedAttributeType = 17,
    ConstraintViolation = 19,
    AttributeOrValueExists = 20,
    InvalidAttributeSyntax = 21,
    NoSuchObject = 32,
    InsufficientAccessRights = 50,
    Busy = 51,
    UnwillingToPerform = 53,
    ObjectClassViolation = 65,
    AssertionFailed = 122,
    NoOperation = 16651,
    Other = 80,
}

/// The reply body written to the client via the reply sink.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub code: ResultCode,
    pub matched: Option<String>,
    pub message: String,
    pub referral: Vec<String>,
    pub controls: Vec<ReadEntryControl>,
}

impl LdapResult {
    pub fn success() -> Self {
        LdapResult {
            code: ResultCode::Success,
            matched: None,
            message: String::new(),
            referral: Vec::new(),
            controls: Vec::new(),
        }
    }

    pub fn new(code: ResultCode, message: &str) -> Self {
        LdapResult {
            code,
            matched: None,
            message: message.to_string(),
            referral: Vec::new(),
            controls: Vec::new(),
        }
    }
}
