//! Internal error types. These are used across the server core and mapped to
//! wire result codes at the dispatch boundary.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/* ===== errors ===== */

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SchemaError {
    NoClassFound,
    InvalidClass(Vec<String>),
    MissingMustAttribute(Vec<String>),
    InvalidAttribute(String),
    InvalidAttributeSyntax(String),
    AttributeNotValidForClass(String),
    SingleValueConstraint(String),
    Corrupted,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationError {
    // Request shape errors, detected before any backend work.
    ProtocolError(String),
    EmptyRequest,

    // Policy errors. Never retried.
    AccessDenied,
    AssertionFailed,
    Referral {
        matched: Option<String>,
        refs: Vec<String>,
    },
    UnwillingToPerform(String),

    // Semantic errors from the value engine and schema check.
    NoSuchObject,
    NoSuchAttribute(String),
    TypeOrValueExists(String),
    ConstraintViolation(String),
    SchemaViolation(SchemaError),

    // Operation status.
    Busy,
    Abandoned,
    NoOperation,

    // Anything the storage engine surfaced that is not retryable.
    Other(String),
}

impl Display for OperationError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?} - {}", self, msg),
            None => write!(f, "{:?}", self),
        }
    }
}

impl OperationError {
    /// The reply text carried alongside the result code, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::ProtocolError(s)
            | Self::UnwillingToPerform(s)
            | Self::NoSuchAttribute(s)
            | Self::TypeOrValueExists(s)
            | Self::ConstraintViolation(s)
            | Self::Other(s) => Some(s.as_str()),
            Self::Busy => Some("ldap server busy"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operationerror_display() {
        assert_eq!(
            OperationError::Busy.to_string(),
            "Busy - ldap server busy".to_string()
        );
        assert_eq!(
            OperationError::AccessDenied.to_string(),
            "AccessDenied".to_string()
        );
    }
}
