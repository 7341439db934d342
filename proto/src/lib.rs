//! Wire-level types for the cadastre directory server. These are the
//! serialisable structures exchanged between the protocol front end and the
//! server core, along with the error types that cross that boundary. No
//! server logic lives here.

#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]

pub mod internal;
pub mod v1;
