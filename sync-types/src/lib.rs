//! # sync-types
//!
//! Wire format types for the lanbackup pairing and transfer protocol.
//!
//! This crate provides the foundational types used across all lanbackup crates:
//! - [`ServiceId`] - Stable identity of a backup server
//! - [`ServiceRecord`] - One discovery announcement
//! - [`Message`] - Protocol messages (pairing and transfer)
//! - [`WireError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod messages;
mod service;

pub use error::WireError;
pub use ids::{ParseServiceIdError, ServiceId};
pub use messages::{
    AuthChallenge, AuthHello, AuthProof, AuthResult, Bye, FileAck, FileChunk, FileEnd, FileHeader,
    Message, PairCommitment, PairNonce, PairNonceReveal, PairRequest, NONCE_SIZE,
    PROTOCOL_VERSION, PUBLIC_KEY_SIZE,
};
pub use service::ServiceRecord;
