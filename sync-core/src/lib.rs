//! # sync-core
//!
//! Pure logic for lanbackup (no I/O, instant tests).
//!
//! This crate implements the state machines and bookkeeping behind
//! discovery, pairing and file transfer without any network or disk I/O,
//! enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. Time, randomness and secrets are passed in by the
//! caller.
//!
//! The actual I/O (network, disk, background tasks) is performed by
//! `sync-client`, which drives these types.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod pairing;
pub mod service_table;
pub mod watermark;

pub use pairing::{
    numeric_comparison_value, NumericCode, PairingError, PairingEvent, PairingState,
    SharedSecret, NUMERIC_CODE_DIGITS, SHARED_SECRET_SIZE,
};
pub use service_table::{
    CycleChanges, DiscoveredService, ServiceTable, DEFAULT_MISSED_CYCLES_BEFORE_OFFLINE,
};
pub use watermark::{FileFingerprint, FileStamp, TransferWatermark};
