//! Pairing state machine and human-verifiable comparison code.
//!
//! Pairing two devices happens in two halves:
//! 1. A key exchange over the network produces a [`SharedSecret`].
//! 2. Both devices display the [`NumericCode`] derived from that secret and
//!    a person confirms they match.
//!
//! This module holds the pure part: the states a pairing attempt moves
//! through and the derivation of the code. The network exchange is driven
//! by `sync-client`.

use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the secret produced by the key exchange.
pub const SHARED_SECRET_SIZE: usize = 32;

/// Number of decimal digits shown to the user.
pub const NUMERIC_CODE_DIGITS: usize = 6;

const NUMERIC_CODE_MODULUS: u64 = 1_000_000;

const NUMERIC_CODE_DOMAIN: &[u8] = b"lanbackup-numeric-comparison-v1";

/// Errors that end a pairing attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    /// The exchange with the server did not produce a trustworthy secret.
    #[error("key exchange failed: {0}")]
    KeyExchangeFailed(String),

    /// The exchange did not finish in time.
    #[error("pairing timed out")]
    Timeout,

    /// A key exchange is already running for this session.
    #[error("pairing already in progress")]
    AlreadyInProgress,

    /// An operation was called in a state that does not allow it, or the
    /// peer sent a message out of order.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// 32-byte secret agreed on during the key exchange.
///
/// Never persisted directly: the long-term credential is derived from it.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_SIZE]);

impl SharedSecret {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; SHARED_SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.0
    }
}

// Intentionally opaque debug to avoid logging secrets
impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}

/// Six-digit code both devices display for the user to compare.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NumericCode(u32);

impl NumericCode {
    /// Numeric value, always below 1 000 000.
    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Rendered zero-padded, so `42` shows as `000042`.
impl fmt::Display for NumericCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.0, width = NUMERIC_CODE_DIGITS)
    }
}

impl fmt::Debug for NumericCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NumericCode({})", self)
    }
}

/// Derive the comparison code from a shared secret.
///
/// Pure and deterministic: both peers holding the same secret compute the
/// same code. Any leading zeros are kept when displayed.
pub fn numeric_comparison_value(secret: &SharedSecret) -> NumericCode {
    let mut hasher = Sha256::new();
    hasher.update(NUMERIC_CODE_DOMAIN);
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let value = u64::from_be_bytes(head) % NUMERIC_CODE_MODULUS;

    NumericCode(value as u32)
}

/// Events that drive a pairing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// The caller asked to pair with a server.
    Started,
    /// The key exchange produced a secret and this code.
    KeyExchangeSucceeded {
        /// Code derived from the new secret.
        code: NumericCode,
    },
    /// The key exchange failed or timed out.
    KeyExchangeFailed,
    /// The user confirmed that both codes match.
    UserConfirmed,
    /// The user reported a mismatch or cancelled.
    UserRejected,
}

/// States of a single pairing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingState {
    /// Nothing started yet.
    Idle,
    /// Exchange running on a worker.
    KeyExchangeInProgress,
    /// Secret agreed, waiting for the user to compare codes.
    AwaitingUserConfirmation {
        /// Code to display.
        code: NumericCode,
    },
    /// Server added to the registry.
    Confirmed,
    /// User refused; nothing was stored.
    Rejected,
    /// Exchange failed; nothing was stored.
    Failed,
}

impl PairingState {
    /// Create a new state machine in the Idle state.
    pub fn new() -> Self {
        Self::Idle
    }

    /// Apply an event, returning the next state.
    ///
    /// This is a pure function. Transitions not listed below are refused and
    /// leave the caller's state untouched:
    ///
    /// ```text
    /// Idle --Started--> KeyExchangeInProgress
    /// KeyExchangeInProgress --KeyExchangeSucceeded--> AwaitingUserConfirmation
    /// KeyExchangeInProgress --KeyExchangeFailed--> Failed
    /// AwaitingUserConfirmation --UserConfirmed--> Confirmed
    /// AwaitingUserConfirmation --UserRejected--> Rejected
    /// ```
    pub fn on_event(&self, event: PairingEvent) -> Result<Self, PairingError> {
        match (self, event) {
            (Self::Idle, PairingEvent::Started) => Ok(Self::KeyExchangeInProgress),
            (Self::KeyExchangeInProgress, PairingEvent::Started) => {
                Err(PairingError::AlreadyInProgress)
            }

            (Self::KeyExchangeInProgress, PairingEvent::KeyExchangeSucceeded { code }) => {
                Ok(Self::AwaitingUserConfirmation { code })
            }
            (Self::KeyExchangeInProgress, PairingEvent::KeyExchangeFailed) => Ok(Self::Failed),

            (Self::AwaitingUserConfirmation { .. }, PairingEvent::UserConfirmed) => {
                Ok(Self::Confirmed)
            }
            (Self::AwaitingUserConfirmation { .. }, PairingEvent::UserRejected) => {
                Ok(Self::Rejected)
            }

            (state, event) => Err(PairingError::ProtocolViolation(format!(
                "{:?} is not allowed while {}",
                event,
                state.name()
            ))),
        }
    }

    /// Code to display, only while awaiting confirmation.
    pub fn numeric_code(&self) -> Option<NumericCode> {
        match self {
            Self::AwaitingUserConfirmation { code } => Some(*code),
            _ => None,
        }
    }

    /// Whether the attempt is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Rejected | Self::Failed)
    }

    /// Short state name for logs and error text.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::KeyExchangeInProgress => "key exchange in progress",
            Self::AwaitingUserConfirmation { .. } => "awaiting user confirmation",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

impl Default for PairingState {
    fn default() -> Self {
        Self::new()
    }
}
