//! Identity types for lanbackup.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable identifier a backup server announces about itself.
///
/// 16 bytes (UUID layout), displayed as 32 lowercase hex characters.
/// The network address of a server may change; this id does not.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId(uuid::Uuid);

impl ServiceId {
    /// Create a new random ServiceId.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Create a ServiceId from its 16 raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(bytes))
    }

    /// Create a ServiceId from a byte slice, if it is exactly 16 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        uuid::Uuid::from_slice(bytes).ok().map(Self)
    }

    /// Get the raw bytes of this ServiceId.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

impl fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceId({})", &self.to_string()[..8])
    }
}

/// Error returned when parsing a [`ServiceId`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid service id: {0}")]
pub struct ParseServiceIdError(String);

impl FromStr for ServiceId {
    type Err = ParseServiceIdError;

    /// Accepts the 32-character hex form as well as hyphenated UUID text.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| ParseServiceIdError(e.to_string()))
    }
}
