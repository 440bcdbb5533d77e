//! Per-server record of files already transferred.
//!
//! A file is only ever sent again when its content changed. The watermark
//! keeps, per path relative to the sync directory, the fingerprint of the
//! version the server acknowledged:
//! - a matching size and modification time means the file is current,
//!   without reading it,
//! - otherwise the caller hashes the file and asks [`TransferWatermark::has_content`];
//!   a touched but unchanged file is re-recorded instead of re-sent.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Cheap metadata used to detect changes without hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileStamp {
    /// Size in bytes.
    pub size: u64,
    /// Modification time, seconds since the Unix epoch.
    pub modified: u64,
}

/// Full identity of one transferred file version.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileFingerprint {
    /// Metadata at the time of transfer.
    pub stamp: FileStamp,
    /// BLAKE3 hash of the content.
    pub content_hash: [u8; 32],
}

impl fmt::Debug for FileFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileFingerprint")
            .field("stamp", &self.stamp)
            .field("content_hash", &hex::encode(&self.content_hash[..8]))
            .finish()
    }
}

/// Paths a server already holds, keyed by `/`-separated relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferWatermark {
    files: BTreeMap<String, FileFingerprint>,
}

impl TransferWatermark {
    /// Create an empty watermark.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `path` was transferred and its metadata has not changed since.
    pub fn is_current(&self, path: &str, stamp: &FileStamp) -> bool {
        self.files
            .get(path)
            .is_some_and(|recorded| recorded.stamp == *stamp)
    }

    /// True if the server already holds exactly this content at `path`.
    pub fn has_content(&self, path: &str, content_hash: &[u8; 32]) -> bool {
        self.files
            .get(path)
            .is_some_and(|recorded| recorded.content_hash == *content_hash)
    }

    /// Record a version the server acknowledged.
    pub fn record(&mut self, path: impl Into<String>, fingerprint: FileFingerprint) {
        self.files.insert(path.into(), fingerprint);
    }

    /// Fingerprint recorded for `path`.
    pub fn get(&self, path: &str) -> Option<&FileFingerprint> {
        self.files.get(path)
    }

    /// Iterate recorded paths in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileFingerprint)> {
        self.files.iter().map(|(path, fp)| (path.as_str(), fp))
    }

    /// Number of recorded files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether nothing was transferred yet.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Forget everything, e.g. after the sync directory changed.
    pub fn clear(&mut self) {
        self.files.clear();
    }
}
