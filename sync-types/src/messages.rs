//! Protocol messages for lanbackup.
//!
//! Two conversations share one message enum:
//! - pairing: a commit-then-reveal X25519 exchange between a client and a
//!   server that have never met,
//! - transfer: an authenticated session in which a paired client pushes
//!   files to the server.
//!
//! Every message travels as one length-prefixed MessagePack frame.

use serde::{Deserialize, Serialize};

use crate::{ServiceId, WireError};

/// Current protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of an X25519 public key.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of the random nonces exchanged during pairing.
pub const NONCE_SIZE: usize = 32;

/// All possible protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Client opens a pairing exchange
    PairRequest(PairRequest),
    /// Server answers with its key and a commitment to its nonce
    PairCommitment(PairCommitment),
    /// Client reveals its nonce
    PairNonce(PairNonce),
    /// Server reveals the nonce it committed to
    PairNonceReveal(PairNonceReveal),
    /// Paired client opens a transfer session
    AuthHello(AuthHello),
    /// Server challenge for the client credential
    AuthChallenge(AuthChallenge),
    /// Client proof of credential possession
    AuthProof(AuthProof),
    /// Server verdict on the session
    AuthResult(AuthResult),
    /// Start of a file
    FileHeader(FileHeader),
    /// Sealed piece of file content
    FileChunk(FileChunk),
    /// End of a file
    FileEnd(FileEnd),
    /// Server confirmation that a file was stored
    FileAck(FileAck),
    /// Graceful end of a session
    Bye(Bye),
}

impl Message {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }

    /// Short name of the message variant, for logs and error text.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::PairRequest(_) => "PairRequest",
            Message::PairCommitment(_) => "PairCommitment",
            Message::PairNonce(_) => "PairNonce",
            Message::PairNonceReveal(_) => "PairNonceReveal",
            Message::AuthHello(_) => "AuthHello",
            Message::AuthChallenge(_) => "AuthChallenge",
            Message::AuthProof(_) => "AuthProof",
            Message::AuthResult(_) => "AuthResult",
            Message::FileHeader(_) => "FileHeader",
            Message::FileChunk(_) => "FileChunk",
            Message::FileEnd(_) => "FileEnd",
            Message::FileAck(_) => "FileAck",
            Message::Bye(_) => "Bye",
        }
    }
}

/// First pairing message, sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairRequest {
    /// Protocol version (currently 1)
    pub version: u8,
    /// Client's ephemeral X25519 public key
    pub client_public_key: [u8; PUBLIC_KEY_SIZE],
    /// Human-readable client name shown on the server
    pub client_name: String,
}

/// Server answer to [`PairRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairCommitment {
    /// Id the server announces on the network
    pub server_id: ServiceId,
    /// Human-readable server name
    pub server_name: String,
    /// Server's ephemeral X25519 public key
    pub server_public_key: [u8; PUBLIC_KEY_SIZE],
    /// Hash binding both public keys to the server's not yet revealed nonce
    pub commitment: [u8; 32],
}

/// Client nonce, sent after the commitment has been received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairNonce {
    /// 32 random bytes
    pub client_nonce: [u8; NONCE_SIZE],
}

/// Server nonce, revealed once the client nonce is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairNonceReveal {
    /// The nonce the commitment was computed over
    pub server_nonce: [u8; NONCE_SIZE],
}

/// Opens an authenticated transfer session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthHello {
    /// Protocol version (currently 1)
    pub version: u8,
    /// Public identifier of the credential the client holds
    pub key_id: [u8; 16],
    /// Human-readable client name
    pub client_name: String,
}

/// Random challenge the client must answer with its credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChallenge {
    /// 32 random bytes
    pub challenge: [u8; 32],
}

/// Answer to an [`AuthChallenge`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthProof {
    /// Keyed digest over the challenge
    pub proof: [u8; 32],
}

impl std::fmt::Debug for AuthProof {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthProof")
            .field("proof", &"[REDACTED]")
            .finish()
    }
}

/// Server verdict on an authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    /// Whether the session may continue
    pub accepted: bool,
    /// Optional reason for a refusal
    pub reason: Option<String>,
}

/// Announces the next file of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    /// Path relative to the sync directory, `/`-separated
    pub relative_path: String,
    /// Plaintext size in bytes
    pub size: u64,
}

/// Sealed slice of file content.
///
/// `sealed` is `nonce || ciphertext` under the session key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    /// Sealed bytes
    pub sealed: Vec<u8>,
}

impl std::fmt::Debug for FileChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChunk")
            .field("sealed_len", &self.sealed.len())
            .finish()
    }
}

/// Closes the current file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEnd {
    /// BLAKE3 hash of the plaintext
    pub content_hash: [u8; 32],
}

/// Server acknowledgement for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAck {
    /// Path from the matching [`FileHeader`]
    pub relative_path: String,
    /// Whether the server stored the file
    pub stored: bool,
}

/// Graceful disconnect message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bye {
    /// Optional reason for disconnect
    pub reason: Option<String>,
}
