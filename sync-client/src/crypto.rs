//! Cryptographic primitives for lanbackup.
//!
//! This module provides:
//! - Ephemeral X25519 key pairs for the pairing exchange
//! - The commit-then-reveal hash and HKDF derivation of the pairing secret
//! - [`CredentialScheme`], the pluggable way a pairing secret becomes a
//!   long-term credential and how that credential authenticates a session
//! - [`SessionKey`], XChaCha20-Poly1305 sealing for transferred content
//!
//! # Security Notes
//!
//! - XChaCha20 uses 192-bit nonces (24 bytes), safe for random generation
//! - Every derivation is domain-separated with a versioned label
//! - Secret material is zeroized on drop and never shown by `Debug`

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use lanbackup_core::{SharedSecret, SHARED_SECRET_SIZE};
use lanbackup_types::{NONCE_SIZE as PAIRING_NONCE_SIZE, PUBLIC_KEY_SIZE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Nonce size for XChaCha20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Key size for XChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Size of the public credential identifier.
pub const KEY_ID_SIZE: usize = 16;

/// Size of an authentication challenge and its proof.
pub const CHALLENGE_SIZE: usize = 32;

const COMMITMENT_DOMAIN: &[u8] = b"lanbackup-pairing-commitment-v1";
const PAIRING_SECRET_DOMAIN: &[u8] = b"lanbackup-pairing-secret-v1";
const CREDENTIAL_SALT: &[u8] = b"lanbackup-credential-v1";
const CREDENTIAL_VERSION: u8 = 1;
const CREDENTIAL_LEN: usize = 1 + KEY_ID_SIZE + KEY_SIZE;

/// Crypto errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication error).
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// The peer key produced an all-zero shared value.
    #[error("peer public key is not contributory")]
    NonContributory,

    /// The operating system random source failed.
    #[error("random source unavailable: {0}")]
    Randomness(String),
}

/// Fill an array from the operating system random source.
pub fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut bytes = [0u8; N];
    getrandom::getrandom(&mut bytes).map_err(|e| CryptoError::Randomness(e.to_string()))?;
    Ok(bytes)
}

/// One-shot X25519 key pair used for a single pairing exchange.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a fresh key pair.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random();
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public half, as sent on the wire.
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Consume the key pair and compute the Diffie-Hellman value with a peer.
    pub fn diffie_hellman(
        self,
        peer_public: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EphemeralKeyPair {{ public: {}, secret: [REDACTED] }}",
            hex::encode(self.public.as_bytes())
        )
    }
}

/// Hash a server publishes before it learns the client nonce.
///
/// Binds both public keys and the server nonce, so the server cannot pick
/// its nonce after seeing the client's.
pub fn pairing_commitment(
    server_public_key: &[u8; PUBLIC_KEY_SIZE],
    client_public_key: &[u8; PUBLIC_KEY_SIZE],
    server_nonce: &[u8; PAIRING_NONCE_SIZE],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(COMMITMENT_DOMAIN);
    hasher.update(server_public_key);
    hasher.update(client_public_key);
    hasher.update(server_nonce);
    hasher.finalize().into()
}

/// Derive the pairing secret from the Diffie-Hellman value and both nonces.
///
/// Both peers call this with identical arguments and obtain the same
/// [`SharedSecret`].
pub fn derive_shared_secret(
    dh_output: &[u8; 32],
    client_public_key: &[u8; PUBLIC_KEY_SIZE],
    server_public_key: &[u8; PUBLIC_KEY_SIZE],
    client_nonce: &[u8; PAIRING_NONCE_SIZE],
    server_nonce: &[u8; PAIRING_NONCE_SIZE],
) -> Result<SharedSecret, CryptoError> {
    let mut salt = Vec::with_capacity(2 * PAIRING_NONCE_SIZE);
    salt.extend_from_slice(client_nonce);
    salt.extend_from_slice(server_nonce);

    let mut info = Vec::with_capacity(PAIRING_SECRET_DOMAIN.len() + 2 * PUBLIC_KEY_SIZE);
    info.extend_from_slice(PAIRING_SECRET_DOMAIN);
    info.extend_from_slice(client_public_key);
    info.extend_from_slice(server_public_key);

    let hkdf = Hkdf::<Sha256>::new(Some(salt.as_slice()), dh_output);
    let mut okm = Zeroizing::new([0u8; SHARED_SECRET_SIZE]);
    hkdf.expand(&info, &mut okm[..])
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

    Ok(SharedSecret::from_bytes(*okm))
}

/// Long-term secret stored for a paired server.
///
/// Opaque to everything but the [`CredentialScheme`] that produced it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credential(Vec<u8>);

impl Credential {
    /// Wrap raw credential bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// Don't leak secret in debug output
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential([REDACTED; {}])", self.0.len())
    }
}

/// How a pairing secret becomes a credential and how that credential opens
/// a transfer session.
///
/// The server side of a session runs the same scheme to check the proof.
pub trait CredentialScheme: Send + Sync {
    /// Derive the long-term credential from a confirmed pairing secret.
    fn derive_credential(&self, secret: &SharedSecret) -> Result<Credential, CryptoError>;

    /// Public identifier the server uses to look the credential up.
    fn key_id(&self, credential: &Credential) -> Result<[u8; KEY_ID_SIZE], CryptoError>;

    /// Answer a server challenge: the proof to send back and the key that
    /// seals this session's content.
    fn authenticate(
        &self,
        credential: &Credential,
        challenge: &[u8; CHALLENGE_SIZE],
    ) -> Result<([u8; CHALLENGE_SIZE], SessionKey), CryptoError>;
}

/// Default scheme: HKDF-SHA256 everywhere.
///
/// Credential layout: `version (1) || key_id (16) || auth secret (32)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HkdfCredentialScheme;

impl HkdfCredentialScheme {
    fn parse<'a>(&self, credential: &'a Credential) -> Result<(&'a [u8], &'a [u8]), CryptoError> {
        let bytes = credential.as_bytes();
        if bytes.len() != CREDENTIAL_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: CREDENTIAL_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[0] != CREDENTIAL_VERSION {
            return Err(CryptoError::KeyDerivationFailed(format!(
                "unsupported credential version {}",
                bytes[0]
            )));
        }
        Ok((&bytes[1..1 + KEY_ID_SIZE], &bytes[1 + KEY_ID_SIZE..]))
    }
}

impl CredentialScheme for HkdfCredentialScheme {
    fn derive_credential(&self, secret: &SharedSecret) -> Result<Credential, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(CREDENTIAL_SALT), secret.as_bytes());

        let mut key_id = [0u8; KEY_ID_SIZE];
        let mut auth_secret = Zeroizing::new([0u8; KEY_SIZE]);
        hkdf.expand(b"key-id", &mut key_id)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        hkdf.expand(b"auth-secret", &mut auth_secret[..])
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

        let mut bytes = Vec::with_capacity(CREDENTIAL_LEN);
        bytes.push(CREDENTIAL_VERSION);
        bytes.extend_from_slice(&key_id);
        bytes.extend_from_slice(&auth_secret[..]);
        Ok(Credential(bytes))
    }

    fn key_id(&self, credential: &Credential) -> Result<[u8; KEY_ID_SIZE], CryptoError> {
        let (key_id, _) = self.parse(credential)?;
        let mut out = [0u8; KEY_ID_SIZE];
        out.copy_from_slice(key_id);
        Ok(out)
    }

    fn authenticate(
        &self,
        credential: &Credential,
        challenge: &[u8; CHALLENGE_SIZE],
    ) -> Result<([u8; CHALLENGE_SIZE], SessionKey), CryptoError> {
        let (_, auth_secret) = self.parse(credential)?;
        let hkdf = Hkdf::<Sha256>::new(Some(&challenge[..]), auth_secret);

        let mut proof = [0u8; CHALLENGE_SIZE];
        let mut session = Zeroizing::new([0u8; KEY_SIZE]);
        hkdf.expand(b"proof", &mut proof)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        hkdf.expand(b"session", &mut session[..])
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

        Ok((proof, SessionKey::from_bytes(*session)))
    }
}

/// Compare two proofs without an early exit.
pub fn proofs_match(a: &[u8; CHALLENGE_SIZE], b: &[u8; CHALLENGE_SIZE]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Symmetric key sealing the content of one transfer session.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Encrypt with XChaCha20-Poly1305 under a random nonce.
    ///
    /// Returns `nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = random_bytes::<NONCE_SIZE>()?;
        let nonce = XNonce::from_slice(&nonce_bytes);

        let cipher = XChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt the output of [`SessionKey::seal`].
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let nonce = XNonce::from_slice(nonce_bytes);

        let cipher = XChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

// Don't leak keys in debug output
impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey([REDACTED])")
    }
}
