//! Scripted backup servers for integration tests.
//!
//! A [`FakeServer`] plays the server side of pairing, authentication and
//! transfer. A [`FakeNetwork`] routes every message the client sends through
//! a [`MockTransport`] to the server listening at the connected address.

#![allow(dead_code)]

use lanbackup_client::crypto::{
    derive_shared_secret, pairing_commitment, proofs_match, random_bytes, EphemeralKeyPair,
};
use lanbackup_client::{
    Credential, CredentialScheme, HkdfCredentialScheme, MockTransport, Responder, SessionKey,
};
use lanbackup_core::{numeric_comparison_value, NumericCode, SharedSecret};
use lanbackup_types::{
    AuthChallenge, AuthResult, FileAck, Message, PairCommitment, PairNonceReveal, ServiceId,
    ServiceRecord, PUBLIC_KEY_SIZE,
};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

/// The id `01 02 .. 10`.
pub fn sequential_id() -> ServiceId {
    let mut bytes = [0u8; 16];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = i as u8 + 1;
    }
    ServiceId::from_bytes(bytes)
}

/// An id whose bytes are all `fill`.
pub fn id_of(fill: u8) -> ServiceId {
    ServiceId::from_bytes([fill; 16])
}

pub fn record(id: ServiceId, address: &str, port: u16, name: &str) -> ServiceRecord {
    let address: IpAddr = address.parse().unwrap();
    ServiceRecord::new(id, address, port, name)
}

#[derive(Default)]
struct PendingPairing {
    keys: Option<EphemeralKeyPair>,
    server_public_key: [u8; PUBLIC_KEY_SIZE],
    client_public_key: [u8; PUBLIC_KEY_SIZE],
    server_nonce: [u8; 32],
}

#[derive(Default)]
struct ServerState {
    pairing: Option<PendingPairing>,
    secret: Option<SharedSecret>,
    credentials: Vec<Credential>,
    challenged: Option<(Credential, [u8; 32])>,
    session: Option<SessionKey>,
    current_file: Option<(String, Vec<u8>)>,
    stored: BTreeMap<String, Vec<u8>>,
    receipts: Vec<String>,
    tamper_commitment: bool,
    announce_as: Option<ServiceId>,
    hang_up_after: Option<usize>,
}

/// Server side of the lanbackup protocols.
pub struct FakeServer {
    pub record: ServiceRecord,
    state: Mutex<ServerState>,
}

impl FakeServer {
    pub fn new(record: ServiceRecord) -> Arc<Self> {
        Arc::new(Self {
            record,
            state: Mutex::new(ServerState::default()),
        })
    }

    /// Send a commitment that does not match the revealed nonce.
    pub fn tamper_commitment(&self) {
        self.state.lock().unwrap().tamper_commitment = true;
    }

    /// Answer pairing requests under another id.
    pub fn announce_as(&self, id: ServiceId) {
        self.state.lock().unwrap().announce_as = Some(id);
    }

    /// Drop the connection once `files` files were stored in one session.
    pub fn hang_up_after(&self, files: usize) {
        self.state.lock().unwrap().hang_up_after = Some(files);
    }

    /// Code this server displays for the last pairing exchange.
    pub fn numeric_code(&self) -> Option<NumericCode> {
        self.state
            .lock()
            .unwrap()
            .secret
            .as_ref()
            .map(numeric_comparison_value)
    }

    /// The server operator confirmed the pairing.
    pub fn accept_pairing(&self) {
        let mut state = self.state.lock().unwrap();
        let secret = state.secret.take().expect("no pairing to accept");
        let credential = HkdfCredentialScheme.derive_credential(&secret).unwrap();
        state.credentials.push(credential);
    }

    /// Accept a client holding a credential derived from `secret`.
    pub fn accept_pairing_with(&self, secret: &SharedSecret) {
        let credential = HkdfCredentialScheme.derive_credential(secret).unwrap();
        self.state.lock().unwrap().credentials.push(credential);
    }

    /// Forget every accepted client.
    pub fn revoke_all(&self) {
        self.state.lock().unwrap().credentials.clear();
    }

    /// Stored file contents by relative path.
    pub fn stored(&self) -> BTreeMap<String, Vec<u8>> {
        self.state.lock().unwrap().stored.clone()
    }

    /// Every file acknowledged, in order, including re-sends.
    pub fn receipts(&self) -> Vec<String> {
        self.state.lock().unwrap().receipts.clone()
    }

    fn handle(&self, data: &[u8]) -> Vec<Vec<u8>> {
        let message = Message::from_bytes(data).unwrap();
        let mut state = self.state.lock().unwrap();

        let reply = match message {
            Message::PairRequest(request) => {
                let keys = EphemeralKeyPair::generate();
                let server_public_key = keys.public_bytes();
                let server_nonce = random_bytes::<32>().unwrap();
                let mut commitment = pairing_commitment(
                    &server_public_key,
                    &request.client_public_key,
                    &server_nonce,
                );
                if state.tamper_commitment {
                    commitment[0] ^= 0xFF;
                }
                state.pairing = Some(PendingPairing {
                    keys: Some(keys),
                    server_public_key,
                    client_public_key: request.client_public_key,
                    server_nonce,
                });
                Some(Message::PairCommitment(PairCommitment {
                    server_id: state.announce_as.unwrap_or(self.record.id),
                    server_name: self.record.name.clone(),
                    server_public_key,
                    commitment,
                }))
            }
            Message::PairNonce(nonce) => {
                let mut pairing = state.pairing.take().expect("nonce before request");
                let dh = pairing
                    .keys
                    .take()
                    .unwrap()
                    .diffie_hellman(&pairing.client_public_key)
                    .unwrap();
                let secret = derive_shared_secret(
                    &dh,
                    &pairing.client_public_key,
                    &pairing.server_public_key,
                    &nonce.client_nonce,
                    &pairing.server_nonce,
                )
                .unwrap();
                state.secret = Some(secret);
                Some(Message::PairNonceReveal(PairNonceReveal {
                    server_nonce: pairing.server_nonce,
                }))
            }
            Message::AuthHello(hello) => {
                let known = state
                    .credentials
                    .iter()
                    .find(|c| HkdfCredentialScheme.key_id(c).unwrap() == hello.key_id)
                    .cloned();
                match known {
                    Some(credential) => {
                        let challenge = random_bytes::<32>().unwrap();
                        state.challenged = Some((credential, challenge));
                        Some(Message::AuthChallenge(AuthChallenge { challenge }))
                    }
                    None => Some(Message::AuthResult(AuthResult {
                        accepted: false,
                        reason: Some("unknown client".into()),
                    })),
                }
            }
            Message::AuthProof(proof) => {
                let (credential, challenge) = state.challenged.take().expect("proof first");
                let (expected, session) =
                    HkdfCredentialScheme.authenticate(&credential, &challenge).unwrap();
                let accepted = proofs_match(&proof.proof, &expected);
                if accepted {
                    state.session = Some(session);
                }
                Some(Message::AuthResult(AuthResult {
                    accepted,
                    reason: (!accepted).then(|| "bad proof".to_string()),
                }))
            }
            Message::FileHeader(header) => {
                state.current_file = Some((header.relative_path, Vec::new()));
                None
            }
            Message::FileChunk(chunk) => {
                let plain = state.session.as_ref().unwrap().open(&chunk.sealed).unwrap();
                state.current_file.as_mut().unwrap().1.extend_from_slice(&plain);
                None
            }
            Message::FileEnd(end) => {
                let (path, content) = state.current_file.take().unwrap();
                let stored = *blake3::hash(&content).as_bytes() == end.content_hash;
                if stored {
                    state.stored.insert(path.clone(), content);
                    state.receipts.push(path.clone());
                }
                if state.hang_up_after == Some(state.receipts.len()) {
                    state.hang_up_after = None;
                    None
                } else {
                    Some(Message::FileAck(FileAck {
                        relative_path: path,
                        stored,
                    }))
                }
            }
            Message::Bye(_) => {
                state.session = None;
                None
            }
            other => panic!("server got unexpected {}", other.kind()),
        };

        reply
            .map(|m| vec![m.to_bytes().unwrap()])
            .unwrap_or_default()
    }
}

/// Servers reachable through one mock transport, keyed by `ip:port`.
#[derive(Clone, Default)]
pub struct FakeNetwork {
    servers: Arc<Mutex<HashMap<String, Arc<FakeServer>>>>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start serving `server` at its record's address.
    pub fn add(&self, server: &Arc<FakeServer>) {
        self.servers
            .lock()
            .unwrap()
            .insert(server.record.socket_addr().to_string(), Arc::clone(server));
    }

    /// Serve `server` at another address instead.
    pub fn move_to(&self, server: &Arc<FakeServer>, address: &str) {
        let mut servers = self.servers.lock().unwrap();
        servers.retain(|_, s| !Arc::ptr_eq(s, server));
        servers.insert(address.to_string(), Arc::clone(server));
    }

    /// A transport whose peer is whichever server listens at the address.
    pub fn transport(&self) -> MockTransport {
        let servers = Arc::clone(&self.servers);
        let responder: Responder = Arc::new(move |address: &str, data: &[u8]| {
            let server = servers.lock().unwrap().get(address).cloned();
            match server {
                Some(server) => server.handle(data),
                None => Vec::new(),
            }
        });
        MockTransport::with_responder(responder)
    }
}
