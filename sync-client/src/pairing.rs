//! PairingSession - pairing this device with one discovered server.
//!
//! A session drives the pure [`PairingState`] machine from `sync-core`:
//!
//! ```text
//! pair_to_server ──► worker task ──► oneshot ──► PairingTicket::wait
//!                       │                           │
//!                  key exchange               six-digit code shown
//!                  over Transport             to the user
//!                                                   │
//!                              add_as_paired(registry) | reject()
//! ```
//!
//! The key exchange is a commit-then-reveal X25519 exchange: the server
//! commits to its nonce before it sees the client nonce, so a man in the
//! middle cannot grind nonces until both displayed codes agree.
//!
//! Nothing reaches the [`DeviceRegistry`] until the user confirms.

use lanbackup_core::{
    numeric_comparison_value, NumericCode, PairingError, PairingEvent, PairingState, SharedSecret,
};
use lanbackup_types::{
    Message, PairNonce, PairRequest, ServiceRecord, NONCE_SIZE, PROTOCOL_VERSION,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::crypto::{
    derive_shared_secret, pairing_commitment, random_bytes, CredentialScheme, CryptoError,
    EphemeralKeyPair,
};
use crate::registry::{DeviceRegistry, PairedServer, StorageError};
use crate::transport::{recv_message, send_message, Transport, TransportError};

/// Default upper bound for the key exchange.
pub const DEFAULT_PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// Why confirming a pairing failed.
#[derive(Debug, Error)]
pub enum ConfirmError {
    /// The session was not awaiting confirmation.
    #[error(transparent)]
    Pairing(#[from] PairingError),

    /// The registry refused the new entry.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Pending outcome of a key exchange started by
/// [`PairingSession::pair_to_server`].
#[derive(Debug)]
pub struct PairingTicket {
    outcome: oneshot::Receiver<Result<NumericCode, PairingError>>,
}

impl PairingTicket {
    /// Wait for the key exchange to finish.
    ///
    /// Yields the code to show the user, or why the exchange failed.
    pub async fn wait(self) -> Result<NumericCode, PairingError> {
        self.outcome.await.unwrap_or_else(|_| {
            Err(PairingError::KeyExchangeFailed(
                "pairing worker stopped".into(),
            ))
        })
    }
}

#[derive(Default)]
struct SessionInner {
    state: PairingState,
    target: Option<ServiceRecord>,
    secret: Option<SharedSecret>,
    worker: Option<JoinHandle<()>>,
    /// Set while `add_as_paired` is writing to the registry.
    confirming: bool,
}

/// One attempt to pair with one server.
///
/// A session is single use: once it reaches Confirmed, Rejected or Failed,
/// create a new one to try again.
pub struct PairingSession<T: Transport + 'static> {
    transport: Arc<T>,
    scheme: Arc<dyn CredentialScheme>,
    client_name: String,
    timeout: Duration,
    inner: Arc<Mutex<SessionInner>>,
}

impl<T: Transport + 'static> PairingSession<T> {
    /// Create an idle session.
    pub fn new(transport: T, scheme: Arc<dyn CredentialScheme>, client_name: &str) -> Self {
        Self {
            transport: Arc::new(transport),
            scheme,
            client_name: client_name.to_string(),
            timeout: DEFAULT_PAIRING_TIMEOUT,
            inner: Arc::new(Mutex::new(SessionInner::default())),
        }
    }

    /// Set the upper bound for the key exchange.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Current state.
    pub fn state(&self) -> PairingState {
        self.lock().state.clone()
    }

    /// Server this session is pairing with, once started.
    pub fn target(&self) -> Option<ServiceRecord> {
        self.lock().target.clone()
    }

    /// Start the key exchange with `service` on a worker task.
    ///
    /// # Errors
    ///
    /// [`PairingError::AlreadyInProgress`] while an exchange is running and
    /// [`PairingError::ProtocolViolation`] once the session has moved past it.
    pub fn pair_to_server(&self, service: ServiceRecord) -> Result<PairingTicket, PairingError> {
        let mut inner = self.lock();
        inner.state = inner.state.on_event(PairingEvent::Started)?;
        inner.target = Some(service.clone());

        tracing::info!("Pairing with {}", service);

        let (sender, outcome) = oneshot::channel();
        let transport = Arc::clone(&self.transport);
        let session = Arc::clone(&self.inner);
        let client_name = self.client_name.clone();
        let timeout = self.timeout;

        inner.worker = Some(tokio::spawn(async move {
            let exchange = key_exchange(transport.as_ref(), &service, &client_name);
            let result = match tokio::time::timeout(timeout, exchange).await {
                Ok(result) => result,
                Err(_) => Err(PairingError::Timeout),
            };
            transport.close().await.ok();

            let outcome = finish_exchange(&session, result);
            sender.send(outcome).ok();
        }));

        Ok(PairingTicket { outcome })
    }

    /// Code to compare with the one the server shows.
    ///
    /// `None` unless the session is awaiting user confirmation.
    pub fn compute_numeric_comparison_value(&self) -> Option<NumericCode> {
        self.lock().state.numeric_code()
    }

    /// The user confirmed matching codes: store the server in `registry`.
    ///
    /// An existing entry with the same id is replaced in place. The registry
    /// is not saved; call [`DeviceRegistry::save`] to make it durable.
    ///
    /// # Errors
    ///
    /// [`PairingError::ProtocolViolation`] unless awaiting confirmation; the
    /// registry is untouched in that case.
    pub async fn add_as_paired(
        &self,
        registry: &DeviceRegistry,
    ) -> Result<PairedServer, ConfirmError> {
        let server = {
            let mut inner = self.lock();
            if inner.confirming {
                return Err(confirmation_pending().into());
            }
            inner.state.on_event(PairingEvent::UserConfirmed)?;

            let (secret, target) = match (&inner.secret, &inner.target) {
                (Some(secret), Some(target)) => (secret, target),
                _ => {
                    return Err(PairingError::ProtocolViolation(
                        "no agreed secret to confirm".into(),
                    )
                    .into())
                }
            };
            let credential = self
                .scheme
                .derive_credential(secret)
                .map_err(|e| PairingError::KeyExchangeFailed(e.to_string()))?;
            let server = PairedServer::new(target, credential);
            inner.confirming = true;
            server
        };

        let inserted = registry.insert(server.clone()).await;

        let mut inner = self.lock();
        inner.confirming = false;
        inserted?;
        inner.state = inner.state.on_event(PairingEvent::UserConfirmed)?;
        inner.secret = None;
        tracing::info!("Pairing with {} confirmed", server.name);

        Ok(server)
    }

    /// The user saw different codes or cancelled. Nothing is stored.
    ///
    /// Fails while a confirmation is being stored.
    pub fn reject(&self) -> Result<(), PairingError> {
        let mut inner = self.lock();
        if inner.confirming {
            return Err(confirmation_pending());
        }
        inner.state = inner.state.on_event(PairingEvent::UserRejected)?;
        inner.secret = None;
        tracing::info!("Pairing rejected by user");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Transport + 'static> std::fmt::Debug for PairingSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("PairingSession")
            .field("state", &inner.state)
            .field("target", &inner.target)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<T: Transport + 'static> Drop for PairingSession<T> {
    fn drop(&mut self) {
        if let Some(worker) = self.lock().worker.take() {
            worker.abort();
        }
    }
}

fn finish_exchange(
    session: &Mutex<SessionInner>,
    result: Result<SharedSecret, PairingError>,
) -> Result<NumericCode, PairingError> {
    let mut inner = session.lock().unwrap_or_else(PoisonError::into_inner);
    inner.worker = None;

    match result {
        Ok(secret) => {
            let code = numeric_comparison_value(&secret);
            inner.state = inner
                .state
                .on_event(PairingEvent::KeyExchangeSucceeded { code })?;
            inner.secret = Some(secret);
            tracing::debug!("Key exchange finished, awaiting user confirmation");
            Ok(code)
        }
        Err(e) => {
            tracing::warn!("Pairing failed: {}", e);
            inner.state = inner.state.on_event(PairingEvent::KeyExchangeFailed)?;
            Err(e)
        }
    }
}

async fn key_exchange<T: Transport + ?Sized>(
    transport: &T,
    service: &ServiceRecord,
    client_name: &str,
) -> Result<SharedSecret, PairingError> {
    transport
        .connect(&service.socket_addr().to_string())
        .await
        .map_err(transport_failed)?;

    let keys = EphemeralKeyPair::generate();
    let client_public_key = keys.public_bytes();

    send_message(
        transport,
        &Message::PairRequest(PairRequest {
            version: PROTOCOL_VERSION,
            client_public_key,
            client_name: client_name.to_string(),
        }),
    )
    .await
    .map_err(transport_failed)?;

    let commitment = match recv_message(transport).await.map_err(transport_failed)? {
        Message::PairCommitment(commitment) => commitment,
        other => return Err(unexpected("PairCommitment", &other)),
    };
    if commitment.server_id != service.id {
        return Err(PairingError::KeyExchangeFailed(format!(
            "server answered as {} but {} was selected",
            commitment.server_id, service.id
        )));
    }

    let client_nonce = random_bytes::<NONCE_SIZE>().map_err(crypto_failed)?;
    send_message(transport, &Message::PairNonce(PairNonce { client_nonce }))
        .await
        .map_err(transport_failed)?;

    let reveal = match recv_message(transport).await.map_err(transport_failed)? {
        Message::PairNonceReveal(reveal) => reveal,
        other => return Err(unexpected("PairNonceReveal", &other)),
    };

    let expected = pairing_commitment(
        &commitment.server_public_key,
        &client_public_key,
        &reveal.server_nonce,
    );
    if expected != commitment.commitment {
        return Err(PairingError::KeyExchangeFailed(
            "server nonce does not match its commitment".into(),
        ));
    }

    let dh = keys
        .diffie_hellman(&commitment.server_public_key)
        .map_err(crypto_failed)?;
    derive_shared_secret(
        &dh,
        &client_public_key,
        &commitment.server_public_key,
        &client_nonce,
        &reveal.server_nonce,
    )
    .map_err(crypto_failed)
}

fn confirmation_pending() -> PairingError {
    PairingError::ProtocolViolation("confirmation already in progress".into())
}

fn transport_failed(e: TransportError) -> PairingError {
    PairingError::KeyExchangeFailed(e.to_string())
}

fn crypto_failed(e: CryptoError) -> PairingError {
    PairingError::KeyExchangeFailed(e.to_string())
}

fn unexpected(expected: &str, got: &Message) -> PairingError {
    match got {
        Message::Bye(bye) => PairingError::KeyExchangeFailed(format!(
            "server ended pairing: {}",
            bye.reason.as_deref().unwrap_or("no reason given")
        )),
        other => PairingError::ProtocolViolation(format!(
            "expected {expected}, got {}",
            other.kind()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HkdfCredentialScheme;
    use crate::transport::MockTransport;
    use lanbackup_types::{Bye, ServiceId};

    fn desk() -> ServiceRecord {
        ServiceRecord::new(
            ServiceId::from_bytes([1; 16]),
            "10.0.0.5".parse().unwrap(),
            8080,
            "desk",
        )
    }

    fn session(transport: &MockTransport) -> PairingSession<MockTransport> {
        PairingSession::new(transport.clone(), Arc::new(HkdfCredentialScheme), "phone")
    }

    // ===========================================
    // State Guard Tests
    // ===========================================

    #[tokio::test]
    async fn new_session_is_idle_without_code() {
        let session = session(&MockTransport::new());
        assert_eq!(session.state(), PairingState::Idle);
        assert!(session.compute_numeric_comparison_value().is_none());
        assert!(session.target().is_none());
    }

    #[tokio::test]
    async fn confirm_while_idle_is_protocol_violation() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::new(dir.path().join("servers.bin"));
        let session = session(&MockTransport::new());

        let result = session.add_as_paired(&registry).await;

        assert!(matches!(
            result,
            Err(ConfirmError::Pairing(PairingError::ProtocolViolation(_)))
        ));
        assert!(registry.paired_servers().await.is_empty());
        assert_eq!(session.state(), PairingState::Idle);
    }

    #[tokio::test]
    async fn reject_while_idle_is_protocol_violation() {
        let session = session(&MockTransport::new());
        assert!(matches!(
            session.reject(),
            Err(PairingError::ProtocolViolation(_))
        ));
    }

    // ===========================================
    // Failure Tests
    // ===========================================

    #[tokio::test]
    async fn unreachable_server_fails_session() {
        let transport = MockTransport::new();
        transport.set_unreachable("10.0.0.5:8080");
        let session = session(&transport);

        let ticket = session.pair_to_server(desk()).unwrap();
        let result = ticket.wait().await;

        assert!(matches!(result, Err(PairingError::KeyExchangeFailed(_))));
        assert_eq!(session.state(), PairingState::Failed);
        assert!(matches!(
            session.pair_to_server(desk()),
            Err(PairingError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn out_of_order_reply_is_protocol_violation() {
        let transport = MockTransport::new();
        transport.queue_response(
            Message::PairNonce(PairNonce {
                client_nonce: [0; NONCE_SIZE],
            })
            .to_bytes()
            .unwrap(),
        );
        let session = session(&transport);

        let result = session.pair_to_server(desk()).unwrap().wait().await;

        assert!(matches!(result, Err(PairingError::ProtocolViolation(_))));
        assert_eq!(session.state(), PairingState::Failed);
    }

    #[tokio::test]
    async fn server_refusal_is_key_exchange_failure() {
        let transport = MockTransport::new();
        transport.queue_response(
            Message::Bye(Bye {
                reason: Some("pairing disabled".into()),
            })
            .to_bytes()
            .unwrap(),
        );
        let session = session(&transport);

        let result = session.pair_to_server(desk()).unwrap().wait().await;

        match result {
            Err(PairingError::KeyExchangeFailed(reason)) => {
                assert!(reason.contains("pairing disabled"))
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_times_out() {
        let transport = MockTransport::new();
        transport.hang_on_recv(true);
        let session = session(&transport).with_timeout(Duration::from_secs(5));

        let result = session.pair_to_server(desk()).unwrap().wait().await;

        assert_eq!(result, Err(PairingError::Timeout));
        assert_eq!(session.state(), PairingState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_while_running_is_already_in_progress() {
        let transport = MockTransport::new();
        transport.hang_on_recv(true);
        let session = session(&transport);

        let _ticket = session.pair_to_server(desk()).unwrap();

        assert_eq!(
            session.pair_to_server(desk()).unwrap_err(),
            PairingError::AlreadyInProgress
        );
        assert_eq!(session.state(), PairingState::KeyExchangeInProgress);
    }

    // ===========================================
    // Confirmation Race Tests
    // ===========================================

    fn awaiting_confirmation(session: &PairingSession<MockTransport>) {
        let secret = SharedSecret::from_bytes([3; 32]);
        let mut inner = session.lock();
        inner.state = PairingState::AwaitingUserConfirmation {
            code: numeric_comparison_value(&secret),
        };
        inner.secret = Some(secret);
        inner.target = Some(desk());
    }

    #[tokio::test]
    async fn reject_during_confirmation_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::new(dir.path().join("servers.bin"));
        let session = session(&MockTransport::new());
        awaiting_confirmation(&session);

        // The registry stays locked until reject() has run, so the
        // confirmation is parked inside insert when the user rejects
        let (rejected, confirmed) = tokio::join!(
            registry.locked_during(async {
                tokio::task::yield_now().await;
                session.reject()
            }),
            session.add_as_paired(&registry),
        );

        assert!(matches!(rejected, Err(PairingError::ProtocolViolation(_))));
        assert!(confirmed.is_ok());
        assert_eq!(session.state(), PairingState::Confirmed);
        assert_eq!(registry.paired_servers().await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_confirmations_store_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::new(dir.path().join("servers.bin"));
        let session = session(&MockTransport::new());
        awaiting_confirmation(&session);

        let (_, first, second) = tokio::join!(
            registry.locked_during(tokio::task::yield_now()),
            session.add_as_paired(&registry),
            session.add_as_paired(&registry),
        );

        assert!(first.is_ok());
        assert!(matches!(
            second,
            Err(ConfirmError::Pairing(PairingError::ProtocolViolation(_)))
        ));
        assert_eq!(session.state(), PairingState::Confirmed);
        assert_eq!(registry.paired_servers().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_session_abandons_worker() {
        let transport = MockTransport::new();
        transport.hang_on_recv(true);
        let session = session(&transport);
        let ticket = session.pair_to_server(desk()).unwrap();

        drop(session);

        assert!(matches!(
            ticket.wait().await,
            Err(PairingError::KeyExchangeFailed(_))
        ));
    }
}
