//! Mock transport for testing.
//!
//! Allows queueing responses, scripting a fake server through a
//! [`Responder`], simulating unreachable addresses and capturing sent
//! messages for verification.

use super::{Transport, TransportError};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Scripted peer: called with the connected address and every sent
/// message, returns the messages the peer answers with.
pub type Responder = Arc<dyn Fn(&str, &[u8]) -> Vec<Vec<u8>> + Send + Sync>;

/// Mock transport for testing.
///
/// Clones share state, so a test can keep one handle while the code under
/// test owns another.
#[derive(Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Default)]
struct MockTransportInner {
    connected: bool,
    connected_address: Option<String>,
    connect_attempts: Vec<String>,
    sent_messages: Vec<(String, Vec<u8>)>,
    receive_queue: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
    unreachable: HashSet<String>,
    hang_on_recv: bool,
    fail_next_connect: Option<String>,
    fail_next_send: Option<String>,
    fail_next_recv: Option<String>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock transport whose peer is played by `responder`.
    pub fn with_responder(responder: Responder) -> Self {
        let transport = Self::new();
        transport.set_responder(responder);
        transport
    }

    /// Install a scripted peer. Replies are queued as each message is sent;
    /// every new connection starts with an empty queue.
    pub fn set_responder(&self, responder: Responder) {
        let mut inner = self.inner.lock().unwrap();
        inner.responder = Some(responder);
    }

    /// Queue a message to be returned by the next `recv()` call.
    pub fn queue_response(&self, data: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.receive_queue.push_back(data);
    }

    /// Make every connect() to `address` fail.
    pub fn set_unreachable(&self, address: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.unreachable.insert(address.to_string());
    }

    /// Make connect() to `address` succeed again.
    pub fn set_reachable(&self, address: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.unreachable.remove(address);
    }

    /// Make recv() wait forever instead of reporting a closed connection.
    pub fn hang_on_recv(&self, hang: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.hang_on_recv = hang;
    }

    /// Get all messages that were sent.
    pub fn sent_messages(&self) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .sent_messages
            .iter()
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Get the messages that were sent while connected to `address`.
    pub fn sent_messages_to(&self, address: &str) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .sent_messages
            .iter()
            .filter(|(to, _)| to == address)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Get the last message that was sent.
    pub fn last_sent(&self) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.sent_messages.last().map(|(_, data)| data.clone())
    }

    /// Get the address that was connected to.
    pub fn connected_address(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.connected_address.clone()
    }

    /// Every address connect() was called with, in order, failures included.
    pub fn connect_attempts(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.connect_attempts.clone()
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_connect = Some(error.to_string());
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_send = Some(error.to_string());
    }

    /// Cause the next recv() to fail with the given error.
    pub fn fail_next_recv(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_recv = Some(error.to_string());
    }

    /// Clear all state (messages, queue, connection, responder).
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = MockTransportInner::default();
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("MockTransport")
            .field("connected_address", &inner.connected_address)
            .field("sent", &inner.sent_messages.len())
            .field("queued", &inner.receive_queue.len())
            .field("scripted", &inner.responder.is_some())
            .finish()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.connect_attempts.push(address.to_string());

        // Check for forced failure
        if let Some(error) = inner.fail_next_connect.take() {
            return Err(TransportError::ConnectionFailed(error));
        }
        if inner.unreachable.contains(address) {
            return Err(TransportError::ConnectionFailed(format!(
                "{address} is unreachable"
            )));
        }

        if inner.responder.is_some() {
            inner.receive_queue.clear();
        }
        inner.connected = true;
        inner.connected_address = Some(address.to_string());
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.connected {
            return Err(TransportError::NotConnected);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }

        let address = inner.connected_address.clone().unwrap_or_default();
        inner.sent_messages.push((address.clone(), data.to_vec()));

        if let Some(responder) = inner.responder.clone() {
            let replies = responder(&address, data);
            inner.receive_queue.extend(replies);
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        {
            let mut inner = self.inner.lock().unwrap();

            if !inner.connected {
                return Err(TransportError::NotConnected);
            }

            // Check for forced failure
            if let Some(error) = inner.fail_next_recv.take() {
                return Err(TransportError::ReceiveFailed(error));
            }

            if let Some(data) = inner.receive_queue.pop_front() {
                return Ok(data);
            }

            if !inner.hang_on_recv {
                return Err(TransportError::ConnectionClosed);
            }
        }

        std::future::pending().await
    }

    fn is_connected(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===========================================
    // MockTransport Basic Tests
    // ===========================================

    #[tokio::test]
    async fn mock_transport_connects() {
        let transport = MockTransport::new();
        assert!(!transport.is_connected());

        transport.connect("10.0.0.5:8080").await.unwrap();

        assert!(transport.is_connected());
        assert_eq!(
            transport.connected_address(),
            Some("10.0.0.5:8080".to_string())
        );
    }

    #[tokio::test]
    async fn mock_transport_sends_messages() {
        let transport = MockTransport::new();
        transport.connect("server").await.unwrap();

        transport.send(b"message 1").await.unwrap();
        transport.send(b"message 2").await.unwrap();

        let sent = transport.sent_messages();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], b"message 1");
        assert_eq!(sent[1], b"message 2");
    }

    #[tokio::test]
    async fn mock_transport_receives_queued_messages() {
        let transport = MockTransport::new();
        transport.connect("server").await.unwrap();

        transport.queue_response(b"response 1".to_vec());
        transport.queue_response(b"response 2".to_vec());

        assert_eq!(transport.recv().await.unwrap(), b"response 1");
        assert_eq!(transport.recv().await.unwrap(), b"response 2");
    }

    #[tokio::test]
    async fn mock_transport_recv_empty_returns_closed() {
        let transport = MockTransport::new();
        transport.connect("server").await.unwrap();

        let result = transport.recv().await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn mock_transport_closes() {
        let transport = MockTransport::new();
        transport.connect("server").await.unwrap();
        assert!(transport.is_connected());

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    // ===========================================
    // Scripted Peer Tests
    // ===========================================

    #[tokio::test]
    async fn responder_answers_each_send() {
        let transport = MockTransport::with_responder(Arc::new(|address, data| {
            vec![format!("{address} got {}", data.len()).into_bytes()]
        }));
        transport.connect("a:1").await.unwrap();

        transport.send(b"abc").await.unwrap();

        assert_eq!(transport.recv().await.unwrap(), b"a:1 got 3");
    }

    #[tokio::test]
    async fn responder_mode_starts_each_connection_clean() {
        let transport = MockTransport::with_responder(Arc::new(|_, _| vec![b"reply".to_vec()]));
        transport.connect("a:1").await.unwrap();
        transport.send(b"x").await.unwrap();

        transport.connect("b:2").await.unwrap();

        let result = transport.recv().await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn sent_messages_are_tracked_per_address() {
        let transport = MockTransport::new();
        transport.connect("a:1").await.unwrap();
        transport.send(b"to a").await.unwrap();
        transport.connect("b:2").await.unwrap();
        transport.send(b"to b").await.unwrap();

        assert_eq!(transport.sent_messages_to("a:1"), vec![b"to a".to_vec()]);
        assert_eq!(transport.sent_messages_to("b:2"), vec![b"to b".to_vec()]);
        assert_eq!(transport.connect_attempts(), vec!["a:1", "b:2"]);
    }

    #[tokio::test]
    async fn unreachable_address_refuses_connections() {
        let transport = MockTransport::new();
        transport.set_unreachable("10.0.0.9:8080");

        let result = transport.connect("10.0.0.9:8080").await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert!(!transport.is_connected());

        transport.set_reachable("10.0.0.9:8080");
        transport.connect("10.0.0.9:8080").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_recv_never_completes() {
        let transport = MockTransport::new();
        transport.connect("server").await.unwrap();
        transport.hang_on_recv(true);

        let result =
            tokio::time::timeout(std::time::Duration::from_secs(5), transport.recv()).await;
        assert!(result.is_err());
    }

    // ===========================================
    // Error Condition Tests
    // ===========================================

    #[tokio::test]
    async fn send_without_connect_fails() {
        let transport = MockTransport::new();

        let result = transport.send(b"data").await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn recv_without_connect_fails() {
        let transport = MockTransport::new();

        let result = transport.recv().await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn forced_connect_failure() {
        let transport = MockTransport::new();
        transport.fail_next_connect("network unreachable");

        let result = transport.connect("server").await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn forced_send_failure() {
        let transport = MockTransport::new();
        transport.connect("server").await.unwrap();
        transport.fail_next_send("buffer full");

        let result = transport.send(b"data").await;
        assert!(matches!(result, Err(TransportError::SendFailed(_))));

        // Next send should work
        transport.send(b"data").await.unwrap();
    }

    #[tokio::test]
    async fn forced_recv_failure() {
        let transport = MockTransport::new();
        transport.connect("server").await.unwrap();
        transport.queue_response(b"data".to_vec());
        transport.fail_next_recv("timeout");

        let result = transport.recv().await;
        assert!(matches!(result, Err(TransportError::ReceiveFailed(_))));

        // Next recv should work (and get the queued data)
        let data = transport.recv().await.unwrap();
        assert_eq!(data, b"data");
    }

    // ===========================================
    // Clone and Shared State Tests
    // ===========================================

    #[tokio::test]
    async fn mock_transport_clone_shares_state() {
        let transport1 = MockTransport::new();
        let transport2 = transport1.clone();

        transport1.connect("server").await.unwrap();
        assert!(transport2.is_connected());

        transport1.send(b"from t1").await.unwrap();
        transport2.send(b"from t2").await.unwrap();

        assert_eq!(transport1.sent_messages().len(), 2);
    }

    #[tokio::test]
    async fn mock_transport_reset_clears_all() {
        let transport = MockTransport::new();
        transport.connect("server").await.unwrap();
        transport.send(b"data").await.unwrap();
        transport.queue_response(b"response".to_vec());

        transport.reset();

        assert!(!transport.is_connected());
        assert!(transport.sent_messages().is_empty());
        assert!(transport.connected_address().is_none());
        assert!(transport.last_sent().is_none());
    }
}
