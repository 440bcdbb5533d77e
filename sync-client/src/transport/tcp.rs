//! TcpTransport - plain TCP on the local network.
//!
//! Each protocol message travels as one frame: a 4-byte big-endian length
//! followed by the MessagePack payload.

use super::{Transport, TransportError, MAX_MESSAGE_SIZE};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Configuration for TcpTransport.
#[derive(Clone, Debug)]
pub struct TcpTransportConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Send/recv operation timeout.
    pub operation_timeout: Duration,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(60),
        }
    }
}

/// TcpTransport implements the Transport trait over a single TCP stream.
///
/// # Example
///
/// ```ignore
/// let transport = TcpTransport::new();
/// transport.connect("10.0.0.5:8080").await?;
/// transport.send(b"hello").await?;
/// let response = transport.recv().await?;
/// ```
#[derive(Debug, Default)]
pub struct TcpTransport {
    /// Active stream (if connected).
    stream: Arc<Mutex<Option<TcpStream>>>,
    /// Configuration options.
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Create a new TcpTransport with default timeouts.
    pub fn new() -> Self {
        Self::with_config(TcpTransportConfig::default())
    }

    /// Create a new TcpTransport with custom configuration.
    pub fn with_config(config: TcpTransportConfig) -> Self {
        Self {
            stream: Arc::new(Mutex::new(None)),
            config,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        // Close existing connection if any
        self.close().await.ok();

        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{address}: {e}")))?;
        stream.set_nodelay(true).ok();

        *self.stream.lock().await = Some(stream);
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        // Validate message size
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::SendFailed(format!(
                "Message too large: {} > {}",
                data.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let write = async {
            // Length-prefixed framing (4 bytes, big-endian)
            let len = (data.len() as u32).to_be_bytes();
            stream
                .write_all(&len)
                .await
                .map_err(|e| TransportError::SendFailed(format!("Failed to write length: {e}")))?;
            stream
                .write_all(data)
                .await
                .map_err(|e| TransportError::SendFailed(format!("Failed to write data: {e}")))?;
            stream
                .flush()
                .await
                .map_err(|e| TransportError::SendFailed(format!("Failed to flush: {e}")))
        };

        tokio::time::timeout(self.config.operation_timeout, write)
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let read = async {
            // Read length prefix (4 bytes, big-endian)
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    TransportError::ConnectionClosed
                } else {
                    TransportError::ReceiveFailed(format!("Failed to read length: {e}"))
                }
            })?;

            let len = u32::from_be_bytes(len_buf) as usize;
            if len > MAX_MESSAGE_SIZE {
                return Err(TransportError::ReceiveFailed(format!(
                    "Message too large: {} > {}",
                    len, MAX_MESSAGE_SIZE
                )));
            }

            let mut data = vec![0u8; len];
            stream
                .read_exact(&mut data)
                .await
                .map_err(|e| TransportError::ReceiveFailed(format!("Failed to read data: {e}")))?;
            Ok(data)
        };

        tokio::time::timeout(self.config.operation_timeout, read)
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    fn is_connected(&self) -> bool {
        self.stream
            .try_lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.lock().await.take() {
            stream.shutdown().await.ok();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    // ===========================================
    // Trait Compliance Tests
    // ===========================================

    #[test]
    fn tcp_transport_implements_transport_trait() {
        fn assert_transport<T: Transport>() {}
        assert_transport::<TcpTransport>();
    }

    // ===========================================
    // Connection State Tests
    // ===========================================

    #[tokio::test]
    async fn not_connected_initially() {
        let transport = TcpTransport::new();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn send_without_connect_fails() {
        let transport = TcpTransport::new();
        let result = transport.send(b"data").await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn recv_without_connect_fails() {
        let transport = TcpTransport::new();
        let result = transport.recv().await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn close_without_connect_succeeds() {
        let transport = TcpTransport::new();
        assert!(transport.close().await.is_ok());
    }

    #[tokio::test]
    async fn send_oversized_message_fails() {
        let transport = TcpTransport::new();
        let oversized = vec![0u8; MAX_MESSAGE_SIZE + 1];
        let result = transport.send(&oversized).await;
        assert!(matches!(result, Err(TransportError::SendFailed(_))));
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = TcpTransport::new();
        let result = transport.connect(&address).await;
        assert!(result.is_err());
        assert!(!transport.is_connected());
    }

    // ===========================================
    // Framing Tests
    // ===========================================

    #[tokio::test]
    async fn frames_echo_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            for _ in 0..2 {
                let mut len_buf = [0u8; 4];
                socket.read_exact(&mut len_buf).await.unwrap();
                let len = u32::from_be_bytes(len_buf) as usize;
                let mut data = vec![0u8; len];
                socket.read_exact(&mut data).await.unwrap();
                socket.write_all(&len_buf).await.unwrap();
                socket.write_all(&data).await.unwrap();
            }
        });

        let transport = TcpTransport::new();
        transport.connect(&address).await.unwrap();
        assert!(transport.is_connected());

        transport.send(b"first").await.unwrap();
        transport.send(b"").await.unwrap();
        assert_eq!(transport.recv().await.unwrap(), b"first");
        assert_eq!(transport.recv().await.unwrap(), b"");

        server.await.unwrap();
        let result = transport.recv().await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn oversized_incoming_frame_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let len = ((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes();
            socket.write_all(&len).await.unwrap();
            socket
        });

        let transport = TcpTransport::new();
        transport.connect(&address).await.unwrap();
        let _socket = server.await.unwrap();

        let result = transport.recv().await;
        assert!(matches!(result, Err(TransportError::ReceiveFailed(_))));
    }
}
