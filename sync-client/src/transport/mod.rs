//! Transport abstraction for lanbackup.
//!
//! This module provides a pluggable transport layer that abstracts
//! the underlying connection mechanism (TCP on the local network, mock
//! for testing).
//!
//! # Design
//!
//! The transport trait is async, connection-oriented and message-framed:
//! - `connect()` establishes a connection to `ip:port`
//! - `send()` transmits one encoded protocol message
//! - `recv()` receives one encoded protocol message
//! - `close()` gracefully terminates
//!
//! # Example
//!
//! ```ignore
//! let transport = TcpTransport::new();
//! transport.connect("10.0.0.5:8080").await?;
//! transport.send(&message.to_bytes()?).await?;
//! let response = Message::from_bytes(&transport.recv().await?)?;
//! ```

mod mock;
mod tcp;

pub use mock::{MockTransport, Responder};
pub use tcp::{TcpTransport, TcpTransportConfig};

use async_trait::async_trait;
use lanbackup_types::Message;
use thiserror::Error;

/// Maximum size of one framed message (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,

    /// Peer sent bytes that are not a protocol message.
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Transport trait for sending and receiving protocol messages.
///
/// Implementations handle the underlying connection mechanism
/// (TCP, mock, etc). A transport carries one connection at a time.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to a server identified by the given address (`ip:port`).
    async fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Send one message worth of bytes over the connection.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive one message worth of bytes from the connection.
    ///
    /// Blocks until data is available or connection closes.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Encode and send a protocol message.
pub async fn send_message<T: Transport + ?Sized>(
    transport: &T,
    message: &Message,
) -> Result<(), TransportError> {
    let bytes = message
        .to_bytes()
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    transport.send(&bytes).await
}

/// Receive and decode a protocol message.
pub async fn recv_message<T: Transport + ?Sized>(transport: &T) -> Result<Message, TransportError> {
    let bytes = transport.recv().await?;
    Message::from_bytes(&bytes).map_err(|e| TransportError::Malformed(e.to_string()))
}
