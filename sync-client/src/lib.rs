//! # sync-client
//!
//! Client library for lanbackup: back up a device to servers on the local
//! network.
//!
//! This is the library applications embed to find, pair with and push files
//! to backup servers.
//!
//! ## Features
//!
//! - **Discovery**: Cancellable background scan loop over a pluggable
//!   announcement source
//! - **Pairing**: Commit-then-reveal X25519 exchange confirmed by a six-digit
//!   code the user compares
//! - **Registry**: Paired servers persisted with atomic file replacement
//! - **Dispatch**: Per-server failure isolation, never resends a file the
//!   server already holds
//! - **Transport Abstraction**: Pluggable transport layer (TCP, mock)
//!
//! ## Example
//!
//! ```ignore
//! use lanbackup_client::{DeviceRegistry, HkdfCredentialScheme, PairingSession, TcpTransport};
//!
//! let registry = DeviceRegistry::open("paired_servers.bin").await?;
//! let scheme = Arc::new(HkdfCredentialScheme);
//!
//! let session = PairingSession::new(TcpTransport::new(), scheme.clone(), "phone");
//! let code = session.pair_to_server(service)?.wait().await?;
//! println!("Does the server show {code}?");
//! session.add_as_paired(&registry).await?;
//! registry.save().await?;
//!
//! let dispatcher = SyncDispatcher::new(TcpTransport::new(), scheme, "phone");
//! println!("{}", dispatcher.process_sending_files(&registry).await.summary());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod crypto;
pub mod discovery;
pub mod dispatcher;
pub mod pairing;
pub mod registry;
pub mod transport;

pub use config::{ClientConfig, ConfigError, ManualServer};
pub use crypto::{
    Credential, CredentialScheme, CryptoError, HkdfCredentialScheme, SessionKey, KEY_SIZE,
    NONCE_SIZE,
};
pub use discovery::{
    AnnouncementSource, ChannelAnnouncements, DiscoveryError, DiscoveryService,
    ServiceRegistry, StaticAnnouncements,
};
pub use dispatcher::{
    AuthenticatedConnection, ChunkedTransfer, OutgoingFile, ServerOutcome, ServerResult,
    SyncDispatcher, SyncError, SyncReport, TransferStrategy,
};
pub use pairing::{ConfirmError, PairingSession, PairingTicket};
pub use registry::{DeviceRegistry, PairedServer, StorageError};
pub use transport::{
    MockTransport, Responder, TcpTransport, TcpTransportConfig, Transport, TransportError,
    MAX_MESSAGE_SIZE,
};

pub use lanbackup_core::{DiscoveredService, NumericCode, PairingError, PairingState};
pub use lanbackup_types::{ServiceId, ServiceRecord};
