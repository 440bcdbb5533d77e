//! SyncDispatcher - push new files to every paired server.
//!
//! One pass of [`SyncDispatcher::process_sending_files`] walks the paired
//! servers in registry order. Per server it:
//! 1. skips the server if no sync directory is set,
//! 2. lists the files the server does not hold yet (on a blocking worker),
//! 3. connects and authenticates with the stored credential,
//! 4. hands every pending file to the [`TransferStrategy`],
//! 5. records each acknowledged file and saves the registry.
//!
//! A failing server never stops the pass; its error lands in the
//! [`SyncReport`] next to the other outcomes.
//!
//! # Session protocol
//!
//! ```text
//! client                               server
//!   AuthHello {key_id} ─────────────────►
//!   ◄──────────────── AuthChallenge | AuthResult {accepted: false}
//!   AuthProof ──────────────────────────►
//!   ◄──────────────────────── AuthResult
//!   FileHeader, FileChunk*, FileEnd ────►   (per file)
//!   ◄──────────────────────────── FileAck
//!   Bye ────────────────────────────────►
//! ```

use async_trait::async_trait;
use lanbackup_core::{FileFingerprint, FileStamp, TransferWatermark};
use lanbackup_types::{
    AuthHello, AuthProof, Bye, FileChunk, FileEnd, FileHeader, Message, ServiceId,
    PROTOCOL_VERSION,
};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::crypto::{CredentialScheme, SessionKey};
use crate::discovery::ServiceRegistry;
use crate::registry::{DeviceRegistry, PairedServer};
use crate::transport::{recv_message, send_message, Transport, TransportError, MAX_MESSAGE_SIZE};

/// Default plaintext bytes per sealed chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Largest chunk that still fits one framed message after sealing.
pub const MAX_CHUNK_SIZE: usize = MAX_MESSAGE_SIZE / 2;

/// Default timeout for one network exchange.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Why syncing with one server failed.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The server could not be reached.
    #[error("server unreachable: {0}")]
    Unreachable(String),

    /// The server did not accept the stored credential.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Some files were sent before the session broke.
    #[error("sent {sent} of {total} files: {reason}")]
    PartialTransfer {
        /// Files acknowledged before the failure.
        sent: usize,
        /// Files that were pending.
        total: usize,
        /// What broke the session.
        reason: String,
    },

    /// Local file system, registry or session failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        SyncError::Io(e.to_string())
    }
}

/// A file waiting to be sent to one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    /// `/`-separated path relative to the sync directory.
    pub relative_path: String,
    /// Where to read it from.
    pub absolute_path: PathBuf,
    /// Size, mtime and content hash at scan time.
    pub fingerprint: FileFingerprint,
}

/// An authenticated session with a server, lent to a [`TransferStrategy`].
pub struct AuthenticatedConnection<'a> {
    transport: &'a dyn Transport,
    session_key: SessionKey,
    io_timeout: Duration,
}

impl<'a> AuthenticatedConnection<'a> {
    /// Wrap a transport that already completed authentication.
    pub fn new(transport: &'a dyn Transport, session_key: SessionKey, io_timeout: Duration) -> Self {
        Self {
            transport,
            session_key,
            io_timeout,
        }
    }

    /// Key sealing this session's content.
    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    /// Send one message, bounded by the I/O timeout.
    pub async fn send(&self, message: &Message) -> Result<(), TransportError> {
        tokio::time::timeout(self.io_timeout, send_message(self.transport, message))
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    /// Receive one message, bounded by the I/O timeout.
    pub async fn recv(&self) -> Result<Message, TransportError> {
        tokio::time::timeout(self.io_timeout, recv_message(self.transport))
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}

impl fmt::Debug for AuthenticatedConnection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedConnection")
            .field("io_timeout", &self.io_timeout)
            .finish_non_exhaustive()
    }
}

/// How one file travels over an authenticated session.
#[async_trait]
pub trait TransferStrategy: Send + Sync {
    /// Send `file` and wait for the server to acknowledge it.
    ///
    /// Returns the number of plaintext bytes sent.
    async fn transfer(
        &self,
        file: &OutgoingFile,
        connection: &AuthenticatedConnection<'_>,
    ) -> Result<u64, SyncError>;
}

/// Default strategy: header, sealed chunks, hash, then wait for the ack.
#[derive(Debug, Clone, Copy)]
pub struct ChunkedTransfer {
    chunk_size: usize,
}

impl ChunkedTransfer {
    /// Send at most `chunk_size` plaintext bytes per chunk.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.clamp(1, MAX_CHUNK_SIZE),
        }
    }

    /// Plaintext bytes per chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl Default for ChunkedTransfer {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

#[async_trait]
impl TransferStrategy for ChunkedTransfer {
    async fn transfer(
        &self,
        file: &OutgoingFile,
        connection: &AuthenticatedConnection<'_>,
    ) -> Result<u64, SyncError> {
        let mut reader = tokio::fs::File::open(&file.absolute_path)
            .await
            .map_err(|e| SyncError::Io(format!("{}: {e}", file.relative_path)))?;

        connection
            .send(&Message::FileHeader(FileHeader {
                relative_path: file.relative_path.clone(),
                size: file.fingerprint.stamp.size,
            }))
            .await?;

        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; self.chunk_size];
        let mut sent = 0u64;
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| SyncError::Io(format!("{}: {e}", file.relative_path)))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            let sealed = connection
                .session_key()
                .seal(&buf[..n])
                .map_err(|e| SyncError::Io(e.to_string()))?;
            connection
                .send(&Message::FileChunk(FileChunk { sealed }))
                .await?;
            sent += n as u64;
        }

        let content_hash = *hasher.finalize().as_bytes();
        connection
            .send(&Message::FileEnd(FileEnd { content_hash }))
            .await?;

        match connection.recv().await? {
            Message::FileAck(ack) if ack.relative_path == file.relative_path => {
                if !ack.stored {
                    return Err(SyncError::Io(format!(
                        "server did not store {}",
                        file.relative_path
                    )));
                }
            }
            other => {
                return Err(SyncError::Io(format!(
                    "expected FileAck for {}, got {}",
                    file.relative_path,
                    other.kind()
                )))
            }
        }

        if content_hash != file.fingerprint.content_hash {
            return Err(SyncError::Io(format!(
                "{} changed while it was being sent",
                file.relative_path
            )));
        }
        Ok(sent)
    }
}

/// What happened to one server during a pass.
#[derive(Debug)]
pub enum ServerResult {
    /// Every pending file was acknowledged (possibly none were pending).
    Transferred {
        /// Files sent.
        files: usize,
        /// Plaintext bytes sent.
        bytes: u64,
    },
    /// The server was not contacted.
    Skipped(String),
    /// Syncing this server failed.
    Failed(SyncError),
}

/// Outcome for one paired server.
#[derive(Debug)]
pub struct ServerOutcome {
    /// Server id.
    pub server_id: ServiceId,
    /// Server name at the time of the pass.
    pub server_name: String,
    /// What happened.
    pub result: ServerResult,
}

/// Aggregated result of one dispatch pass.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// One entry per paired server, in registry order.
    pub outcomes: Vec<ServerOutcome>,
}

impl SyncReport {
    /// Whether any server failed.
    pub fn has_failures(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o.result, ServerResult::Failed(_)))
    }

    /// Total files sent across all servers.
    pub fn files_sent(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| match o.result {
                ServerResult::Transferred { files, .. } => files,
                ServerResult::Failed(SyncError::PartialTransfer { sent, .. }) => sent,
                _ => 0,
            })
            .sum()
    }

    /// Outcome for a server.
    pub fn outcome(&self, id: &ServiceId) -> Option<&ServerOutcome> {
        self.outcomes.iter().find(|o| &o.server_id == id)
    }

    /// Human-readable summary, one line per server after a totals line.
    pub fn summary(&self) -> String {
        let mut synced = 0;
        let mut skipped = 0;
        let mut failed = 0;
        for outcome in &self.outcomes {
            match outcome.result {
                ServerResult::Transferred { .. } => synced += 1,
                ServerResult::Skipped(_) => skipped += 1,
                ServerResult::Failed(_) => failed += 1,
            }
        }

        let mut out = format!(
            "{} servers: {} synced, {} skipped, {} failed ({} files sent)",
            self.outcomes.len(),
            synced,
            skipped,
            failed,
            self.files_sent()
        );
        for outcome in &self.outcomes {
            let line = match &outcome.result {
                ServerResult::Transferred { files: 0, .. } => "up to date".to_string(),
                ServerResult::Transferred { files, bytes } => {
                    format!("sent {files} files ({bytes} bytes)")
                }
                ServerResult::Skipped(reason) => format!("skipped: {reason}"),
                ServerResult::Failed(e) => format!("failed: {e}"),
            };
            out.push_str(&format!("\n  {}: {}", outcome.server_name, line));
        }
        out
    }
}

/// Pushes pending files to every paired server.
pub struct SyncDispatcher<T: Transport> {
    transport: T,
    scheme: Arc<dyn CredentialScheme>,
    strategy: Arc<dyn TransferStrategy>,
    client_name: String,
    io_timeout: Duration,
    discovery: Option<ServiceRegistry>,
}

impl<T: Transport> SyncDispatcher<T> {
    /// Create a dispatcher with the default [`ChunkedTransfer`] strategy.
    pub fn new(transport: T, scheme: Arc<dyn CredentialScheme>, client_name: &str) -> Self {
        Self {
            transport,
            scheme,
            strategy: Arc::new(ChunkedTransfer::default()),
            client_name: client_name.to_string(),
            io_timeout: DEFAULT_IO_TIMEOUT,
            discovery: None,
        }
    }

    /// Use another transfer strategy.
    pub fn with_strategy(mut self, strategy: Arc<dyn TransferStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Bound every network exchange by `timeout`.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Prefer addresses from live discovery over the stored ones.
    pub fn with_discovery(mut self, discovery: ServiceRegistry) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Get the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run one pass over every paired server.
    ///
    /// Never fails as a whole: per-server errors are collected in the
    /// returned report.
    pub async fn process_sending_files(&self, registry: &DeviceRegistry) -> SyncReport {
        let servers = registry.paired_servers().await;
        let mut report = SyncReport::default();

        for server in servers {
            let result = self.sync_server(registry, &server).await;
            match &result {
                ServerResult::Transferred { files, .. } => {
                    tracing::info!("Server {}: {} files sent", server.name, files)
                }
                ServerResult::Skipped(reason) => {
                    tracing::debug!("Server {} skipped: {}", server.name, reason)
                }
                ServerResult::Failed(e) => tracing::warn!("Server {} failed: {}", server.name, e),
            }
            report.outcomes.push(ServerOutcome {
                server_id: server.id,
                server_name: server.name.clone(),
                result,
            });
        }

        report
    }

    async fn sync_server(&self, registry: &DeviceRegistry, server: &PairedServer) -> ServerResult {
        let Some(directory) = server.sync_directory.clone() else {
            return ServerResult::Skipped("no sync directory".into());
        };

        let scan = match scan_directory(directory, server.transferred.clone()).await {
            Ok(scan) => scan,
            Err(e) => return ServerResult::Failed(e),
        };
        let mut dirty = false;
        if !scan.unchanged.is_empty() {
            dirty |= self
                .record(registry, server, scan.unchanged)
                .await
                .is_ok();
        }

        if scan.pending.is_empty() {
            return self
                .finish(registry, dirty, ServerResult::Transferred { files: 0, bytes: 0 })
                .await;
        }

        let (address, moved) = self.current_address(registry, server).await;
        dirty |= moved;
        let session = self.send_files(registry, server, address, &scan.pending).await;
        dirty |= session.sent > 0;

        let result = match session.error {
            None => ServerResult::Transferred {
                files: session.sent,
                bytes: session.bytes,
            },
            Some(e) if session.sent == 0 => ServerResult::Failed(e),
            Some(e) => ServerResult::Failed(SyncError::PartialTransfer {
                sent: session.sent,
                total: scan.pending.len(),
                reason: e.to_string(),
            }),
        };
        self.finish(registry, dirty, result).await
    }

    async fn finish(&self, registry: &DeviceRegistry, dirty: bool, result: ServerResult) -> ServerResult {
        if !dirty {
            return result;
        }
        match registry.save().await {
            Ok(()) => result,
            Err(e) => {
                let reason = format!("acknowledged files could not be saved: {e}");
                match result {
                    ServerResult::Failed(previous) => {
                        ServerResult::Failed(SyncError::Io(format!("{previous}; {reason}")))
                    }
                    _ => ServerResult::Failed(SyncError::Io(reason)),
                }
            }
        }
    }

    async fn record(
        &self,
        registry: &DeviceRegistry,
        server: &PairedServer,
        files: Vec<(String, FileFingerprint)>,
    ) -> Result<(), SyncError> {
        registry
            .record_transfers(&server.id, files)
            .await
            .map_err(|e| {
                tracing::warn!("Could not record transfers for {}: {}", server.name, e);
                SyncError::Io(e.to_string())
            })
    }

    /// Address to connect to, and whether the registry entry was updated.
    async fn current_address(
        &self,
        registry: &DeviceRegistry,
        server: &PairedServer,
    ) -> (SocketAddr, bool) {
        let stored = server.socket_addr();
        let Some(discovered) = self.discovery.as_ref().and_then(|d| d.find(&server.id)) else {
            return (stored, false);
        };
        if !discovered.online || discovered.record.socket_addr() == stored {
            return (stored, false);
        }

        let fresh = discovered.record.socket_addr();
        tracing::info!("Server {} moved from {} to {}", server.name, stored, fresh);
        match registry
            .update_address(&server.id, fresh.ip(), fresh.port())
            .await
        {
            Ok(updated) => (fresh, updated),
            Err(e) => {
                tracing::warn!("Could not store new address for {}: {}", server.name, e);
                (fresh, false)
            }
        }
    }

    async fn send_files(
        &self,
        registry: &DeviceRegistry,
        server: &PairedServer,
        address: SocketAddr,
        pending: &[OutgoingFile],
    ) -> SessionOutcome {
        let mut outcome = SessionOutcome::default();

        let connect = tokio::time::timeout(
            self.io_timeout,
            self.transport.connect(&address.to_string()),
        )
        .await
        .map_err(|_| TransportError::Timeout)
        .and_then(|r| r);
        if let Err(e) = connect {
            outcome.error = Some(SyncError::Unreachable(format!("{address}: {e}")));
            return outcome;
        }

        let connection = match self.authenticate(server).await {
            Ok(connection) => connection,
            Err(e) => {
                self.transport.close().await.ok();
                outcome.error = Some(e);
                return outcome;
            }
        };
        tracing::debug!("Authenticated with {} at {}", server.name, address);

        for file in pending {
            match self.strategy.transfer(file, &connection).await {
                Ok(bytes) => {
                    let recorded = self
                        .record(
                            registry,
                            server,
                            vec![(file.relative_path.clone(), file.fingerprint)],
                        )
                        .await;
                    if let Err(e) = recorded {
                        outcome.error = Some(e);
                        break;
                    }
                    outcome.sent += 1;
                    outcome.bytes += bytes;
                }
                Err(e) => {
                    outcome.error = Some(e);
                    break;
                }
            }
        }

        if outcome.error.is_none() {
            connection
                .send(&Message::Bye(Bye { reason: None }))
                .await
                .ok();
        }
        self.transport.close().await.ok();
        outcome
    }

    async fn authenticate(
        &self,
        server: &PairedServer,
    ) -> Result<AuthenticatedConnection<'_>, SyncError> {
        let key_id = self
            .scheme
            .key_id(&server.credential)
            .map_err(|e| SyncError::AuthRejected(format!("stored credential unusable: {e}")))?;

        self.send(&Message::AuthHello(AuthHello {
                version: PROTOCOL_VERSION,
                key_id,
                client_name: self.client_name.clone(),
            }))
            .await?;

        let challenge = match self.recv().await? {
            Message::AuthChallenge(challenge) => challenge.challenge,
            Message::AuthResult(result) if !result.accepted => {
                return Err(SyncError::AuthRejected(
                    result.reason.unwrap_or_else(|| "unknown client".into()),
                ))
            }
            other => {
                return Err(SyncError::Io(format!(
                    "expected AuthChallenge, got {}",
                    other.kind()
                )))
            }
        };

        let (proof, session_key) = self
            .scheme
            .authenticate(&server.credential, &challenge)
            .map_err(|e| SyncError::AuthRejected(format!("stored credential unusable: {e}")))?;
        self.send(&Message::AuthProof(AuthProof { proof })).await?;

        match self.recv().await? {
            Message::AuthResult(result) if result.accepted => Ok(AuthenticatedConnection::new(
                &self.transport,
                session_key,
                self.io_timeout,
            )),
            Message::AuthResult(result) => Err(SyncError::AuthRejected(
                result.reason.unwrap_or_else(|| "proof refused".into()),
            )),
            other => Err(SyncError::Io(format!(
                "expected AuthResult, got {}",
                other.kind()
            ))),
        }
    }
}

impl<T: Transport> SyncDispatcher<T> {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        tokio::time::timeout(self.io_timeout, send_message(&self.transport, message))
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn recv(&self) -> Result<Message, TransportError> {
        tokio::time::timeout(self.io_timeout, recv_message(&self.transport))
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}

impl<T: Transport + fmt::Debug> fmt::Debug for SyncDispatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncDispatcher")
            .field("transport", &self.transport)
            .field("client_name", &self.client_name)
            .field("io_timeout", &self.io_timeout)
            .field("discovery", &self.discovery.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct SessionOutcome {
    sent: usize,
    bytes: u64,
    error: Option<SyncError>,
}

/// Result of comparing a sync directory with a server's watermark.
#[derive(Debug, Default)]
struct DirectoryScan {
    /// Files the server does not hold.
    pending: Vec<OutgoingFile>,
    /// Files whose metadata changed but whose content the server holds.
    unchanged: Vec<(String, FileFingerprint)>,
}

async fn scan_directory(
    root: PathBuf,
    watermark: TransferWatermark,
) -> Result<DirectoryScan, SyncError> {
    let display = root.display().to_string();
    tokio::task::spawn_blocking(move || collect_pending(&root, &watermark))
        .await
        .map_err(|e| SyncError::Io(format!("scan task failed: {e}")))?
        .map_err(|e| SyncError::Io(format!("{display}: {e}")))
}

fn collect_pending(root: &Path, watermark: &TransferWatermark) -> io::Result<DirectoryScan> {
    let mut scan = DirectoryScan::default();
    let mut directories = vec![root.to_path_buf()];

    while let Some(directory) = directories.pop() {
        // Only an unreadable root fails the scan; anything below is skipped
        let mut entries = match read_entries(&directory) {
            Ok(entries) => entries,
            Err(e) if directory == root => return Err(e),
            Err(e) => {
                tracing::warn!("Skipping directory {}: {}", directory.display(), e);
                continue;
            }
        };
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            match scan_entry(root, &entry, watermark) {
                Ok(Scanned::Directory) => directories.push(path),
                Ok(Scanned::Pending(file)) => scan.pending.push(file),
                Ok(Scanned::Unchanged(relative_path, fingerprint)) => {
                    scan.unchanged.push((relative_path, fingerprint))
                }
                Ok(Scanned::Ignored) => {}
                Err(e) => tracing::warn!("Skipping {}: {}", path.display(), e),
            }
        }
    }

    scan.pending
        .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(scan)
}

fn read_entries(directory: &Path) -> io::Result<Vec<std::fs::DirEntry>> {
    std::fs::read_dir(directory)?.collect()
}

enum Scanned {
    Directory,
    Pending(OutgoingFile),
    Unchanged(String, FileFingerprint),
    Ignored,
}

fn scan_entry(
    root: &Path,
    entry: &std::fs::DirEntry,
    watermark: &TransferWatermark,
) -> io::Result<Scanned> {
    let path = entry.path();
    if entry.file_type()?.is_dir() {
        return Ok(Scanned::Directory);
    }

    let metadata = std::fs::metadata(&path)?;
    if !metadata.is_file() {
        return Ok(Scanned::Ignored);
    }
    let Some(relative_path) = relative_path(root, &path) else {
        tracing::warn!("Skipping {}: name is not valid UTF-8", path.display());
        return Ok(Scanned::Ignored);
    };

    let stamp = FileStamp {
        size: metadata.len(),
        modified: metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0),
    };
    if watermark.is_current(&relative_path, &stamp) {
        return Ok(Scanned::Ignored);
    }

    let fingerprint = FileFingerprint {
        stamp,
        content_hash: hash_file(&path)?,
    };
    if watermark.has_content(&relative_path, &fingerprint.content_hash) {
        return Ok(Scanned::Unchanged(relative_path, fingerprint));
    }

    Ok(Scanned::Pending(OutgoingFile {
        relative_path,
        absolute_path: path,
        fingerprint,
    }))
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

fn hash_file(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(*hasher.finalize().as_bytes())
}
