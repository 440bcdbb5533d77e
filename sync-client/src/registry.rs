//! Durable registry of paired servers.
//!
//! [`DeviceRegistry`] owns the working copy of every [`PairedServer`] and the
//! file it is persisted to. Mutations only touch memory; [`DeviceRegistry::save`]
//! makes them durable by replacing the file atomically (write a temporary
//! sibling, `fsync`, rename), so a crash leaves either the old or the new
//! file and never a torn one.
//!
//! # File layout
//!
//! ```text
//! magic "LBRG" (4) | format version u16 BE (2) | BLAKE3 of body (32) | body
//! ```
//!
//! The body is MessagePack. A file that fails any check is reported as
//! [`StorageError::Corrupt`]; after that the registry refuses every mutation
//! until [`DeviceRegistry::reset`] is called, so a damaged file is never
//! silently overwritten.

use lanbackup_core::{FileFingerprint, TransferWatermark};
use lanbackup_types::{ServiceId, ServiceRecord};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::crypto::Credential;

/// First bytes of every registry file.
pub const REGISTRY_MAGIC: &[u8; 4] = b"LBRG";

/// Current registry file format version.
pub const REGISTRY_FORMAT_VERSION: u16 = 1;

const HEADER_LEN: usize = 4 + 2 + 32;

/// Registry errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No paired server has this id.
    #[error("no paired server with id {0}")]
    NotFound(ServiceId),

    /// The registry file could not be decoded, or an earlier load found it
    /// corrupt and the registry has not been reset since.
    #[error("registry file is corrupt: {0}")]
    Corrupt(String),

    /// Reading or writing the registry file failed.
    #[error("registry I/O failed: {0}")]
    IoFailure(#[from] io::Error),
}

/// A server this device trusts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedServer {
    /// Server id, unique within the registry.
    pub id: ServiceId,
    /// Name the server announced when it was paired.
    pub name: String,
    /// Last known address.
    pub address: IpAddr,
    /// Last known port.
    pub port: u16,
    /// Local directory whose files are pushed to this server.
    pub sync_directory: Option<PathBuf>,
    /// Long-term credential derived during pairing.
    pub credential: Credential,
    /// When pairing was confirmed, seconds since the Unix epoch.
    pub paired_at: u64,
    /// Files the server already acknowledged.
    #[serde(default)]
    pub transferred: TransferWatermark,
}

impl PairedServer {
    /// Create an entry for a freshly confirmed server.
    pub fn new(record: &ServiceRecord, credential: Credential) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            address: record.address,
            port: record.port,
            sync_directory: None,
            credential,
            paired_at: unix_now(),
            transferred: TransferWatermark::new(),
        }
    }

    /// Socket address to connect to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

#[derive(Serialize)]
struct RegistryBody<'a> {
    servers: &'a [PairedServer],
}

#[derive(Deserialize)]
struct RegistryFile {
    servers: Vec<PairedServer>,
}

#[derive(Debug, Default)]
struct RegistryState {
    servers: Vec<PairedServer>,
    /// Set when the last load found a corrupt file.
    corruption: Option<String>,
}

impl RegistryState {
    fn ensure_writable(&self) -> Result<(), StorageError> {
        match &self.corruption {
            Some(reason) => Err(StorageError::Corrupt(reason.clone())),
            None => Ok(()),
        }
    }

    fn position(&self, id: &ServiceId) -> Option<usize> {
        self.servers.iter().position(|s| &s.id == id)
    }
}

/// Ordered, id-unique collection of paired servers backed by one file.
#[derive(Debug)]
pub struct DeviceRegistry {
    path: PathBuf,
    state: Mutex<RegistryState>,
}

impl DeviceRegistry {
    /// Run `work` while the registry is locked.
    #[cfg(test)]
    pub(crate) async fn locked_during<F: std::future::Future>(&self, work: F) -> F::Output {
        let _state = self.state.lock().await;
        work.await
    }

    /// Create an empty registry bound to `path` without reading it.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Open the registry stored at `path`.
    ///
    /// A missing file yields an empty registry. A corrupt file is an error.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let registry = Self::new(path);
        registry.load().await?;
        Ok(registry)
    }

    /// File this registry is persisted to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the working copy with the file contents.
    ///
    /// Returns the number of servers loaded. On [`StorageError::Corrupt`] the
    /// working copy is emptied and mutations are refused until [`reset`](Self::reset).
    pub async fn load(&self) -> Result<usize, StorageError> {
        let mut state = self.state.lock().await;

        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No registry at {}, starting empty", self.path.display());
                state.servers.clear();
                state.corruption = None;
                return Ok(0);
            }
            Err(e) => return Err(StorageError::IoFailure(e)),
        };

        match decode(&bytes) {
            Ok(servers) => {
                tracing::info!(
                    "Loaded {} paired servers from {}",
                    servers.len(),
                    self.path.display()
                );
                state.servers = servers;
                state.corruption = None;
                Ok(state.servers.len())
            }
            Err(reason) => {
                tracing::error!("Registry {} is corrupt: {}", self.path.display(), reason);
                state.servers.clear();
                state.corruption = Some(reason.clone());
                Err(StorageError::Corrupt(reason))
            }
        }
    }

    /// Persist the working copy, replacing the file atomically.
    ///
    /// The registry lock is held for the whole write, so the file always
    /// reflects one consistent snapshot. If writing fails the previous file
    /// is left untouched.
    pub async fn save(&self) -> Result<(), StorageError> {
        let state = self.state.lock().await;
        state.ensure_writable()?;

        let bytes = encode(&state.servers)?;
        let tmp = temporary_path(&self.path);

        let result = write_then_rename(&tmp, &self.path, &bytes).await;
        if result.is_err() {
            tokio::fs::remove_file(&tmp).await.ok();
        } else {
            tracing::debug!(
                "Saved {} paired servers to {}",
                state.servers.len(),
                self.path.display()
            );
        }
        result.map_err(StorageError::IoFailure)
    }

    /// Drop everything, including a pending corruption, and start empty.
    ///
    /// The file on disk is only replaced by the next [`save`](Self::save).
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        if state.corruption.take().is_some() {
            tracing::warn!("Registry {} reset after corruption", self.path.display());
        }
        state.servers.clear();
    }

    /// Whether mutations are refused because the last load found corruption.
    pub async fn is_blocked(&self) -> bool {
        self.state.lock().await.corruption.is_some()
    }

    /// Snapshot of every paired server, in pairing order.
    pub async fn paired_servers(&self) -> Vec<PairedServer> {
        self.state.lock().await.servers.clone()
    }

    /// Snapshot of one paired server.
    pub async fn get(&self, id: &ServiceId) -> Option<PairedServer> {
        let state = self.state.lock().await;
        state.position(id).map(|i| state.servers[i].clone())
    }

    /// Whether a server with this id is paired.
    pub async fn is_paired(&self, id: &ServiceId) -> bool {
        self.state.lock().await.position(id).is_some()
    }

    /// Add a server, replacing an existing entry with the same id in place.
    pub async fn insert(&self, server: PairedServer) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.ensure_writable()?;

        match state.position(&server.id) {
            Some(i) => {
                tracing::info!("Re-paired server {} ({})", server.name, server.id);
                state.servers[i] = server;
            }
            None => {
                tracing::info!("Paired server {} ({})", server.name, server.id);
                state.servers.push(server);
            }
        }
        Ok(())
    }

    /// Set or clear the directory synced to a server.
    ///
    /// Pointing a server at a different directory forgets what was
    /// transferred from the old one.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if no server has this id.
    pub async fn set_sync_directory(
        &self,
        id: &ServiceId,
        directory: Option<PathBuf>,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.ensure_writable()?;

        let i = state.position(id).ok_or(StorageError::NotFound(*id))?;
        let server = &mut state.servers[i];
        if server.sync_directory != directory {
            server.transferred.clear();
            server.sync_directory = directory;
        }
        Ok(())
    }

    /// Remove a server. Removing an unknown id is a no-op.
    ///
    /// Returns whether an entry was removed.
    pub async fn remove(&self, id: &ServiceId) -> Result<bool, StorageError> {
        let mut state = self.state.lock().await;
        state.ensure_writable()?;

        match state.position(id) {
            Some(i) => {
                let removed = state.servers.remove(i);
                tracing::info!("Removed server {} ({})", removed.name, removed.id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remember a new address for a server. Returns whether anything changed.
    pub async fn update_address(
        &self,
        id: &ServiceId,
        address: IpAddr,
        port: u16,
    ) -> Result<bool, StorageError> {
        let mut state = self.state.lock().await;
        state.ensure_writable()?;

        let i = state.position(id).ok_or(StorageError::NotFound(*id))?;
        let server = &mut state.servers[i];
        if server.address == address && server.port == port {
            return Ok(false);
        }
        server.address = address;
        server.port = port;
        Ok(true)
    }

    /// Record files a server acknowledged.
    pub async fn record_transfers(
        &self,
        id: &ServiceId,
        files: Vec<(String, FileFingerprint)>,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.ensure_writable()?;

        let i = state.position(id).ok_or(StorageError::NotFound(*id))?;
        let server = &mut state.servers[i];
        for (path, fingerprint) in files {
            server.transferred.record(path, fingerprint);
        }
        Ok(())
    }
}

fn encode(servers: &[PairedServer]) -> Result<Vec<u8>, StorageError> {
    let body = rmp_serde::to_vec(&RegistryBody { servers })
        .map_err(|e| StorageError::IoFailure(io::Error::other(e.to_string())))?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.extend_from_slice(REGISTRY_MAGIC);
    bytes.extend_from_slice(&REGISTRY_FORMAT_VERSION.to_be_bytes());
    bytes.extend_from_slice(blake3::hash(&body).as_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

fn decode(bytes: &[u8]) -> Result<Vec<PairedServer>, String> {
    if bytes.len() < HEADER_LEN {
        return Err(format!("truncated header ({} bytes)", bytes.len()));
    }
    if &bytes[..4] != REGISTRY_MAGIC {
        return Err("bad magic".to_string());
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != REGISTRY_FORMAT_VERSION {
        return Err(format!("unsupported format version {version}"));
    }

    let body = &bytes[HEADER_LEN..];
    if blake3::hash(body).as_bytes() != &bytes[6..HEADER_LEN] {
        return Err("checksum mismatch".to_string());
    }

    let file: RegistryFile = rmp_serde::from_slice(body).map_err(|e| e.to_string())?;

    for (i, server) in file.servers.iter().enumerate() {
        if file.servers[..i].iter().any(|s| s.id == server.id) {
            return Err(format!("duplicate server id {}", server.id));
        }
    }
    Ok(file.servers)
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "registry".into());
    name.push(".tmp");
    path.with_file_name(name)
}

async fn write_then_rename(tmp: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = tokio::fs::File::create(tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(tmp, path).await?;
    sync_parent(path).await
}

#[cfg(unix)]
async fn sync_parent(path: &Path) -> io::Result<()> {
    // The rename is durable only once the directory entry is on disk
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => tokio::fs::File::open(parent).await?.sync_all().await,
        None => tokio::fs::File::open(".").await?.sync_all().await,
    }
}

#[cfg(not(unix))]
async fn sync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
