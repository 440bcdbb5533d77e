//! Background discovery of backup servers.
//!
//! [`DiscoveryService`] runs a scan loop on a tokio task. Every cycle it asks
//! an [`AnnouncementSource`] what was heard and folds the answer into a
//! [`ServiceTable`] shared through a [`ServiceRegistry`] handle. Readers take
//! snapshots without waiting for the loop.
//!
//! The network side of discovery (mDNS, OS service discovery) stays outside
//! this crate; hosts feed it through [`ChannelAnnouncements`].

use async_trait::async_trait;
use lanbackup_core::{CycleChanges, DiscoveredService, ServiceTable};
use lanbackup_types::{ServiceId, ServiceRecord};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Discovery errors.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The source could not scan this cycle. The loop retries next cycle.
    #[error("announcement source unavailable: {0}")]
    SourceUnavailable(String),

    /// The source will never produce announcements again.
    #[error("announcement source closed")]
    Closed,
}

/// Where a discovery cycle gets its announcements from.
#[async_trait]
pub trait AnnouncementSource: Send + Sync {
    /// Collect the records heard during one cycle of length `window`.
    ///
    /// Implementations may return early; the loop waits out the rest of the
    /// cycle itself.
    async fn scan(&self, window: Duration) -> Result<Vec<ServiceRecord>, DiscoveryError>;
}

/// Announcements pushed by the host, for example from OS discovery callbacks.
#[derive(Debug)]
pub struct ChannelAnnouncements {
    receiver: tokio::sync::Mutex<mpsc::Receiver<ServiceRecord>>,
}

impl ChannelAnnouncements {
    /// Create a source and the sender the host pushes announcements into.
    pub fn new(capacity: usize) -> (mpsc::Sender<ServiceRecord>, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let source = Self {
            receiver: tokio::sync::Mutex::new(receiver),
        };
        (sender, source)
    }
}

#[async_trait]
impl AnnouncementSource for ChannelAnnouncements {
    async fn scan(&self, window: Duration) -> Result<Vec<ServiceRecord>, DiscoveryError> {
        let mut receiver = self.receiver.lock().await;
        let deadline = Instant::now() + window;
        let mut heard = Vec::new();

        loop {
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Ok(Some(record)) => heard.push(record),
                Ok(None) if heard.is_empty() => return Err(DiscoveryError::Closed),
                Ok(None) | Err(_) => break,
            }
        }
        Ok(heard)
    }
}

/// A fixed set of servers, announced every cycle.
#[derive(Debug, Clone, Default)]
pub struct StaticAnnouncements {
    records: Vec<ServiceRecord>,
}

impl StaticAnnouncements {
    /// Announce `records` on every cycle.
    pub fn new(records: Vec<ServiceRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl AnnouncementSource for StaticAnnouncements {
    async fn scan(&self, _window: Duration) -> Result<Vec<ServiceRecord>, DiscoveryError> {
        Ok(self.records.clone())
    }
}

/// Shared, read-mostly view of discovered servers.
///
/// Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    table: Arc<RwLock<ServiceTable>>,
}

impl ServiceRegistry {
    fn with_table(table: ServiceTable) -> Self {
        Self {
            table: Arc::new(RwLock::new(table)),
        }
    }

    /// Copy of every known entry, in first-heard order.
    pub fn snapshot(&self) -> Vec<DiscoveredService> {
        self.read().entries().to_vec()
    }

    /// Latest entry for a service id.
    pub fn find(&self, id: &ServiceId) -> Option<DiscoveredService> {
        self.read().get(id).cloned()
    }

    /// Number of known entries, online or not.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// True when nothing has been discovered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ServiceTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ServiceTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}

struct RunningLoop {
    period: Duration,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Periodic discovery of backup servers.
///
/// # Example
///
/// ```ignore
/// let (announce, source) = ChannelAnnouncements::new(64);
/// let discovery = DiscoveryService::new(Arc::new(source));
/// discovery.start(Duration::from_secs(5));
/// // host pushes records into `announce`
/// let servers = discovery.snapshot();
/// discovery.stop(true).await;
/// ```
pub struct DiscoveryService {
    source: Arc<dyn AnnouncementSource>,
    registry: ServiceRegistry,
    running: Mutex<Option<RunningLoop>>,
}

impl DiscoveryService {
    /// Create a stopped service reading from `source`.
    pub fn new(source: Arc<dyn AnnouncementSource>) -> Self {
        Self::with_offline_threshold(source, lanbackup_core::DEFAULT_MISSED_CYCLES_BEFORE_OFFLINE)
    }

    /// Create a stopped service that marks servers offline after
    /// `missed_cycles` cycles without an announcement.
    pub fn with_offline_threshold(source: Arc<dyn AnnouncementSource>, missed_cycles: u32) -> Self {
        Self {
            source,
            registry: ServiceRegistry::with_table(ServiceTable::with_offline_threshold(
                missed_cycles,
            )),
            running: Mutex::new(None),
        }
    }

    /// Handle to the discovered servers, for readers such as the dispatcher.
    pub fn registry(&self) -> ServiceRegistry {
        self.registry.clone()
    }

    /// Start scanning every `period`.
    ///
    /// Does nothing if already running with the same period. A different
    /// period restarts the loop and keeps the entries found so far.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, period: Duration) {
        let mut running = self.lock_running();

        if let Some(current) = running.as_ref() {
            if current.period == period && !current.handle.is_finished() {
                return;
            }
        }
        if let Some(previous) = running.take() {
            tracing::debug!(
                "Restarting discovery: {:?} -> {:?}",
                previous.period,
                period
            );
            previous.shutdown.send(true).ok();
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.source),
            self.registry.clone(),
            period,
            shutdown_rx,
        ));
        tracing::info!("Discovery started, period {:?}", period);

        *running = Some(RunningLoop {
            period,
            shutdown,
            handle,
        });
    }

    /// Stop scanning and forget every discovered server.
    ///
    /// With `wait_for_completion` the call returns only after the loop task
    /// has exited.
    pub async fn stop(&self, wait_for_completion: bool) {
        let stopped = self.lock_running().take();

        if let Some(stopped) = &stopped {
            stopped.shutdown.send(true).ok();
        }
        // The loop re-checks its flag under the write lock, so nothing is
        // merged after this clear.
        self.registry.write().clear();

        if let Some(stopped) = stopped {
            if wait_for_completion {
                if let Err(e) = stopped.handle.await {
                    tracing::warn!("Discovery task ended abnormally: {}", e);
                }
            }
            tracing::info!("Discovery stopped");
        }
    }

    /// Copy of the current discovery results.
    pub fn snapshot(&self) -> Vec<DiscoveredService> {
        self.registry.snapshot()
    }

    /// Whether a scan loop is active.
    pub fn is_running(&self) -> bool {
        self.lock_running()
            .as_ref()
            .map(|l| !l.handle.is_finished())
            .unwrap_or(false)
    }

    /// Period of the active loop, if any.
    pub fn period(&self) -> Option<Duration> {
        self.lock_running().as_ref().map(|l| l.period)
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<RunningLoop>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for DiscoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryService")
            .field("period", &self.period())
            .field("known", &self.registry.len())
            .finish()
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        if let Some(running) = self.lock_running().take() {
            running.shutdown.send(true).ok();
        }
    }
}

async fn run_loop(
    source: Arc<dyn AnnouncementSource>,
    registry: ServiceRegistry,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let cycle_start = Instant::now();

        let scanned = tokio::select! {
            _ = shutdown.changed() => break,
            result = source.scan(period) => result,
        };

        match scanned {
            Ok(records) => {
                let mut table = registry.write();
                if *shutdown.borrow() {
                    break;
                }
                let changes = table.merge_cycle(&records, SystemTime::now());
                drop(table);
                log_changes(&changes);
            }
            Err(DiscoveryError::Closed) => {
                tracing::warn!("Announcement source closed, discovery loop exiting");
                let mut table = registry.write();
                if !*shutdown.borrow() {
                    for id in table.mark_all_offline() {
                        tracing::info!("Server {} went offline", id);
                    }
                }
                break;
            }
            Err(e) => tracing::warn!("Discovery cycle failed: {}", e),
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep_until(cycle_start + period) => {}
        }
    }
    tracing::debug!("Discovery loop exited");
}

fn log_changes(changes: &CycleChanges) {
    for id in &changes.appeared {
        tracing::info!("Server {} is online", id);
    }
    for id in &changes.moved {
        tracing::info!("Server {} moved to a new address", id);
    }
    for id in &changes.went_offline {
        tracing::info!("Server {} went offline", id);
    }
}
