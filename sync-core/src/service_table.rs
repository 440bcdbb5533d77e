//! Merge logic for discovered backup servers.
//!
//! The discovery loop hears announcements in cycles. Each cycle is folded
//! into a [`ServiceTable`]:
//! - entries are keyed by [`ServiceId`], never by address,
//! - an entry heard again gets its address, name and `last_seen` refreshed,
//! - an entry missing from enough consecutive cycles is marked offline but
//!   kept, so a server that comes back keeps its position.
//!
//! Time is passed in by the caller, which keeps the table deterministic.

use lanbackup_types::{ServiceId, ServiceRecord};
use std::time::SystemTime;

/// Missed cycles after which an entry is marked offline.
pub const DEFAULT_MISSED_CYCLES_BEFORE_OFFLINE: u32 = 1;

/// A server as currently known to discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    /// Latest announcement for this id.
    pub record: ServiceRecord,
    /// When the server was last heard.
    pub last_seen: SystemTime,
    /// Whether the server was heard recently enough to be considered reachable.
    pub online: bool,
    /// Consecutive cycles without an announcement.
    pub missed_cycles: u32,
}

/// What a merged cycle changed, for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleChanges {
    /// Ids that are new or came back online.
    pub appeared: Vec<ServiceId>,
    /// Ids whose address or port changed.
    pub moved: Vec<ServiceId>,
    /// Ids that went offline in this cycle.
    pub went_offline: Vec<ServiceId>,
}

impl CycleChanges {
    /// True when the cycle changed nothing visible.
    pub fn is_empty(&self) -> bool {
        self.appeared.is_empty() && self.moved.is_empty() && self.went_offline.is_empty()
    }
}

/// Deduplicated view of every server heard since discovery started.
#[derive(Debug, Clone)]
pub struct ServiceTable {
    entries: Vec<DiscoveredService>,
    missed_cycles_before_offline: u32,
}

impl ServiceTable {
    /// Create an empty table with the default offline threshold.
    pub fn new() -> Self {
        Self::with_offline_threshold(DEFAULT_MISSED_CYCLES_BEFORE_OFFLINE)
    }

    /// Create an empty table that marks entries offline after `missed_cycles`
    /// consecutive cycles without an announcement (at least 1).
    pub fn with_offline_threshold(missed_cycles: u32) -> Self {
        Self {
            entries: Vec::new(),
            missed_cycles_before_offline: missed_cycles.max(1),
        }
    }

    /// Fold one discovery cycle into the table.
    ///
    /// `announced` may contain the same id several times; the last record
    /// for an id wins.
    pub fn merge_cycle(&mut self, announced: &[ServiceRecord], now: SystemTime) -> CycleChanges {
        let mut changes = CycleChanges::default();
        let mut heard: Vec<ServiceId> = Vec::with_capacity(announced.len());

        for record in announced {
            if !heard.contains(&record.id) {
                heard.push(record.id);
            }

            match self.entries.iter_mut().find(|e| e.record.id == record.id) {
                Some(entry) => {
                    let moved = entry.record.socket_addr() != record.socket_addr();
                    if moved && !changes.moved.contains(&record.id) {
                        changes.moved.push(record.id);
                    }
                    if !entry.online && !changes.appeared.contains(&record.id) {
                        changes.appeared.push(record.id);
                    }
                    entry.record = record.clone();
                    entry.last_seen = now;
                    entry.online = true;
                    entry.missed_cycles = 0;
                }
                None => {
                    changes.appeared.push(record.id);
                    self.entries.push(DiscoveredService {
                        record: record.clone(),
                        last_seen: now,
                        online: true,
                        missed_cycles: 0,
                    });
                }
            }
        }

        for entry in self.entries.iter_mut() {
            if heard.contains(&entry.record.id) {
                continue;
            }
            entry.missed_cycles = entry.missed_cycles.saturating_add(1);
            if entry.online && entry.missed_cycles >= self.missed_cycles_before_offline {
                entry.online = false;
                changes.went_offline.push(entry.record.id);
            }
        }

        changes
    }

    /// Look up an entry by id.
    pub fn get(&self, id: &ServiceId) -> Option<&DiscoveredService> {
        self.entries.iter().find(|e| &e.record.id == id)
    }

    /// All entries in first-heard order.
    pub fn entries(&self) -> &[DiscoveredService] {
        &self.entries
    }

    /// Entries currently marked online.
    pub fn online(&self) -> impl Iterator<Item = &DiscoveredService> {
        self.entries.iter().filter(|e| e.online)
    }

    /// Number of entries, online or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mark every entry offline, keeping them. Returns the ids that were online.
    pub fn mark_all_offline(&mut self) -> Vec<ServiceId> {
        let mut went_offline = Vec::new();
        for entry in self.entries.iter_mut().filter(|e| e.online) {
            entry.online = false;
            went_offline.push(entry.record.id);
        }
        went_offline
    }

    /// Forget every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for ServiceTable {
    fn default() -> Self {
        Self::new()
    }
}
