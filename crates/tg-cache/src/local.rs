//! Bounded in-process tier with least-recently-used eviction.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;

use tg_types::group::TradeGroupId;
use tg_types::snapshot::RiskSnapshot;

/// Cached snapshot with coherence metadata
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub snapshot: Arc<RiskSnapshot>,
    pub source_version: u64,
    /// `None` once pinned.
    pub expires_at: Option<Instant>,
    pub invalidated: bool,
    /// Last time the entry was confirmed against the shared tier.
    pub validated_at: Instant,
    last_accessed: Instant,
}

impl LocalEntry {
    pub fn new(snapshot: Arc<RiskSnapshot>, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            source_version: snapshot.as_of_version,
            snapshot,
            expires_at: ttl.map(|ttl| now + ttl),
            invalidated: false,
            validated_at: now,
            last_accessed: now,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    pub fn is_pinned(&self) -> bool {
        self.expires_at.is_none()
    }

    fn access(&mut self) {
        self.last_accessed = Instant::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalWrite {
    Stored { evicted: usize },
    IgnoredOlder,
}

#[derive(Debug)]
pub struct LocalTier {
    entries: DashMap<TradeGroupId, RwLock<LocalEntry>>,
    max_entries: usize,
}

impl LocalTier {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Look up and touch an entry. Expired entries are dropped.
    pub fn get(&self, group_id: TradeGroupId) -> Option<LocalEntry> {
        let now = Instant::now();
        {
            let slot = self.entries.get(&group_id)?;
            let mut entry = slot.write();
            if !entry.is_expired(now) {
                entry.access();
                return Some(entry.clone());
            }
        }
        self.entries
            .remove_if(&group_id, |_, entry| entry.read().is_expired(now));
        None
    }

    /// Store `entry` unless a strictly newer source version is held.
    pub fn put(&self, entry: LocalEntry) -> LocalWrite {
        let group_id = entry.snapshot.trade_group_id;

        if let Some(slot) = self.entries.get(&group_id) {
            let mut held = slot.write();
            if held.source_version > entry.source_version {
                return LocalWrite::IgnoredOlder;
            }
            let pinned = held.is_pinned();
            *held = entry;
            if pinned {
                held.expires_at = None;
            }
            return LocalWrite::Stored { evicted: 0 };
        }

        let evicted = if self.entries.len() >= self.max_entries {
            self.evict_lru()
        } else {
            0
        };
        self.entries.insert(group_id, RwLock::new(entry));
        LocalWrite::Stored { evicted }
    }

    /// Store a copy read from the shared tier. Unlike [`put`](Self::put) it
    /// only replaces a strictly older entry, so a local invalidation at the
    /// same version survives.
    pub fn promote(&self, entry: LocalEntry) -> LocalWrite {
        if let Some(slot) = self.entries.get(&entry.snapshot.trade_group_id) {
            let mut held = slot.write();
            if held.source_version >= entry.source_version {
                return LocalWrite::IgnoredOlder;
            }
            let pinned = held.is_pinned();
            *held = entry;
            if pinned {
                held.expires_at = None;
            }
            return LocalWrite::Stored { evicted: 0 };
        }
        self.put(entry)
    }

    /// True if a valid entry at or above `version` is held.
    pub fn holds_valid(&self, group_id: TradeGroupId, version: u64) -> bool {
        self.entries
            .get(&group_id)
            .map(|slot| {
                let entry = slot.read();
                !entry.invalidated && entry.source_version >= version
            })
            .unwrap_or(false)
    }

    /// Mark stale if the held source version is older than `version`.
    /// Returns true if an entry was marked.
    pub fn invalidate(&self, group_id: TradeGroupId, version: u64) -> bool {
        match self.entries.get(&group_id) {
            Some(slot) => {
                let mut entry = slot.write();
                if entry.source_version < version && !entry.invalidated {
                    entry.invalidated = true;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    pub fn source_version(&self, group_id: TradeGroupId) -> Option<u64> {
        self.entries
            .get(&group_id)
            .map(|slot| slot.read().source_version)
    }

    pub fn pin(&self, group_id: TradeGroupId) -> bool {
        match self.entries.get(&group_id) {
            Some(slot) => {
                slot.write().expires_at = None;
                true
            }
            None => false,
        }
    }

    pub fn mark_validated(&self, group_id: TradeGroupId) {
        if let Some(slot) = self.entries.get(&group_id) {
            slot.write().validated_at = Instant::now();
        }
    }

    /// Groups whose unpinned entries expire within `horizon`.
    pub fn expiring_within(&self, horizon: Duration) -> Vec<TradeGroupId> {
        let deadline = Instant::now() + horizon;
        self.entries
            .iter()
            .filter(|slot| {
                slot.value()
                    .read()
                    .expires_at
                    .map(|at| at <= deadline)
                    .unwrap_or(false)
            })
            .map(|slot| *slot.key())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict the least recently used tenth of the entries (at least one).
    /// Pinned entries are never evicted.
    fn evict_lru(&self) -> usize {
        let entries_to_remove = (self.entries.len() / 10).max(1);
        let mut candidates: Vec<(TradeGroupId, Instant)> = self
            .entries
            .iter()
            .filter_map(|slot| {
                let entry = slot.value().read();
                (!entry.is_pinned()).then(|| (*slot.key(), entry.last_accessed))
            })
            .collect();

        // Oldest first
        candidates.sort_by(|a, b| a.1.cmp(&b.1));

        candidates
            .into_iter()
            .take(entries_to_remove)
            .filter(|(key, _)| self.entries.remove(key).is_some())
            .count()
    }
}
