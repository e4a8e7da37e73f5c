//! Shared (cross-process) cache tier.
//!
//! The tier stores serialized [`SharedEntry`] values keyed by trade group.
//! [`InMemorySharedTier`] keeps the JSON bytes in a `DashMap` and can be
//! switched off or slowed down to exercise degraded mode.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use tg_types::errors::CacheError;
use tg_types::group::TradeGroupId;
use tg_types::snapshot::RiskSnapshot;

/// Wire form of a cache entry in the shared tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedEntry {
    pub snapshot: RiskSnapshot,
    pub source_version: u64,
    /// `None` for pinned entries.
    pub expires_at: Option<DateTime<Utc>>,
    pub invalidated: bool,
}

impl SharedEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Outcome of a shared-tier write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedWrite {
    Stored,
    /// The tier already held a newer source version.
    IgnoredOlder,
}

#[async_trait]
pub trait SharedTier: Send + Sync {
    async fn get(&self, group_id: TradeGroupId) -> Result<Option<SharedEntry>, CacheError>;

    /// Store `entry` unless the tier holds a strictly newer source version.
    async fn put(&self, entry: SharedEntry) -> Result<SharedWrite, CacheError>;

    /// Mark the entry stale if its source version is older than `version`.
    async fn invalidate(&self, group_id: TradeGroupId, version: u64) -> Result<(), CacheError>;

    /// Clear the entry's expiry.
    async fn pin(&self, group_id: TradeGroupId) -> Result<(), CacheError>;
}

/// In-process stand-in for a networked key-value store.
#[derive(Debug, Default)]
pub struct InMemorySharedTier {
    entries: DashMap<TradeGroupId, Vec<u8>>,
    unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl InMemorySharedTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    async fn simulate_network(&self) -> Result<(), CacheError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable {
                message: "in-memory shared tier switched off".to_string(),
            });
        }
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<SharedEntry, CacheError> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Serialization {
            message: e.to_string(),
        })
    }

    fn encode(entry: &SharedEntry) -> Result<Vec<u8>, CacheError> {
        serde_json::to_vec(entry).map_err(|e| CacheError::Serialization {
            message: e.to_string(),
        })
    }

    fn update<F>(&self, group_id: TradeGroupId, f: F) -> Result<(), CacheError>
    where
        F: FnOnce(&mut SharedEntry),
    {
        if let Some(mut slot) = self.entries.get_mut(&group_id) {
            let mut entry = Self::decode(slot.value())?;
            f(&mut entry);
            *slot.value_mut() = Self::encode(&entry)?;
        }
        Ok(())
    }
}

#[async_trait]
impl SharedTier for InMemorySharedTier {
    async fn get(&self, group_id: TradeGroupId) -> Result<Option<SharedEntry>, CacheError> {
        self.simulate_network().await?;
        match self.entries.get(&group_id) {
            Some(bytes) => Ok(Some(Self::decode(bytes.value())?)),
            None => Ok(None),
        }
    }

    async fn put(&self, entry: SharedEntry) -> Result<SharedWrite, CacheError> {
        self.simulate_network().await?;
        let bytes = Self::encode(&entry)?;
        let group_id = entry.snapshot.trade_group_id;

        let mut slot = self.entries.entry(group_id).or_default();
        if !slot.value().is_empty() {
            let held = Self::decode(slot.value())?;
            if held.source_version > entry.source_version {
                return Ok(SharedWrite::IgnoredOlder);
            }
        }
        *slot.value_mut() = bytes;
        Ok(SharedWrite::Stored)
    }

    async fn invalidate(&self, group_id: TradeGroupId, version: u64) -> Result<(), CacheError> {
        self.simulate_network().await?;
        self.update(group_id, |entry| {
            if entry.source_version < version {
                entry.invalidated = true;
            }
        })
    }

    async fn pin(&self, group_id: TradeGroupId) -> Result<(), CacheError> {
        self.simulate_network().await?;
        self.update(group_id, |entry| entry.expires_at = None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn entry(group_id: TradeGroupId, version: u64) -> SharedEntry {
        SharedEntry {
            snapshot: RiskSnapshot::empty(group_id, version),
            source_version: version,
            expires_at: Some(Utc::now() + chrono::Duration::minutes(5)),
            invalidated: false,
        }
    }

    #[tokio::test]
    async fn older_write_is_ignored() {
        let tier = InMemorySharedTier::new();
        let group_id = Uuid::new_v4();

        assert_eq!(tier.put(entry(group_id, 4)).await.unwrap(), SharedWrite::Stored);
        assert_eq!(tier.put(entry(group_id, 3)).await.unwrap(), SharedWrite::IgnoredOlder);
        assert_eq!(tier.put(entry(group_id, 4)).await.unwrap(), SharedWrite::Stored);

        let held = tier.get(group_id).await.unwrap().unwrap();
        assert_eq!(held.source_version, 4);
    }

    #[tokio::test]
    async fn invalidate_respects_version() {
        let tier = InMemorySharedTier::new();
        let group_id = Uuid::new_v4();
        tier.put(entry(group_id, 5)).await.unwrap();

        tier.invalidate(group_id, 5).await.unwrap();
        assert!(!tier.get(group_id).await.unwrap().unwrap().invalidated);

        tier.invalidate(group_id, 6).await.unwrap();
        assert!(tier.get(group_id).await.unwrap().unwrap().invalidated);
    }

    #[tokio::test]
    async fn pin_clears_expiry() {
        let tier = InMemorySharedTier::new();
        let group_id = Uuid::new_v4();
        tier.put(entry(group_id, 1)).await.unwrap();
        tier.pin(group_id).await.unwrap();

        let held = tier.get(group_id).await.unwrap().unwrap();
        assert!(held.expires_at.is_none());
        assert!(!held.is_expired(Utc::now() + chrono::Duration::days(365)));
    }

    #[tokio::test]
    async fn unavailable_tier_errors() {
        let tier = InMemorySharedTier::new();
        tier.set_available(false);
        let err = tier.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, CacheError::Unavailable { .. }));
    }
}
