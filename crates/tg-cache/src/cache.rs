use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tg_types::errors::CacheError;
use tg_types::events::InvalidationEvent;
use tg_types::group::TradeGroupId;
use tg_types::position::PositionId;
use tg_types::snapshot::RiskSnapshot;

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::coherence::{GroupDirectory, InvalidationSink, SinkOutcome};
use crate::local::{LocalEntry, LocalTier, LocalWrite};
use crate::shared::{SharedEntry, SharedTier, SharedWrite};

/// Cache tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of groups held in the local tier.
    pub local_capacity: usize,
    pub ttl_secs: u64,
    pub shared_timeout_ms: u64,
    /// Local hits older than this are revalidated against the shared tier.
    pub staleness_window_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_capacity: 1024,
            ttl_secs: 300,
            shared_timeout_ms: 50,
            staleness_window_ms: 2_000,
            breaker_failure_threshold: 3,
            breaker_cooldown_ms: 5_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn shared_timeout(&self) -> Duration {
        Duration::from_millis(self.shared_timeout_ms)
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_millis(self.staleness_window_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupStatus {
    /// Snapshot matches the group's current version.
    Fresh,
    /// Snapshot exists but the group has moved on (or it was invalidated).
    Stale,
    Miss,
}

#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub snapshot: Option<Arc<RiskSnapshot>>,
    pub status: LookupStatus,
}

impl CacheLookup {
    fn fresh(snapshot: Arc<RiskSnapshot>) -> Self {
        Self {
            snapshot: Some(snapshot),
            status: LookupStatus::Fresh,
        }
    }

    fn stale(snapshot: Arc<RiskSnapshot>) -> Self {
        Self {
            snapshot: Some(snapshot),
            status: LookupStatus::Stale,
        }
    }

    fn miss() -> Self {
        Self {
            snapshot: None,
            status: LookupStatus::Miss,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.status == LookupStatus::Fresh
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    Stored,
    /// A newer snapshot was already cached.
    IgnoredOlder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheHealth {
    Healthy,
    /// No shared tier configured.
    LocalOnly,
    /// Shared tier failing; serving from the local tier only.
    Degraded { consecutive_failures: u32 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub ignored_writes: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub shared_failures: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.stale_hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Shared-tier work deferred to the relay task.
#[derive(Debug, Clone, Copy)]
enum RelayOp {
    Invalidate { group_id: TradeGroupId, version: u64 },
    Pin { group_id: TradeGroupId },
}

/// Version-aware two-tier snapshot cache.
///
/// Freshness is decided against the [`GroupDirectory`]: a snapshot is fresh
/// only while its source version equals the group's current version and it
/// has not been invalidated. Shared-tier failures never surface as errors;
/// they trip the breaker and the cache keeps serving from the local tier.
pub struct AggregationCache {
    config: CacheConfig,
    directory: Arc<dyn GroupDirectory>,
    local: LocalTier,
    shared: Option<Arc<dyn SharedTier>>,
    breaker: CircuitBreaker,
    stats: RwLock<CacheStats>,
    relay_tx: mpsc::UnboundedSender<RelayOp>,
    relay_rx: Mutex<Option<mpsc::UnboundedReceiver<RelayOp>>>,
}

impl AggregationCache {
    pub fn new(
        config: CacheConfig,
        directory: Arc<dyn GroupDirectory>,
        shared: Option<Arc<dyn SharedTier>>,
    ) -> Self {
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        Self {
            local: LocalTier::new(config.local_capacity),
            breaker: CircuitBreaker::new(config.breaker_failure_threshold, config.breaker_cooldown()),
            config,
            directory,
            shared,
            stats: RwLock::new(CacheStats::default()),
            relay_tx,
            relay_rx: Mutex::new(Some(relay_rx)),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Start the task that forwards invalidations and pins to the shared
    /// tier. Returns `None` without a shared tier or if already started.
    pub fn spawn_relay(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        self.shared.as_ref()?;
        let mut rx = self.relay_rx.lock().take()?;
        let cache: Weak<Self> = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    op = rx.recv() => {
                        let Some(op) = op else { break };
                        let Some(cache) = cache.upgrade() else { break };
                        cache.relay(op).await;
                    }
                }
            }
            debug!("shared cache relay stopped");
        }))
    }

    pub async fn get(&self, group_id: TradeGroupId) -> CacheLookup {
        let current = self.directory.current_version(group_id);

        let lookup = match self.local.get(group_id) {
            Some(entry) if Self::is_fresh(&entry, current) => {
                if entry.is_pinned() || entry.validated_at.elapsed() < self.config.staleness_window() {
                    CacheLookup::fresh(entry.snapshot)
                } else {
                    self.revalidate(group_id, entry).await
                }
            }
            Some(entry) => match self.fetch_shared(group_id, current).await {
                // another process already recomputed
                Some(remote) if remote.is_fresh() => remote,
                _ => CacheLookup::stale(entry.snapshot),
            },
            None => self
                .fetch_shared(group_id, current)
                .await
                .unwrap_or_else(CacheLookup::miss),
        };

        {
            let mut stats = self.stats.write();
            match lookup.status {
                LookupStatus::Fresh => stats.hits += 1,
                LookupStatus::Stale => stats.stale_hits += 1,
                LookupStatus::Miss => stats.misses += 1,
            }
        }
        debug!(group_id = %group_id, status = ?lookup.status, "cache lookup");
        lookup
    }

    /// Store `snapshot` in both tiers. `ttl` defaults to the configured TTL.
    pub async fn put(&self, snapshot: RiskSnapshot, ttl: Option<Duration>) -> CacheWrite {
        let ttl = ttl.unwrap_or_else(|| self.config.ttl());
        let group_id = snapshot.trade_group_id;
        let version = snapshot.as_of_version;
        let snapshot = Arc::new(snapshot);

        match self.local.put(LocalEntry::new(snapshot.clone(), Some(ttl))) {
            LocalWrite::IgnoredOlder => {
                self.stats.write().ignored_writes += 1;
                debug!(group_id = %group_id, version, "ignored write older than cached snapshot");
                return CacheWrite::IgnoredOlder;
            }
            LocalWrite::Stored { evicted } => {
                let mut stats = self.stats.write();
                stats.stores += 1;
                stats.evictions += evicted as u64;
            }
        }

        if let Some(shared) = &self.shared {
            let entry = SharedEntry {
                snapshot: (*snapshot).clone(),
                source_version: version,
                expires_at: chrono::Duration::from_std(ttl).ok().map(|d| Utc::now() + d),
                invalidated: false,
            };
            if let Some(SharedWrite::IgnoredOlder) = self.call_shared("put", shared.put(entry)).await {
                debug!(group_id = %group_id, version, "shared tier holds a newer snapshot");
            }
        }
        CacheWrite::Stored
    }

    /// Mark the group's snapshot stale in both tiers. Idempotent.
    ///
    /// Marks up to the locally held version, or the directory's current
    /// version when nothing is held.
    pub fn invalidate(&self, group_id: TradeGroupId) -> bool {
        let version = self
            .local
            .source_version(group_id)
            .or_else(|| self.directory.current_version(group_id))
            .map(|held| held.saturating_add(1))
            .unwrap_or(u64::MAX);

        let marked = self.local.invalidate(group_id, version);
        if marked {
            self.stats.write().invalidations += 1;
        }
        self.enqueue(RelayOp::Invalidate { group_id, version });
        marked
    }

    /// Invalidate the group that currently owns `position_id`.
    pub fn invalidate_by_position(&self, position_id: PositionId) -> Option<TradeGroupId> {
        let owner = self.directory.owner_of(position_id)?;
        self.invalidate(owner);
        Some(owner)
    }

    /// Clear the expiry of the group's entry so it outlives the TTL.
    pub fn pin(&self, group_id: TradeGroupId) -> bool {
        let pinned = self.local.pin(group_id);
        self.enqueue(RelayOp::Pin { group_id });
        pinned
    }

    /// Groups whose entries expire within `horizon`.
    pub fn expiring_within(&self, horizon: Duration) -> Vec<TradeGroupId> {
        self.local.expiring_within(horizon)
    }

    pub fn health(&self) -> CacheHealth {
        if self.shared.is_none() {
            return CacheHealth::LocalOnly;
        }
        match self.breaker.state() {
            BreakerState::Closed => CacheHealth::Healthy,
            BreakerState::Open | BreakerState::HalfOpen => CacheHealth::Degraded {
                consecutive_failures: self.breaker.consecutive_failures(),
            },
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }

    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    fn is_fresh(entry: &LocalEntry, current: Option<u64>) -> bool {
        !entry.invalidated && Some(entry.source_version) == current
    }

    fn enqueue(&self, op: RelayOp) {
        if self.shared.is_some() {
            // receiver only goes away with the cache itself
            let _ = self.relay_tx.send(op);
        }
    }

    async fn relay(&self, op: RelayOp) {
        let Some(shared) = &self.shared else { return };
        match op {
            RelayOp::Invalidate { group_id, version } => {
                // recomputed since: the shared tier already holds the new snapshot
                if self.local.holds_valid(group_id, version.saturating_sub(1)) {
                    debug!(group_id = %group_id, version, "relayed invalidation superseded");
                    return;
                }
                self.call_shared("invalidate", shared.invalidate(group_id, version))
                    .await;
            }
            RelayOp::Pin { group_id } => {
                self.call_shared("pin", shared.pin(group_id)).await;
            }
        }
    }

    /// Read the shared tier and promote what it holds into the local tier.
    /// Returns `None` when the local tier already holds the same or a newer
    /// source version.
    async fn fetch_shared(&self, group_id: TradeGroupId, current: Option<u64>) -> Option<CacheLookup> {
        let shared = self.shared.as_ref()?;
        let remote = self.call_shared("get", shared.get(group_id)).await??;

        let now = Utc::now();
        if remote.is_expired(now) {
            return None;
        }

        let fresh = !remote.invalidated && Some(remote.source_version) == current;
        let snapshot = Arc::new(remote.snapshot);
        let ttl = remote
            .expires_at
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO));
        let mut promoted = LocalEntry::new(snapshot.clone(), ttl);
        promoted.invalidated = remote.invalidated;
        match self.local.promote(promoted) {
            LocalWrite::Stored { evicted } => self.stats.write().evictions += evicted as u64,
            LocalWrite::IgnoredOlder => return None,
        }

        Some(if fresh {
            CacheLookup::fresh(snapshot)
        } else {
            CacheLookup::stale(snapshot)
        })
    }

    /// Confirm a locally fresh entry against the shared tier.
    async fn revalidate(&self, group_id: TradeGroupId, entry: LocalEntry) -> CacheLookup {
        let Some(shared) = &self.shared else {
            self.local.mark_validated(group_id);
            return CacheLookup::fresh(entry.snapshot);
        };

        match self.call_shared("get", shared.get(group_id)).await {
            Some(Some(remote))
                if remote.source_version > entry.source_version
                    || (remote.invalidated && remote.source_version == entry.source_version) =>
            {
                debug!(group_id = %group_id, "snapshot invalidated by another process");
                self.local.invalidate(group_id, entry.source_version + 1);
                CacheLookup::stale(entry.snapshot)
            }
            Some(_) => {
                self.local.mark_validated(group_id);
                CacheLookup::fresh(entry.snapshot)
            }
            // shared tier down: keep serving local
            None => CacheLookup::fresh(entry.snapshot),
        }
    }

    /// Run a shared-tier call under the timeout and breaker.
    async fn call_shared<T, F>(&self, operation: &'static str, call: F) -> Option<T>
    where
        F: Future<Output = Result<T, CacheError>>,
    {
        if !self.breaker.allow() {
            debug!(operation, "shared cache call skipped, breaker open");
            return None;
        }

        let timeout = self.config.shared_timeout();
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout {
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(value) => {
                self.breaker.record_success();
                Some(value)
            }
            Err(e) => {
                self.stats.write().shared_failures += 1;
                warn!(operation, error = %e, "shared cache tier degraded, serving local");
                self.breaker.record_failure();
                None
            }
        }
    }
}

impl InvalidationSink for AggregationCache {
    fn apply(&self, event: &InvalidationEvent) -> SinkOutcome {
        let group_id = event.trade_group_id;
        if let Some(held) = self.local.source_version(group_id) {
            if held >= event.triggering_version {
                debug!(
                    group_id = %group_id,
                    version = event.triggering_version,
                    "invalidation subsumed by cached snapshot"
                );
                return SinkOutcome::Subsumed;
            }
        }

        if self.local.invalidate(group_id, event.triggering_version) {
            self.stats.write().invalidations += 1;
        }
        self.enqueue(RelayOp::Invalidate {
            group_id,
            version: event.triggering_version,
        });
        debug!(
            group_id = %group_id,
            position_id = %event.position_id,
            change = %event.change_kind,
            version = event.triggering_version,
            "snapshot invalidated"
        );
        SinkOutcome::Applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;
    use tg_types::events::ChangeKind;
    use uuid::Uuid;

    use crate::shared::InMemorySharedTier;

    #[derive(Default)]
    struct StaticDirectory {
        versions: DashMap<TradeGroupId, u64>,
        owners: DashMap<PositionId, TradeGroupId>,
    }

    impl StaticDirectory {
        fn set_version(&self, group_id: TradeGroupId, version: u64) {
            self.versions.insert(group_id, version);
        }
    }

    impl GroupDirectory for StaticDirectory {
        fn current_version(&self, group_id: TradeGroupId) -> Option<u64> {
            self.versions.get(&group_id).map(|v| *v)
        }

        fn owner_of(&self, position_id: PositionId) -> Option<TradeGroupId> {
            self.owners.get(&position_id).map(|g| *g)
        }
    }

    fn local_cache(directory: Arc<StaticDirectory>) -> AggregationCache {
        AggregationCache::new(CacheConfig::default(), directory, None)
    }

    fn shared_cache(
        directory: Arc<StaticDirectory>,
        tier: Arc<InMemorySharedTier>,
    ) -> Arc<AggregationCache> {
        Arc::new(AggregationCache::new(
            CacheConfig::default(),
            directory,
            Some(tier as Arc<dyn SharedTier>),
        ))
    }

    #[tokio::test]
    async fn miss_then_fresh_then_stale_on_version_bump() {
        let directory = Arc::new(StaticDirectory::default());
        let cache = local_cache(directory.clone());
        let group_id = Uuid::new_v4();
        directory.set_version(group_id, 1);

        assert_eq!(cache.get(group_id).await.status, LookupStatus::Miss);

        cache.put(RiskSnapshot::empty(group_id, 1), None).await;
        let lookup = cache.get(group_id).await;
        assert!(lookup.is_fresh());
        assert_eq!(lookup.snapshot.unwrap().as_of_version, 1);

        directory.set_version(group_id, 2);
        let lookup = cache.get(group_id).await;
        assert_eq!(lookup.status, LookupStatus::Stale);
        assert!(lookup.snapshot.is_some());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.stale_hits, 1);
        assert_eq!(cache.health(), CacheHealth::LocalOnly);
    }

    #[tokio::test]
    async fn explicit_invalidate_is_idempotent() {
        let directory = Arc::new(StaticDirectory::default());
        let cache = local_cache(directory.clone());
        let group_id = Uuid::new_v4();
        directory.set_version(group_id, 1);
        cache.put(RiskSnapshot::empty(group_id, 1), None).await;

        assert!(cache.invalidate(group_id));
        assert!(!cache.invalidate(group_id));
        assert_eq!(cache.get(group_id).await.status, LookupStatus::Stale);
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[tokio::test]
    async fn invalidate_by_position_resolves_owner() {
        let directory = Arc::new(StaticDirectory::default());
        let cache = local_cache(directory.clone());
        let group_id = Uuid::new_v4();
        let position_id = Uuid::new_v4();
        directory.set_version(group_id, 1);
        directory.owners.insert(position_id, group_id);
        cache.put(RiskSnapshot::empty(group_id, 1), None).await;

        assert_eq!(cache.invalidate_by_position(position_id), Some(group_id));
        assert_eq!(cache.get(group_id).await.status, LookupStatus::Stale);
        assert_eq!(cache.invalidate_by_position(Uuid::new_v4()), None);
    }

    #[tokio::test]
    async fn older_snapshot_does_not_replace_newer() {
        let directory = Arc::new(StaticDirectory::default());
        let cache = local_cache(directory.clone());
        let group_id = Uuid::new_v4();
        directory.set_version(group_id, 5);

        assert_eq!(cache.put(RiskSnapshot::empty(group_id, 5), None).await, CacheWrite::Stored);
        assert_eq!(
            cache.put(RiskSnapshot::empty(group_id, 4), None).await,
            CacheWrite::IgnoredOlder
        );
        let lookup = cache.get(group_id).await;
        assert!(lookup.is_fresh());
        assert_eq!(lookup.snapshot.unwrap().as_of_version, 5);
        assert_eq!(cache.stats().ignored_writes, 1);
    }

    #[tokio::test]
    async fn events_are_gated_by_cached_version() {
        let directory = Arc::new(StaticDirectory::default());
        let cache = local_cache(directory.clone());
        let group_id = Uuid::new_v4();
        let position_id = Uuid::new_v4();
        directory.set_version(group_id, 3);
        cache.put(RiskSnapshot::empty(group_id, 3), None).await;

        let old = InvalidationEvent::new(position_id, group_id, ChangeKind::Repriced, 3);
        assert_eq!(cache.apply(&old), SinkOutcome::Subsumed);
        assert!(cache.get(group_id).await.is_fresh());

        directory.set_version(group_id, 4);
        let new = InvalidationEvent::new(position_id, group_id, ChangeKind::Repriced, 4);
        assert_eq!(cache.apply(&new), SinkOutcome::Applied);
        assert_eq!(cache.get(group_id).await.status, LookupStatus::Stale);
    }

    #[tokio::test(start_paused = true)]
    async fn pinned_snapshot_outlives_ttl() {
        let directory = Arc::new(StaticDirectory::default());
        let cache = local_cache(directory.clone());
        let group_id = Uuid::new_v4();
        directory.set_version(group_id, 2);
        cache
            .put(RiskSnapshot::empty(group_id, 2), Some(Duration::from_secs(1)))
            .await;
        assert!(cache.pin(group_id));

        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(cache.get(group_id).await.is_fresh());
    }

    #[tokio::test(start_paused = true)]
    async fn shared_tier_serves_other_process() {
        let directory = Arc::new(StaticDirectory::default());
        let tier = Arc::new(InMemorySharedTier::new());
        let a = shared_cache(directory.clone(), tier.clone());
        let b = shared_cache(directory.clone(), tier.clone());
        let group_id = Uuid::new_v4();
        directory.set_version(group_id, 1);

        a.put(RiskSnapshot::empty(group_id, 1), None).await;
        assert_eq!(tier.len(), 1);

        let lookup = b.get(group_id).await;
        assert!(lookup.is_fresh());
        assert_eq!(b.len(), 1);
        assert_eq!(b.health(), CacheHealth::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_invalidation_visible_after_staleness_window() {
        let directory = Arc::new(StaticDirectory::default());
        let tier = Arc::new(InMemorySharedTier::new());
        let a = shared_cache(directory.clone(), tier.clone());
        let b = shared_cache(directory.clone(), tier.clone());
        let cancel = CancellationToken::new();
        let relay = a.spawn_relay(cancel.clone()).unwrap();
        let group_id = Uuid::new_v4();
        directory.set_version(group_id, 1);

        a.put(RiskSnapshot::empty(group_id, 1), None).await;
        assert!(b.get(group_id).await.is_fresh());

        a.invalidate(group_id);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(tier.get(group_id).await.unwrap().unwrap().invalidated);

        // within the window b still trusts its local copy
        assert!(b.get(group_id).await.is_fresh());

        tokio::time::advance(Duration::from_millis(2_100)).await;
        assert_eq!(b.get(group_id).await.status, LookupStatus::Stale);

        cancel.cancel();
        relay.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_invalidate_visible_with_shared_tier() {
        let directory = Arc::new(StaticDirectory::default());
        let tier = Arc::new(InMemorySharedTier::new());
        let cache = shared_cache(directory.clone(), tier.clone());
        let cancel = CancellationToken::new();
        let relay = cache.spawn_relay(cancel.clone()).unwrap();
        let group_id = Uuid::new_v4();
        directory.set_version(group_id, 1);
        cache.put(RiskSnapshot::empty(group_id, 1), None).await;

        assert!(cache.invalidate(group_id));
        // the shared copy is still unmarked until the relay runs
        let lookup = cache.get(group_id).await;
        assert_eq!(lookup.status, LookupStatus::Stale);
        assert_eq!(lookup.snapshot.unwrap().as_of_version, 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(tier.get(group_id).await.unwrap().unwrap().invalidated);
        assert_eq!(cache.get(group_id).await.status, LookupStatus::Stale);

        cancel.cancel();
        relay.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn relayed_invalidation_skips_recomputed_snapshot() {
        let directory = Arc::new(StaticDirectory::default());
        let tier = Arc::new(InMemorySharedTier::new());
        let cache = shared_cache(directory.clone(), tier.clone());
        let group_id = Uuid::new_v4();
        directory.set_version(group_id, 1);
        cache.put(RiskSnapshot::empty(group_id, 1), None).await;

        assert!(cache.invalidate(group_id));
        // recomputed before the relay drains the queue
        cache.put(RiskSnapshot::empty(group_id, 1), None).await;

        let cancel = CancellationToken::new();
        let relay = cache.spawn_relay(cancel.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!tier.get(group_id).await.unwrap().unwrap().invalidated);
        assert!(cache.get(group_id).await.is_fresh());

        cancel.cancel();
        relay.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failing_shared_tier_degrades_to_local() {
        let directory = Arc::new(StaticDirectory::default());
        let tier = Arc::new(InMemorySharedTier::new());
        let cache = shared_cache(directory.clone(), tier.clone());
        let group_id = Uuid::new_v4();
        directory.set_version(group_id, 1);

        tier.set_available(false);
        cache.put(RiskSnapshot::empty(group_id, 1), None).await;
        assert!(cache.get(group_id).await.is_fresh());

        // unknown groups fall through to the failing shared tier
        cache.get(Uuid::new_v4()).await;
        cache.get(Uuid::new_v4()).await;

        assert!(matches!(cache.health(), CacheHealth::Degraded { .. }));
        assert_eq!(cache.stats().shared_failures, 3);

        // local tier keeps serving while the breaker is open
        assert!(cache.get(group_id).await.is_fresh());

        tier.set_available(true);
        tokio::time::advance(Duration::from_secs(5)).await;
        cache.get(Uuid::new_v4()).await;
        assert_eq!(cache.health(), CacheHealth::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_shared_tier_times_out() {
        let directory = Arc::new(StaticDirectory::default());
        let tier = Arc::new(InMemorySharedTier::new());
        tier.set_latency(Some(Duration::from_millis(200)));
        let cache = shared_cache(directory.clone(), tier.clone());

        let lookup = cache.get(Uuid::new_v4()).await;
        assert_eq!(lookup.status, LookupStatus::Miss);
        assert_eq!(cache.stats().shared_failures, 1);
    }
}
