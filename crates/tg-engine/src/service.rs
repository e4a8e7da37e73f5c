//! The risk service: registry, cache and calculator behind one API.
//!
//! Reads go cache first. A miss or stale hit is recomputed under a
//! per-group gate so concurrent readers of one group share a single
//! computation. Inputs are fetched concurrently with per-call timeouts and
//! the computation itself runs on the blocking pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use crossbeam_channel::Receiver;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tg_cache::{
    AggregationCache, CacheHealth, CacheStats, GroupDirectory, InvalidationSink, LookupStatus,
    SharedTier, SinkOutcome,
};
use tg_risk::{ComputeControl, LimitMonitor, RiskAlert, RiskInputs, RiskSnapshotCalculator};
use tg_types::errors::{ComputeError, RegistryError, TgError, TgResult};
use tg_types::events::InvalidationEvent;
use tg_types::group::{GroupStatus, RiskLimits, StrategyType, TradeGroup, TradeGroupId};
use tg_types::market::{InstrumentKey, PriceSeries};
use tg_types::position::{PositionId, PositionRef};
use tg_types::snapshot::RiskSnapshot;

use crate::bus::InvalidationBus;
use crate::config::EngineConfig;
use crate::registry::{GroupView, PositionLinkRegistry, RegistryResult};
use crate::sources::{with_timeout, Collaborators};

const ALERT_CHANNEL_CAPACITY: usize = 1024;

pub type SubscriptionId = Uuid;
pub type SnapshotCallback = Arc<dyn Fn(Arc<RiskSnapshot>) + Send + Sync>;

/// How the returned snapshot relates to the group's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Freshness {
    /// Served from cache at the current version.
    Fresh,
    /// Older than the current version; a fresh one could not be produced.
    Stale,
    /// Computed for this request.
    Recomputed,
    /// Last snapshot of a closed group.
    Frozen,
}

#[derive(Debug, Clone)]
pub struct RiskRead {
    pub snapshot: Arc<RiskSnapshot>,
    pub freshness: Freshness,
}

impl RiskRead {
    fn new(snapshot: Arc<RiskSnapshot>, freshness: Freshness) -> Self {
        Self { snapshot, freshness }
    }
}

/// Groups invalidated since their subscribers were last notified.
#[derive(Debug, Default)]
struct PendingNotifications {
    dirty: DashMap<TradeGroupId, u64>,
}

impl PendingNotifications {
    fn mark(&self, group_id: TradeGroupId, version: u64) {
        self.dirty
            .entry(group_id)
            .and_modify(|v| *v = (*v).max(version))
            .or_insert(version);
    }

    /// Clear the mark if `version` covers it.
    fn take_if_covered(&self, group_id: TradeGroupId, version: u64) -> bool {
        self.dirty
            .remove_if(&group_id, |_, dirty| *dirty <= version)
            .is_some()
    }
}

impl InvalidationSink for PendingNotifications {
    fn apply(&self, event: &InvalidationEvent) -> SinkOutcome {
        self.mark(event.trade_group_id, event.triggering_version);
        SinkOutcome::Applied
    }
}

struct LoadedInputs {
    history: HashMap<InstrumentKey, PriceSeries>,
    benchmark: Option<PriceSeries>,
    net_asset_value: Option<Decimal>,
}

pub struct RiskService {
    config: EngineConfig,
    registry: Arc<PositionLinkRegistry>,
    cache: Arc<AggregationCache>,
    calculator: Arc<RiskSnapshotCalculator>,
    monitor: LimitMonitor,
    sources: Collaborators,
    benchmark: Option<InstrumentKey>,
    gates: DashMap<TradeGroupId, Arc<tokio::sync::Mutex<()>>>,
    subscribers: DashMap<TradeGroupId, Vec<(SubscriptionId, SnapshotCallback)>>,
    pending: Arc<PendingNotifications>,
    alert_rx: Receiver<RiskAlert>,
}

impl RiskService {
    pub fn new(
        config: EngineConfig,
        sources: Collaborators,
        shared: Option<Arc<dyn SharedTier>>,
    ) -> TgResult<Self> {
        config.validate()?;

        let bus = Arc::new(InvalidationBus::new());
        let registry = Arc::new(PositionLinkRegistry::new(bus.clone()));
        let cache = Arc::new(AggregationCache::new(
            config.cache.clone(),
            registry.clone() as Arc<dyn GroupDirectory>,
            shared,
        ));
        let pending = Arc::new(PendingNotifications::default());
        bus.register(&(cache.clone() as Arc<dyn InvalidationSink>));
        bus.register(&(pending.clone() as Arc<dyn InvalidationSink>));

        let (alert_tx, alert_rx) = crossbeam_channel::bounded(ALERT_CHANNEL_CAPACITY);
        let monitor = LimitMonitor::new(config.monitor.clone(), alert_tx);
        let calculator = Arc::new(RiskSnapshotCalculator::new(config.calculator.clone()));
        let benchmark = config.benchmark.as_deref().map(InstrumentKey::new);

        Ok(Self {
            config,
            registry,
            cache,
            calculator,
            monitor,
            sources,
            benchmark,
            gates: DashMap::new(),
            subscribers: DashMap::new(),
            pending,
            alert_rx,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PositionLinkRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<AggregationCache> {
        &self.cache
    }

    /// Start forwarding cache invalidations to the shared tier.
    pub fn spawn_relay(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        self.cache.spawn_relay(cancel)
    }

    // --- registry operations ---

    pub fn create_group(&self, name: &str, strategy_type: StrategyType, risk_limits: RiskLimits) -> TradeGroup {
        self.registry.create_group(name, strategy_type, risk_limits)
    }

    pub fn assign_position(
        &self,
        group_id: TradeGroupId,
        position: PositionRef,
        expected_version: u64,
    ) -> RegistryResult<u64> {
        self.registry.assign_position(group_id, position, expected_version)
    }

    pub fn unassign_position(
        &self,
        group_id: TradeGroupId,
        position_id: PositionId,
        expected_version: u64,
    ) -> RegistryResult<u64> {
        self.registry.unassign_position(group_id, position_id, expected_version)
    }

    pub fn reprice_position(
        &self,
        group_id: TradeGroupId,
        position_id: PositionId,
        mark_price: Decimal,
        expected_version: u64,
    ) -> RegistryResult<u64> {
        self.registry
            .reprice_position(group_id, position_id, mark_price, expected_version)
    }

    /// Close the group and freeze its last snapshot.
    pub fn close_group(&self, group_id: TradeGroupId, expected_version: u64) -> RegistryResult<u64> {
        let version = self.registry.close_group(group_id, expected_version)?;
        if !self.cache.pin(group_id) {
            debug!(group_id = %group_id, "closed group has no snapshot to freeze");
        }
        Ok(version)
    }

    pub fn list_positions(&self, group_id: TradeGroupId) -> RegistryResult<Vec<PositionRef>> {
        self.registry.list_positions(group_id)
    }

    pub fn group(&self, group_id: TradeGroupId) -> RegistryResult<TradeGroup> {
        self.registry.group(group_id)
    }

    /// Re-read a position from the contract store and re-link it.
    pub async fn sync_position_from_contract(
        &self,
        group_id: TradeGroupId,
        position_id: PositionId,
        expected_version: u64,
    ) -> TgResult<u64> {
        let position = with_timeout(
            "contracts",
            self.config.source_timeout(),
            self.sources.contracts.position(position_id),
        )
        .await?;
        Ok(self.registry.assign_position(group_id, position, expected_version)?)
    }

    // --- risk reads ---

    pub async fn get_portfolio_risk(
        &self,
        group_id: TradeGroupId,
        cancel: CancellationToken,
    ) -> TgResult<RiskRead> {
        let group = self.registry.group(group_id)?;
        if group.status.is_closed() {
            return self.frozen(group_id).await;
        }

        let lookup = self.cache.get(group_id).await;
        if let (LookupStatus::Fresh, Some(snapshot)) = (lookup.status, &lookup.snapshot) {
            return Ok(RiskRead::new(snapshot.clone(), Freshness::Fresh));
        }

        let gate = self.gate(group_id);
        let _turn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ComputeError::Cancelled.into()),
            turn = gate.lock() => turn,
        };

        // another reader may have recomputed while we waited
        let lookup = self.cache.get(group_id).await;
        if let (LookupStatus::Fresh, Some(snapshot)) = (lookup.status, &lookup.snapshot) {
            return Ok(RiskRead::new(snapshot.clone(), Freshness::Fresh));
        }

        match self.recompute(group_id, &cancel).await {
            Err(TgError::Compute(ComputeError::DeadlineExceeded)) if lookup.snapshot.is_some() => {
                warn!(group_id = %group_id, "recomputation missed its deadline, serving stale snapshot");
                let snapshot = lookup.snapshot.ok_or(ComputeError::DeadlineExceeded)?;
                Ok(RiskRead::new(snapshot, Freshness::Stale))
            }
            result => result,
        }
    }

    /// Recompute regardless of what the cache holds.
    pub async fn refresh(&self, group_id: TradeGroupId, cancel: CancellationToken) -> TgResult<RiskRead> {
        let gate = self.gate(group_id);
        let _turn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ComputeError::Cancelled.into()),
            turn = gate.lock() => turn,
        };
        self.recompute(group_id, &cancel).await
    }

    /// Invalidate the snapshot of the group holding `position_id`.
    pub fn invalidate_by_position(&self, position_id: PositionId) -> Option<TradeGroupId> {
        let owner = self.cache.invalidate_by_position(position_id)?;
        self.pending.mark(owner, 0);
        Some(owner)
    }

    /// Call `callback` with each snapshot recomputed after an invalidation.
    pub fn subscribe(&self, group_id: TradeGroupId, callback: SnapshotCallback) -> RegistryResult<SubscriptionId> {
        self.registry.group(group_id)?;
        let id = Uuid::new_v4();
        self.subscribers.entry(group_id).or_default().push((id, callback));
        Ok(id)
    }

    pub fn unsubscribe(&self, subscription_id: SubscriptionId) -> bool {
        let mut removed = false;
        for mut subs in self.subscribers.iter_mut() {
            let before = subs.len();
            subs.retain(|(id, _)| *id != subscription_id);
            removed |= subs.len() != before;
        }
        removed
    }

    pub fn alerts(&self) -> Receiver<RiskAlert> {
        self.alert_rx.clone()
    }

    pub fn cache_health(&self) -> CacheHealth {
        self.cache.health()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn gate(&self, group_id: TradeGroupId) -> Arc<tokio::sync::Mutex<()>> {
        self.gates.entry(group_id).or_default().value().clone()
    }

    async fn frozen(&self, group_id: TradeGroupId) -> TgResult<RiskRead> {
        match self.cache.get(group_id).await.snapshot {
            Some(snapshot) => Ok(RiskRead::new(snapshot, Freshness::Frozen)),
            None => Err(RegistryError::SnapshotUnavailable { group_id }.into()),
        }
    }

    /// Caller holds the group's gate.
    async fn recompute(&self, group_id: TradeGroupId, cancel: &CancellationToken) -> TgResult<RiskRead> {
        let started = Instant::now();
        let GroupView { group, positions } = self.registry.view(group_id)?;
        if group.status.is_closed() {
            return self.frozen(group_id).await;
        }
        if group.status == GroupStatus::Draft {
            // nothing linked yet: zero risk, kept out of the cache
            debug!(group_id = %group_id, "draft group read as empty snapshot");
            let snapshot = Arc::new(RiskSnapshot::empty(group_id, group.version));
            return Ok(RiskRead::new(snapshot, Freshness::Recomputed));
        }

        let control = ComputeControl::new(cancel.clone()).with_deadline(started + self.config.compute_deadline());
        let inputs = self.load_inputs(&positions).await;
        control.checkpoint()?;

        let calculator = self.calculator.clone();
        let version = group.version;
        let snapshot = tokio::task::spawn_blocking(move || {
            let inputs = RiskInputs {
                positions: &positions,
                history: &inputs.history,
                benchmark: inputs.benchmark.as_ref(),
                net_asset_value: inputs.net_asset_value,
            };
            calculator.compute(group_id, version, &inputs, &control)
        })
        .await
        .map_err(|e| ComputeError::TaskFailed {
            message: e.to_string(),
        })??;

        self.cache.put(snapshot.clone(), None).await;
        self.monitor.evaluate(&group.risk_limits, &snapshot);
        info!(
            group_id = %group_id,
            version,
            positions = snapshot.position_count,
            var_95 = %snapshot.var_95,
            var_99 = %snapshot.var_99,
            data_insufficient = snapshot.data_insufficient,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "risk snapshot recomputed"
        );

        let snapshot = Arc::new(snapshot);
        self.notify(group_id, &snapshot);

        let freshness = if self.registry.current_version(group_id) == Some(version) {
            Freshness::Recomputed
        } else {
            Freshness::Stale
        };
        Ok(RiskRead::new(snapshot, freshness))
    }

    /// Fetch price history, benchmark and capital base concurrently.
    /// Failures and timeouts leave the input out.
    async fn load_inputs(&self, positions: &[PositionRef]) -> LoadedInputs {
        let timeout = self.config.source_timeout();
        let to = Utc::now().date_naive();
        let from = to - chrono::Duration::days(self.config.history_lookback_days);

        let mut instruments: Vec<InstrumentKey> = positions.iter().map(|p| p.instrument.clone()).collect();
        instruments.sort();
        instruments.dedup();

        let mut tasks = JoinSet::new();
        for instrument in instruments {
            let prices = self.sources.prices.clone();
            tasks.spawn(async move {
                let result = with_timeout("prices", timeout, prices.history(&instrument, from, to)).await;
                (instrument, result)
            });
        }

        let history = async {
            let mut history = HashMap::new();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((instrument, Ok(series))) => {
                        history.insert(instrument, series);
                    }
                    Ok((instrument, Err(e))) => {
                        warn!(instrument = %instrument, error = %e, "price history unavailable");
                    }
                    Err(e) => warn!(error = %e, "price history task failed"),
                }
            }
            history
        };

        let benchmark = async {
            let instrument = self.benchmark.as_ref()?;
            match with_timeout("prices", timeout, self.sources.prices.history(instrument, from, to)).await {
                Ok(series) => Some(series),
                Err(e) => {
                    warn!(instrument = %instrument, error = %e, "benchmark history unavailable");
                    None
                }
            }
        };

        let net_asset_value = async {
            match with_timeout("capital", timeout, self.sources.capital.net_asset_value()).await {
                Ok(nav) => nav,
                Err(e) => {
                    warn!(error = %e, "capital base unavailable, leverage reported as zero");
                    None
                }
            }
        };

        let (history, benchmark, net_asset_value) = tokio::join!(history, benchmark, net_asset_value);
        LoadedInputs {
            history,
            benchmark,
            net_asset_value,
        }
    }

    fn notify(&self, group_id: TradeGroupId, snapshot: &Arc<RiskSnapshot>) {
        if !self.pending.take_if_covered(group_id, snapshot.as_of_version) {
            return;
        }
        let callbacks: Vec<SnapshotCallback> = self
            .subscribers
            .get(&group_id)
            .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(snapshot.clone());
        }
    }
}
