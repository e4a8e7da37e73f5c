//! Background refresh of snapshots that are about to expire.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tg_types::errors::{TgError, TgResult};
use tg_types::group::GroupStatus;

use crate::service::RiskService;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmerConfig {
    pub enabled: bool,
    /// Seconds between sweeps.
    pub interval_secs: u64,
    /// Entries expiring within this many seconds are refreshed.
    pub horizon_secs: u64,
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            horizon_secs: 60,
        }
    }
}

impl WarmerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn horizon(&self) -> Duration {
        Duration::from_secs(self.horizon_secs)
    }
}

/// Handle to a running warmer task.
pub struct WarmerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl WarmerHandle {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop the warmer and wait for the current sweep to finish.
    pub async fn shutdown(self) -> TgResult<()> {
        self.cancel.cancel();
        self.join
            .await
            .map_err(|e| TgError::Internal(format!("cache warmer task failed: {e}")))
    }
}

pub struct CacheWarmer;

impl CacheWarmer {
    pub fn spawn(service: Arc<RiskService>, config: WarmerConfig) -> WarmerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = config.interval_secs, horizon_secs = config.horizon_secs, "cache warmer started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let refreshed = Self::warm_once(&service, config.horizon(), &token).await;
                        if refreshed > 0 {
                            debug!(refreshed, "cache warmer sweep");
                        }
                    }
                }
            }
            info!("cache warmer stopped");
        });

        WarmerHandle { cancel, join }
    }

    /// Refresh active groups whose snapshots expire within `horizon`.
    /// Returns the number refreshed.
    pub async fn warm_once(service: &RiskService, horizon: Duration, cancel: &CancellationToken) -> usize {
        let mut refreshed = 0;
        for group_id in service.cache().expiring_within(horizon) {
            if cancel.is_cancelled() {
                break;
            }
            if service.registry().status(group_id) != Some(GroupStatus::Active) {
                continue;
            }
            match service.refresh(group_id, cancel.child_token()).await {
                Ok(_) => refreshed += 1,
                Err(e) => warn!(group_id = %group_id, error = %e, "cache warm-up failed"),
            }
        }
        refreshed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tg_types::group::{RiskLimits, StrategyType};
    use tg_types::market::{InstrumentKey, PriceSeries};
    use tg_types::position::{PaperSide, PositionRef};

    use crate::config::EngineConfig;
    use crate::sources::{Collaborators, FixedCapitalBase, InMemoryContractRepository, InMemoryPriceStore};

    fn service() -> (Arc<RiskService>, Arc<InMemoryPriceStore>) {
        let prices = Arc::new(InMemoryPriceStore::new());
        let start = Utc::now().date_naive() - chrono::Duration::days(30);
        prices.insert(
            InstrumentKey::new("WTI"),
            PriceSeries::from_daily_closes(start, &[dec!(70), dec!(71), dec!(69), dec!(72), dec!(70)]),
        );
        let sources = Collaborators {
            contracts: Arc::new(InMemoryContractRepository::new()),
            prices: prices.clone(),
            capital: Arc::new(FixedCapitalBase::new(None)),
        };
        let service = RiskService::new(EngineConfig::default(), sources, None).unwrap();
        (Arc::new(service), prices)
    }

    #[tokio::test]
    async fn refreshes_active_groups_near_expiry() {
        let (service, prices) = service();
        let group = service.create_group("wti", StrategyType::Directional, RiskLimits::default());
        service
            .assign_position(
                group.id,
                PositionRef::paper(PaperSide::Long, dec!(100), dec!(70), dec!(70), "WTI"),
                0,
            )
            .unwrap();
        service.get_portfolio_risk(group.id, CancellationToken::new()).await.unwrap();
        assert_eq!(prices.call_count(), 1);

        // nothing expires within a second of a fresh 300s entry
        let refreshed = CacheWarmer::warm_once(&service, Duration::from_secs(1), &CancellationToken::new()).await;
        assert_eq!(refreshed, 0);

        let refreshed = CacheWarmer::warm_once(&service, Duration::from_secs(600), &CancellationToken::new()).await;
        assert_eq!(refreshed, 1);
        assert_eq!(prices.call_count(), 2);
    }

    #[tokio::test]
    async fn skips_closed_and_draft_groups() {
        let (service, prices) = service();
        let draft = service.create_group("draft", StrategyType::Hedge, RiskLimits::default());
        service.get_portfolio_risk(draft.id, CancellationToken::new()).await.unwrap();

        let closed = service.create_group("closed", StrategyType::Hedge, RiskLimits::default());
        service
            .assign_position(
                closed.id,
                PositionRef::paper(PaperSide::Short, dec!(100), dec!(72), dec!(70), "WTI"),
                0,
            )
            .unwrap();
        service.get_portfolio_risk(closed.id, CancellationToken::new()).await.unwrap();
        service.close_group(closed.id, 1).unwrap();

        let refreshed = CacheWarmer::warm_once(&service, Duration::from_secs(600), &CancellationToken::new()).await;
        assert_eq!(refreshed, 0);
        assert_eq!(prices.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_warmer_stops_on_shutdown() {
        let (service, _) = service();
        let handle = CacheWarmer::spawn(
            service,
            WarmerConfig {
                interval_secs: 1,
                ..WarmerConfig::default()
            },
        );
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!handle.is_finished());

        handle.shutdown().await.unwrap();
    }
}
