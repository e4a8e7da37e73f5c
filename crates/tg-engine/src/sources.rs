//! External collaborators consumed by the risk service.
//!
//! Contract data, price history and the capital base live outside the
//! engine. Each is reached through an async trait so a networked adapter
//! can replace the in-memory implementations shipped here.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;

use tg_types::errors::SourceError;
use tg_types::market::{InstrumentKey, PriceSeries};
use tg_types::position::{PositionId, PositionRef};

pub type SourceResult<T> = Result<T, SourceError>;

/// Run a collaborator call under `timeout`, mapping expiry to
/// [`SourceError::Timeout`].
pub async fn with_timeout<T, F>(source_name: &str, timeout: Duration, call: F) -> SourceResult<T>
where
    F: Future<Output = SourceResult<T>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or_else(|_| {
            Err(SourceError::Timeout {
                source_name: source_name.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        })
}

/// Read access to the contract store.
#[async_trait]
pub trait ContractRepository: Send + Sync {
    /// Current attributes of a position.
    async fn position(&self, position_id: PositionId) -> SourceResult<PositionRef>;
}

/// Daily close history per instrument.
#[async_trait]
pub trait TimeSeriesPriceStore: Send + Sync {
    /// Closes between `from` and `to`, both inclusive.
    async fn history(
        &self,
        instrument: &InstrumentKey,
        from: NaiveDate,
        to: NaiveDate,
    ) -> SourceResult<PriceSeries>;
}

#[async_trait]
pub trait CapitalBaseProvider: Send + Sync {
    async fn net_asset_value(&self) -> SourceResult<Option<Decimal>>;
}

/// Bundle of collaborators handed to the service.
#[derive(Clone)]
pub struct Collaborators {
    pub contracts: Arc<dyn ContractRepository>,
    pub prices: Arc<dyn TimeSeriesPriceStore>,
    pub capital: Arc<dyn CapitalBaseProvider>,
}

#[derive(Debug, Default)]
pub struct InMemoryContractRepository {
    positions: DashMap<PositionId, PositionRef>,
}

impl InMemoryContractRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, position: PositionRef) {
        self.positions.insert(position.position_id, position);
    }
}

#[async_trait]
impl ContractRepository for InMemoryContractRepository {
    async fn position(&self, position_id: PositionId) -> SourceResult<PositionRef> {
        self.positions
            .get(&position_id)
            .map(|p| p.value().clone())
            .ok_or_else(|| SourceError::NotFound {
                source_name: "contracts".to_string(),
                key: position_id.to_string(),
            })
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPriceStore {
    series: DashMap<InstrumentKey, PriceSeries>,
    latency: RwLock<Option<Duration>>,
    calls: AtomicU64,
}

impl InMemoryPriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, instrument: InstrumentKey, series: PriceSeries) {
        self.series.insert(instrument, series);
    }

    /// Delay every lookup, for exercising source timeouts.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Number of history lookups served so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TimeSeriesPriceStore for InMemoryPriceStore {
    async fn history(
        &self,
        instrument: &InstrumentKey,
        from: NaiveDate,
        to: NaiveDate,
    ) -> SourceResult<PriceSeries> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let series = self.series.get(instrument).ok_or_else(|| SourceError::NotFound {
            source_name: "prices".to_string(),
            key: instrument.to_string(),
        })?;
        let points = series
            .points()
            .iter()
            .filter(|p| p.date >= from && p.date <= to)
            .cloned()
            .collect();
        Ok(PriceSeries::new(points))
    }
}

/// Capital base that never changes.
#[derive(Debug, Clone, Default)]
pub struct FixedCapitalBase {
    net_asset_value: Option<Decimal>,
}

impl FixedCapitalBase {
    pub fn new(net_asset_value: Option<Decimal>) -> Self {
        Self { net_asset_value }
    }
}

#[async_trait]
impl CapitalBaseProvider for FixedCapitalBase {
    async fn net_asset_value(&self) -> SourceResult<Option<Decimal>> {
        Ok(self.net_asset_value)
    }
}
