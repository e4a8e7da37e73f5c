// Trade-group risk engine
// Registry, invalidation fan-out and the risk service built on top of them

pub mod bus;
pub mod config;
pub mod guard;
pub mod registry;
pub mod service;
pub mod sources;
pub mod warmer;

pub use bus::{BusStats, InvalidationBus, PublishOutcome};
pub use config::EngineConfig;
pub use guard::ConcurrencyGuard;
pub use registry::{GroupView, PositionLinkRegistry, RegistryResult};
pub use service::{Freshness, RiskRead, RiskService, SnapshotCallback, SubscriptionId};
pub use sources::{
    CapitalBaseProvider, Collaborators, ContractRepository, FixedCapitalBase, InMemoryContractRepository,
    InMemoryPriceStore, TimeSeriesPriceStore,
};
pub use warmer::{CacheWarmer, WarmerConfig, WarmerHandle};
