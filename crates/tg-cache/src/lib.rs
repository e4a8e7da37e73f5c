//! Two-tier cache for trade-group risk snapshots.
//!
//! A bounded local tier answers most reads; an optional shared tier keeps
//! processes coherent. Entries carry the group version they were computed
//! at, so freshness is a version comparison rather than a clock check.

pub mod breaker;
pub mod cache;
pub mod coherence;
pub mod local;
pub mod shared;

pub use breaker::{BreakerState, CircuitBreaker};
pub use cache::{
    AggregationCache, CacheConfig, CacheHealth, CacheLookup, CacheStats, CacheWrite, LookupStatus,
};
pub use coherence::{GroupDirectory, InvalidationSink, SinkOutcome};
pub use shared::{InMemorySharedTier, SharedEntry, SharedTier, SharedWrite};
