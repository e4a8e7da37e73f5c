//! Seams between the cache and the component that owns group versions.

use tg_types::events::InvalidationEvent;
use tg_types::group::TradeGroupId;
use tg_types::position::PositionId;

/// Read-only view of group versions and position ownership.
pub trait GroupDirectory: Send + Sync {
    /// Current version of the group, `None` if unknown.
    fn current_version(&self, group_id: TradeGroupId) -> Option<u64>;

    /// Group currently holding the position in the reverse index.
    fn owner_of(&self, position_id: PositionId) -> Option<TradeGroupId>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    Applied,
    /// The cached entry already reflects the event's version.
    Subsumed,
}

/// Receiver of invalidation events fanned out by the bus.
pub trait InvalidationSink: Send + Sync {
    fn apply(&self, event: &InvalidationEvent) -> SinkOutcome;
}
