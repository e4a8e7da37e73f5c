//! Synchronous fan-out of invalidation events.

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tg_cache::coherence::{InvalidationSink, SinkOutcome};
use tg_types::events::InvalidationEvent;
use tg_types::group::TradeGroupId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered { sinks: usize, subsumed: usize },
    /// The group already saw this version or a later one.
    Duplicate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusStats {
    pub published: u64,
    pub duplicates: u64,
    pub deliveries: u64,
}

/// Delivers each event to every registered sink, at least once.
///
/// Sinks are held weakly so the bus never keeps a cache alive. Events are
/// gated per group on `triggering_version`, which makes redelivery a no-op.
#[derive(Default)]
pub struct InvalidationBus {
    sinks: RwLock<Vec<Weak<dyn InvalidationSink>>>,
    last_applied: DashMap<TradeGroupId, u64>,
    stats: RwLock<BusStats>,
}

impl InvalidationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: &Arc<dyn InvalidationSink>) {
        self.sinks.write().push(Arc::downgrade(sink));
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.read().iter().filter(|s| s.strong_count() > 0).count()
    }

    pub fn publish(&self, event: &InvalidationEvent) -> PublishOutcome {
        self.stats.write().published += 1;

        match self.last_applied.entry(event.trade_group_id) {
            Entry::Occupied(mut seen) => {
                if event.triggering_version <= *seen.get() {
                    self.stats.write().duplicates += 1;
                    debug!(
                        group_id = %event.trade_group_id,
                        version = event.triggering_version,
                        "duplicate invalidation discarded"
                    );
                    return PublishOutcome::Duplicate;
                }
                seen.insert(event.triggering_version);
            }
            Entry::Vacant(slot) => {
                slot.insert(event.triggering_version);
            }
        }

        let live: Vec<Arc<dyn InvalidationSink>> = {
            let mut sinks = self.sinks.write();
            sinks.retain(|s| s.strong_count() > 0);
            sinks.iter().filter_map(Weak::upgrade).collect()
        };

        let mut subsumed = 0;
        for sink in &live {
            if sink.apply(event) == SinkOutcome::Subsumed {
                subsumed += 1;
            }
        }
        self.stats.write().deliveries += live.len() as u64;

        PublishOutcome::Delivered {
            sinks: live.len(),
            subsumed,
        }
    }

    pub fn stats(&self) -> BusStats {
        self.stats.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tg_types::events::ChangeKind;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<u64>>,
    }

    impl InvalidationSink for RecordingSink {
        fn apply(&self, event: &InvalidationEvent) -> SinkOutcome {
            self.seen.lock().push(event.triggering_version);
            SinkOutcome::Applied
        }
    }

    fn event(group_id: TradeGroupId, version: u64) -> InvalidationEvent {
        InvalidationEvent::new(Uuid::new_v4(), group_id, ChangeKind::Assigned, version)
    }

    #[test]
    fn fans_out_and_discards_duplicates() {
        let bus = InvalidationBus::new();
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        bus.register(&(a.clone() as Arc<dyn InvalidationSink>));
        bus.register(&(b.clone() as Arc<dyn InvalidationSink>));

        let group_id = Uuid::new_v4();
        assert_eq!(
            bus.publish(&event(group_id, 1)),
            PublishOutcome::Delivered { sinks: 2, subsumed: 0 }
        );
        assert_eq!(bus.publish(&event(group_id, 1)), PublishOutcome::Duplicate);
        assert_eq!(bus.publish(&event(group_id, 2)), PublishOutcome::Delivered { sinks: 2, subsumed: 0 });

        assert_eq!(*a.seen.lock(), vec![1, 2]);
        assert_eq!(*b.seen.lock(), vec![1, 2]);
        assert_eq!(bus.stats().duplicates, 1);
    }

    #[test]
    fn out_of_order_event_is_discarded() {
        let bus = InvalidationBus::new();
        let sink = Arc::new(RecordingSink::default());
        bus.register(&(sink.clone() as Arc<dyn InvalidationSink>));
        let group_id = Uuid::new_v4();

        bus.publish(&event(group_id, 5));
        assert_eq!(bus.publish(&event(group_id, 4)), PublishOutcome::Duplicate);
        // other groups are independent
        assert!(matches!(
            bus.publish(&event(Uuid::new_v4(), 1)),
            PublishOutcome::Delivered { .. }
        ));
        assert_eq!(*sink.seen.lock(), vec![5, 1]);
    }

    #[test]
    fn dropped_sinks_are_pruned() {
        let bus = InvalidationBus::new();
        let sink: Arc<dyn InvalidationSink> = Arc::new(RecordingSink::default());
        bus.register(&sink);
        assert_eq!(bus.sink_count(), 1);

        drop(sink);
        assert_eq!(
            bus.publish(&event(Uuid::new_v4(), 1)),
            PublishOutcome::Delivered { sinks: 0, subsumed: 0 }
        );
        assert_eq!(bus.sink_count(), 0);
    }
}
