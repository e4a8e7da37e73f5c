//! Optimistic concurrency for trade-group versions.

use std::sync::atomic::{AtomicU64, Ordering};

use tg_types::errors::RegistryError;
use tg_types::group::TradeGroupId;

/// Per-group version stamp with compare-and-set.
///
/// Readers load the version without locking. A writer supplies the version
/// it last observed; exactly one writer can move the stamp from a given
/// value, the rest get [`RegistryError::VersionConflict`].
#[derive(Debug)]
pub struct ConcurrencyGuard {
    group_id: TradeGroupId,
    version: AtomicU64,
}

impl ConcurrencyGuard {
    pub fn new(group_id: TradeGroupId, initial: u64) -> Self {
        Self {
            group_id,
            version: AtomicU64::new(initial),
        }
    }

    pub fn current(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Verify `expected` without changing the stamp.
    pub fn check(&self, expected: u64) -> Result<u64, RegistryError> {
        let actual = self.current();
        if actual == expected {
            Ok(actual)
        } else {
            Err(self.conflict(expected, actual))
        }
    }

    /// Move the stamp from `expected` to `expected + 1`.
    pub fn advance(&self, expected: u64) -> Result<u64, RegistryError> {
        let next = expected + 1;
        self.version
            .compare_exchange(expected, next, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| next)
            .map_err(|actual| self.conflict(expected, actual))
    }

    fn conflict(&self, expected: u64, actual: u64) -> RegistryError {
        RegistryError::VersionConflict {
            group_id: self.group_id,
            expected,
            actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use uuid::Uuid;

    #[test]
    fn advance_requires_matching_version() {
        let guard = ConcurrencyGuard::new(Uuid::new_v4(), 0);
        assert_eq!(guard.advance(0).unwrap(), 1);

        let err = guard.advance(0).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::VersionConflict { expected: 0, actual: 1, .. }
        ));
        assert_eq!(guard.current(), 1);
        assert!(guard.check(1).is_ok());
    }

    #[test]
    fn concurrent_writers_with_same_expectation_one_wins() {
        let guard = Arc::new(ConcurrencyGuard::new(Uuid::new_v4(), 7));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = guard.clone();
                thread::spawn(move || guard.advance(7).is_ok())
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(guard.current(), 8);
    }
}
