use thiserror::Error;

use crate::group::{GroupStatus, TradeGroupId};
use crate::position::PositionId;

/// Main error type for the trade-group risk engine
#[derive(Error, Debug)]
pub enum TgError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Computation error: {0}")]
    Compute(#[from] ComputeError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Structural and business errors raised by the position-link registry.
///
/// These are returned to the caller as-is and never retried by the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Trade group not found: {group_id}")]
    GroupNotFound { group_id: TradeGroupId },

    #[error("Position {position_id} is not a member of trade group {group_id}")]
    PositionNotFound {
        group_id: TradeGroupId,
        position_id: PositionId,
    },

    #[error("Trade group {group_id} is {status} and rejects this operation")]
    InvalidState {
        group_id: TradeGroupId,
        status: GroupStatus,
    },

    #[error("Position {position_id} is already assigned to active trade group {owner}")]
    PositionAlreadyAssigned {
        position_id: PositionId,
        owner: TradeGroupId,
    },

    #[error("Version conflict on trade group {group_id}: expected {expected}, found {actual}")]
    VersionConflict {
        group_id: TradeGroupId,
        expected: u64,
        actual: u64,
    },

    #[error("Trade group {group_id} is closed and has no frozen snapshot")]
    SnapshotUnavailable { group_id: TradeGroupId },
}

/// Transient failures of the shared cache tier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Shared cache tier unavailable: {message}")]
    Unavailable { message: String },

    #[error("Shared cache tier timed out after {timeout_ms} ms during {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Cache entry serialization failed: {message}")]
    Serialization { message: String },
}

/// Errors that abort a risk computation. Partial results are discarded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComputeError {
    #[error("Risk computation cancelled")]
    Cancelled,

    #[error("Risk computation exceeded its deadline")]
    DeadlineExceeded,

    #[error("Risk computation task failed: {message}")]
    TaskFailed { message: String },
}

/// Failures reported by external collaborators (contract store, price store,
/// capital base provider).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Record not found in {source_name}: {key}")]
    NotFound { source_name: String, key: String },

    #[error("{source_name} timed out after {timeout_ms} ms")]
    Timeout { source_name: String, timeout_ms: u64 },

    #[error("{source_name} unavailable: {message}")]
    Unavailable { source_name: String, message: String },
}

/// Result type alias for engine operations
pub type TgResult<T> = Result<T, TgError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TgError::Config(format!($($arg)*))
    };
}
