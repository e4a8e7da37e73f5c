use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::group::TradeGroupId;
use crate::position::PositionId;

/// What happened to the position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Assigned,
    Unassigned,
    Repriced,
    Amended,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Assigned => "assigned",
            ChangeKind::Unassigned => "unassigned",
            ChangeKind::Repriced => "repriced",
            ChangeKind::Amended => "amended",
        };
        write!(f, "{}", s)
    }
}

/// Published whenever a group's membership or a member's attributes change.
///
/// Carries the group id because an unassigned position is no longer
/// resolvable through the reverse index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub position_id: PositionId,
    pub trade_group_id: TradeGroupId,
    pub change_kind: ChangeKind,
    /// Group version produced by the mutation.
    pub triggering_version: u64,
    pub timestamp: DateTime<Utc>,
}

impl InvalidationEvent {
    pub fn new(
        position_id: PositionId,
        trade_group_id: TradeGroupId,
        change_kind: ChangeKind,
        triggering_version: u64,
    ) -> Self {
        Self {
            position_id,
            trade_group_id,
            change_kind,
            triggering_version,
            timestamp: Utc::now(),
        }
    }
}
