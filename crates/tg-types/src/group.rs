use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique trade group identifier
pub type TradeGroupId = Uuid;

/// Trading strategy a group represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyType {
    Directional,
    Hedge,
    Spread,
    Arbitrage,
}

/// Lifecycle status. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupStatus {
    Draft,
    Active,
    Closed,
}

impl GroupStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, GroupStatus::Closed)
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            GroupStatus::Draft => 0,
            GroupStatus::Active => 1,
            GroupStatus::Closed => 2,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => GroupStatus::Draft,
            1 => GroupStatus::Active,
            _ => GroupStatus::Closed,
        }
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GroupStatus::Draft => "Draft",
            GroupStatus::Active => "Active",
            GroupStatus::Closed => "Closed",
        };
        write!(f, "{}", s)
    }
}

/// Per-group P&L limits. Both are optional absolute currency amounts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_allowed_loss: Option<Decimal>,
    pub target_profit: Option<Decimal>,
}

impl RiskLimits {
    pub fn with_max_allowed_loss(mut self, loss: Decimal) -> Self {
        self.max_allowed_loss = Some(loss.abs());
        self
    }

    pub fn with_target_profit(mut self, profit: Decimal) -> Self {
        self.target_profit = Some(profit);
        self
    }
}

/// A named multi-leg strategy. Snapshots of this struct are handed out by the
/// registry; the registry owns the live state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeGroup {
    pub id: TradeGroupId,
    pub name: String,
    pub strategy_type: StrategyType,
    pub status: GroupStatus,
    pub risk_limits: RiskLimits,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl TradeGroup {
    pub fn new(name: String, strategy_type: StrategyType, risk_limits: RiskLimits) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            strategy_type,
            status: GroupStatus::Draft,
            risk_limits,
            version: 0,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_new_group_is_draft_at_version_zero() {
        let group = TradeGroup::new("Brent crack".into(), StrategyType::Spread, RiskLimits::default());
        assert_eq!(group.status, GroupStatus::Draft);
        assert_eq!(group.version, 0);
    }

    #[test]
    fn test_status_u8_roundtrip() {
        for status in [GroupStatus::Draft, GroupStatus::Active, GroupStatus::Closed] {
            assert_eq!(GroupStatus::from_u8(status.as_u8()), status);
        }
    }

    #[test]
    fn test_max_loss_stored_positive() {
        let limits = RiskLimits::default().with_max_allowed_loss(dec!(-50000));
        assert_eq!(limits.max_allowed_loss, Some(dec!(50000)));
    }
}
