//! Risk alert types and severity levels.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tg_types::group::TradeGroupId;

/// Severity of a risk alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskSeverity {
    /// Informational, e.g. a profit target was reached.
    Info,
    /// Approaching a limit.
    Warning,
    /// Limit breached; action required.
    Critical,
}

/// Discriminant for the kind of risk alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RiskAlertKind {
    /// Unrealized loss is at or beyond the group's maximum allowed loss.
    MaxLossBreached { net_pnl: Decimal, limit: Decimal },
    /// One-day 99% VaR would consume the whole loss budget.
    VarExceedsLossBudget { var_99: Decimal, limit: Decimal },
    /// Unrealized profit reached the group's target.
    TargetProfitReached { net_pnl: Decimal, target: Decimal },
}

/// A single risk alert emitted by the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAlert {
    pub id: Uuid,
    pub trade_group_id: TradeGroupId,
    pub timestamp: DateTime<Utc>,
    pub severity: RiskSeverity,
    pub kind: RiskAlertKind,
    pub message: String,
}

impl RiskAlert {
    pub fn new(
        trade_group_id: TradeGroupId,
        severity: RiskSeverity,
        kind: RiskAlertKind,
        message: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            trade_group_id,
            timestamp: Utc::now(),
            severity,
            kind,
            message,
        }
    }
}
