use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::group::TradeGroupId;

/// P&L impact of one deterministic price-shock scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressResult {
    pub scenario: String,
    /// Shock applied to every mark, as a fraction (-0.10 = ten percent down).
    pub shock: Decimal,
    pub pnl_impact: Decimal,
    pub description: String,
}

/// Portfolio risk statistics for one trade group at one version.
///
/// Immutable once produced; a newer snapshot supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub trade_group_id: TradeGroupId,
    /// Registry version of the group the inputs were read at.
    pub as_of_version: u64,

    // --- VaR / tail (positive currency amounts) ---
    pub var_95: Decimal,
    pub var_99: Decimal,
    pub expected_shortfall_95: Decimal,
    /// Normal VaR scaled by the EWMA volatility of daily P&L.
    pub parametric_var_95: Decimal,
    pub parametric_var_99: Decimal,
    /// VaR of a seeded simulation from a normal fitted to daily P&L.
    pub monte_carlo_var_95: Decimal,
    pub monte_carlo_var_99: Decimal,

    // --- performance ---
    /// Annualised mean / stdev of daily P&L.
    pub sharpe_ratio: Decimal,
    /// Peak-to-trough decline of cumulative P&L as a fraction of the peak.
    pub max_drawdown: Decimal,
    /// Annualised stdev of daily portfolio returns.
    pub volatility: Decimal,
    pub beta: Decimal,

    // --- exposure ---
    /// Herfindahl index of exposure shares, 0-100.
    pub concentration_risk: Decimal,
    pub leverage_ratio: Decimal,
    pub net_pnl: Decimal,
    pub total_value: Decimal,

    pub data_insufficient: bool,
    /// Number of aligned trading days that fed the historical simulation.
    pub observations: usize,
    pub position_count: usize,
    pub stress_results: Vec<StressResult>,
    pub computed_at: DateTime<Utc>,
}

impl RiskSnapshot {
    /// Snapshot with every metric at zero.
    pub fn empty(trade_group_id: TradeGroupId, as_of_version: u64) -> Self {
        Self {
            trade_group_id,
            as_of_version,
            var_95: Decimal::ZERO,
            var_99: Decimal::ZERO,
            expected_shortfall_95: Decimal::ZERO,
            parametric_var_95: Decimal::ZERO,
            parametric_var_99: Decimal::ZERO,
            monte_carlo_var_95: Decimal::ZERO,
            monte_carlo_var_99: Decimal::ZERO,
            sharpe_ratio: Decimal::ZERO,
            max_drawdown: Decimal::ZERO,
            volatility: Decimal::ZERO,
            beta: Decimal::ZERO,
            concentration_risk: Decimal::ZERO,
            leverage_ratio: Decimal::ZERO,
            net_pnl: Decimal::ZERO,
            total_value: Decimal::ZERO,
            data_insufficient: false,
            observations: 0,
            position_count: 0,
            stress_results: Vec::new(),
            computed_at: Utc::now(),
        }
    }
}
