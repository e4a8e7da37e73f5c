//! Risk computation for trade groups.
//!
//! Provides:
//! - Historical-simulation VaR / expected shortfall, volatility, Sharpe,
//!   drawdown, beta, concentration and leverage ([`RiskSnapshotCalculator`])
//! - Deterministic price-shock scenarios
//! - Per-group loss / profit limit checks with alert emission via channels

pub mod alerts;
pub mod calculator;
pub mod monitor;
pub mod stress;

pub use alerts::{RiskAlert, RiskAlertKind, RiskSeverity};
pub use calculator::{
    expected_shortfall, historical_var, CalculatorConfig, ComputeControl, RiskInputs,
    RiskSnapshotCalculator,
};
pub use monitor::{LimitMonitor, LimitMonitorConfig};
pub use stress::{run_scenarios, StressScenario};
