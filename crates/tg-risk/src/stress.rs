//! Deterministic price-shock scenarios.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use tg_types::position::MarketExposure;
use tg_types::snapshot::StressResult;

/// A uniform shock applied to every reference price in the portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressScenario {
    pub name: String,
    /// Fractional move, e.g. `-0.10` for a ten percent decline.
    pub shock: Decimal,
    pub description: String,
}

impl StressScenario {
    pub fn new(name: &str, shock: Decimal, description: &str) -> Self {
        Self {
            name: name.to_string(),
            shock,
            description: description.to_string(),
        }
    }

    /// The desk's standard scenario set.
    pub fn standard_set() -> Vec<Self> {
        vec![
            Self::new(
                "-10% Shock",
                Decimal::new(-10, 2),
                "10% decline in all oil and fuel prices",
            ),
            Self::new(
                "+10% Shock",
                Decimal::new(10, 2),
                "10% increase in all oil and fuel prices",
            ),
            Self::new(
                "Historical Worst",
                Decimal::new(-15, 2),
                "Repeat of historical worst daily oil price decline",
            ),
        ]
    }

    pub fn impact(&self, exposures: &[MarketExposure]) -> Decimal {
        exposures.iter().map(|e| e.notional() * self.shock).sum()
    }
}

/// Apply each scenario to the portfolio's exposures.
pub fn run_scenarios(scenarios: &[StressScenario], exposures: &[MarketExposure]) -> Vec<StressResult> {
    scenarios
        .iter()
        .map(|s| StressResult {
            scenario: s.name.clone(),
            shock: s.shock,
            pnl_impact: s.impact(exposures),
            description: s.description.clone(),
        })
        .collect()
}
