//! Historical-simulation risk computation.
//!
//! [`RiskSnapshotCalculator`] takes the positions of one trade group and the
//! price history of their instruments and produces a [`RiskSnapshot`]. It is
//! stateless and side-effect free; the only way it fails is cancellation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use chrono::NaiveDate;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tg_types::errors::ComputeError;
use tg_types::group::TradeGroupId;
use tg_types::market::{InstrumentKey, PriceSeries, ReturnBasis};
use tg_types::position::{MarketExposure, PositionRef};
use tg_types::snapshot::RiskSnapshot;

use crate::stress::{run_scenarios, StressScenario};

const Z_95: f64 = 1.644_853_626_951_472_2;
const Z_99: f64 = 2.326_347_874_040_840_8;

/// Calculator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalculatorConfig {
    /// Number of most recent aligned trading days used for simulation.
    pub window: usize,
    pub return_basis: ReturnBasis,
    /// Trading days per year used to annualise volatility and Sharpe.
    pub annualization_days: u32,
    /// Minimum number of price points for an instrument to contribute.
    pub min_history_points: usize,
    pub stress_scenarios: Vec<StressScenario>,
    /// Decay factor of the EWMA volatility behind parametric VaR.
    pub ewma_lambda: f64,
    /// Draws for Monte-Carlo VaR. Zero turns it off.
    pub monte_carlo_simulations: usize,
    pub monte_carlo_seed: u64,
}

impl Default for CalculatorConfig {
    fn default() -> Self {
        Self {
            window: 250,
            return_basis: ReturnBasis::Relative,
            annualization_days: 252,
            min_history_points: 2,
            stress_scenarios: StressScenario::standard_set(),
            ewma_lambda: 0.94,
            monte_carlo_simulations: 10_000,
            monte_carlo_seed: 42,
        }
    }
}

/// Cancellation and deadline for a single computation.
#[derive(Debug, Clone)]
pub struct ComputeControl {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl ComputeControl {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Control that is never cancelled and has no deadline.
    pub fn unbounded() -> Self {
        Self::new(CancellationToken::new())
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fails if the computation should stop.
    pub fn checkpoint(&self) -> Result<(), ComputeError> {
        if self.cancel.is_cancelled() {
            return Err(ComputeError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(ComputeError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

/// Everything a computation reads.
#[derive(Debug, Clone, Copy)]
pub struct RiskInputs<'a> {
    pub positions: &'a [PositionRef],
    pub history: &'a HashMap<InstrumentKey, PriceSeries>,
    pub benchmark: Option<&'a PriceSeries>,
    /// Capital base for leverage. `None` when the provider did not answer.
    pub net_asset_value: Option<Decimal>,
}

/// Stateless calculator for trade-group risk snapshots.
#[derive(Debug, Clone, Default)]
pub struct RiskSnapshotCalculator {
    config: CalculatorConfig,
}

impl RiskSnapshotCalculator {
    pub fn new(config: CalculatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CalculatorConfig {
        &self.config
    }

    /// Compute a full risk snapshot for `group_id` at `as_of_version`.
    pub fn compute(
        &self,
        group_id: TradeGroupId,
        as_of_version: u64,
        inputs: &RiskInputs<'_>,
        control: &ComputeControl,
    ) -> Result<RiskSnapshot, ComputeError> {
        control.checkpoint()?;

        let mut snap = RiskSnapshot::empty(group_id, as_of_version);
        if inputs.positions.is_empty() {
            return Ok(snap);
        }

        // --- exposure ---
        let exposures: Vec<MarketExposure> =
            inputs.positions.iter().map(PositionRef::market_exposure).collect();
        let total_value: Decimal = exposures.iter().map(|e| e.notional().abs()).sum();

        snap.position_count = inputs.positions.len();
        snap.net_pnl = inputs.positions.iter().map(PositionRef::unrealized_pnl).sum();
        snap.total_value = total_value;
        snap.concentration_risk = Self::concentration(&exposures, total_value);
        snap.leverage_ratio = Self::leverage(total_value, inputs.net_asset_value);
        snap.stress_results = run_scenarios(&self.config.stress_scenarios, &exposures);

        // --- historical simulation ---
        let mut contributing = Vec::with_capacity(exposures.len());
        for exposure in &exposures {
            match inputs.history.get(&exposure.instrument) {
                Some(series) if series.len() >= self.config.min_history_points.max(2) => {
                    contributing.push((exposure, series));
                }
                _ => {
                    debug!(instrument = %exposure.instrument, "instrument excluded: insufficient price history");
                    snap.data_insufficient = true;
                }
            }
        }

        control.checkpoint()?;

        // Fan out: one P&L series per position, keyed by trading day.
        let basis = self.config.return_basis;
        let per_position: Vec<BTreeMap<NaiveDate, Decimal>> = contributing
            .par_iter()
            .map(|(exposure, series)| Self::position_pnl_series(exposure, series, basis))
            .collect();

        control.checkpoint()?;

        let days = Self::aligned_days(&per_position, self.config.window);
        if days.is_empty() {
            snap.data_insufficient = true;
            return Ok(snap);
        }

        // Fan in per day bucket.
        let daily_pnl: Vec<Decimal> = days
            .par_iter()
            .map(|day| {
                per_position
                    .iter()
                    .map(|series| series.get(day).copied().unwrap_or_default())
                    .sum::<Decimal>()
            })
            .collect();

        control.checkpoint()?;

        let mut sorted = daily_pnl.clone();
        sorted.sort();

        snap.observations = daily_pnl.len();
        snap.var_95 = historical_var(&sorted, Decimal::new(95, 2));
        snap.var_99 = historical_var(&sorted, Decimal::new(99, 2));
        snap.expected_shortfall_95 = expected_shortfall(&sorted, Decimal::new(95, 2));

        let pnl = to_f64_vec(&daily_pnl);
        let ewma_std = ewma_std(&pnl, self.config.ewma_lambda);
        snap.parametric_var_95 = from_f64(Z_95 * ewma_std);
        snap.parametric_var_99 = from_f64(Z_99 * ewma_std);

        control.checkpoint()?;
        if let Some((var_95, var_99)) = self.monte_carlo_var(&pnl) {
            snap.monte_carlo_var_95 = var_95;
            snap.monte_carlo_var_99 = var_99;
        }

        snap.sharpe_ratio = self.sharpe(&daily_pnl);
        snap.max_drawdown = Self::max_drawdown(&daily_pnl);

        let portfolio_returns: BTreeMap<NaiveDate, Decimal> = if total_value > Decimal::ZERO {
            days.iter()
                .zip(&daily_pnl)
                .map(|(day, pnl)| (*day, *pnl / total_value))
                .collect()
        } else {
            BTreeMap::new()
        };
        snap.volatility = self.volatility(&portfolio_returns);
        snap.beta = Self::beta(&portfolio_returns, inputs.benchmark);

        Ok(snap)
    }

    /// Simulate daily P&L from a normal with the sample mean and stdev of
    /// `pnl` and take the loss quantiles of the draws.
    fn monte_carlo_var(&self, pnl: &[f64]) -> Option<(Decimal, Decimal)> {
        let n = self.config.monte_carlo_simulations;
        let std = sample_std(pnl)?;
        if n == 0 {
            return None;
        }
        let mu = mean(pnl);

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.monte_carlo_seed);
        let mut draws: Vec<f64> = (0..n).map(|_| mu + std * standard_normal(&mut rng)).collect();
        draws.sort_by(f64::total_cmp);

        let var = |alpha: Decimal| {
            let k = tail_count(alpha, draws.len());
            from_f64((-draws[k - 1]).max(0.0))
        };
        Some((var(Decimal::new(95, 2)), var(Decimal::new(99, 2))))
    }

    /// Hypothetical daily P&L of one position: today's position replayed
    /// through each historical day's price move.
    fn position_pnl_series(
        exposure: &MarketExposure,
        series: &PriceSeries,
        basis: ReturnBasis,
    ) -> BTreeMap<NaiveDate, Decimal> {
        series
            .daily_moves(basis)
            .into_iter()
            .map(|(day, mv)| {
                let pnl = match basis {
                    ReturnBasis::Relative => exposure.signed_quantity * exposure.reference_price * mv,
                    ReturnBasis::Absolute => exposure.signed_quantity * mv,
                };
                (day, pnl)
            })
            .collect()
    }

    /// Trading days present in every series, most recent `window` of them.
    fn aligned_days(series: &[BTreeMap<NaiveDate, Decimal>], window: usize) -> Vec<NaiveDate> {
        let Some((first, rest)) = series.split_first() else {
            return Vec::new();
        };
        let mut common: BTreeSet<NaiveDate> = first.keys().copied().collect();
        for s in rest {
            common.retain(|day| s.contains_key(day));
        }
        let skip = common.len().saturating_sub(window);
        common.into_iter().skip(skip).collect()
    }

    /// Herfindahl index of absolute exposure shares, scaled to 0-100.
    fn concentration(exposures: &[MarketExposure], total_value: Decimal) -> Decimal {
        if total_value.is_zero() {
            return Decimal::ZERO;
        }
        let hhi: Decimal = exposures
            .iter()
            .map(|e| {
                let share = e.notional().abs() / total_value;
                share * share
            })
            .sum();
        (hhi * Decimal::ONE_HUNDRED)
            .round_dp(10)
            .clamp(Decimal::ZERO, Decimal::ONE_HUNDRED)
    }

    fn leverage(total_value: Decimal, net_asset_value: Option<Decimal>) -> Decimal {
        match net_asset_value {
            Some(nav) if nav > Decimal::ZERO => total_value / nav,
            _ => Decimal::ZERO,
        }
    }

    fn sharpe(&self, daily_pnl: &[Decimal]) -> Decimal {
        let values = to_f64_vec(daily_pnl);
        match sample_std(&values) {
            Some(std) if std > 0.0 => {
                let annualization = f64::from(self.config.annualization_days).sqrt();
                from_f64(mean(&values) / std * annualization)
            }
            _ => Decimal::ZERO,
        }
    }

    fn volatility(&self, portfolio_returns: &BTreeMap<NaiveDate, Decimal>) -> Decimal {
        let values: Vec<f64> = portfolio_returns.values().filter_map(|r| r.to_f64()).collect();
        match sample_std(&values) {
            Some(std) => from_f64(std * f64::from(self.config.annualization_days).sqrt()),
            None => Decimal::ZERO,
        }
    }

    /// Largest decline of cumulative P&L from a positive running peak.
    fn max_drawdown(daily_pnl: &[Decimal]) -> Decimal {
        let mut cumulative = Decimal::ZERO;
        let mut peak = Decimal::ZERO;
        let mut max_dd = Decimal::ZERO;

        for pnl in daily_pnl {
            cumulative += *pnl;
            if cumulative > peak {
                peak = cumulative;
            }
            if peak > Decimal::ZERO {
                let dd = (peak - cumulative) / peak;
                if dd > max_dd {
                    max_dd = dd;
                }
            }
        }

        max_dd
    }

    fn beta(
        portfolio_returns: &BTreeMap<NaiveDate, Decimal>,
        benchmark: Option<&PriceSeries>,
    ) -> Decimal {
        let Some(benchmark) = benchmark else {
            return Decimal::ZERO;
        };
        let bench_returns = benchmark.daily_moves(ReturnBasis::Relative);

        let (port, bench): (Vec<f64>, Vec<f64>) = portfolio_returns
            .iter()
            .filter_map(|(day, r)| {
                let b = bench_returns.get(day)?;
                Some((r.to_f64()?, b.to_f64()?))
            })
            .unzip();

        if port.len() < 2 {
            return Decimal::ZERO;
        }

        let (mean_p, mean_b) = (mean(&port), mean(&bench));
        let n = (port.len() - 1) as f64;
        let cov = port
            .iter()
            .zip(&bench)
            .map(|(p, b)| (p - mean_p) * (b - mean_b))
            .sum::<f64>()
            / n;
        let var = bench.iter().map(|b| (b - mean_b).powi(2)).sum::<f64>() / n;

        if var > 0.0 {
            from_f64(cov / var)
        } else {
            Decimal::ZERO
        }
    }
}

/// `k = ceil((1 - alpha) * n)`, clamped to `[1, n]`.
fn tail_count(alpha: Decimal, n: usize) -> usize {
    let k = ((Decimal::ONE - alpha) * Decimal::from(n)).ceil();
    k.to_usize().unwrap_or(1).clamp(1, n)
}

/// Historical VaR at confidence `alpha` from P&L sorted ascending, reported
/// as a non-negative loss.
pub fn historical_var(sorted_pnl: &[Decimal], alpha: Decimal) -> Decimal {
    if sorted_pnl.is_empty() {
        return Decimal::ZERO;
    }
    let k = tail_count(alpha, sorted_pnl.len());
    (-sorted_pnl[k - 1]).max(Decimal::ZERO)
}

/// Mean of the `k` worst outcomes, reported as a non-negative loss.
pub fn expected_shortfall(sorted_pnl: &[Decimal], alpha: Decimal) -> Decimal {
    if sorted_pnl.is_empty() {
        return Decimal::ZERO;
    }
    let k = tail_count(alpha, sorted_pnl.len());
    let tail: Decimal = sorted_pnl[..k].iter().copied().sum();
    (-(tail / Decimal::from(k))).max(Decimal::ZERO)
}

/// Exponentially weighted stdev around zero. `values` run oldest to
/// newest; the newest gets weight `1 - lambda`, each older one `lambda`
/// times the next, and the weights are normalised.
fn ewma_std(values: &[f64], lambda: f64) -> f64 {
    let mut weight = 1.0 - lambda;
    let mut total_weight = 0.0;
    let mut variance = 0.0;
    for v in values.iter().rev() {
        variance += weight * v * v;
        total_weight += weight;
        weight *= lambda;
    }
    if total_weight > 0.0 {
        (variance / total_weight).sqrt()
    } else {
        0.0
    }
}

/// Box-Muller transform over two uniform draws.
fn standard_normal<R: Rng>(rng: &mut R) -> f64 {
    // gen() is in [0, 1); keep u1 away from zero for ln
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn to_f64_vec(values: &[Decimal]) -> Vec<f64> {
    values.iter().filter_map(|v| v.to_f64()).collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

fn from_f64(value: f64) -> Decimal {
    if !value.is_finite() {
        return Decimal::ZERO;
    }
    Decimal::from_f64_retain(value)
        .unwrap_or_default()
        .round_dp(10)
}
