//! Engine configuration.
//!
//! Loaded from a JSON file and/or `TG_RISK_*` environment variables. Every
//! section has defaults, so an empty `{}` is a valid file.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tg_cache::CacheConfig;
use tg_risk::{CalculatorConfig, LimitMonitorConfig};
use tg_types::errors::{TgError, TgResult};
use tg_types::market::ReturnBasis;
use tg_types::config_error;

use crate::warmer::WarmerConfig;

/// Environment variable naming a JSON config file.
pub const CONFIG_PATH_ENV: &str = "TG_RISK_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub calculator: CalculatorConfig,
    pub cache: CacheConfig,
    pub monitor: LimitMonitorConfig,
    pub warmer: WarmerConfig,
    /// Per-call timeout for price history and capital base lookups.
    pub source_timeout_ms: u64,
    /// Calendar days of price history requested per instrument.
    pub history_lookback_days: i64,
    /// Upper bound on one recomputation, inputs included.
    pub compute_deadline_ms: u64,
    /// Instrument used for beta, if any.
    pub benchmark: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            calculator: CalculatorConfig::default(),
            cache: CacheConfig::default(),
            monitor: LimitMonitorConfig::default(),
            warmer: WarmerConfig::default(),
            source_timeout_ms: 300,
            history_lookback_days: 400,
            compute_deadline_ms: 5_000,
            benchmark: None,
        }
    }
}

impl EngineConfig {
    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    pub fn compute_deadline(&self) -> Duration {
        Duration::from_millis(self.compute_deadline_ms)
    }

    pub fn from_json_str(json: &str) -> TgResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> TgResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// File named by `TG_RISK_CONFIG` (or defaults), then environment overrides.
    pub fn load() -> TgResult<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TG_RISK_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> TgResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TG_RISK_WINDOW") {
            self.calculator.window = parse("TG_RISK_WINDOW", &v)?;
        }
        if let Some(v) = lookup("TG_RISK_RETURN_BASIS") {
            self.calculator.return_basis = match v.to_ascii_lowercase().as_str() {
                "relative" => ReturnBasis::Relative,
                "absolute" => ReturnBasis::Absolute,
                other => return Err(config_error!("TG_RISK_RETURN_BASIS: unknown basis '{}'", other)),
            };
        }
        if let Some(v) = lookup("TG_RISK_CACHE_CAPACITY") {
            self.cache.local_capacity = parse("TG_RISK_CACHE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("TG_RISK_CACHE_TTL_SECS") {
            self.cache.ttl_secs = parse("TG_RISK_CACHE_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("TG_RISK_SHARED_TIMEOUT_MS") {
            self.cache.shared_timeout_ms = parse("TG_RISK_SHARED_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("TG_RISK_STALENESS_WINDOW_MS") {
            self.cache.staleness_window_ms = parse("TG_RISK_STALENESS_WINDOW_MS", &v)?;
        }
        if let Some(v) = lookup("TG_RISK_SOURCE_TIMEOUT_MS") {
            self.source_timeout_ms = parse("TG_RISK_SOURCE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("TG_RISK_LOOKBACK_DAYS") {
            self.history_lookback_days = parse("TG_RISK_LOOKBACK_DAYS", &v)?;
        }
        if let Some(v) = lookup("TG_RISK_WARMER_INTERVAL_SECS") {
            self.warmer.interval_secs = parse("TG_RISK_WARMER_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("TG_RISK_BENCHMARK") {
            self.benchmark = (!v.trim().is_empty()).then(|| v.trim().to_string());
        }
        Ok(())
    }

    pub fn validate(&self) -> TgResult<()> {
        if self.calculator.window < 2 {
            return Err(config_error!("calculator.window must be at least 2, got {}", self.calculator.window));
        }
        if self.calculator.annualization_days == 0 {
            return Err(config_error!("calculator.annualization_days must be positive"));
        }
        if !(self.calculator.ewma_lambda > 0.0 && self.calculator.ewma_lambda < 1.0) {
            return Err(config_error!(
                "calculator.ewma_lambda must be in (0, 1), got {}",
                self.calculator.ewma_lambda
            ));
        }
        if self.cache.local_capacity == 0 {
            return Err(config_error!("cache.local_capacity must be positive"));
        }
        if self.cache.ttl_secs == 0 {
            return Err(config_error!("cache.ttl_secs must be positive"));
        }
        if self.history_lookback_days <= 0 {
            return Err(config_error!(
                "history_lookback_days must be positive, got {}",
                self.history_lookback_days
            ));
        }
        if self.monitor.warning_threshold_pct <= rust_decimal::Decimal::ZERO
            || self.monitor.warning_threshold_pct > rust_decimal::Decimal::ONE
        {
            return Err(config_error!(
                "monitor.warning_threshold_pct must be in (0, 1], got {}",
                self.monitor.warning_threshold_pct
            ));
        }
        if self.warmer.interval_secs == 0 {
            return Err(config_error!("warmer.interval_secs must be positive"));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> TgResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| TgError::Config(format!("{key}: invalid value '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert_ok!(config.validate());
        assert_eq!(config.calculator.window, 250);
        assert_eq!(config.cache.ttl(), Duration::from_secs(300));
        assert_eq!(config.cache.shared_timeout(), Duration::from_millis(50));
        assert_eq!(config.source_timeout(), Duration::from_millis(300));
        assert_eq!(config.history_lookback_days, 400);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "calculator": { "window": 60 }, "cache": { "ttl_secs": 30 }, "benchmark": "BRENT" }"#,
        )
        .unwrap();
        assert_eq!(config.calculator.window, 60);
        assert_eq!(config.calculator.annualization_days, 252);
        assert_eq!(config.cache.ttl_secs, 30);
        assert_eq!(config.cache.local_capacity, 1024);
        assert_eq!(config.benchmark.as_deref(), Some("BRENT"));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("TG_RISK_WINDOW", "120"),
            ("TG_RISK_RETURN_BASIS", "Absolute"),
            ("TG_RISK_SHARED_TIMEOUT_MS", "25"),
            ("TG_RISK_BENCHMARK", "WTI"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.calculator.window, 120);
        assert_eq!(config.calculator.return_basis, ReturnBasis::Absolute);
        assert_eq!(config.cache.shared_timeout_ms, 25);
        assert_eq!(config.benchmark.as_deref(), Some("WTI"));
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let mut config = EngineConfig::default();
        let err = assert_err!(config.apply_overrides(|k| (k == "TG_RISK_WINDOW").then(|| "many".to_string())));
        assert!(matches!(err, TgError::Config(_)));

        let err = EngineConfig::from_json_str(r#"{ "calculator": { "window": 1 } }"#).unwrap_err();
        assert!(matches!(err, TgError::Config(_)));

        let err = EngineConfig::from_json_str(r#"{ "calculator": { "ewma_lambda": 1.0 } }"#).unwrap_err();
        assert!(matches!(err, TgError::Config(_)));

        let err = EngineConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, TgError::Serialization(_)));
    }
}
