//! Limit monitor: checks each fresh snapshot against its group's limits.
//!
//! [`LimitMonitor`] compares a [`RiskSnapshot`] with the group's
//! [`RiskLimits`] and emits [`RiskAlert`]s via a channel.

use crossbeam_channel::Sender;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tg_types::group::RiskLimits;
use tg_types::snapshot::RiskSnapshot;

use crate::alerts::{RiskAlert, RiskAlertKind, RiskSeverity};

/// Configuration for the limit monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitMonitorConfig {
    /// Fraction of the loss limit at which a *warning* fires (e.g. 0.80 = 80%).
    pub warning_threshold_pct: Decimal,
    /// Warn when 99% VaR reaches the loss budget.
    pub check_var_against_loss_budget: bool,
}

impl Default for LimitMonitorConfig {
    fn default() -> Self {
        Self {
            warning_threshold_pct: Decimal::new(80, 2), // 80%
            check_var_against_loss_budget: true,
        }
    }
}

/// Stateless limit checker shared by all groups.
pub struct LimitMonitor {
    config: LimitMonitorConfig,
    alert_tx: Sender<RiskAlert>,
}

impl LimitMonitor {
    pub fn new(config: LimitMonitorConfig, alert_tx: Sender<RiskAlert>) -> Self {
        Self { config, alert_tx }
    }

    /// Check `snap` against `limits`, emit and return the alerts raised.
    pub fn evaluate(&self, limits: &RiskLimits, snap: &RiskSnapshot) -> Vec<RiskAlert> {
        let mut alerts = Vec::new();

        if let Some(limit) = limits.max_allowed_loss {
            self.check_max_loss(snap, limit, &mut alerts);
            if self.config.check_var_against_loss_budget {
                self.check_var_budget(snap, limit, &mut alerts);
            }
        }
        if let Some(target) = limits.target_profit {
            self.check_target(snap, target, &mut alerts);
        }

        for alert in &alerts {
            self.emit(alert.clone());
        }
        alerts
    }

    fn check_max_loss(&self, snap: &RiskSnapshot, limit: Decimal, alerts: &mut Vec<RiskAlert>) {
        let loss = -snap.net_pnl; // positive when losing
        if loss <= Decimal::ZERO || limit <= Decimal::ZERO {
            return;
        }

        let kind = RiskAlertKind::MaxLossBreached {
            net_pnl: snap.net_pnl,
            limit,
        };
        if loss >= limit {
            alerts.push(RiskAlert::new(
                snap.trade_group_id,
                RiskSeverity::Critical,
                kind,
                format!("Unrealized loss {:.2} exceeds {:.2} limit", loss, limit),
            ));
        } else if loss >= limit * self.config.warning_threshold_pct {
            alerts.push(RiskAlert::new(
                snap.trade_group_id,
                RiskSeverity::Warning,
                kind,
                format!("Unrealized loss {:.2} approaching {:.2} limit", loss, limit),
            ));
        }
    }

    fn check_var_budget(&self, snap: &RiskSnapshot, limit: Decimal, alerts: &mut Vec<RiskAlert>) {
        if limit > Decimal::ZERO && snap.var_99 >= limit {
            alerts.push(RiskAlert::new(
                snap.trade_group_id,
                RiskSeverity::Warning,
                RiskAlertKind::VarExceedsLossBudget {
                    var_99: snap.var_99,
                    limit,
                },
                format!("VaR(99%) {:.2} reaches {:.2} loss budget", snap.var_99, limit),
            ));
        }
    }

    fn check_target(&self, snap: &RiskSnapshot, target: Decimal, alerts: &mut Vec<RiskAlert>) {
        if snap.net_pnl >= target {
            alerts.push(RiskAlert::new(
                snap.trade_group_id,
                RiskSeverity::Info,
                RiskAlertKind::TargetProfitReached {
                    net_pnl: snap.net_pnl,
                    target,
                },
                format!("Unrealized profit {:.2} reached {:.2} target", snap.net_pnl, target),
            ));
        }
    }

    fn emit(&self, alert: RiskAlert) {
        match alert.severity {
            RiskSeverity::Critical => warn!(group_id = %alert.trade_group_id, %alert.message, "RISK CRITICAL"),
            RiskSeverity::Warning => warn!(group_id = %alert.trade_group_id, %alert.message, "RISK WARNING"),
            RiskSeverity::Info => info!(group_id = %alert.trade_group_id, %alert.message, "RISK INFO"),
        }
        // Best-effort send; a dropped receiver is not an error.
        let _ = self.alert_tx.try_send(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn snapshot(net_pnl: Decimal, var_99: Decimal) -> RiskSnapshot {
        let mut snap = RiskSnapshot::empty(Uuid::new_v4(), 1);
        snap.net_pnl = net_pnl;
        snap.var_99 = var_99;
        snap.var_95 = var_99;
        snap
    }

    #[test]
    fn no_alerts_without_limits() {
        let (tx, rx) = unbounded();
        let monitor = LimitMonitor::new(LimitMonitorConfig::default(), tx);

        let alerts = monitor.evaluate(&RiskLimits::default(), &snapshot(dec!(-1_000_000), dec!(0)));

        assert!(alerts.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn max_loss_breach_is_critical() {
        let (tx, rx) = unbounded();
        let monitor = LimitMonitor::new(LimitMonitorConfig::default(), tx);
        let limits = RiskLimits::default().with_max_allowed_loss(dec!(50_000));

        monitor.evaluate(&limits, &snapshot(dec!(-60_000), dec!(0)));

        let alert = rx.try_recv().expect("expected max loss alert");
        assert_eq!(alert.severity, RiskSeverity::Critical);
        assert!(matches!(alert.kind, RiskAlertKind::MaxLossBreached { .. }));
    }

    #[test]
    fn approaching_max_loss_warns() {
        let (tx, rx) = unbounded();
        let monitor = LimitMonitor::new(LimitMonitorConfig::default(), tx);
        let limits = RiskLimits::default().with_max_allowed_loss(dec!(50_000));

        // 42k loss is 84% of the limit
        monitor.evaluate(&limits, &snapshot(dec!(-42_000), dec!(0)));

        let alert = rx.try_recv().expect("expected warning");
        assert_eq!(alert.severity, RiskSeverity::Warning);
    }

    #[test]
    fn var_over_budget_warns() {
        let (tx, _rx) = unbounded();
        let monitor = LimitMonitor::new(LimitMonitorConfig::default(), tx);
        let limits = RiskLimits::default().with_max_allowed_loss(dec!(10_000));

        let alerts = monitor.evaluate(&limits, &snapshot(dec!(0), dec!(12_000)));

        assert_eq!(alerts.len(), 1);
        assert!(matches!(alerts[0].kind, RiskAlertKind::VarExceedsLossBudget { .. }));
    }

    #[test]
    fn target_profit_is_informational() {
        let (tx, _rx) = unbounded();
        let monitor = LimitMonitor::new(LimitMonitorConfig::default(), tx);
        let limits = RiskLimits::default().with_target_profit(dec!(5_000));

        let alerts = monitor.evaluate(&limits, &snapshot(dec!(5_000), dec!(0)));

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, RiskSeverity::Info);
    }

    #[test]
    fn dropped_receiver_does_not_panic() {
        let (tx, rx) = unbounded();
        drop(rx);
        let monitor = LimitMonitor::new(LimitMonitorConfig::default(), tx);
        let limits = RiskLimits::default().with_max_allowed_loss(dec!(1));
        let alerts = monitor.evaluate(&limits, &snapshot(dec!(-2), dec!(0)));
        assert_eq!(alerts.len(), 1);
    }
}
