use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

/// Declarative risk limits, each a fraction of bankroll.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_risk_per_trade: f64,
    pub max_daily_loss: f64,
    pub max_net_exposure: f64,
}

/// Why a trade was refused by the risk gate. Refusals have no side effects.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum RiskReject {
    #[error("kill switch active: {0}")]
    KillSwitch(String),
    #[error("trade cost {cost:.4} exceeds per-trade limit {limit:.4}")]
    PerTradeLimit { cost: f64, limit: f64 },
    #[error("daily loss limit: pnl {daily_pnl:.4} - cost {cost:.4} breaches {limit:.4}")]
    DailyLoss { daily_pnl: f64, cost: f64, limit: f64 },
    #[error("net exposure {exposure:.4} + cost {cost:.4} exceeds limit {limit:.4}")]
    NetExposure { exposure: f64, cost: f64, limit: f64 },
}

/// Serializable view of the risk state, persisted on every update.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub bankroll: f64,
    pub daily_pnl: f64,
    pub current_exposure: f64,
    pub kill_switch: Option<String>,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug)]
struct RiskState {
    bankroll: f64,
    bankroll_at_day_start: f64,
    daily_pnl: f64,
    current_exposure: f64,
    last_sync: Option<Instant>,
    last_reset_date: NaiveDate,
    kill_switch: Option<String>,
}

/// Process-wide risk authority. Every operation runs under one mutex so
/// callers observe a linear history; the lock is held only around the
/// in-memory check-and-update, never across I/O.
pub struct RiskManager {
    limits: RiskLimits,
    state: Mutex<RiskState>,
}

impl RiskManager {
    /// `bankroll` comes from the venue-of-record balance at startup.
    pub fn new(limits: RiskLimits, bankroll: f64) -> Self {
        Self {
            limits,
            state: Mutex::new(RiskState {
                bankroll,
                bankroll_at_day_start: bankroll,
                daily_pnl: 0.0,
                current_exposure: 0.0,
                last_sync: Some(Instant::now()),
                last_reset_date: Local::now().date_naive(),
                kill_switch: None,
            }),
        }
    }

    pub fn limits(&self) -> RiskLimits {
        self.limits
    }

    /// Restore today's running totals (e.g. after a restart mid-day).
    pub fn restore(&self, daily_pnl: f64, current_exposure: f64) {
        let mut s = self.state.lock().expect("risk state poisoned");
        s.daily_pnl = daily_pnl;
        s.current_exposure = current_exposure.max(0.0);
        info!(target: "risk", daily_pnl, current_exposure, "risk state restored");
    }

    /// Gate a prospective trade of total cost `cost` (both legs plus fees).
    ///
    /// Runs the daily-reset check first so every gate decision is causal
    /// after a midnight rollover.
    pub fn can_execute(&self, cost: f64) -> Result<(), RiskReject> {
        self.can_execute_on(cost, Local::now().date_naive())
    }

    fn can_execute_on(&self, cost: f64, today: NaiveDate) -> Result<(), RiskReject> {
        let mut s = self.state.lock().expect("risk state poisoned");
        reset_if_new_day(&mut s, today);

        if let Some(reason) = &s.kill_switch {
            return Err(RiskReject::KillSwitch(reason.clone()));
        }

        let per_trade_limit = s.bankroll * self.limits.max_risk_per_trade;
        if cost > per_trade_limit {
            return Err(RiskReject::PerTradeLimit { cost, limit: per_trade_limit });
        }

        let daily_loss_limit = -self.limits.max_daily_loss * s.bankroll_at_day_start;
        if s.daily_pnl - cost < daily_loss_limit {
            return Err(RiskReject::DailyLoss {
                daily_pnl: s.daily_pnl,
                cost,
                limit: daily_loss_limit,
            });
        }

        let exposure_limit = s.bankroll * self.limits.max_net_exposure;
        if s.current_exposure + cost > exposure_limit {
            return Err(RiskReject::NetExposure {
                exposure: s.current_exposure,
                cost,
                limit: exposure_limit,
            });
        }

        Ok(())
    }

    /// Commit a filled trade's total cost (including fees) to exposure.
    pub fn register_trade(&self, cost: f64) {
        let mut s = self.state.lock().expect("risk state poisoned");
        s.current_exposure += cost;
    }

    /// Release exposure when a position resolves or is flattened. Clamped so
    /// exposure never goes negative under any interleaving.
    pub fn close_position(&self, amount: f64) {
        let mut s = self.state.lock().expect("risk state poisoned");
        s.current_exposure = (s.current_exposure - amount).max(0.0);
    }

    pub fn update_pnl(&self, delta: f64) {
        let mut s = self.state.lock().expect("risk state poisoned");
        s.daily_pnl += delta;
        s.bankroll += delta;
    }

    /// Record an authoritative balance pulled from the venue of record.
    pub fn record_balance(&self, balance: f64) {
        let mut s = self.state.lock().expect("risk state poisoned");
        let drift = balance - s.bankroll;
        if drift.abs() > 0.01 {
            info!(target: "risk", balance, drift, "bankroll synced from venue of record");
        }
        s.bankroll = balance;
        s.last_sync = Some(Instant::now());
    }

    /// A failed sync keeps the previous bankroll in place.
    pub fn record_sync_failure(&self, err: &dyn std::fmt::Display) {
        warn!(target: "risk", error = %err, "balance sync failed; keeping previous bankroll");
    }

    pub fn bankroll(&self) -> f64 {
        self.state.lock().expect("risk state poisoned").bankroll
    }

    /// Age of the last successful balance sync, `None` if never synced.
    pub fn balance_age(&self) -> Option<Duration> {
        let s = self.state.lock().expect("risk state poisoned");
        s.last_sync.map(|at| at.elapsed())
    }

    pub fn trigger_kill_switch(&self, reason: &str) {
        let mut s = self.state.lock().expect("risk state poisoned");
        error!(target: "risk", reason, "kill switch triggered");
        s.kill_switch = Some(reason.to_string());
    }

    /// Explicit operator action; nothing clears the switch automatically.
    pub fn clear_kill_switch(&self) {
        let mut s = self.state.lock().expect("risk state poisoned");
        s.kill_switch = None;
    }

    pub fn kill_switch_reason(&self) -> Option<String> {
        self.state.lock().expect("risk state poisoned").kill_switch.clone()
    }

    /// Roll daily counters if the local calendar date advanced.
    pub fn check_daily_reset(&self) {
        let mut s = self.state.lock().expect("risk state poisoned");
        reset_if_new_day(&mut s, Local::now().date_naive());
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        let s = self.state.lock().expect("risk state poisoned");
        RiskSnapshot {
            bankroll: s.bankroll,
            daily_pnl: s.daily_pnl,
            current_exposure: s.current_exposure,
            kill_switch: s.kill_switch.clone(),
            as_of: Utc::now(),
        }
    }
}

fn reset_if_new_day(s: &mut RiskState, today: NaiveDate) {
    if today > s.last_reset_date {
        info!(
            target: "risk",
            %today,
            carried_pnl = s.daily_pnl,
            carried_exposure = s.current_exposure,
            "daily reset"
        );
        s.daily_pnl = 0.0;
        s.current_exposure = 0.0;
        s.bankroll_at_day_start = s.bankroll;
        s.last_reset_date = today;
    }
}
