use serde::Serialize;
use tracing::info;

use crate::types::AppConfig;

#[derive(Serialize)]
struct StartupLog<'a> {
    event: &'a str,
    execution_mode: &'a str,
    kalshi_series: Vec<&'a str>,
    min_profit: f64,
    orderbook_ttl_ms: u64,
    trade_cooldown_s: u64,
}

/// One structured startup line with the trading-relevant configuration.
/// Credentials and storage URLs never appear here.
pub fn log_startup(cfg: &AppConfig) {
    let payload = StartupLog {
        event: "startup",
        execution_mode: cfg.execution.mode.as_str(),
        kalshi_series: cfg.discovery.kalshi_series.iter().map(String::as_str).collect(),
        min_profit: cfg.detector.min_profit,
        orderbook_ttl_ms: cfg.market_data.orderbook_ttl_ms,
        trade_cooldown_s: cfg.orchestrator.trade_cooldown_s,
    };
    info!(
        target: "bot",
        startup = serde_json::to_string(&payload).unwrap_or_default().as_str()
    );
}
