use std::fs;
use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::client::polymarket::PolyCredentials;
use crate::execution::CoordinatorConfig;
use crate::risk::RiskLimits;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Paper,
    Live,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Paper => "paper",
            ExecutionMode::Live => "live",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KalshiConfig {
    #[serde(default = "default_kalshi_base")]
    pub base_url: String,
    #[serde(default = "default_kalshi_ws")]
    pub ws_url: String,
}

fn default_kalshi_base() -> String {
    "https://api.elections.kalshi.com".to_string()
}

fn default_kalshi_ws() -> String {
    "wss://api.elections.kalshi.com/trade-api/ws/v2".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolymarketConfig {
    #[serde(default = "default_gamma")]
    pub gamma_url: String,
    #[serde(default = "default_clob")]
    pub clob_url: String,
    #[serde(default = "default_poly_ws")]
    pub ws_url: String,
    /// Gamma tag for the 15-minute crypto series.
    #[serde(default = "default_poly_tag")]
    pub tag_id: u64,
}

fn default_gamma() -> String {
    "https://gamma-api.polymarket.com".to_string()
}

fn default_clob() -> String {
    "https://clob.polymarket.com".to_string()
}

fn default_poly_ws() -> String {
    "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string()
}

fn default_poly_tag() -> u64 {
    102_467
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Kalshi 15-minute crypto series to scan.
    #[serde(default = "default_series")]
    pub kalshi_series: Vec<String>,
    #[serde(default = "default_kalshi_limit")]
    pub kalshi_limit: u32,
    /// Only a handful of 15-minute rounds are ever live at once; a small
    /// page ordered by end date is enough.
    #[serde(default = "default_poly_limit")]
    pub poly_limit: u32,
}

fn default_series() -> Vec<String> {
    vec!["KXBTC15M".to_string(), "KXETH15M".to_string(), "KXSOL15M".to_string()]
}

fn default_kalshi_limit() -> u32 {
    100
}

fn default_poly_limit() -> u32 {
    20
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Kalshi taker rate on notional.
    pub kalshi_rate: f64,
    /// Polymarket flat fee per contract.
    pub poly_per_unit: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_min_profit")]
    pub min_profit: f64,
    #[serde(default = "default_arb_cache_ttl_ms")]
    pub arb_cache_ttl_ms: u64,
}

fn default_min_profit() -> f64 {
    0.005
}

fn default_arb_cache_ttl_ms() -> u64 {
    100
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MarketDataConfig {
    #[serde(default = "default_orderbook_ttl_ms")]
    pub orderbook_ttl_ms: u64,
}

fn default_orderbook_ttl_ms() -> u64 {
    500
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub mode: ExecutionMode,
    #[serde(default = "default_fill_schedule")]
    pub fill_monitor_schedule_ms: Vec<u64>,
    #[serde(default = "default_fill_budget_ms")]
    pub fill_budget_ms: u64,
    #[serde(default = "default_fetch_deadline_ms")]
    pub fetch_deadline_ms: u64,
    #[serde(default = "default_balance_reuse_s")]
    pub balance_reuse_s: u64,
    #[serde(default = "default_poly_min_notional")]
    pub poly_min_notional: f64,
    #[serde(default = "default_opportunity_max_age_ms")]
    pub opportunity_max_age_ms: u64,
    /// Simulated bankroll when running in paper mode.
    #[serde(default = "default_paper_bankroll")]
    pub paper_bankroll: f64,
}

fn default_paper_bankroll() -> f64 {
    10_000.0
}

fn default_fill_schedule() -> Vec<u64> {
    vec![100, 200, 300, 500, 1000, 1000, 2000, 2000, 3000, 3000]
}

fn default_fill_budget_ms() -> u64 {
    10_000
}

fn default_fetch_deadline_ms() -> u64 {
    5_000
}

fn default_balance_reuse_s() -> u64 {
    10
}

fn default_poly_min_notional() -> f64 {
    1.0
}

fn default_opportunity_max_age_ms() -> u64 {
    500
}

impl ExecutionConfig {
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            opportunity_max_age: Duration::from_millis(self.opportunity_max_age_ms),
            fetch_deadline: Duration::from_millis(self.fetch_deadline_ms),
            balance_reuse_age: Duration::from_secs(self.balance_reuse_s),
            fill_schedule: self
                .fill_monitor_schedule_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            fill_budget: Duration::from_millis(self.fill_budget_ms),
            poly_min_notional: self.poly_min_notional,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_trade_cooldown_s")]
    pub trade_cooldown_s: u64,
    #[serde(default = "default_dedupe_window_s")]
    pub dedupe_window_s: u64,
    /// Tradable leg prices must sit inside this band on both venues.
    #[serde(default = "default_price_band")]
    pub price_band: [f64; 2],
    #[serde(default = "default_time_to_close_min_s")]
    pub time_to_close_min_s: i64,
    #[serde(default = "default_balance_sync_period_s")]
    pub balance_sync_period_s: u64,
}

fn default_trade_cooldown_s() -> u64 {
    60
}

fn default_dedupe_window_s() -> u64 {
    15
}

fn default_price_band() -> [f64; 2] {
    [0.10, 0.90]
}

fn default_time_to_close_min_s() -> i64 {
    60
}

fn default_balance_sync_period_s() -> u64 {
    30
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    pub postgres: PostgresConfig,
    pub redis: RedisConfig,
    #[serde(default = "default_kalshi_config")]
    pub kalshi: KalshiConfig,
    #[serde(default = "default_polymarket_config")]
    pub polymarket: PolymarketConfig,
    #[serde(default = "default_discovery_config")]
    pub discovery: DiscoveryConfig,
    pub execution: ExecutionConfig,
    pub risk: RiskLimits,
    pub fees: FeeConfig,
    #[serde(default = "default_detector_config")]
    pub detector: DetectorConfig,
    #[serde(default = "default_market_data_config")]
    pub market_data: MarketDataConfig,
    #[serde(default = "default_orchestrator_config")]
    pub orchestrator: OrchestratorConfig,
}

fn default_kalshi_config() -> KalshiConfig {
    KalshiConfig {
        base_url: default_kalshi_base(),
        ws_url: default_kalshi_ws(),
    }
}

fn default_polymarket_config() -> PolymarketConfig {
    PolymarketConfig {
        gamma_url: default_gamma(),
        clob_url: default_clob(),
        ws_url: default_poly_ws(),
        tag_id: default_poly_tag(),
    }
}

fn default_discovery_config() -> DiscoveryConfig {
    DiscoveryConfig {
        kalshi_series: default_series(),
        kalshi_limit: default_kalshi_limit(),
        poly_limit: default_poly_limit(),
    }
}

fn default_detector_config() -> DetectorConfig {
    DetectorConfig {
        min_profit: default_min_profit(),
        arb_cache_ttl_ms: default_arb_cache_ttl_ms(),
    }
}

fn default_market_data_config() -> MarketDataConfig {
    MarketDataConfig {
        orderbook_ttl_ms: default_orderbook_ttl_ms(),
    }
}

fn default_orchestrator_config() -> OrchestratorConfig {
    OrchestratorConfig {
        trade_cooldown_s: default_trade_cooldown_s(),
        dedupe_window_s: default_dedupe_window_s(),
        price_band: default_price_band(),
        time_to_close_min_s: default_time_to_close_min_s(),
        balance_sync_period_s: default_balance_sync_period_s(),
    }
}

impl AppConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {path}"))?;
        let cfg: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to deserialize TOML config at {path}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("risk.max_risk_per_trade", self.risk.max_risk_per_trade),
            ("risk.max_daily_loss", self.risk.max_daily_loss),
            ("risk.max_net_exposure", self.risk.max_net_exposure),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{name} must be a fraction in [0, 1], got {value}");
            }
        }
        let [lo, hi] = self.orchestrator.price_band;
        if !(0.0 <= lo && lo < hi && hi <= 1.0) {
            anyhow::bail!("orchestrator.price_band must satisfy 0 <= lo < hi <= 1");
        }
        if self.execution.fill_monitor_schedule_ms.is_empty() {
            anyhow::bail!("execution.fill_monitor_schedule_ms must not be empty");
        }
        Ok(())
    }
}

/// Venue credentials, read exclusively from the process environment and
/// never logged.
pub struct Credentials {
    pub kalshi_key_id: String,
    pub kalshi_secret: String,
    pub poly: PolyCredentials,
}

impl Credentials {
    pub fn from_env() -> anyhow::Result<Self> {
        let var = |name: &str| {
            std::env::var(name).map_err(|_| anyhow::anyhow!("{name} not set in environment"))
        };
        Ok(Self {
            kalshi_key_id: var("KALSHI_API_KEY")?,
            kalshi_secret: var("KALSHI_API_SECRET")?,
            poly: PolyCredentials {
                api_key: var("POLY_API_KEY")?,
                api_secret: var("POLY_API_SECRET")?,
                api_passphrase: var("POLY_PASSPHRASE")?,
                address: var("POLY_ADDRESS")?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [postgres]
        url = "postgres://localhost/arb"

        [redis]
        url = "redis://localhost"

        [execution]
        mode = "paper"

        [risk]
        max_risk_per_trade = 0.10
        max_daily_loss = 0.20
        max_net_exposure = 0.50

        [fees]
        kalshi_rate = 0.01
        poly_per_unit = 0.001
    "#;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg: AppConfig = toml::from_str(MINIMAL).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.execution.mode, ExecutionMode::Paper);
        assert_eq!(cfg.detector.min_profit, 0.005);
        assert_eq!(cfg.market_data.orderbook_ttl_ms, 500);
        assert_eq!(cfg.orchestrator.trade_cooldown_s, 60);
        assert_eq!(cfg.orchestrator.price_band, [0.10, 0.90]);
        assert_eq!(cfg.discovery.kalshi_series.len(), 3);
        assert_eq!(cfg.execution.fill_monitor_schedule_ms.len(), 10);
    }

    #[test]
    fn risk_fractions_are_validated() {
        let bad = MINIMAL.replace("max_risk_per_trade = 0.10", "max_risk_per_trade = 1.5");
        let cfg: AppConfig = toml::from_str(&bad).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn coordinator_config_mirrors_execution_section() {
        let cfg: AppConfig = toml::from_str(MINIMAL).unwrap();
        let coord = cfg.execution.coordinator_config();
        assert_eq!(coord.fill_schedule.len(), 10);
        assert_eq!(coord.fill_budget, Duration::from_secs(10));
        assert_eq!(coord.opportunity_max_age, Duration::from_millis(500));
    }
}
