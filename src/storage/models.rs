use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Row model for matched cross-venue pairs.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MatchedPairRow {
    pub created_at: DateTime<Utc>,
    pub pair_key: String,
    pub asset: String,
    pub kalshi_ticker: String,
    pub poly_slug: String,
    pub kalshi_title: String,
    pub poly_title: String,
    pub resolution_time: DateTime<Utc>,
}

/// Row model for the opportunity audit trail: every emitted opportunity and
/// every rejection of a profitable-looking quote, with a structured reason.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OpportunityRow {
    pub ts: DateTime<Utc>,
    pub pair_key: String,
    pub cost_yes_k_no_p: f64,
    pub cost_no_k_yes_p: f64,
    pub net_profit: Option<f64>,
    pub strategy: Option<String>,
    pub decision: String,
    pub reason: Option<String>,
}

/// Row model for executed trades (both legs terminal).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TradeRow {
    pub ts: DateTime<Utc>,
    pub pair_key: String,
    pub strategy: String,
    pub size: f64,
    pub kalshi_order_id: String,
    pub kalshi_price: f64,
    pub poly_order_id: String,
    pub poly_price: f64,
    pub total_cost: f64,
    pub total_fees: f64,
}

/// Row model for unwind reports, with the full candidate evaluation preserved
/// as JSON for post-mortems.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UnwindRow {
    pub ts: DateTime<Utc>,
    pub pair_key: String,
    pub matched_size: f64,
    pub residual: f64,
    pub resolved: bool,
    pub steps_json: String,
    pub evaluations_json: String,
}

/// Row model for risk-state snapshots written on every update.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RiskSnapshotRow {
    pub ts: DateTime<Utc>,
    pub bankroll: f64,
    pub daily_pnl: f64,
    pub current_exposure: f64,
    pub kill_switch: Option<String>,
}
