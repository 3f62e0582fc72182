use chrono::Utc;
use sqlx::{query, Pool, Postgres};

use crate::execution::{Trade, UnwindReport};
use crate::market::MatchedPair;
use crate::risk::RiskSnapshot;
use crate::storage::models::{MatchedPairRow, OpportunityRow, RiskSnapshotRow, TradeRow, UnwindRow};
use crate::strategy::Evaluation;

/// Records matched pairs.
///
/// Expected schema (created via migrations):
/// ```sql
/// CREATE TABLE IF NOT EXISTS matched_pairs (
///   created_at      TIMESTAMPTZ NOT NULL,
///   pair_key        TEXT        NOT NULL,
///   asset           TEXT        NOT NULL,
///   kalshi_ticker   TEXT        NOT NULL,
///   poly_slug       TEXT        NOT NULL,
///   kalshi_title    TEXT        NOT NULL,
///   poly_title      TEXT        NOT NULL,
///   resolution_time TIMESTAMPTZ NOT NULL
/// );
/// ```
pub struct PairRecorder {
    pool: Pool<Postgres>,
}

impl PairRecorder {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn record_pair(&self, pair: &MatchedPair) -> anyhow::Result<()> {
        let row = MatchedPairRow {
            created_at: pair.created_at,
            pair_key: pair.pair_key.clone(),
            asset: pair.asset.to_string(),
            kalshi_ticker: pair.kalshi.instrument.clone(),
            poly_slug: pair.polymarket.instrument.clone(),
            kalshi_title: pair.kalshi.title.clone(),
            poly_title: pair.polymarket.title.clone(),
            resolution_time: pair.resolution_time,
        };

        query(
            "INSERT INTO matched_pairs \
             (created_at, pair_key, asset, kalshi_ticker, poly_slug, kalshi_title, poly_title, resolution_time) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(row.created_at)
        .bind(row.pair_key)
        .bind(row.asset)
        .bind(row.kalshi_ticker)
        .bind(row.poly_slug)
        .bind(row.kalshi_title)
        .bind(row.poly_title)
        .bind(row.resolution_time)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Records detector evaluations: accepted opportunities and rejections with
/// their structured reason, so post-mortems can reconstruct why any given
/// price did not become a trade.
///
/// Expected schema:
/// ```sql
/// CREATE TABLE IF NOT EXISTS opportunities (
///   ts               TIMESTAMPTZ NOT NULL,
///   pair_key         TEXT        NOT NULL,
///   cost_yes_k_no_p  DOUBLE PRECISION NOT NULL,
///   cost_no_k_yes_p  DOUBLE PRECISION NOT NULL,
///   net_profit       DOUBLE PRECISION,
///   strategy         TEXT,
///   decision         TEXT        NOT NULL,
///   reason           TEXT
/// );
/// ```
pub struct OpportunityRecorder {
    pool: Pool<Postgres>,
}

impl OpportunityRecorder {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn record_evaluation(
        &self,
        eval: &Evaluation,
        decision: &str,
        reason: Option<&str>,
    ) -> anyhow::Result<()> {
        let opp = eval.opportunity();
        let row = OpportunityRow {
            ts: Utc::now(),
            pair_key: eval.pair_key.clone(),
            cost_yes_k_no_p: eval.cost_yes_k_no_p,
            cost_no_k_yes_p: eval.cost_no_k_yes_p,
            net_profit: opp.map(|o| o.net_profit),
            strategy: opp.map(|o| o.strategy.to_string()),
            decision: decision.to_string(),
            reason: reason.map(str::to_string),
        };

        query(
            "INSERT INTO opportunities \
             (ts, pair_key, cost_yes_k_no_p, cost_no_k_yes_p, net_profit, strategy, decision, reason) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(row.ts)
        .bind(row.pair_key)
        .bind(row.cost_yes_k_no_p)
        .bind(row.cost_no_k_yes_p)
        .bind(row.net_profit)
        .bind(row.strategy)
        .bind(row.decision)
        .bind(row.reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Records executed trades and unwind reports.
///
/// Expected schema:
/// ```sql
/// CREATE TABLE IF NOT EXISTS trades (
///   ts              TIMESTAMPTZ NOT NULL,
///   pair_key        TEXT        NOT NULL,
///   strategy        TEXT        NOT NULL,
///   size            DOUBLE PRECISION NOT NULL,
///   kalshi_order_id TEXT        NOT NULL,
///   kalshi_price    DOUBLE PRECISION NOT NULL,
///   poly_order_id   TEXT        NOT NULL,
///   poly_price      DOUBLE PRECISION NOT NULL,
///   total_cost      DOUBLE PRECISION NOT NULL,
///   total_fees      DOUBLE PRECISION NOT NULL
/// );
/// CREATE TABLE IF NOT EXISTS unwinds (
///   ts               TIMESTAMPTZ NOT NULL,
///   pair_key         TEXT        NOT NULL,
///   matched_size     DOUBLE PRECISION NOT NULL,
///   residual         DOUBLE PRECISION NOT NULL,
///   resolved         BOOLEAN     NOT NULL,
///   steps_json       TEXT        NOT NULL,
///   evaluations_json TEXT        NOT NULL
/// );
/// ```
pub struct TradeRecorder {
    pool: Pool<Postgres>,
}

impl TradeRecorder {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn record_trade(&self, trade: &Trade) -> anyhow::Result<()> {
        let row = TradeRow {
            ts: trade.executed_at,
            pair_key: trade.pair_key.clone(),
            strategy: trade.strategy.clone(),
            size: trade.size,
            kalshi_order_id: trade.kalshi.order_id.clone(),
            kalshi_price: trade.kalshi.avg_price,
            poly_order_id: trade.poly.order_id.clone(),
            poly_price: trade.poly.avg_price,
            total_cost: trade.total_cost,
            total_fees: trade.total_fees,
        };

        query(
            "INSERT INTO trades \
             (ts, pair_key, strategy, size, kalshi_order_id, kalshi_price, poly_order_id, poly_price, total_cost, total_fees) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(row.ts)
        .bind(row.pair_key)
        .bind(row.strategy)
        .bind(row.size)
        .bind(row.kalshi_order_id)
        .bind(row.kalshi_price)
        .bind(row.poly_order_id)
        .bind(row.poly_price)
        .bind(row.total_cost)
        .bind(row.total_fees)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_unwind(&self, report: &UnwindReport) -> anyhow::Result<()> {
        let row = UnwindRow {
            ts: Utc::now(),
            pair_key: report.pair_key.clone(),
            matched_size: report.matched_size,
            residual: report.residual,
            resolved: report.resolved,
            steps_json: serde_json::to_string(&report.steps)?,
            evaluations_json: serde_json::to_string(&report.evaluations)?,
        };

        query(
            "INSERT INTO unwinds \
             (ts, pair_key, matched_size, residual, resolved, steps_json, evaluations_json) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(row.ts)
        .bind(row.pair_key)
        .bind(row.matched_size)
        .bind(row.residual)
        .bind(row.resolved)
        .bind(row.steps_json)
        .bind(row.evaluations_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Records risk-state snapshots on every update.
///
/// Expected schema:
/// ```sql
/// CREATE TABLE IF NOT EXISTS risk_snapshots (
///   ts               TIMESTAMPTZ NOT NULL,
///   bankroll         DOUBLE PRECISION NOT NULL,
///   daily_pnl        DOUBLE PRECISION NOT NULL,
///   current_exposure DOUBLE PRECISION NOT NULL,
///   kill_switch      TEXT
/// );
/// ```
pub struct RiskRecorder {
    pool: Pool<Postgres>,
}

impl RiskRecorder {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn record_snapshot(&self, snapshot: &RiskSnapshot) -> anyhow::Result<()> {
        let row = RiskSnapshotRow {
            ts: snapshot.as_of,
            bankroll: snapshot.bankroll,
            daily_pnl: snapshot.daily_pnl,
            current_exposure: snapshot.current_exposure,
            kill_switch: snapshot.kill_switch.clone(),
        };

        query(
            "INSERT INTO risk_snapshots (ts, bankroll, daily_pnl, current_exposure, kill_switch) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(row.ts)
        .bind(row.bankroll)
        .bind(row.daily_pnl)
        .bind(row.current_exposure)
        .bind(row.kill_switch)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
