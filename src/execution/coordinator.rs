use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::market::{OrderbookCache, OrderbookSnapshot, Venue};
use crate::risk::{RiskManager, RiskReject};
use crate::strategy::{FeeSchedule, Opportunity, OpportunityLeg};
use crate::utils::math::{contracts_for_budget, SizingError};

use super::order::{LegFill, OrderStatus, OrderTicket, Trade, VenueOrder};
use super::unwind::{self, LegState, UnwindReport};
use super::ExecutionBackend;

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Opportunities older than this at consumption time are discarded.
    pub opportunity_max_age: Duration,
    /// Deadline for the pre-trade fan-out (books + balance).
    pub fetch_deadline: Duration,
    /// Reuse the risk manager's cached balance if synced within this window.
    pub balance_reuse_age: Duration,
    /// Exponential-backoff sleeps between fill polls.
    pub fill_schedule: Vec<Duration>,
    /// Hard ceiling on total fill-monitoring time.
    pub fill_budget: Duration,
    /// Polymarket's minimum order notional in dollars.
    pub poly_min_notional: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            opportunity_max_age: Duration::from_millis(500),
            fetch_deadline: Duration::from_secs(5),
            balance_reuse_age: Duration::from_secs(10),
            fill_schedule: [100, 200, 300, 500, 1000, 1000, 2000, 2000, 3000, 3000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            fill_budget: Duration::from_secs(10),
            poly_min_notional: 1.0,
        }
    }
}

/// Why an execution attempt stopped before any venue-side cost was incurred.
#[derive(Clone, Debug)]
pub enum AbortReason {
    StaleOpportunity { age_ms: u128 },
    StaleBooks { detail: String },
    /// Forced refetch came back with no asks.
    StaleAndEmpty { venue: Venue },
    InsufficientLiquidity { venue: Venue, detail: String },
    Sizing(SizingError),
    Risk(RiskReject),
    BothLegsRejected,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::StaleOpportunity { age_ms } => write!(f, "stale opportunity ({age_ms}ms)"),
            AbortReason::StaleBooks { detail } => write!(f, "stale books: {detail}"),
            AbortReason::StaleAndEmpty { venue } => write!(f, "stale+empty on {venue}"),
            AbortReason::InsufficientLiquidity { venue, detail } => {
                write!(f, "insufficient liquidity on {venue}: {detail}")
            }
            AbortReason::Sizing(err) => write!(f, "sizing: {err:?}"),
            AbortReason::Risk(reject) => write!(f, "risk: {reject}"),
            AbortReason::BothLegsRejected => write!(f, "both legs rejected"),
        }
    }
}

/// Terminal result of consuming one opportunity. Aborts before placement are
/// free; anything after placement ends recorded as filled or unwound.
#[derive(Debug)]
pub enum TradeOutcome {
    Completed(Trade),
    Aborted(AbortReason),
    Unwound(UnwindReport),
}

/// Takes an `Opportunity` and produces a `Trade` or a bounded-cost abort,
/// never an undetected one-sided position.
pub struct ExecutionCoordinator {
    backend: ExecutionBackend,
    risk: Arc<RiskManager>,
    cache: Arc<OrderbookCache>,
    fees: FeeSchedule,
    config: CoordinatorConfig,
}

impl ExecutionCoordinator {
    pub fn new(
        backend: ExecutionBackend,
        risk: Arc<RiskManager>,
        cache: Arc<OrderbookCache>,
        fees: FeeSchedule,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            backend,
            risk,
            cache,
            fees,
            config,
        }
    }

    pub fn backend(&self) -> &ExecutionBackend {
        &self.backend
    }

    pub async fn execute(&self, opp: &Opportunity) -> anyhow::Result<TradeOutcome> {
        let age = opp.age();
        if age > self.config.opportunity_max_age {
            return Ok(TradeOutcome::Aborted(AbortReason::StaleOpportunity {
                age_ms: age.as_millis(),
            }));
        }

        // Fresh books for both legs, pulling REST (plus balance when the
        // cached sync is old) in one bounded fan-out if the cache is stale.
        let (k_book, p_book) = match self.obtain_books(opp).await? {
            Ok(books) => books,
            Err(abort) => return Ok(TradeOutcome::Aborted(abort)),
        };

        let bankroll = self.risk.bankroll();
        let limits = self.risk.limits();
        let size = match contracts_for_budget(
            bankroll,
            limits.max_risk_per_trade,
            opp.total_cost,
            opp.poly_leg.price,
            self.config.poly_min_notional,
        ) {
            Ok(size) => size,
            Err(err) => return Ok(TradeOutcome::Aborted(AbortReason::Sizing(err))),
        };

        // Strict liquidity: the full size must rest at the target price on
        // both books, with no fallback to deeper levels.
        for (leg, book) in [(&opp.kalshi_leg, &k_book), (&opp.poly_leg, &p_book)] {
            if let Err(detail) = leg_liquid(leg, book, size) {
                return Ok(TradeOutcome::Aborted(AbortReason::InsufficientLiquidity {
                    venue: leg.venue,
                    detail,
                }));
            }
        }

        let est_fees = self.fees.kalshi.fee(opp.kalshi_leg.price, size)
            + self.fees.poly.fee(opp.poly_leg.price, size);
        let total_cost = size * opp.total_cost;
        if let Err(reject) = self.risk.can_execute(total_cost + est_fees) {
            return Ok(TradeOutcome::Aborted(AbortReason::Risk(reject)));
        }

        info!(
            target: "execution",
            pair = %opp.pair_key,
            strategy = %opp.strategy,
            size,
            total_cost,
            est_fees,
            net_per_unit = opp.net_profit,
            "placing both legs"
        );

        // Both legs at the exact observed target prices, concurrently.
        let k_ticket = OrderTicket::new(
            Venue::Kalshi,
            &opp.kalshi_leg.instrument,
            opp.kalshi_leg.side,
            opp.kalshi_leg.price,
            size,
        );
        let p_ticket = OrderTicket::new(
            Venue::Polymarket,
            &opp.poly_leg.instrument,
            opp.poly_leg.side,
            opp.poly_leg.price,
            size,
        );
        let (k_res, p_res) = tokio::join!(self.backend.place(&k_ticket), self.backend.place(&p_ticket));

        let mut k_order = match k_res {
            Ok(order) => Some(order),
            Err(err) => {
                warn!(target: "execution", error = %err, "kalshi leg placement failed");
                None
            }
        };
        let mut p_order = match p_res {
            Ok(order) => Some(order),
            Err(err) => {
                warn!(target: "execution", error = %err, "polymarket leg placement failed");
                None
            }
        };

        if k_order.is_none() && p_order.is_none() {
            // Clean two-sided failure: nothing to unwind, but resync the
            // balance in case the venue refused on funds.
            if let Ok(balance) = self.backend.fetch_balance_of_record().await {
                self.risk.record_balance(balance);
            }
            return Ok(TradeOutcome::Aborted(AbortReason::BothLegsRejected));
        }

        self.monitor_fills(opp, size, &mut k_order, &mut p_order).await;

        let both_filled = is_filled(&k_order, size) && is_filled(&p_order, size);
        if both_filled {
            let trade = self.record_trade(opp, size, k_order.unwrap(), p_order.unwrap());
            return Ok(TradeOutcome::Completed(trade));
        }

        let report = unwind::unwind(
            &self.backend,
            &self.fees,
            &self.risk,
            &opp.pair_key,
            LegState { leg: &opp.kalshi_leg, order: k_order, target: size },
            LegState { leg: &opp.poly_leg, order: p_order, target: size },
        )
        .await;

        // Contracts matched across venues stay on as a hedged position.
        if report.matched_size > 0.0 {
            let matched_cost = report.matched_size * opp.total_cost;
            let matched_fees = self.fees.kalshi.fee(opp.kalshi_leg.price, report.matched_size)
                + self.fees.poly.fee(opp.poly_leg.price, report.matched_size);
            self.risk.register_trade(matched_cost + matched_fees);
        }

        Ok(TradeOutcome::Unwound(report))
    }

    /// Fresh top-of-book for both legs. Cache hits under the TTL are used
    /// as-is; otherwise both books (and, if stale, the balance) are fetched in
    /// parallel under one deadline.
    async fn obtain_books(
        &self,
        opp: &Opportunity,
    ) -> anyhow::Result<Result<(OrderbookSnapshot, OrderbookSnapshot), AbortReason>> {
        let cached_k = self.cache.fresh(Venue::Kalshi, &opp.kalshi_leg.book_id);
        let cached_p = self.cache.fresh(Venue::Polymarket, &opp.poly_leg.book_id);
        if let (Some(k), Some(p)) = (cached_k, cached_p) {
            return Ok(Ok((k, p)));
        }

        let need_balance = self
            .risk
            .balance_age()
            .map(|age| age > self.config.balance_reuse_age)
            .unwrap_or(true);

        let fetch = async {
            let balance_fut = async {
                if need_balance {
                    Some(self.backend.fetch_balance_of_record().await)
                } else {
                    None
                }
            };
            tokio::join!(
                self.backend.fetch_book(Venue::Kalshi, &opp.kalshi_leg.book_id),
                self.backend.fetch_book(Venue::Polymarket, &opp.poly_leg.book_id),
                balance_fut,
            )
        };

        let (k_res, p_res, balance_res) = match timeout(self.config.fetch_deadline, fetch).await {
            Ok(results) => results,
            Err(_) => {
                return Ok(Err(AbortReason::StaleBooks {
                    detail: "refetch deadline exceeded".to_string(),
                }))
            }
        };

        match balance_res {
            Some(Ok(balance)) => self.risk.record_balance(balance),
            Some(Err(err)) => self.risk.record_sync_failure(&err),
            None => {}
        }

        let k_book = match k_res {
            Ok(book) => book,
            Err(err) if err.is_transient() => {
                return Ok(Err(AbortReason::StaleBooks { detail: err.to_string() }))
            }
            Err(err) => return Err(err.into()),
        };
        let p_book = match p_res {
            Ok(book) => book,
            Err(err) if err.is_transient() => {
                return Ok(Err(AbortReason::StaleBooks { detail: err.to_string() }))
            }
            Err(err) => return Err(err.into()),
        };

        for book in [&k_book, &p_book] {
            if book.asks.is_empty() {
                return Ok(Err(AbortReason::StaleAndEmpty { venue: book.venue }));
            }
        }

        self.cache.insert(k_book.clone());
        self.cache.insert(p_book.clone());
        Ok(Ok((k_book, p_book)))
    }

    /// Poll both legs on the backoff schedule, checking before each sleep and
    /// again right after each poll, under a hard total budget.
    async fn monitor_fills(
        &self,
        opp: &Opportunity,
        size: f64,
        k_order: &mut Option<VenueOrder>,
        p_order: &mut Option<VenueOrder>,
    ) {
        let started = std::time::Instant::now();

        for delay in &self.config.fill_schedule {
            if settled(k_order, p_order, size) {
                return;
            }
            if started.elapsed() + *delay > self.config.fill_budget {
                break;
            }
            sleep(*delay).await;

            for order in [&mut *k_order, &mut *p_order] {
                let pending = match order.as_ref() {
                    Some(o) if o.classify(size) != OrderStatus::Filled && !o.status.is_terminal() => {
                        (o.venue, o.order_id.clone())
                    }
                    _ => continue,
                };
                match self.backend.order_status(pending.0, &pending.1).await {
                    Ok(updated) => *order = Some(updated),
                    Err(err) => {
                        warn!(target: "execution", error = %err, "fill poll failed");
                    }
                }
            }
            if settled(k_order, p_order, size) {
                return;
            }
        }

        if !settled(k_order, p_order, size) {
            warn!(
                target: "execution",
                pair = %opp.pair_key,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "fill monitoring budget exhausted"
            );
        }
    }

    fn record_trade(
        &self,
        opp: &Opportunity,
        size: f64,
        k_order: VenueOrder,
        p_order: VenueOrder,
    ) -> Trade {
        let k_fees = self.fees.kalshi.fee(opp.kalshi_leg.price, size);
        let p_fees = self.fees.poly.fee(opp.poly_leg.price, size);
        let k_fill = leg_fill(&opp.kalshi_leg, &k_order, k_fees);
        let p_fill = leg_fill(&opp.poly_leg, &p_order, p_fees);

        let total_cost = k_fill.avg_price * k_fill.filled + p_fill.avg_price * p_fill.filled;
        let total_fees = k_fees + p_fees;
        self.risk.register_trade(total_cost + total_fees);

        info!(
            target: "execution",
            pair = %opp.pair_key,
            strategy = %opp.strategy,
            size,
            total_cost,
            total_fees,
            kalshi_order = %k_fill.order_id,
            poly_order = %p_fill.order_id,
            "trade completed"
        );

        Trade {
            pair_key: opp.pair_key.clone(),
            strategy: opp.strategy.to_string(),
            size,
            kalshi: k_fill,
            poly: p_fill,
            total_cost,
            total_fees,
            executed_at: Utc::now(),
        }
    }
}

fn leg_liquid(leg: &OpportunityLeg, book: &OrderbookSnapshot, size: f64) -> Result<(), String> {
    let Some(best) = book.best_ask() else {
        return Err("no asks".to_string());
    };
    if best.price > leg.price + 1e-9 {
        return Err(format!("best ask {:.4} above target {:.4}", best.price, leg.price));
    }
    if best.size < size {
        return Err(format!("best ask size {:.2} below trade size {size:.2}", best.size));
    }
    Ok(())
}

fn is_filled(order: &Option<VenueOrder>, size: f64) -> bool {
    order
        .as_ref()
        .map(|o| o.classify(size) == OrderStatus::Filled)
        .unwrap_or(false)
}

/// No further monitoring can change the outcome: both legs filled, or any
/// placed leg has reached a terminal state.
fn settled(k: &Option<VenueOrder>, p: &Option<VenueOrder>, size: f64) -> bool {
    let leg_settled = |o: &Option<VenueOrder>| match o {
        None => true,
        Some(order) => order.classify(size) == OrderStatus::Filled || order.status.is_terminal(),
    };
    leg_settled(k) && leg_settled(p)
}

fn leg_fill(leg: &OpportunityLeg, order: &VenueOrder, fees: f64) -> LegFill {
    let avg_price = if order.avg_price > 0.0 { order.avg_price } else { leg.price };
    LegFill {
        venue: leg.venue,
        instrument: leg.instrument.clone(),
        side: leg.side,
        order_id: order.order_id.clone(),
        status: order.status,
        filled: order.filled_size,
        avg_price,
        fees,
    }
}
