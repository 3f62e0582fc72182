use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::client::kalshi;
use crate::market::{MatchedPair, Side, Venue};

use super::fees::FeeSchedule;
use super::PairQuote;

/// Fee headroom used by the pre-filter. Pairs whose cheaper strategy already
/// costs more than `1 - 2 * FEE_EPSILON` cannot be profitable under any
/// configured fee model and are dropped before fee evaluation.
const FEE_EPSILON: f64 = 0.02;

/// The two compensating strategies, in deterministic tie-break order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArbStrategy {
    /// BUY_YES on Kalshi, BUY_NO on Polymarket.
    YesKalshiNoPoly,
    /// BUY_NO on Kalshi, BUY_YES on Polymarket.
    NoKalshiYesPoly,
}

impl std::fmt::Display for ArbStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArbStrategy::YesKalshiNoPoly => write!(f, "yes_k_no_p"),
            ArbStrategy::NoKalshiYesPoly => write!(f, "no_k_yes_p"),
        }
    }
}

/// One leg of a detected opportunity with every identifier the coordinator
/// needs pre-resolved, so the hot path never re-queries venue metadata.
#[derive(Clone, Debug)]
pub struct OpportunityLeg {
    pub venue: Venue,
    /// Order-routing identifier: Kalshi ticker or Polymarket CLOB token.
    pub instrument: String,
    pub side: Side,
    /// Outcome-book identifier for cache and REST book lookups.
    pub book_id: String,
    /// Target limit price observed at detection time.
    pub price: f64,
    /// Opposite-outcome identifiers, used only by the unwind path.
    pub hedge_instrument: String,
    pub hedge_book_id: String,
}

/// A detected, fee-adjusted profitable pair of legs. Immutable once created;
/// consumed at most once by the coordinator and discarded when stale.
#[derive(Clone, Debug)]
pub struct Opportunity {
    pub pair_key: String,
    pub strategy: ArbStrategy,
    pub kalshi_leg: OpportunityLeg,
    pub poly_leg: OpportunityLeg,
    /// Expected net profit per contract after fees.
    pub net_profit: f64,
    /// Sum of both target prices per contract.
    pub total_cost: f64,
    /// Expected fees per contract at the target prices.
    pub fees: f64,
    pub detected_at: DateTime<Utc>,
    detected: Instant,
}

impl Opportunity {
    pub fn age(&self) -> Duration {
        self.detected.elapsed()
    }

    /// Dedupe key: one execution per (pair, strategy) within the dedupe window.
    pub fn dedupe_key(&self) -> (String, ArbStrategy) {
        (self.pair_key.clone(), self.strategy)
    }
}

/// Why the detector did not emit for a given quote, kept for the audit trail.
#[derive(Clone, Debug)]
pub enum Verdict {
    Emit(Opportunity),
    /// Cheaper strategy already costs too much; fees were never evaluated.
    PreFiltered { min_total: f64 },
    /// Best strategy cleared the pre-filter but not the profit floor.
    BelowMinProfit { best_net: f64, strategy: ArbStrategy },
}

/// Full result of one detector pass over a pair quote.
#[derive(Clone, Debug)]
pub struct Evaluation {
    pub pair_key: String,
    pub cost_yes_k_no_p: f64,
    pub cost_no_k_yes_p: f64,
    pub verdict: Verdict,
}

impl Evaluation {
    pub fn opportunity(&self) -> Option<&Opportunity> {
        match &self.verdict {
            Verdict::Emit(opp) => Some(opp),
            _ => None,
        }
    }

    /// Structured rejection reason for persistence, `None` when emitted.
    pub fn rejection_reason(&self) -> Option<String> {
        match &self.verdict {
            Verdict::Emit(_) => None,
            Verdict::PreFiltered { min_total } => {
                Some(format!("prefiltered: min_total {min_total:.4} > {:.4}", 1.0 - 2.0 * FEE_EPSILON))
            }
            Verdict::BelowMinProfit { best_net, strategy } => {
                Some(format!("below_min_profit: best {strategy} net {best_net:.4}"))
            }
        }
    }
}

type MemoKey = (String, String, [i64; 4]);

/// Evaluates fee-adjusted profitability of both compensating strategies for a
/// matched pair and emits `Opportunity`s.
///
/// Results are memoized for a short TTL keyed by rounded prices, to absorb
/// bursts of duplicate push updates without recomputing fees.
pub struct ArbitrageDetector {
    fees: FeeSchedule,
    min_profit: f64,
    memo_ttl: Duration,
    memo: HashMap<MemoKey, (Instant, Evaluation)>,
}

impl ArbitrageDetector {
    pub fn new(fees: FeeSchedule, min_profit: f64, memo_ttl: Duration) -> Self {
        Self {
            fees,
            min_profit,
            memo_ttl,
            memo: HashMap::new(),
        }
    }

    pub fn evaluate(&mut self, pair: &MatchedPair, quote: &PairQuote) -> Evaluation {
        let key = memo_key(pair, quote);
        if let Some((at, eval)) = self.memo.get(&key) {
            if at.elapsed() <= self.memo_ttl {
                return eval.clone();
            }
        }

        let eval = self.evaluate_uncached(pair, quote);
        if self.memo.len() > 4096 {
            let ttl = self.memo_ttl;
            self.memo.retain(|_, (at, _)| at.elapsed() <= ttl);
        }
        self.memo.insert(key, (Instant::now(), eval.clone()));
        eval
    }

    fn evaluate_uncached(&self, pair: &MatchedPair, quote: &PairQuote) -> Evaluation {
        let cost_1 = quote.kalshi_yes.price + quote.poly_no.price;
        let cost_2 = quote.kalshi_no.price + quote.poly_yes.price;

        let min_total = cost_1.min(cost_2);
        if min_total > 1.0 - 2.0 * FEE_EPSILON {
            debug!(
                target: "bot",
                pair = %pair.pair_key,
                min_total,
                "prefiltered before fee evaluation"
            );
            return Evaluation {
                pair_key: pair.pair_key.clone(),
                cost_yes_k_no_p: cost_1,
                cost_no_k_yes_p: cost_2,
                verdict: Verdict::PreFiltered { min_total },
            };
        }

        let fees_1 = self.fees.kalshi.fee_per_unit(quote.kalshi_yes.price)
            + self.fees.poly.fee_per_unit(quote.poly_no.price);
        let fees_2 = self.fees.kalshi.fee_per_unit(quote.kalshi_no.price)
            + self.fees.poly.fee_per_unit(quote.poly_yes.price);

        let net_1 = 1.0 - cost_1 - fees_1;
        let net_2 = 1.0 - cost_2 - fees_2;

        // Strict `>` keeps ties on the lower strategy ordinal.
        let (strategy, net, cost, fees) = if net_2 > net_1 {
            (ArbStrategy::NoKalshiYesPoly, net_2, cost_2, fees_2)
        } else {
            (ArbStrategy::YesKalshiNoPoly, net_1, cost_1, fees_1)
        };

        let verdict = if net >= self.min_profit {
            Verdict::Emit(self.build_opportunity(pair, quote, strategy, net, cost, fees))
        } else {
            Verdict::BelowMinProfit { best_net: net, strategy }
        };

        Evaluation {
            pair_key: pair.pair_key.clone(),
            cost_yes_k_no_p: cost_1,
            cost_no_k_yes_p: cost_2,
            verdict,
        }
    }

    fn build_opportunity(
        &self,
        pair: &MatchedPair,
        quote: &PairQuote,
        strategy: ArbStrategy,
        net: f64,
        cost: f64,
        fees: f64,
    ) -> Opportunity {
        let ticker = &pair.kalshi.instrument;
        let (k_side, k_price, p_side, p_price) = match strategy {
            ArbStrategy::YesKalshiNoPoly => {
                (Side::BuyYes, quote.kalshi_yes.price, Side::BuyNo, quote.poly_no.price)
            }
            ArbStrategy::NoKalshiYesPoly => {
                (Side::BuyNo, quote.kalshi_no.price, Side::BuyYes, quote.poly_yes.price)
            }
        };

        let kalshi_leg = OpportunityLeg {
            venue: Venue::Kalshi,
            instrument: ticker.clone(),
            side: k_side,
            book_id: kalshi::book_id(ticker, k_side),
            price: k_price,
            hedge_instrument: ticker.clone(),
            hedge_book_id: kalshi::book_id(ticker, k_side.opposite()),
        };

        let tokens = &pair.polymarket.tokens;
        let (p_token, p_hedge_token) = match p_side {
            Side::BuyYes => (tokens.yes.clone(), tokens.no.clone()),
            Side::BuyNo => (tokens.no.clone(), tokens.yes.clone()),
        };
        let poly_leg = OpportunityLeg {
            venue: Venue::Polymarket,
            instrument: p_token.clone(),
            side: p_side,
            book_id: p_token,
            price: p_price,
            hedge_instrument: p_hedge_token.clone(),
            hedge_book_id: p_hedge_token,
        };

        Opportunity {
            pair_key: pair.pair_key.clone(),
            strategy,
            kalshi_leg,
            poly_leg,
            net_profit: net,
            total_cost: cost,
            fees,
            detected_at: Utc::now(),
            detected: Instant::now(),
        }
    }
}

fn memo_key(pair: &MatchedPair, quote: &PairQuote) -> MemoKey {
    let round = |p: f64| (p * 10_000.0).round() as i64;
    (
        pair.kalshi.instrument.clone(),
        pair.polymarket.instrument.clone(),
        [
            round(quote.kalshi_yes.price),
            round(quote.kalshi_no.price),
            round(quote.poly_yes.price),
            round(quote.poly_no.price),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{Asset, Market, OutcomeTokens, PriceLevel};
    use chrono::TimeZone;

    fn pair() -> MatchedPair {
        let res = Utc.with_ymd_and_hms(2026, 1, 10, 18, 45, 0).unwrap();
        let kalshi = Market {
            venue: Venue::Kalshi,
            instrument: "KXBTC15M-26JAN101845".to_string(),
            title: "BTC price up in next 15 mins?".to_string(),
            resolution_time: res,
            resolution_source: "CF Benchmarks".to_string(),
            yes_price: 0.5,
            no_price: 0.5,
            volume: 100.0,
            tokens: OutcomeTokens::default(),
        };
        let polymarket = Market {
            venue: Venue::Polymarket,
            instrument: "btc-updown-15m-1768070700".to_string(),
            title: "Bitcoin Up or Down - Jan 10 6:45PM".to_string(),
            resolution_time: res,
            resolution_source: "Chainlink".to_string(),
            yes_price: 0.5,
            no_price: 0.5,
            volume: 100.0,
            tokens: OutcomeTokens {
                yes: "ptoken-yes".to_string(),
                no: "ptoken-no".to_string(),
            },
        };
        MatchedPair::new(kalshi, polymarket, Asset::Btc, Utc::now())
    }

    fn quote(k_yes: f64, k_no: f64, p_yes: f64, p_no: f64) -> PairQuote {
        let lvl = |p| PriceLevel { price: p, size: 500.0 };
        PairQuote {
            kalshi_yes: lvl(k_yes),
            kalshi_no: lvl(k_no),
            poly_yes: lvl(p_yes),
            poly_no: lvl(p_no),
        }
    }

    fn detector() -> ArbitrageDetector {
        // Kalshi proportional 1% on notional, Polymarket 0.001 flat per unit.
        ArbitrageDetector::new(FeeSchedule::new(0.01, 0.001), 0.005, Duration::from_millis(100))
    }

    #[test]
    fn clean_hard_arb_is_emitted() {
        // Buy YES on Polymarket at 0.36, NO on Kalshi at 0.55:
        // cost 0.91, fees 0.001 + 0.01 * 0.55 = 0.0065, net 0.0835.
        let mut det = detector();
        let eval = det.evaluate(&pair(), &quote(0.60, 0.55, 0.36, 0.70));
        let opp = eval.opportunity().expect("expected an opportunity");
        assert_eq!(opp.strategy, ArbStrategy::NoKalshiYesPoly);
        assert!((opp.total_cost - 0.91).abs() < 1e-9);
        assert!((opp.fees - 0.0065).abs() < 1e-9);
        assert!((opp.net_profit - 0.0835).abs() < 1e-9);

        // Recomputing net from the stated prices and fees must agree exactly.
        let recomputed = 1.0 - opp.total_cost - opp.fees;
        assert!((recomputed - opp.net_profit).abs() < 1e-9);

        // Pre-resolved identifiers point at the bought outcomes.
        assert_eq!(opp.kalshi_leg.side, Side::BuyNo);
        assert_eq!(opp.kalshi_leg.book_id, "KXBTC15M-26JAN101845/no");
        assert_eq!(opp.poly_leg.instrument, "ptoken-yes");
        assert_eq!(opp.poly_leg.hedge_instrument, "ptoken-no");
    }

    #[test]
    fn prefilter_rejects_without_fee_evaluation() {
        let mut det = detector();
        let eval = det.evaluate(&pair(), &quote(0.50, 0.50, 0.50, 0.50));
        match eval.verdict {
            Verdict::PreFiltered { min_total } => assert!((min_total - 1.0).abs() < 1e-9),
            other => panic!("expected prefilter, got {other:?}"),
        }
        assert!(eval.rejection_reason().unwrap().starts_with("prefiltered"));
    }

    #[test]
    fn below_min_profit_is_rejected_with_reason() {
        // Net comes out just under the 0.005 floor: cost 0.985 both ways.
        let mut det = ArbitrageDetector::new(
            FeeSchedule::new(0.0, 0.0),
            0.05,
            Duration::from_millis(100),
        );
        let eval = det.evaluate(&pair(), &quote(0.49, 0.49, 0.48, 0.48));
        match eval.verdict {
            Verdict::BelowMinProfit { best_net, .. } => assert!(best_net < 0.05),
            other => panic!("expected below-min-profit, got {other:?}"),
        }
    }

    #[test]
    fn ties_break_on_strategy_ordinal() {
        // Symmetric quote: both strategies cost 0.90 with equal fees.
        let mut det = ArbitrageDetector::new(
            FeeSchedule::new(0.0, 0.0),
            0.005,
            Duration::from_millis(100),
        );
        let eval = det.evaluate(&pair(), &quote(0.45, 0.45, 0.45, 0.45));
        let opp = eval.opportunity().expect("tie should still emit");
        assert_eq!(opp.strategy, ArbStrategy::YesKalshiNoPoly);
    }

    #[test]
    fn memoizes_identical_quotes_within_ttl() {
        let mut det = detector();
        let q = quote(0.60, 0.55, 0.36, 0.70);
        let first = det.evaluate(&pair(), &q);
        let second = det.evaluate(&pair(), &q);
        let (a, b) = (first.opportunity().unwrap(), second.opportunity().unwrap());
        // The memoized evaluation is returned as-is, detection timestamp included.
        assert_eq!(a.detected_at, b.detected_at);
    }
}
