use serde::Serialize;
use tracing::{info, warn};

use crate::market::Venue;
use crate::risk::RiskManager;
use crate::strategy::{FeeSchedule, OpportunityLeg};

use super::order::{OrderTicket, VenueOrder};
use super::ExecutionBackend;

/// One-tick slippage model for an aggressive exit: selling back at the sweep
/// limit is expected to give up about one tick per contract.
pub const AGGRESSIVE_EXIT_EDGE: f64 = 0.01;

/// Sweep limit for selling back an unwanted outcome token. (The venue-native
/// quote for the same YES exit on Kalshi is the 0.99 complement.)
pub const AGGRESSIVE_SELL_LIMIT: f64 = 0.01;

/// Neutralization paths for an imbalanced position, cheapest wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnwindCandidate {
    CancelStub,
    Hedge,
    AggressiveExit,
}

/// Cost evaluation of one candidate, kept for post-trade analysis.
#[derive(Clone, Debug, Serialize)]
pub struct CandidateEval {
    pub candidate: UnwindCandidate,
    pub cost: Option<f64>,
    pub feasible: bool,
    pub detail: String,
}

/// An action the planner actually took.
#[derive(Clone, Debug, Serialize)]
pub struct UnwindStep {
    pub action: String,
    pub venue: Venue,
    pub order_id: Option<String>,
    pub cost: f64,
}

/// Complete record of an unwind: every candidate evaluated, every step taken,
/// and whether net exposure on the pair returned to zero.
#[derive(Clone, Debug, Serialize)]
pub struct UnwindReport {
    pub pair_key: String,
    pub steps: Vec<UnwindStep>,
    pub evaluations: Vec<CandidateEval>,
    /// Contracts hedged across venues by opposing filled legs.
    pub matched_size: f64,
    /// Contracts left exposed after the unwind (zero on success).
    pub residual: f64,
    pub resolved: bool,
}

/// Post-placement state of one leg as seen by the planner.
pub struct LegState<'a> {
    pub leg: &'a OpportunityLeg,
    pub order: Option<VenueOrder>,
    pub target: f64,
}

impl LegState<'_> {
    fn filled(&self) -> f64 {
        self.order.as_ref().map(|o| o.filled_size).unwrap_or(0.0)
    }

    fn cancelable(&self) -> bool {
        self.order
            .as_ref()
            .map(|o| !o.status.is_terminal() && o.filled_size < self.target)
            .unwrap_or(false)
    }
}

/// Evaluate neutralization costs for `qty` excess contracts on one venue.
///
/// The hedge requires live depth on the opposite-outcome book; the aggressive
/// exit is always considered and modeled as one tick of slippage plus fees.
pub fn plan_candidates(
    qty: f64,
    fee: crate::strategy::FeeModel,
    opposite_best_ask: Option<f64>,
) -> Vec<CandidateEval> {
    let mut evals = Vec::with_capacity(2);

    match opposite_best_ask {
        Some(ask) => evals.push(CandidateEval {
            candidate: UnwindCandidate::Hedge,
            cost: Some(ask * qty + fee.fee(ask, qty)),
            feasible: true,
            detail: format!("opposite best ask {ask:.4}"),
        }),
        None => evals.push(CandidateEval {
            candidate: UnwindCandidate::Hedge,
            cost: None,
            feasible: false,
            detail: "opposite book empty".to_string(),
        }),
    }

    evals.push(CandidateEval {
        candidate: UnwindCandidate::AggressiveExit,
        cost: Some(AGGRESSIVE_EXIT_EDGE * qty + fee.fee(AGGRESSIVE_SELL_LIMIT, qty)),
        feasible: true,
        detail: format!("sweep at {AGGRESSIVE_SELL_LIMIT:.2}"),
    });

    evals
}

/// Cheapest feasible candidate.
pub fn choose(evals: &[CandidateEval]) -> Option<UnwindCandidate> {
    evals
        .iter()
        .filter(|e| e.feasible && e.cost.is_some())
        .min_by(|a, b| a.cost.unwrap().total_cmp(&b.cost.unwrap()))
        .map(|e| e.candidate)
}

/// Neutralize an asymmetric post-placement state.
///
/// Cancels any live stub first, then flattens the excess on the over-filled
/// leg via the cheaper of hedge and aggressive exit. If every path fails the
/// kill switch fires; an undetected one-sided position is never left behind
/// silently.
pub async fn unwind(
    backend: &ExecutionBackend,
    fees: &FeeSchedule,
    risk: &RiskManager,
    pair_key: &str,
    mut kalshi: LegState<'_>,
    mut poly: LegState<'_>,
) -> UnwindReport {
    let mut steps = Vec::new();
    let mut evaluations = Vec::new();

    for leg in [&mut kalshi, &mut poly] {
        if !leg.cancelable() {
            continue;
        }
        let order_id = leg.order.as_ref().map(|o| o.order_id.clone()).unwrap_or_default();
        match backend.cancel(leg.leg.venue, &order_id).await {
            Ok(updated) => {
                evaluations.push(CandidateEval {
                    candidate: UnwindCandidate::CancelStub,
                    cost: Some(0.0),
                    feasible: true,
                    detail: format!("{} order {order_id}", leg.leg.venue),
                });
                steps.push(UnwindStep {
                    action: "cancel".to_string(),
                    venue: leg.leg.venue,
                    order_id: Some(order_id),
                    cost: 0.0,
                });
                leg.order = Some(updated);
            }
            Err(err) => {
                // The cancel may have raced a fill; re-read before deciding.
                warn!(target: "execution", error = %err, "cancel failed during unwind");
                if let Ok(current) = backend.order_status(leg.leg.venue, &order_id).await {
                    leg.order = Some(current);
                }
            }
        }
    }

    let matched = kalshi.filled().min(poly.filled());
    let (excess_leg, excess_qty) = if kalshi.filled() > poly.filled() {
        (&kalshi, kalshi.filled() - poly.filled())
    } else {
        (&poly, poly.filled() - kalshi.filled())
    };

    if excess_qty <= 0.0 {
        return UnwindReport {
            pair_key: pair_key.to_string(),
            steps,
            evaluations,
            matched_size: matched,
            residual: 0.0,
            resolved: true,
        };
    }

    let leg = excess_leg.leg;
    let held_price = excess_leg
        .order
        .as_ref()
        .map(|o| if o.avg_price > 0.0 { o.avg_price } else { leg.price })
        .unwrap_or(leg.price);
    let fee = fees.for_venue(leg.venue);

    let opposite_best_ask = match backend.fetch_book(leg.venue, &leg.hedge_book_id).await {
        Ok(book) => book.best_ask().map(|l| l.price),
        Err(err) => {
            warn!(target: "execution", error = %err, "failed to fetch hedge book");
            None
        }
    };

    let excess_evals = plan_candidates(excess_qty, fee, opposite_best_ask);
    evaluations.extend(excess_evals.iter().cloned());

    let mut attempts: Vec<UnwindCandidate> = Vec::new();
    if let Some(first) = choose(&excess_evals) {
        attempts.push(first);
        let fallback = match first {
            UnwindCandidate::Hedge => UnwindCandidate::AggressiveExit,
            _ => UnwindCandidate::Hedge,
        };
        if excess_evals.iter().any(|e| e.candidate == fallback && e.feasible) {
            attempts.push(fallback);
        }
    }

    for candidate in attempts {
        let outcome = match candidate {
            UnwindCandidate::Hedge => {
                let ask = match opposite_best_ask {
                    Some(a) => a,
                    None => continue,
                };
                let ticket = OrderTicket::new(
                    leg.venue,
                    &leg.hedge_instrument,
                    leg.side.opposite(),
                    ask,
                    excess_qty,
                );
                match backend.place(&ticket).await {
                    Ok(o) if o.filled_size >= excess_qty - 1e-9 => {
                        let cost = ask * excess_qty + fee.fee(ask, excess_qty);
                        // The excess is now a riskless same-venue pair held to
                        // resolution; its full cost counts as exposure.
                        risk.register_trade(held_price * excess_qty + cost);
                        Some(("hedge", o.order_id, cost))
                    }
                    Ok(o) => {
                        warn!(
                            target: "execution",
                            filled = o.filled_size,
                            needed = excess_qty,
                            "hedge under-filled"
                        );
                        None
                    }
                    Err(err) => {
                        warn!(target: "execution", error = %err, "hedge placement failed");
                        None
                    }
                }
            }
            UnwindCandidate::AggressiveExit => {
                let ticket = OrderTicket::sell(
                    leg.venue,
                    &leg.instrument,
                    leg.side,
                    AGGRESSIVE_SELL_LIMIT,
                    excess_qty,
                );
                match backend.place(&ticket).await {
                    Ok(o) if o.filled_size >= excess_qty - 1e-9 => {
                        let recovered = o.avg_price.max(AGGRESSIVE_SELL_LIMIT) * excess_qty;
                        let loss =
                            held_price * excess_qty - recovered + fee.fee(AGGRESSIVE_SELL_LIMIT, excess_qty);
                        risk.update_pnl(-loss);
                        Some(("aggressive_exit", o.order_id, loss))
                    }
                    Ok(o) => {
                        warn!(
                            target: "execution",
                            filled = o.filled_size,
                            needed = excess_qty,
                            "aggressive exit under-filled"
                        );
                        None
                    }
                    Err(err) => {
                        warn!(target: "execution", error = %err, "aggressive exit failed");
                        None
                    }
                }
            }
            UnwindCandidate::CancelStub => None,
        };

        if let Some((action, order_id, cost)) = outcome {
            info!(
                target: "execution",
                pair = pair_key,
                action,
                qty = excess_qty,
                cost,
                "imbalance neutralized"
            );
            steps.push(UnwindStep {
                action: action.to_string(),
                venue: leg.venue,
                order_id: Some(order_id),
                cost,
            });
            return UnwindReport {
                pair_key: pair_key.to_string(),
                steps,
                evaluations,
                matched_size: matched,
                residual: 0.0,
                resolved: true,
            };
        }
    }

    risk.trigger_kill_switch(&format!(
        "unwind exhausted on {pair_key}: {excess_qty} contracts stranded on {}",
        leg.venue
    ));
    UnwindReport {
        pair_key: pair_key.to_string(),
        steps,
        evaluations,
        matched_size: matched,
        residual: excess_qty,
        resolved: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::FeeModel;

    #[test]
    fn aggressive_exit_beats_costly_hedge() {
        // Hedge at 0.45 for 10 contracts with a 0.001 flat fee costs 4.51;
        // the aggressive sweep is modeled at 0.11. Planner must pick the sweep.
        let evals = plan_candidates(10.0, FeeModel::PerUnit(0.001), Some(0.45));
        let hedge = evals.iter().find(|e| e.candidate == UnwindCandidate::Hedge).unwrap();
        let aggr = evals
            .iter()
            .find(|e| e.candidate == UnwindCandidate::AggressiveExit)
            .unwrap();
        assert!((hedge.cost.unwrap() - 4.51).abs() < 1e-9);
        assert!((aggr.cost.unwrap() - 0.11).abs() < 1e-9);
        assert_eq!(choose(&evals), Some(UnwindCandidate::AggressiveExit));
    }

    #[test]
    fn cheap_hedge_wins() {
        // A 0.005 opposite ask makes the hedge cheaper than one tick of
        // slippage per contract.
        let evals = plan_candidates(10.0, FeeModel::PerUnit(0.0), Some(0.005));
        assert_eq!(choose(&evals), Some(UnwindCandidate::Hedge));
    }

    #[test]
    fn empty_opposite_book_forces_aggressive() {
        let evals = plan_candidates(5.0, FeeModel::Proportional(0.01), None);
        let hedge = evals.iter().find(|e| e.candidate == UnwindCandidate::Hedge).unwrap();
        assert!(!hedge.feasible);
        assert_eq!(choose(&evals), Some(UnwindCandidate::AggressiveExit));
    }

    #[test]
    fn hedge_cost_for_partial_cancel_path() {
        // After a clean cancel of the 0/10 stub, flattening the 5 filled
        // contracts hedges at the opposite ask.
        let evals = plan_candidates(5.0, FeeModel::Proportional(0.01), Some(0.55));
        let hedge = evals.iter().find(|e| e.candidate == UnwindCandidate::Hedge).unwrap();
        let expected = 0.55 * 5.0 + 0.01 * 0.55 * 5.0;
        assert!((hedge.cost.unwrap() - expected).abs() < 1e-9);
    }
}
