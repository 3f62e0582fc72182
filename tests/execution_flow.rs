//! Paper-mode integration tests driving the full decision pipeline:
//! detector evaluation, coordinator protocol, fill monitoring, unwind and
//! risk accounting, with no network involved.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use prediction_arb_bot::execution::{
    unwind, AbortReason, CoordinatorConfig, ExecutionBackend, ExecutionCoordinator, OrderStatus,
    PaperBackend, PaperPlan, TradeOutcome, UnwindCandidate, VenueOrder,
};
use prediction_arb_bot::market::{
    Asset, Market, MatchedPair, OrderbookCache, OrderbookSnapshot, OutcomeTokens, PriceLevel, Side,
    Venue,
};
use prediction_arb_bot::risk::{RiskLimits, RiskManager, RiskReject};
use prediction_arb_bot::strategy::{
    ArbStrategy, ArbitrageDetector, FeeSchedule, Opportunity, OpportunityLeg, PairQuote,
};

const TICKER: &str = "KXBTC15M-TEST";

fn fees() -> FeeSchedule {
    FeeSchedule::new(0.01, 0.001)
}

fn limits() -> RiskLimits {
    RiskLimits {
        max_risk_per_trade: 0.10,
        max_daily_loss: 0.20,
        max_net_exposure: 0.50,
    }
}

fn matched_pair() -> MatchedPair {
    let res = Utc::now() + chrono::Duration::seconds(600);
    let kalshi = Market {
        venue: Venue::Kalshi,
        instrument: TICKER.to_string(),
        title: "BTC price up in next 15 mins?".to_string(),
        resolution_time: res,
        resolution_source: "CF Benchmarks".to_string(),
        yes_price: 0.5,
        no_price: 0.5,
        volume: 1000.0,
        tokens: OutcomeTokens::default(),
    };
    let poly = Market {
        venue: Venue::Polymarket,
        instrument: "btc-updown-15m-test".to_string(),
        title: "Bitcoin Up or Down".to_string(),
        resolution_time: res,
        resolution_source: "Chainlink".to_string(),
        yes_price: 0.5,
        no_price: 0.5,
        volume: 1000.0,
        tokens: OutcomeTokens {
            yes: "tok-yes".to_string(),
            no: "tok-no".to_string(),
        },
    };
    MatchedPair::new(kalshi, poly, Asset::Btc, Utc::now())
}

/// Emit the canonical clean arb: buy NO on Kalshi at 0.55, YES on Polymarket
/// at 0.36. Cost 0.91, fees 0.0065, net 0.0835 per contract.
fn clean_opportunity() -> Opportunity {
    let lvl = |p| PriceLevel { price: p, size: 500.0 };
    let quote = PairQuote {
        kalshi_yes: lvl(0.60),
        kalshi_no: lvl(0.55),
        poly_yes: lvl(0.36),
        poly_no: lvl(0.70),
    };
    let mut detector = ArbitrageDetector::new(fees(), 0.005, Duration::from_millis(100));
    let eval = detector.evaluate(&matched_pair(), &quote);
    eval.opportunity().expect("clean arb must be emitted").clone()
}

fn book(venue: Venue, book_id: &str, price: f64, size: f64) -> OrderbookSnapshot {
    OrderbookSnapshot {
        venue,
        book_id: book_id.to_string(),
        asks: vec![PriceLevel { price, size }],
        bids: vec![],
        ts: Utc::now(),
    }
}

struct Harness {
    coordinator: ExecutionCoordinator,
    risk: Arc<RiskManager>,
    cache: Arc<OrderbookCache>,
}

fn harness(backend: PaperBackend, bankroll: f64) -> Harness {
    let risk = Arc::new(RiskManager::new(limits(), bankroll));
    let cache = Arc::new(OrderbookCache::new(Duration::from_millis(500)));
    let coordinator = ExecutionCoordinator::new(
        ExecutionBackend::Paper(backend),
        Arc::clone(&risk),
        Arc::clone(&cache),
        fees(),
        CoordinatorConfig::default(),
    );
    Harness {
        coordinator,
        risk,
        cache,
    }
}

fn seed_fresh_books(cache: &OrderbookCache) {
    cache.insert(book(Venue::Kalshi, &format!("{TICKER}/no"), 0.55, 500.0));
    cache.insert(book(Venue::Polymarket, "tok-yes", 0.36, 500.0));
}

#[tokio::test(start_paused = true)]
async fn clean_hard_arb_completes_and_registers_exposure() {
    let h = harness(PaperBackend::new(10_000.0), 100.0);
    seed_fresh_books(&h.cache);

    let opp = clean_opportunity();
    assert_eq!(opp.strategy, ArbStrategy::NoKalshiYesPoly);

    let outcome = h.coordinator.execute(&opp).await.unwrap();
    let trade = match outcome {
        TradeOutcome::Completed(trade) => trade,
        other => panic!("expected completed trade, got {other:?}"),
    };

    // 10% of a 100 bankroll at 0.91 per pair buys 10 contracts.
    assert_eq!(trade.size, 10.0);
    assert!((trade.total_cost - 9.10).abs() < 1e-9);
    assert!((trade.total_fees - 0.065).abs() < 1e-9);
    assert_eq!(trade.kalshi.status, OrderStatus::Filled);
    assert_eq!(trade.poly.status, OrderStatus::Filled);
    assert!(!trade.kalshi.order_id.is_empty());
    assert!(!trade.poly.order_id.is_empty());

    // Exposure reflects cost plus fees (0.9165 per contract).
    let snapshot = h.risk.snapshot();
    assert!((snapshot.current_exposure - 9.165).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn stale_cache_forces_refetch_and_continues() {
    let paper = PaperBackend::new(10_000.0);
    // No cache entries; the fan-out refetch serves these books.
    paper.set_book(book(Venue::Kalshi, &format!("{TICKER}/no"), 0.55, 500.0));
    paper.set_book(book(Venue::Polymarket, "tok-yes", 0.36, 500.0));
    let h = harness(paper, 100.0);

    let outcome = h.coordinator.execute(&clean_opportunity()).await.unwrap();
    assert!(matches!(outcome, TradeOutcome::Completed(_)));
}

#[tokio::test(start_paused = true)]
async fn stale_and_empty_book_aborts_cleanly() {
    let paper = PaperBackend::new(10_000.0);
    paper.set_book(OrderbookSnapshot {
        venue: Venue::Kalshi,
        book_id: format!("{TICKER}/no"),
        asks: vec![],
        bids: vec![],
        ts: Utc::now(),
    });
    paper.set_book(book(Venue::Polymarket, "tok-yes", 0.36, 500.0));
    let h = harness(paper, 100.0);

    let outcome = h.coordinator.execute(&clean_opportunity()).await.unwrap();
    match outcome {
        TradeOutcome::Aborted(reason) => {
            assert_eq!(reason.to_string(), "stale+empty on kalshi");
        }
        other => panic!("expected abort, got {other:?}"),
    }
    // Zero venue cost and zero exposure on pre-placement aborts.
    assert_eq!(h.risk.snapshot().current_exposure, 0.0);
}

#[tokio::test(start_paused = true)]
async fn thin_best_ask_fails_strict_liquidity() {
    let h = harness(PaperBackend::new(10_000.0), 100.0);
    // Only 3 contracts rest at the Kalshi target; trade needs 10.
    h.cache.insert(book(Venue::Kalshi, &format!("{TICKER}/no"), 0.55, 3.0));
    h.cache.insert(book(Venue::Polymarket, "tok-yes", 0.36, 500.0));

    let outcome = h.coordinator.execute(&clean_opportunity()).await.unwrap();
    assert!(matches!(
        outcome,
        TradeOutcome::Aborted(AbortReason::InsufficientLiquidity { venue: Venue::Kalshi, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn exposure_cap_refuses_trade_without_side_effects() {
    let h = harness(PaperBackend::new(10_000.0), 100.0);
    seed_fresh_books(&h.cache);
    // 49 of the 50 exposure cap is already committed.
    h.risk.register_trade(49.0);

    let outcome = h.coordinator.execute(&clean_opportunity()).await.unwrap();
    assert!(matches!(
        outcome,
        TradeOutcome::Aborted(AbortReason::Risk(RiskReject::NetExposure { .. }))
    ));
    assert_eq!(h.risk.snapshot().current_exposure, 49.0);
}

#[tokio::test(start_paused = true)]
async fn tiny_bankroll_aborts_on_min_notional() {
    let h = harness(PaperBackend::new(10_000.0), 5.0);
    seed_fresh_books(&h.cache);

    // A 0.50 budget fits zero contracts at 0.91; the $1 Polymarket floor
    // would force a size whose cost blows the per-trade cap.
    let outcome = h.coordinator.execute(&clean_opportunity()).await.unwrap();
    assert!(matches!(outcome, TradeOutcome::Aborted(AbortReason::Sizing(_))));
}

#[tokio::test(start_paused = true)]
async fn partial_fill_cancels_stub_and_neutralizes_excess() {
    let paper = PaperBackend::new(10_000.0);
    // Kalshi fills 5 of 10; the Polymarket leg rests untouched.
    paper.set_plan(TICKER, PaperPlan::Partial(0.5));
    paper.set_plan("tok-yes", PaperPlan::Rest);
    // Hedge book on Kalshi's opposite side is live.
    paper.set_book(book(Venue::Kalshi, &format!("{TICKER}/yes"), 0.45, 100.0));
    let h = harness(paper, 100.0);
    seed_fresh_books(&h.cache);

    let outcome = h.coordinator.execute(&clean_opportunity()).await.unwrap();
    let report = match outcome {
        TradeOutcome::Unwound(report) => report,
        other => panic!("expected unwind, got {other:?}"),
    };

    assert!(report.resolved);
    assert_eq!(report.residual, 0.0);
    assert_eq!(report.matched_size, 0.0);

    // The resting stub was canceled at zero cost before flattening.
    let cancel_steps: Vec<_> = report.steps.iter().filter(|s| s.action == "cancel").collect();
    assert!(!cancel_steps.is_empty());
    assert!(cancel_steps.iter().all(|s| s.cost == 0.0));

    // All three candidates were evaluated for the record.
    for candidate in [
        UnwindCandidate::CancelStub,
        UnwindCandidate::Hedge,
        UnwindCandidate::AggressiveExit,
    ] {
        assert!(
            report.evaluations.iter().any(|e| e.candidate == candidate),
            "missing evaluation for {candidate:?}"
        );
    }

    // The excess ended neutralized by hedge or aggressive exit.
    let last = report.steps.last().unwrap();
    assert!(last.action == "hedge" || last.action == "aggressive_exit");
}

#[tokio::test(start_paused = true)]
async fn rejected_leg_triggers_aggressive_exit_over_costly_hedge() {
    let paper = PaperBackend::new(10_000.0);
    paper.set_plan(TICKER, PaperPlan::Fill);
    paper.set_plan("tok-yes", PaperPlan::Reject);
    // Hedging 10 contracts at 0.45 would cost ~4.5; the sweep is ~0.1.
    paper.set_book(book(Venue::Kalshi, &format!("{TICKER}/yes"), 0.45, 100.0));
    let h = harness(paper, 100.0);
    seed_fresh_books(&h.cache);

    let outcome = h.coordinator.execute(&clean_opportunity()).await.unwrap();
    let report = match outcome {
        TradeOutcome::Unwound(report) => report,
        other => panic!("expected unwind, got {other:?}"),
    };

    assert!(report.resolved);
    assert_eq!(report.steps.last().unwrap().action, "aggressive_exit");

    // Dumping 10 contracts bought at 0.55 for 0.01 realizes a loss.
    let snapshot = h.risk.snapshot();
    assert!(snapshot.daily_pnl < -5.0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_unwind_fires_kill_switch() {
    let paper = PaperBackend::new(10_000.0);
    // No hedge book exists and the venue refuses the exit order.
    paper.set_plan(TICKER, PaperPlan::Reject);
    let backend = ExecutionBackend::Paper(paper);
    let risk = RiskManager::new(limits(), 100.0);

    let leg = OpportunityLeg {
        venue: Venue::Kalshi,
        instrument: TICKER.to_string(),
        side: Side::BuyNo,
        book_id: format!("{TICKER}/no"),
        price: 0.55,
        hedge_instrument: TICKER.to_string(),
        hedge_book_id: format!("{TICKER}/yes"),
    };
    let poly_leg = OpportunityLeg {
        venue: Venue::Polymarket,
        instrument: "tok-yes".to_string(),
        side: Side::BuyYes,
        book_id: "tok-yes".to_string(),
        price: 0.36,
        hedge_instrument: "tok-no".to_string(),
        hedge_book_id: "tok-no".to_string(),
    };

    let filled = VenueOrder {
        venue: Venue::Kalshi,
        order_id: "k-1".to_string(),
        status: OrderStatus::Filled,
        filled_size: 10.0,
        avg_price: 0.55,
    };

    let report = unwind::unwind(
        &backend,
        &fees(),
        &risk,
        "btc:test",
        unwind::LegState { leg: &leg, order: Some(filled), target: 10.0 },
        unwind::LegState { leg: &poly_leg, order: None, target: 10.0 },
    )
    .await;

    assert!(!report.resolved);
    assert_eq!(report.residual, 10.0);
    assert!(risk.kill_switch_reason().is_some());
    // With the switch set, every subsequent gate decision is a refusal.
    assert!(matches!(risk.can_execute(0.01), Err(RiskReject::KillSwitch(_))));
}

#[tokio::test]
async fn stale_opportunity_is_discarded_at_consumption() {
    let h = harness(PaperBackend::new(10_000.0), 100.0);
    seed_fresh_books(&h.cache);

    let opp = clean_opportunity();
    // Opportunity age is wall-clock; wait out the 500 ms staleness bound.
    std::thread::sleep(Duration::from_millis(600));

    let outcome = h.coordinator.execute(&opp).await.unwrap();
    assert!(matches!(
        outcome,
        TradeOutcome::Aborted(AbortReason::StaleOpportunity { .. })
    ));
}
