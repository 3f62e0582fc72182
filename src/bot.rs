use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::client::feeds::{spawn_kalshi_feed, spawn_poly_feed, BookUpdate, FeedHandle};
use crate::client::{kalshi, KalshiClient, PolymarketClient};
use crate::execution::{
    ExecutionBackend, ExecutionCoordinator, LiveVenues, PaperBackend, TradeOutcome,
};
use crate::market::{EventMatcher, Market, MatchedPair, OrderbookCache, Side, Venue};
use crate::monitoring::{dashboard, logger, METRICS};
use crate::risk::RiskManager;
use crate::storage::state::RiskDayState;
use crate::storage::{
    create_pg_pool, create_redis_client, OpportunityRecorder, PairRecorder, RedisRiskStore,
    RiskRecorder, TradeRecorder,
};
use crate::strategy::{ArbStrategy, ArbitrageDetector, FeeSchedule, PairQuote};
use crate::types::{AppConfig, Credentials, ExecutionMode, OrchestratorConfig};
use crate::utils::time::seconds_to_close;

/// Matched pairs currently under monitoring, indexed by outcome book.
#[derive(Default)]
pub struct PairIndex {
    pairs: HashMap<String, MatchedPair>,
    by_book: HashMap<(Venue, String), String>,
}

impl PairIndex {
    pub fn insert(&mut self, pair: MatchedPair) {
        let key = pair.pair_key.clone();
        for side in [Side::BuyYes, Side::BuyNo] {
            self.by_book.insert(
                (Venue::Kalshi, kalshi::book_id(&pair.kalshi.instrument, side)),
                key.clone(),
            );
        }
        let tokens = &pair.polymarket.tokens;
        self.by_book
            .insert((Venue::Polymarket, tokens.yes.clone()), key.clone());
        self.by_book
            .insert((Venue::Polymarket, tokens.no.clone()), key.clone());
        self.pairs.insert(key, pair);
    }

    pub fn pair_for_book(&self, venue: Venue, book_id: &str) -> Option<&MatchedPair> {
        let key = self.by_book.get(&(venue, book_id.to_string()))?;
        self.pairs.get(key)
    }

    pub fn contains(&self, pair_key: &str) -> bool {
        self.pairs.contains_key(pair_key)
    }

    pub fn remove(&mut self, pair_key: &str) {
        if let Some(pair) = self.pairs.remove(pair_key) {
            for side in [Side::BuyYes, Side::BuyNo] {
                self.by_book
                    .remove(&(Venue::Kalshi, kalshi::book_id(&pair.kalshi.instrument, side)));
            }
            self.by_book
                .remove(&(Venue::Polymarket, pair.polymarket.tokens.yes.clone()));
            self.by_book
                .remove(&(Venue::Polymarket, pair.polymarket.tokens.no.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Sticky-market and cooldown policy state. One pair receives updates at a
/// time; during cooldown every update is dropped before any detector work.
pub struct StickyState {
    active_pair: Option<String>,
    cooldown_until: Option<Instant>,
    last_executed: HashMap<(String, ArbStrategy), Instant>,
}

/// What the policy allows for an incoming update.
#[derive(Debug, PartialEq, Eq)]
pub enum Gate {
    /// In cooldown; drop before any detector or coordinator work.
    Cooldown,
    /// A different pair holds the focus; drop.
    OtherPairActive,
    /// This update's pair is (now) the active pair.
    Proceed,
}

impl StickyState {
    pub fn new() -> Self {
        Self {
            active_pair: None,
            cooldown_until: None,
            last_executed: HashMap::new(),
        }
    }

    pub fn gate(&mut self, pair_key: &str, now: Instant) -> Gate {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return Gate::Cooldown;
            }
            self.cooldown_until = None;
        }
        match &self.active_pair {
            None => {
                self.active_pair = Some(pair_key.to_string());
                Gate::Proceed
            }
            Some(active) if active == pair_key => Gate::Proceed,
            Some(_) => Gate::OtherPairActive,
        }
    }

    pub fn clear_active(&mut self, pair_key: &str) {
        if self.active_pair.as_deref() == Some(pair_key) {
            self.active_pair = None;
        }
    }

    pub fn begin_cooldown(&mut self, duration: Duration, now: Instant) {
        self.cooldown_until = Some(now + duration);
        self.active_pair = None;
    }

    /// True when this (pair, strategy) executed within the dedupe window.
    pub fn is_duplicate(
        &mut self,
        key: (String, ArbStrategy),
        window: Duration,
        now: Instant,
    ) -> bool {
        if let Some(last) = self.last_executed.get(&key) {
            if now.duration_since(*last) < window {
                return true;
            }
        }
        self.last_executed.insert(key, now);
        false
    }
}

impl Default for StickyState {
    fn default() -> Self {
        Self::new()
    }
}

/// Tradability filters: enough time to resolution and every leg price inside
/// the configured band on both venues.
pub fn pair_passes_filters(
    pair: &MatchedPair,
    quote: &PairQuote,
    cfg: &OrchestratorConfig,
    now: chrono::DateTime<Utc>,
) -> Result<(), String> {
    let ttc = seconds_to_close(pair.resolution_time, now);
    if ttc < cfg.time_to_close_min_s {
        return Err(format!("time to close {ttc}s below {}s", cfg.time_to_close_min_s));
    }
    let [lo, hi] = cfg.price_band;
    for price in quote.prices() {
        if price < lo || price > hi {
            return Err(format!("price {price:.2} outside band [{lo:.2}, {hi:.2}]"));
        }
    }
    Ok(())
}

struct Recorders {
    pairs: PairRecorder,
    opportunities: OpportunityRecorder,
    trades: TradeRecorder,
    risk: RiskRecorder,
}

struct Orchestrator {
    cfg: AppConfig,
    cache: Arc<OrderbookCache>,
    risk: Arc<RiskManager>,
    coordinator: Arc<ExecutionCoordinator>,
    detector: ArbitrageDetector,
    sticky: StickyState,
    index: Arc<RwLock<PairIndex>>,
    recorders: Arc<Recorders>,
    redis: Arc<tokio::sync::Mutex<RedisRiskStore>>,
    kalshi_client: Arc<KalshiClient>,
    poly_client: Arc<PolymarketClient>,
    matcher: Arc<EventMatcher>,
    kalshi_feed: Arc<FeedHandle>,
    poly_feed: Arc<FeedHandle>,
}

impl Orchestrator {
    /// Fresh top-of-book for all four outcome books, or `None` while the
    /// cache is still warming up for this pair.
    fn build_quote(&self, pair: &MatchedPair) -> Option<PairQuote> {
        let ticker = &pair.kalshi.instrument;
        let k_yes = self
            .cache
            .fresh(Venue::Kalshi, &kalshi::book_id(ticker, Side::BuyYes))?
            .best_ask()?;
        let k_no = self
            .cache
            .fresh(Venue::Kalshi, &kalshi::book_id(ticker, Side::BuyNo))?
            .best_ask()?;
        let p_yes = self
            .cache
            .fresh(Venue::Polymarket, &pair.polymarket.tokens.yes)?
            .best_ask()?;
        let p_no = self
            .cache
            .fresh(Venue::Polymarket, &pair.polymarket.tokens.no)?
            .best_ask()?;
        Some(PairQuote {
            kalshi_yes: k_yes,
            kalshi_no: k_no,
            poly_yes: p_yes,
            poly_no: p_no,
        })
    }

    async fn handle_update(&mut self, update: BookUpdate) {
        METRICS.record_book_update();

        let pair = {
            let index = self.index.read().expect("pair index poisoned");
            match index.pair_for_book(update.venue, &update.book_id) {
                Some(pair) => pair.clone(),
                None => return,
            }
        };

        let now = Utc::now();
        if pair.expired(now) {
            self.index
                .write()
                .expect("pair index poisoned")
                .remove(&pair.pair_key);
            self.sticky.clear_active(&pair.pair_key);
            return;
        }

        // Pairs can stop being equivalent before either side closes (venue
        // edits a title, resolution drifts past tolerance). Re-check and
        // close the pair the same way expiry does.
        if self.matcher.are_equivalent(&pair.kalshi, &pair.polymarket).is_none() {
            warn!(
                target: "bot",
                pair = %pair.pair_key,
                "semantic equivalence broke; closing pair"
            );
            self.index
                .write()
                .expect("pair index poisoned")
                .remove(&pair.pair_key);
            self.sticky.clear_active(&pair.pair_key);
            return;
        }

        // Cooldown and sticky policy run before any detector work.
        match self.sticky.gate(&pair.pair_key, Instant::now()) {
            Gate::Cooldown | Gate::OtherPairActive => return,
            Gate::Proceed => {}
        }

        let Some(quote) = self.build_quote(&pair) else {
            return;
        };

        if let Err(reason) = pair_passes_filters(&pair, &quote, &self.cfg.orchestrator, now) {
            self.sticky.clear_active(&pair.pair_key);
            tracing::debug!(target: "bot", pair = %pair.pair_key, reason, "filters stopped holding");
            return;
        }

        let eval = self.detector.evaluate(&pair, &quote);
        let Some(opp) = eval.opportunity().cloned() else {
            // Profitable-looking quotes that fail fee evaluation feed the
            // audit trail; pre-filtered quotes are too numerous to store.
            if let Some(reason) = eval.rejection_reason() {
                if !reason.starts_with("prefiltered") {
                    METRICS.record_rejection(&eval.pair_key, &reason);
                    self.record_evaluation(&eval, "rejected", Some(reason)).await;
                }
            }
            return;
        };

        if self.sticky.is_duplicate(
            opp.dedupe_key(),
            Duration::from_secs(self.cfg.orchestrator.dedupe_window_s),
            Instant::now(),
        ) {
            info!(target: "bot", pair = %opp.pair_key, strategy = %opp.strategy, "duplicate opportunity in dedupe window");
            return;
        }

        METRICS.record_opportunity(&opp.pair_key, opp.net_profit);
        self.record_evaluation(&eval, "emitted", None).await;

        match self.coordinator.execute(&opp).await {
            Ok(TradeOutcome::Completed(trade)) => {
                METRICS.record_trade_completed(&trade.pair_key);
                if let Err(err) = self.recorders.trades.record_trade(&trade).await {
                    warn!(target: "storage", error = %err, "failed to record trade");
                }
                self.after_trade().await;
            }
            Ok(TradeOutcome::Unwound(report)) => {
                METRICS.record_trade_unwound(&report.pair_key);
                if let Err(err) = self.recorders.trades.record_unwind(&report).await {
                    warn!(target: "storage", error = %err, "failed to record unwind");
                }
                self.after_trade().await;
            }
            Ok(TradeOutcome::Aborted(reason)) => {
                METRICS.record_abort(&opp.pair_key, &reason.to_string());
                self.record_evaluation(&eval, "aborted", Some(reason.to_string()))
                    .await;
            }
            Err(err) => {
                warn!(target: "execution", error = %err, "fatal execution error");
                self.risk
                    .trigger_kill_switch(&format!("execution infrastructure failure: {err}"));
            }
        }
    }

    async fn record_evaluation(
        &self,
        eval: &crate::strategy::Evaluation,
        decision: &str,
        reason: Option<String>,
    ) {
        if let Err(err) = self
            .recorders
            .opportunities
            .record_evaluation(eval, decision, reason.as_deref())
            .await
        {
            warn!(target: "storage", error = %err, "failed to record opportunity");
        }
    }

    /// Post-trade bookkeeping: persist risk state, start the cooldown, and
    /// rediscover the catalog in the background.
    async fn after_trade(&mut self) {
        persist_risk_state(&self.risk, &self.recorders, &self.redis).await;

        self.sticky.begin_cooldown(
            Duration::from_secs(self.cfg.orchestrator.trade_cooldown_s),
            Instant::now(),
        );
        info!(
            target: "bot",
            cooldown_s = self.cfg.orchestrator.trade_cooldown_s,
            "trade settled; cooldown started"
        );

        // Fire-and-forget: instruments live ~15 minutes, so the only moment
        // new markets matter is right after a trade consumed this round.
        let kalshi_client = Arc::clone(&self.kalshi_client);
        let poly_client = Arc::clone(&self.poly_client);
        let matcher = Arc::clone(&self.matcher);
        let index = Arc::clone(&self.index);
        let recorders = Arc::clone(&self.recorders);
        let kalshi_feed = Arc::clone(&self.kalshi_feed);
        let poly_feed = Arc::clone(&self.poly_feed);
        let discovery = self.cfg.discovery.clone();
        let tag_id = self.cfg.polymarket.tag_id;
        tokio::spawn(async move {
            match discover_pairs(&kalshi_client, &poly_client, &matcher, &discovery, tag_id).await {
                Ok(pairs) => {
                    subscribe_new_pairs(pairs, &index, &recorders, &kalshi_feed, &poly_feed).await;
                }
                Err(err) => {
                    warn!(target: "bot", error = %err, "post-trade rediscovery failed");
                }
            }
        });
    }
}

/// Markets whose published prices violate the binary invariants never enter
/// matching or quoting.
fn drop_insane_prices(markets: Vec<Market>) -> Vec<Market> {
    markets
        .into_iter()
        .filter(|m| {
            if m.prices_sane() {
                true
            } else {
                warn!(
                    target: "bot",
                    venue = %m.venue,
                    instrument = %m.instrument,
                    yes_price = m.yes_price,
                    no_price = m.no_price,
                    "skipping market with malformed prices"
                );
                false
            }
        })
        .collect()
}

/// Fetch both catalogs in parallel, match them, and keep only pairs whose
/// Polymarket tokens trade on the CLOB.
async fn discover_pairs(
    kalshi_client: &KalshiClient,
    poly_client: &PolymarketClient,
    matcher: &EventMatcher,
    discovery: &crate::types::DiscoveryConfig,
    poly_tag: u64,
) -> anyhow::Result<Vec<MatchedPair>> {
    let kalshi_fut = async {
        let mut all = Vec::new();
        for series in &discovery.kalshi_series {
            match kalshi_client.fetch_markets(series, discovery.kalshi_limit).await {
                Ok(markets) => all.extend(markets),
                Err(err) => {
                    warn!(target: "bot", series = %series, error = %err, "kalshi catalog fetch failed");
                }
            }
        }
        all
    };
    let poly_fut = poly_client.fetch_markets(poly_tag, discovery.poly_limit);

    let (kalshi_markets, poly_markets) = tokio::join!(kalshi_fut, poly_fut);
    let poly_markets = poly_markets?;
    let kalshi_markets = drop_insane_prices(kalshi_markets);
    let poly_markets = drop_insane_prices(poly_markets);
    info!(
        target: "bot",
        kalshi = kalshi_markets.len(),
        polymarket = poly_markets.len(),
        "catalogs fetched"
    );

    let now = Utc::now();
    let matched: Vec<MatchedPair> = matcher
        .match_catalogs(&kalshi_markets, &poly_markets)
        .into_iter()
        .filter(|pair| !pair.expired(now))
        .collect();

    // Token validation runs after matching so only a handful of tokens hit
    // the CLOB.
    let mut validated = Vec::with_capacity(matched.len());
    for pair in matched {
        let tokens = &pair.polymarket.tokens;
        if poly_client.validate_token(&tokens.yes).await && poly_client.validate_token(&tokens.no).await
        {
            validated.push(pair);
        } else {
            tracing::debug!(
                target: "bot",
                pair = %pair.pair_key,
                "skipping pair with untradable polymarket tokens"
            );
        }
    }

    info!(target: "bot", pairs = validated.len(), "matched pairs validated");
    Ok(validated)
}

async fn subscribe_new_pairs(
    pairs: Vec<MatchedPair>,
    index: &Arc<RwLock<PairIndex>>,
    recorders: &Arc<Recorders>,
    kalshi_feed: &Arc<FeedHandle>,
    poly_feed: &Arc<FeedHandle>,
) {
    let mut new_tickers = Vec::new();
    let mut new_tokens = Vec::new();
    let mut new_pairs = Vec::new();
    {
        let mut index = index.write().expect("pair index poisoned");
        for pair in pairs {
            if index.contains(&pair.pair_key) {
                continue;
            }
            new_tickers.push(pair.kalshi.instrument.clone());
            new_tokens.push(pair.polymarket.tokens.yes.clone());
            new_tokens.push(pair.polymarket.tokens.no.clone());
            index.insert(pair.clone());
            new_pairs.push(pair);
        }
    }

    for pair in &new_pairs {
        if let Err(err) = recorders.pairs.record_pair(pair).await {
            warn!(target: "storage", error = %err, "failed to record pair");
        }
    }

    if !new_tickers.is_empty() {
        kalshi_feed.subscribe(new_tickers);
    }
    if !new_tokens.is_empty() {
        poly_feed.subscribe(new_tokens);
    }
}

async fn persist_risk_state(
    risk: &Arc<RiskManager>,
    recorders: &Arc<Recorders>,
    redis: &Arc<tokio::sync::Mutex<RedisRiskStore>>,
) {
    let snapshot = risk.snapshot();
    if let Err(err) = recorders.risk.record_snapshot(&snapshot).await {
        warn!(target: "storage", error = %err, "failed to record risk snapshot");
    }
    let day_state = RiskDayState {
        daily_pnl: snapshot.daily_pnl,
        current_exposure: snapshot.current_exposure,
    };
    let mut store = redis.lock().await;
    if let Err(err) = store.save(chrono::Local::now().date_naive(), &day_state).await {
        warn!(target: "storage", error = %err, "failed to save risk day state");
    }
}

/// Entrypoint used by `main.rs` to start the bot.
///
/// Wires venue adapters, push feeds, the matcher, detector, risk manager,
/// coordinator, storage and monitoring into one event-driven loop.
pub async fn run_bot(cfg: AppConfig) -> anyhow::Result<()> {
    info!(target: "bot", "run_bot starting");
    logger::log_startup(&cfg);

    dashboard::spawn_dashboard_task(Duration::from_secs(10));

    // Storage backends; connecting eagerly surfaces misconfiguration early.
    let pool = create_pg_pool(&cfg.postgres.url).await?;
    let recorders = Arc::new(Recorders {
        pairs: PairRecorder::new(pool.clone()),
        opportunities: OpportunityRecorder::new(pool.clone()),
        trades: TradeRecorder::new(pool.clone()),
        risk: RiskRecorder::new(pool),
    });
    let redis_client = create_redis_client(&cfg.redis.url)?;
    let redis = Arc::new(tokio::sync::Mutex::new(RedisRiskStore::new(redis_client).await?));

    // Venue adapters. Market data always comes from the live venues; paper
    // mode only swaps the order path.
    let creds = Credentials::from_env()?;
    let kalshi_client = Arc::new(KalshiClient::new(
        &cfg.kalshi.base_url,
        &creds.kalshi_key_id,
        &creds.kalshi_secret,
    )?);
    let poly_client = Arc::new(PolymarketClient::new(
        &cfg.polymarket.gamma_url,
        &cfg.polymarket.clob_url,
        creds.poly,
    )?);

    let backend = match cfg.execution.mode {
        ExecutionMode::Paper => ExecutionBackend::Paper(
            PaperBackend::new(cfg.execution.paper_bankroll).with_live_data(LiveVenues {
                kalshi: Arc::clone(&kalshi_client),
                poly: Arc::clone(&poly_client),
            }),
        ),
        ExecutionMode::Live => ExecutionBackend::Live(LiveVenues {
            kalshi: Arc::clone(&kalshi_client),
            poly: Arc::clone(&poly_client),
        }),
    };

    // Risk manager seeded from the venue-of-record balance, with today's
    // counters restored after a mid-day restart.
    let initial_balance = backend.fetch_balance_of_record().await?;
    let risk = Arc::new(RiskManager::new(cfg.risk, initial_balance));
    {
        let mut store = redis.lock().await;
        if let Ok(Some(day)) = store.load(chrono::Local::now().date_naive()).await {
            risk.restore(day.daily_pnl, day.current_exposure);
        }
    }
    info!(target: "risk", bankroll = initial_balance, "risk manager initialized");

    let cache = Arc::new(OrderbookCache::new(Duration::from_millis(
        cfg.market_data.orderbook_ttl_ms,
    )));
    let fees = FeeSchedule::new(cfg.fees.kalshi_rate, cfg.fees.poly_per_unit);
    let coordinator = Arc::new(ExecutionCoordinator::new(
        backend,
        Arc::clone(&risk),
        Arc::clone(&cache),
        fees,
        cfg.execution.coordinator_config(),
    ));
    let detector = ArbitrageDetector::new(
        fees,
        cfg.detector.min_profit,
        Duration::from_millis(cfg.detector.arb_cache_ttl_ms),
    );
    let matcher = Arc::new(EventMatcher::new());

    // Initial discovery, retried until at least one pair exists.
    let mut pairs;
    loop {
        pairs = discover_pairs(
            &kalshi_client,
            &poly_client,
            &matcher,
            &cfg.discovery,
            cfg.polymarket.tag_id,
        )
        .await?;
        if !pairs.is_empty() {
            break;
        }
        warn!(target: "bot", "no matched pairs; retrying discovery in 5 minutes");
        tokio::time::sleep(Duration::from_secs(300)).await;
    }

    // Push subscriptions for every pair instrument.
    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel::<BookUpdate>();
    let tickers: Vec<String> = pairs.iter().map(|p| p.kalshi.instrument.clone()).collect();
    let tokens: Vec<String> = pairs
        .iter()
        .flat_map(|p| [p.polymarket.tokens.yes.clone(), p.polymarket.tokens.no.clone()])
        .collect();

    let kalshi_feed = Arc::new(spawn_kalshi_feed(
        Arc::clone(&kalshi_client),
        cfg.kalshi.ws_url.clone(),
        tickers,
        Arc::clone(&cache),
        updates_tx.clone(),
    ));
    let poly_feed = Arc::new(spawn_poly_feed(
        cfg.polymarket.ws_url.clone(),
        tokens,
        Arc::clone(&cache),
        updates_tx,
    ));

    let index = Arc::new(RwLock::new(PairIndex::default()));
    {
        let mut idx = index.write().expect("pair index poisoned");
        for pair in &pairs {
            idx.insert(pair.clone());
        }
    }
    for pair in &pairs {
        if let Err(err) = recorders.pairs.record_pair(pair).await {
            warn!(target: "storage", error = %err, "failed to record pair");
        }
    }

    // Background balance syncer against the venue of record.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_balance_syncer(
        Arc::clone(&coordinator),
        Arc::clone(&risk),
        Arc::clone(&recorders),
        Arc::clone(&redis),
        Duration::from_secs(cfg.orchestrator.balance_sync_period_s),
        shutdown_rx,
    );

    let mut orchestrator = Orchestrator {
        cfg,
        cache,
        risk: Arc::clone(&risk),
        coordinator,
        detector,
        sticky: StickyState::new(),
        index,
        recorders: Arc::clone(&recorders),
        redis: Arc::clone(&redis),
        kalshi_client,
        poly_client,
        matcher,
        kalshi_feed,
        poly_feed,
    };

    info!(target: "bot", pairs = pairs.len(), "feeds active; monitoring for arbitrage");

    // Trades run to a terminal state inside handle_update, so a shutdown
    // signal observed here never interrupts one mid-flight.
    loop {
        tokio::select! {
            maybe_update = updates_rx.recv() => {
                match maybe_update {
                    Some(update) => orchestrator.handle_update(update).await,
                    None => {
                        warn!(target: "bot", "update channel closed; exiting run loop");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(target: "bot", "shutdown signal received");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    // Final risk state is flushed synchronously before teardown.
    persist_risk_state(&risk, &recorders, &redis).await;

    if let Some(reason) = risk.kill_switch_reason() {
        anyhow::bail!("kill switch fired: {reason}");
    }
    info!(target: "bot", "bot stopped");
    Ok(())
}

fn spawn_balance_syncer(
    coordinator: Arc<ExecutionCoordinator>,
    risk: Arc<RiskManager>,
    recorders: Arc<Recorders>,
    redis: Arc<tokio::sync::Mutex<RedisRiskStore>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match coordinator.backend().fetch_balance_of_record().await {
                        Ok(balance) => {
                            risk.record_balance(balance);
                            persist_risk_state(&risk, &recorders, &redis).await;
                        }
                        Err(err) => risk.record_sync_failure(&err),
                    }
                    risk.check_daily_reset();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{Asset, Market, OutcomeTokens, PriceLevel};
    fn pair(res_offset_secs: i64) -> MatchedPair {
        let res = Utc::now() + chrono::Duration::seconds(res_offset_secs);
        let kalshi = Market {
            venue: Venue::Kalshi,
            instrument: "KXBTC15M-X".to_string(),
            title: "BTC price up in next 15 mins?".to_string(),
            resolution_time: res,
            resolution_source: "kalshi".to_string(),
            yes_price: 0.5,
            no_price: 0.5,
            volume: 0.0,
            tokens: OutcomeTokens::default(),
        };
        let poly = Market {
            venue: Venue::Polymarket,
            instrument: "btc-updown".to_string(),
            title: "Bitcoin Up or Down".to_string(),
            resolution_time: res,
            resolution_source: "polymarket".to_string(),
            yes_price: 0.5,
            no_price: 0.5,
            volume: 0.0,
            tokens: OutcomeTokens {
                yes: "tok-yes".to_string(),
                no: "tok-no".to_string(),
            },
        };
        MatchedPair::new(kalshi, poly, Asset::Btc, Utc::now())
    }

    fn quote(prices: [f64; 4]) -> PairQuote {
        let lvl = |p| PriceLevel { price: p, size: 100.0 };
        PairQuote {
            kalshi_yes: lvl(prices[0]),
            kalshi_no: lvl(prices[1]),
            poly_yes: lvl(prices[2]),
            poly_no: lvl(prices[3]),
        }
    }

    fn orch_cfg() -> OrchestratorConfig {
        OrchestratorConfig {
            trade_cooldown_s: 60,
            dedupe_window_s: 15,
            price_band: [0.10, 0.90],
            time_to_close_min_s: 60,
            balance_sync_period_s: 30,
        }
    }

    #[test]
    fn cooldown_drops_updates_before_any_work() {
        let mut sticky = StickyState::new();
        let now = Instant::now();
        sticky.begin_cooldown(Duration::from_secs(60), now);

        assert_eq!(sticky.gate("btc:x", now + Duration::from_secs(30)), Gate::Cooldown);
        // After the cooldown elapses the next update claims the focus.
        assert_eq!(sticky.gate("btc:x", now + Duration::from_secs(61)), Gate::Proceed);
    }

    #[test]
    fn sticky_focus_admits_one_pair() {
        let mut sticky = StickyState::new();
        let now = Instant::now();
        assert_eq!(sticky.gate("btc:x", now), Gate::Proceed);
        assert_eq!(sticky.gate("eth:y", now), Gate::OtherPairActive);
        assert_eq!(sticky.gate("btc:x", now), Gate::Proceed);

        sticky.clear_active("btc:x");
        assert_eq!(sticky.gate("eth:y", now), Gate::Proceed);
    }

    #[test]
    fn dedupe_window_blocks_reexecution() {
        let mut sticky = StickyState::new();
        let now = Instant::now();
        let key = ("btc:x".to_string(), ArbStrategy::YesKalshiNoPoly);
        assert!(!sticky.is_duplicate(key.clone(), Duration::from_secs(15), now));
        assert!(sticky.is_duplicate(key.clone(), Duration::from_secs(15), now + Duration::from_secs(10)));
        assert!(!sticky.is_duplicate(key, Duration::from_secs(15), now + Duration::from_secs(20)));
    }

    #[test]
    fn filters_enforce_band_and_time_to_close() {
        let cfg = orch_cfg();
        let now = Utc::now();

        assert!(pair_passes_filters(&pair(300), &quote([0.45, 0.55, 0.36, 0.64]), &cfg, now).is_ok());

        // 30 s to close is under the 60 s floor.
        assert!(pair_passes_filters(&pair(30), &quote([0.45, 0.55, 0.36, 0.64]), &cfg, now).is_err());

        // A 0.95 leg sits outside the [0.10, 0.90] band.
        assert!(pair_passes_filters(&pair(300), &quote([0.95, 0.05, 0.36, 0.64]), &cfg, now).is_err());
    }

    #[test]
    fn pair_index_maps_all_four_books() {
        let mut index = PairIndex::default();
        index.insert(pair(300));
        assert_eq!(index.len(), 1);
        assert!(index.pair_for_book(Venue::Kalshi, "KXBTC15M-X/yes").is_some());
        assert!(index.pair_for_book(Venue::Kalshi, "KXBTC15M-X/no").is_some());
        assert!(index.pair_for_book(Venue::Polymarket, "tok-yes").is_some());
        assert!(index.pair_for_book(Venue::Polymarket, "tok-no").is_some());
        assert!(index.pair_for_book(Venue::Polymarket, "unknown").is_none());

        let key = index
            .pair_for_book(Venue::Polymarket, "tok-yes")
            .unwrap()
            .pair_key
            .clone();
        index.remove(&key);
        assert!(index.is_empty());
        assert!(index.pair_for_book(Venue::Polymarket, "tok-yes").is_none());
    }

    #[test]
    fn malformed_prices_never_enter_matching() {
        let mut good = pair(300).kalshi;
        good.yes_price = 0.45;
        good.no_price = 0.55;
        let mut bad = pair(300).kalshi;
        bad.instrument = "KXBTC15M-BAD".to_string();
        bad.yes_price = 1.20;
        bad.no_price = 0.10;

        let kept = drop_insane_prices(vec![good, bad]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].instrument, "KXBTC15M-X");
    }

    #[test]
    fn filter_failure_clears_active_focus() {
        let mut sticky = StickyState::new();
        let now = Instant::now();
        assert_eq!(sticky.gate("btc:x", now), Gate::Proceed);
        // Simulates the orchestrator's reaction to a filter break.
        sticky.clear_active("btc:x");
        assert_eq!(sticky.gate("eth:y", now), Gate::Proceed);
    }
}
