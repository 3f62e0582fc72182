use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::info;

/// Global metrics registry used across the bot.
pub static METRICS: Lazy<Metrics> = Lazy::new(Metrics::default);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

#[derive(Default)]
struct MetricsInner {
    book_updates: AtomicU64,
    opportunities_detected: AtomicU64,
    opportunities_rejected: AtomicU64,
    trades_completed: AtomicU64,
    trades_unwound: AtomicU64,
    aborts: AtomicU64,
    last_event_ts: AtomicU64,
}

/// Lightweight metrics handle backed by atomics so it can be cloned cheaply.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

impl Metrics {
    pub fn record_book_update(&self) {
        self.inner.book_updates.fetch_add(1, Ordering::Relaxed);
        self.heartbeat();
    }

    pub fn record_opportunity(&self, pair_key: &str, net_profit: f64) {
        self.inner
            .opportunities_detected
            .fetch_add(1, Ordering::Relaxed);
        self.heartbeat();

        info!(
            target: "metrics",
            event = "opportunity",
            pair = %pair_key,
            net_profit,
            total = self.inner.opportunities_detected.load(Ordering::Relaxed),
            "opportunity detected"
        );
    }

    pub fn record_rejection(&self, pair_key: &str, reason: &str) {
        self.inner
            .opportunities_rejected
            .fetch_add(1, Ordering::Relaxed);
        self.heartbeat();

        info!(
            target: "metrics",
            event = "opportunity_rejected",
            pair = %pair_key,
            reason = %reason,
            total = self.inner.opportunities_rejected.load(Ordering::Relaxed),
            "opportunity rejected"
        );
    }

    pub fn record_trade_completed(&self, pair_key: &str) {
        self.inner.trades_completed.fetch_add(1, Ordering::Relaxed);
        self.heartbeat();

        info!(
            target: "metrics",
            event = "trade_completed",
            pair = %pair_key,
            total = self.inner.trades_completed.load(Ordering::Relaxed),
            "trade completed"
        );
    }

    pub fn record_trade_unwound(&self, pair_key: &str) {
        self.inner.trades_unwound.fetch_add(1, Ordering::Relaxed);
        self.heartbeat();

        info!(
            target: "metrics",
            event = "trade_unwound",
            pair = %pair_key,
            total = self.inner.trades_unwound.load(Ordering::Relaxed),
            "trade unwound"
        );
    }

    pub fn record_abort(&self, pair_key: &str, reason: &str) {
        self.inner.aborts.fetch_add(1, Ordering::Relaxed);
        self.heartbeat();

        info!(
            target: "metrics",
            event = "execution_abort",
            pair = %pair_key,
            reason = %reason,
            total = self.inner.aborts.load(Ordering::Relaxed),
            "execution aborted"
        );
    }

    pub fn heartbeat(&self) {
        self.inner
            .last_event_ts
            .store(now_unix_secs(), Ordering::Relaxed);
    }

    pub fn is_healthy(&self, max_staleness: Duration) -> bool {
        let last = self.inner.last_event_ts.load(Ordering::Relaxed);
        if last == 0 {
            // No events yet right after startup still counts as healthy.
            return true;
        }
        let now = now_unix_secs();
        now.saturating_sub(last) <= max_staleness.as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            book_updates: self.inner.book_updates.load(Ordering::Relaxed),
            opportunities_detected: self.inner.opportunities_detected.load(Ordering::Relaxed),
            opportunities_rejected: self.inner.opportunities_rejected.load(Ordering::Relaxed),
            trades_completed: self.inner.trades_completed.load(Ordering::Relaxed),
            trades_unwound: self.inner.trades_unwound.load(Ordering::Relaxed),
            aborts: self.inner.aborts.load(Ordering::Relaxed),
            last_event_ts: self.inner.last_event_ts.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of current metrics for the periodic dashboard log.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub book_updates: u64,
    pub opportunities_detected: u64,
    pub opportunities_rejected: u64,
    pub trades_completed: u64,
    pub trades_unwound: u64,
    pub aborts: u64,
    pub last_event_ts: u64,
}

pub fn log_metrics_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        target: "metrics",
        event = "metrics_snapshot",
        book_updates = snapshot.book_updates,
        opportunities_detected = snapshot.opportunities_detected,
        opportunities_rejected = snapshot.opportunities_rejected,
        trades_completed = snapshot.trades_completed,
        trades_unwound = snapshot.trades_unwound,
        aborts = snapshot.aborts,
        last_event_ts = snapshot.last_event_ts,
        "metrics snapshot"
    );
}
