use std::time::Duration;

use tokio::time::interval;

use crate::monitoring::metrics::{log_metrics_snapshot, METRICS};

/// Spawn a background task that periodically logs a compact metrics snapshot.
///
/// Combined with the JSON `tracing` output this gives operators a simple
/// terminal dashboard via `jq`/`grep`; the bot itself serves no HTTP.
pub fn spawn_dashboard_task(period: Duration) {
    let mut ticker = interval(period);
    tokio::spawn(async move {
        loop {
            ticker.tick().await;
            let snapshot = METRICS.snapshot();
            log_metrics_snapshot(&snapshot);
        }
    });
}
