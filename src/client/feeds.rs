use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

use crate::market::{OrderbookCache, OrderbookSnapshot, PriceLevel, Side, Venue};

use super::kalshi::{self, KalshiClient};
use super::websocket::{connect_with_retries, ConnectSpec};

/// Notification that a cached outcome book changed, fanned out to the
/// orchestrator callback.
#[derive(Clone, Debug)]
pub struct BookUpdate {
    pub venue: Venue,
    pub book_id: String,
}

/// Handle to a running push feed: add instruments after rediscovery.
/// Subscriptions are replayed in full on every reconnect.
pub struct FeedHandle {
    venue: Venue,
    subscribed: Arc<Mutex<Vec<String>>>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl FeedHandle {
    /// Subscribe to additional instruments (Kalshi tickers / Poly tokens).
    pub fn subscribe(&self, instruments: Vec<String>) {
        let fresh: Vec<String> = {
            let mut subs = self.subscribed.lock().expect("feed subscriptions poisoned");
            let fresh: Vec<String> = instruments
                .into_iter()
                .filter(|i| !subs.contains(i))
                .collect();
            subs.extend(fresh.iter().cloned());
            fresh
        };
        if fresh.is_empty() {
            return;
        }
        let msg = match self.venue {
            Venue::Kalshi => kalshi_subscribe_msg(&fresh),
            Venue::Polymarket => poly_subscribe_msg(&fresh),
        };
        if self.outbound.send(msg).is_err() {
            warn!(target: "bot", venue = %self.venue, "feed connection gone; subscription dropped");
        }
    }
}

fn kalshi_subscribe_msg(tickers: &[String]) -> Message {
    let payload = serde_json::json!({
        "id": chrono::Utc::now().timestamp_millis(),
        "cmd": "subscribe",
        "params": {
            "channels": ["orderbook_delta"],
            "market_tickers": tickers,
        }
    });
    Message::Text(payload.to_string())
}

fn poly_subscribe_msg(tokens: &[String]) -> Message {
    let payload = serde_json::json!({
        "assets_ids": tokens,
        "type": "market",
    });
    Message::Text(payload.to_string())
}

/// Start the Kalshi orderbook feed. The handshake is signed, so header
/// construction is delegated back to the adapter per connection attempt.
pub fn spawn_kalshi_feed(
    client: Arc<KalshiClient>,
    ws_url: String,
    tickers: Vec<String>,
    cache: Arc<OrderbookCache>,
    updates: mpsc::UnboundedSender<BookUpdate>,
) -> FeedHandle {
    let subscribed = Arc::new(Mutex::new(tickers));

    let subs_for_connect = Arc::clone(&subscribed);
    let spec = ConnectSpec {
        url: ws_url,
        headers: Box::new(move || client.ws_headers()),
        on_connect: Box::new(move || {
            let subs = subs_for_connect.lock().expect("feed subscriptions poisoned");
            if subs.is_empty() {
                Vec::new()
            } else {
                vec![kalshi_subscribe_msg(&subs)]
            }
        }),
    };

    let mut conn = connect_with_retries(spec);
    let outbound = conn.sender();

    tokio::spawn(async move {
        while let Some(msg) = conn.receiver().recv().await {
            if let Message::Text(text) = msg {
                if let Err(err) = handle_kalshi_text(&text, &cache, &updates) {
                    debug!(target: "bot", error = %err, "unhandled kalshi ws message");
                }
                if updates.is_closed() {
                    break;
                }
            }
        }
    });

    FeedHandle {
        venue: Venue::Kalshi,
        subscribed,
        outbound,
    }
}

#[derive(Debug, Deserialize)]
struct KalshiWsEnvelope {
    #[serde(rename = "type", default)]
    msg_type: String,
    #[serde(default)]
    msg: serde_json::Value,
}

fn handle_kalshi_text(
    text: &str,
    cache: &OrderbookCache,
    updates: &mpsc::UnboundedSender<BookUpdate>,
) -> anyhow::Result<()> {
    let envelope: KalshiWsEnvelope = match serde_json::from_str(text) {
        Ok(e) => e,
        // Raw PING/PONG echoes and the like.
        Err(_) => return Ok(()),
    };

    match envelope.msg_type.as_str() {
        "orderbook_snapshot" => {
            #[derive(Deserialize)]
            struct Snapshot {
                market_ticker: String,
                #[serde(default)]
                yes: Vec<(i64, f64)>,
                #[serde(default)]
                no: Vec<(i64, f64)>,
            }
            let snap: Snapshot = serde_json::from_value(envelope.msg)?;
            for (side, levels, other) in [
                (Side::BuyYes, &snap.yes, &snap.no),
                (Side::BuyNo, &snap.no, &snap.yes),
            ] {
                let book_id = kalshi::book_id(&snap.market_ticker, side);
                cache.insert(kalshi_side_book(&book_id, levels, other));
                let _ = updates.send(BookUpdate { venue: Venue::Kalshi, book_id });
            }
        }
        "orderbook_delta" => {
            #[derive(Deserialize)]
            struct Delta {
                market_ticker: String,
                side: String,
                price: i64,
                #[serde(default)]
                delta: f64,
            }
            let d: Delta = serde_json::from_value(envelope.msg)?;
            let side = match d.side.as_str() {
                "yes" => Side::BuyYes,
                "no" => Side::BuyNo,
                other => anyhow::bail!("unknown kalshi side {other}"),
            };
            let book_id = kalshi::book_id(&d.market_ticker, side);
            cache.apply_ask_delta(Venue::Kalshi, &book_id, d.price as f64 / 100.0, d.delta);
            let _ = updates.send(BookUpdate { venue: Venue::Kalshi, book_id });
        }
        "subscribed" => {
            debug!(target: "bot", "kalshi subscription confirmed");
        }
        "error" => {
            warn!(target: "bot", raw = %text, "kalshi websocket error message");
        }
        _ => {}
    }
    Ok(())
}

fn kalshi_side_book(book_id: &str, own: &[(i64, f64)], other: &[(i64, f64)]) -> OrderbookSnapshot {
    let mut asks: Vec<PriceLevel> = own
        .iter()
        .map(|(cents, size)| PriceLevel { price: *cents as f64 / 100.0, size: *size })
        .collect();
    asks.sort_by(|a, b| a.price.total_cmp(&b.price));

    let mut bids: Vec<PriceLevel> = other
        .iter()
        .map(|(cents, size)| PriceLevel { price: 1.0 - *cents as f64 / 100.0, size: *size })
        .collect();
    bids.sort_by(|a, b| b.price.total_cmp(&a.price));

    OrderbookSnapshot {
        venue: Venue::Kalshi,
        book_id: book_id.to_string(),
        asks,
        bids,
        ts: chrono::Utc::now(),
    }
}

/// Start the Polymarket market-channel feed (public, token-keyed).
pub fn spawn_poly_feed(
    ws_url: String,
    tokens: Vec<String>,
    cache: Arc<OrderbookCache>,
    updates: mpsc::UnboundedSender<BookUpdate>,
) -> FeedHandle {
    let subscribed = Arc::new(Mutex::new(tokens));

    let subs_for_connect = Arc::clone(&subscribed);
    let spec = ConnectSpec {
        url: ws_url,
        headers: Box::new(|| Ok(Vec::new())),
        on_connect: Box::new(move || {
            let subs = subs_for_connect.lock().expect("feed subscriptions poisoned");
            if subs.is_empty() {
                Vec::new()
            } else {
                vec![poly_subscribe_msg(&subs)]
            }
        }),
    };

    let mut conn = connect_with_retries(spec);
    let outbound = conn.sender();

    tokio::spawn(async move {
        while let Some(msg) = conn.receiver().recv().await {
            if let Message::Text(text) = msg {
                if let Err(err) = handle_poly_text(&text, &cache, &updates) {
                    debug!(target: "bot", error = %err, "unhandled polymarket ws message");
                }
                if updates.is_closed() {
                    break;
                }
            }
        }
    });

    FeedHandle {
        venue: Venue::Polymarket,
        subscribed,
        outbound,
    }
}

fn handle_poly_text(
    text: &str,
    cache: &OrderbookCache,
    updates: &mpsc::UnboundedSender<BookUpdate>,
) -> anyhow::Result<()> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Ok(()),
    };

    // The market channel sends either a single message or a batch.
    let messages: Vec<serde_json::Value> = match value {
        serde_json::Value::Array(items) => items,
        single => vec![single],
    };

    for msg in messages {
        let has_book = msg.get("bids").is_some() && msg.get("asks").is_some();
        if !has_book {
            // price_change and tick events carry no depth; the next book
            // snapshot refreshes the cache.
            continue;
        }

        #[derive(Deserialize)]
        struct RawLevel {
            price: String,
            size: String,
        }
        #[derive(Deserialize)]
        struct BookMsg {
            asset_id: String,
            #[serde(default)]
            asks: Vec<RawLevel>,
            #[serde(default)]
            bids: Vec<RawLevel>,
        }

        let book: BookMsg = serde_json::from_value(msg)?;
        let parse = |levels: Vec<RawLevel>| -> Vec<PriceLevel> {
            levels
                .into_iter()
                .filter_map(|l| {
                    Some(PriceLevel {
                        price: l.price.parse().ok()?,
                        size: l.size.parse().ok()?,
                    })
                })
                .collect()
        };

        let mut asks = parse(book.asks);
        let mut bids = parse(book.bids);
        asks.sort_by(|a, b| a.price.total_cmp(&b.price));
        bids.sort_by(|a, b| b.price.total_cmp(&a.price));

        cache.insert(OrderbookSnapshot {
            venue: Venue::Polymarket,
            book_id: book.asset_id.clone(),
            asks,
            bids,
            ts: chrono::Utc::now(),
        });
        let _ = updates.send(BookUpdate {
            venue: Venue::Polymarket,
            book_id: book.asset_id,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn kalshi_snapshot_populates_both_side_books() {
        let cache = OrderbookCache::new(Duration::from_millis(500));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let text = r#"{
            "type": "orderbook_snapshot",
            "msg": {
                "market_ticker": "KXBTC15M-26JAN101845",
                "yes": [[45, 100.0], [44, 50.0]],
                "no": [[56, 80.0]]
            }
        }"#;
        handle_kalshi_text(text, &cache, &tx).unwrap();

        let yes = cache.fresh(Venue::Kalshi, "KXBTC15M-26JAN101845/yes").unwrap();
        assert_eq!(yes.best_ask().unwrap().price, 0.44);
        // YES bids are the complement of resting NO orders.
        assert!((yes.best_bid().unwrap().price - 0.44).abs() < 1e-9);

        let no = cache.fresh(Venue::Kalshi, "KXBTC15M-26JAN101845/no").unwrap();
        assert_eq!(no.best_ask().unwrap().price, 0.56);

        assert_eq!(rx.try_recv().unwrap().book_id, "KXBTC15M-26JAN101845/yes");
        assert_eq!(rx.try_recv().unwrap().book_id, "KXBTC15M-26JAN101845/no");
    }

    #[test]
    fn kalshi_delta_updates_cached_side() {
        let cache = OrderbookCache::new(Duration::from_millis(500));
        let (tx, _rx) = mpsc::unbounded_channel();
        let snapshot = r#"{
            "type": "orderbook_snapshot",
            "msg": {"market_ticker": "T", "yes": [[45, 100.0]], "no": []}
        }"#;
        handle_kalshi_text(snapshot, &cache, &tx).unwrap();

        let delta = r#"{
            "type": "orderbook_delta",
            "msg": {"market_ticker": "T", "side": "yes", "price": 45, "delta": -100.0}
        }"#;
        handle_kalshi_text(delta, &cache, &tx).unwrap();
        let yes = cache.fresh(Venue::Kalshi, "T/yes").unwrap();
        assert!(yes.best_ask().is_none());
    }

    #[test]
    fn poly_book_message_is_cached() {
        let cache = OrderbookCache::new(Duration::from_millis(500));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let text = r#"[{
            "event_type": "book",
            "asset_id": "tok-up",
            "asks": [{"price": "0.37", "size": "120"}, {"price": "0.36", "size": "40"}],
            "bids": [{"price": "0.34", "size": "60"}]
        }]"#;
        handle_poly_text(text, &cache, &tx).unwrap();

        let book = cache.fresh(Venue::Polymarket, "tok-up").unwrap();
        assert_eq!(book.best_ask().unwrap().price, 0.36);
        assert_eq!(book.best_bid().unwrap().price, 0.34);
        assert_eq!(rx.try_recv().unwrap().book_id, "tok-up");
    }

    #[test]
    fn poly_price_change_is_ignored() {
        let cache = OrderbookCache::new(Duration::from_millis(500));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let text = r#"{"event_type": "price_change", "price_changes": []}"#;
        handle_poly_text(text, &cache, &tx).unwrap();
        assert!(rx.try_recv().is_err());
    }
}
