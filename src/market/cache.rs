use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use super::{OrderbookSnapshot, Venue};

/// Shared cache of the latest orderbook per outcome book, with per-entry age.
///
/// Push-subscription callbacks write, decision paths read. Reads return a
/// snapshot only while it is younger than the configured TTL; a stale entry
/// forces the caller onto the REST path. The cache is strictly a latency
/// optimizer and never a source of truth.
pub struct OrderbookCache {
    ttl: Duration,
    books: RwLock<HashMap<(Venue, String), CacheEntry>>,
}

struct CacheEntry {
    snapshot: OrderbookSnapshot,
    received_at: Instant,
}

impl OrderbookCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            books: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn insert(&self, snapshot: OrderbookSnapshot) {
        self.insert_at(snapshot, Instant::now());
    }

    fn insert_at(&self, snapshot: OrderbookSnapshot, received_at: Instant) {
        let key = (snapshot.venue, snapshot.book_id.clone());
        let mut books = self.books.write().expect("orderbook cache poisoned");
        books.insert(key, CacheEntry { snapshot, received_at });
    }

    /// Latest snapshot for `book_id`, only if younger than the TTL.
    pub fn fresh(&self, venue: Venue, book_id: &str) -> Option<OrderbookSnapshot> {
        self.fresh_at(venue, book_id, Instant::now())
    }

    fn fresh_at(&self, venue: Venue, book_id: &str, now: Instant) -> Option<OrderbookSnapshot> {
        let books = self.books.read().expect("orderbook cache poisoned");
        let entry = books.get(&(venue, book_id.to_string()))?;
        if now.duration_since(entry.received_at) <= self.ttl {
            Some(entry.snapshot.clone())
        } else {
            None
        }
    }

    /// Age of the cached entry in milliseconds, `None` if never seen.
    pub fn age_ms(&self, venue: Venue, book_id: &str) -> Option<u128> {
        let books = self.books.read().expect("orderbook cache poisoned");
        books
            .get(&(venue, book_id.to_string()))
            .map(|e| e.received_at.elapsed().as_millis())
    }

    /// Apply a per-level delta to the cached book, creating the book if absent.
    ///
    /// Used by the Kalshi feed, whose websocket publishes level deltas after
    /// the initial snapshot. A level whose size drops to zero is removed;
    /// ordering (asks ascending, bids descending) is preserved.
    pub fn apply_ask_delta(&self, venue: Venue, book_id: &str, price: f64, delta: f64) {
        let mut books = self.books.write().expect("orderbook cache poisoned");
        let key = (venue, book_id.to_string());
        if let Some(entry) = books.get_mut(&key) {
            merge_level(&mut entry.snapshot.asks, price, delta);
            entry.snapshot.asks.sort_by(|a, b| a.price.total_cmp(&b.price));
            entry.received_at = Instant::now();
            entry.snapshot.ts = chrono::Utc::now();
        }
    }
}

fn merge_level(levels: &mut Vec<super::PriceLevel>, price: f64, delta: f64) {
    if let Some(level) = levels.iter_mut().find(|l| (l.price - price).abs() < 1e-9) {
        level.size += delta;
        if level.size <= 0.0 {
            levels.retain(|l| (l.price - price).abs() >= 1e-9);
        }
    } else if delta > 0.0 {
        levels.push(super::PriceLevel { price, size: delta });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::PriceLevel;
    use chrono::Utc;

    fn snapshot(book_id: &str) -> OrderbookSnapshot {
        OrderbookSnapshot {
            venue: Venue::Kalshi,
            book_id: book_id.to_string(),
            asks: vec![PriceLevel { price: 0.40, size: 100.0 }],
            bids: vec![],
            ts: Utc::now(),
        }
    }

    #[test]
    fn fresh_entry_is_returned() {
        let cache = OrderbookCache::new(Duration::from_millis(500));
        cache.insert(snapshot("KXBTC15M-X/yes"));
        assert!(cache.fresh(Venue::Kalshi, "KXBTC15M-X/yes").is_some());
        assert!(cache.fresh(Venue::Polymarket, "KXBTC15M-X/yes").is_none());
    }

    #[test]
    fn stale_entry_is_withheld() {
        let cache = OrderbookCache::new(Duration::from_millis(500));
        let past = Instant::now() - Duration::from_millis(750);
        cache.insert_at(snapshot("KXBTC15M-X/yes"), past);
        // 750 ms old against a 500 ms TTL: the read must force a fresh fetch.
        assert!(cache.fresh(Venue::Kalshi, "KXBTC15M-X/yes").is_none());
        assert!(cache.age_ms(Venue::Kalshi, "KXBTC15M-X/yes").unwrap() >= 750);
    }

    #[test]
    fn delta_merges_and_clears_levels() {
        let cache = OrderbookCache::new(Duration::from_millis(500));
        cache.insert(snapshot("T/yes"));
        cache.apply_ask_delta(Venue::Kalshi, "T/yes", 0.40, -40.0);
        let book = cache.fresh(Venue::Kalshi, "T/yes").unwrap();
        assert_eq!(book.best_ask().unwrap().size, 60.0);

        cache.apply_ask_delta(Venue::Kalshi, "T/yes", 0.38, 25.0);
        let book = cache.fresh(Venue::Kalshi, "T/yes").unwrap();
        assert_eq!(book.best_ask().unwrap().price, 0.38);

        cache.apply_ask_delta(Venue::Kalshi, "T/yes", 0.38, -25.0);
        let book = cache.fresh(Venue::Kalshi, "T/yes").unwrap();
        assert_eq!(book.best_ask().unwrap().price, 0.40);
    }
}
