use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod cache;
pub mod matcher;

pub use cache::OrderbookCache;
pub use matcher::EventMatcher;

/// Tolerance on `yes + no` exceeding 1.0 before a market is considered malformed.
pub const SPREAD_EPSILON: f64 = 0.05;

/// The two venues this bot trades across.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Kalshi,
    Polymarket,
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Venue::Kalshi => write!(f, "kalshi"),
            Venue::Polymarket => write!(f, "polymarket"),
        }
    }
}

/// Normalized order side. Venue-native representations (paired outcome tokens,
/// yes/no order fields) are mapped inside the adapters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    BuyYes,
    BuyNo,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::BuyYes => Side::BuyNo,
            Side::BuyNo => Side::BuyYes,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::BuyYes => write!(f, "buy_yes"),
            Side::BuyNo => write!(f, "buy_no"),
        }
    }
}

/// Crypto assets the 15-minute series cover.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Asset {
    Btc,
    Eth,
    Sol,
}

impl Asset {
    /// Canonical asset extracted from a normalized (lowercased) title token.
    pub fn from_token(token: &str) -> Option<Asset> {
        match token {
            "btc" | "bitcoin" => Some(Asset::Btc),
            "eth" | "ethereum" | "ether" => Some(Asset::Eth),
            "sol" | "solana" => Some(Asset::Sol),
            _ => None,
        }
    }
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Asset::Btc => write!(f, "btc"),
            Asset::Eth => write!(f, "eth"),
            Asset::Sol => write!(f, "sol"),
        }
    }
}

/// Venue-specific identifiers needed to trade a market's outcomes.
///
/// For Kalshi both sides live on one ticker; for Polymarket each outcome is a
/// separate CLOB token. Everything outside the adapters treats these as opaque.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OutcomeTokens {
    pub yes: String,
    pub no: String,
}

/// A single binary instrument on one venue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Market {
    pub venue: Venue,
    /// Venue-native market identifier (Kalshi ticker / Polymarket slug).
    pub instrument: String,
    pub title: String,
    pub resolution_time: DateTime<Utc>,
    /// Settlement index provider as published by the venue.
    pub resolution_source: String,
    pub yes_price: f64,
    pub no_price: f64,
    pub volume: f64,
    /// Per-outcome trading identifiers (Polymarket CLOB tokens; for Kalshi the
    /// ticker itself on both sides).
    pub tokens: OutcomeTokens,
}

impl Market {
    /// Whether the published prices satisfy the binary-market invariants.
    pub fn prices_sane(&self) -> bool {
        (0.0..=1.0).contains(&self.yes_price)
            && (0.0..=1.0).contains(&self.no_price)
            && self.yes_price + self.no_price <= 1.0 + SPREAD_EPSILON
    }

    pub fn seconds_to_resolution(&self, now: DateTime<Utc>) -> i64 {
        (self.resolution_time - now).num_seconds()
    }
}

/// One price level of an orderbook.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

/// Top-of-book snapshot for a single outcome book.
///
/// Asks ascending, bids descending. `book_id` identifies one outcome's book:
/// the CLOB token id on Polymarket, `TICKER/yes` or `TICKER/no` on Kalshi
/// (encoded and decoded only by the Kalshi adapter).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderbookSnapshot {
    pub venue: Venue,
    pub book_id: String,
    pub asks: Vec<PriceLevel>,
    pub bids: Vec<PriceLevel>,
    pub ts: DateTime<Utc>,
}

impl OrderbookSnapshot {
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    /// Size resting at asks priced at or below `price`.
    pub fn ask_size_at_or_below(&self, price: f64) -> f64 {
        self.asks
            .iter()
            .take_while(|l| l.price <= price + f64::EPSILON)
            .map(|l| l.size)
            .sum()
    }
}

/// Two markets deemed equivalent, one per venue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatchedPair {
    pub kalshi: Market,
    pub polymarket: Market,
    pub asset: Asset,
    pub resolution_time: DateTime<Utc>,
    /// Stable semantic key: `{asset}:{resolution minute}`.
    pub pair_key: String,
    pub created_at: DateTime<Utc>,
}

impl MatchedPair {
    pub fn new(kalshi: Market, polymarket: Market, asset: Asset, now: DateTime<Utc>) -> Self {
        let resolution_time = kalshi.resolution_time;
        let pair_key = format!("{}:{}", asset, resolution_time.format("%Y-%m-%dT%H:%M"));
        Self {
            kalshi,
            polymarket,
            asset,
            resolution_time,
            pair_key,
            created_at: now,
        }
    }

    /// A pair stops being tradable once either side has resolved.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.kalshi.resolution_time <= now || self.polymarket.resolution_time <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn market(venue: Venue, yes: f64, no: f64) -> Market {
        Market {
            venue,
            instrument: "TEST".to_string(),
            title: "Bitcoin price up in next 15 mins?".to_string(),
            resolution_time: Utc.with_ymd_and_hms(2026, 1, 10, 18, 45, 0).unwrap(),
            resolution_source: "CF Benchmarks".to_string(),
            yes_price: yes,
            no_price: no,
            volume: 1000.0,
            tokens: OutcomeTokens::default(),
        }
    }

    #[test]
    fn price_invariants() {
        assert!(market(Venue::Kalshi, 0.45, 0.55).prices_sane());
        assert!(market(Venue::Kalshi, 0.50, 0.54).prices_sane());
        assert!(!market(Venue::Kalshi, 1.20, 0.10).prices_sane());
        assert!(!market(Venue::Kalshi, 0.70, 0.60).prices_sane());
    }

    #[test]
    fn ask_depth_at_price() {
        let book = OrderbookSnapshot {
            venue: Venue::Polymarket,
            book_id: "tok".to_string(),
            asks: vec![
                PriceLevel { price: 0.40, size: 50.0 },
                PriceLevel { price: 0.41, size: 30.0 },
                PriceLevel { price: 0.45, size: 100.0 },
            ],
            bids: vec![],
            ts: Utc::now(),
        };
        assert_eq!(book.ask_size_at_or_below(0.41), 80.0);
        assert_eq!(book.ask_size_at_or_below(0.39), 0.0);
    }

    #[test]
    fn pair_key_is_stable_per_resolution_minute() {
        let k = market(Venue::Kalshi, 0.5, 0.5);
        let p = market(Venue::Polymarket, 0.5, 0.5);
        let pair = MatchedPair::new(k, p, Asset::Btc, Utc::now());
        assert_eq!(pair.pair_key, "btc:2026-01-10T18:45");
    }
}
