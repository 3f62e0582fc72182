use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info};

use super::{Asset, Market, MatchedPair};

/// Maximum resolution-time drift between venues for aligned clocks.
const TIME_TOLERANCE_SECS: i64 = 60;

/// Cap on the one-shot per-asset offset correction for venues whose documented
/// round quantization differs. Offsets must be calibrated explicitly; nothing
/// is inferred at runtime.
const MAX_CALIBRATED_OFFSET_SECS: i64 = 900;

/// One venue price tick, used when comparing numeric thresholds in titles.
const VENUE_TICK: f64 = 0.01;

/// Pre-validated settlement-source equivalence classes. Sources outside every
/// class never match anything.
const SOURCE_CLASSES: &[&[&str]] = &[
    // Spot crypto index providers accepted as equivalent for 15-minute
    // up/down resolution.
    &["cf benchmarks", "coinbase", "chainlink", "pyth", "kalshi", "polymarket"],
];

const TITLE_STOPWORDS: &[&str] = &[
    "the", "a", "an", "in", "on", "at", "or", "of", "to", "next", "price", "up", "down", "mins",
    "minutes", "min", "will", "be", "by",
];

/// Decides whether a Kalshi market and a Polymarket market resolve to the
/// same real-world outcome.
///
/// All rules must hold: same fuzzy-normalized asset, resolution times within
/// tolerance (after any calibrated offset), settlement sources in one
/// equivalence class, and matching binary shape.
pub struct EventMatcher {
    /// Calibrated Kalshi-minus-Polymarket resolution offset per asset, seconds.
    offsets: HashMap<Asset, i64>,
}

impl EventMatcher {
    pub fn new() -> Self {
        Self {
            offsets: HashMap::new(),
        }
    }

    /// Install a calibrated per-asset offset. Values beyond the documented
    /// quantization bound are rejected as configuration errors.
    pub fn with_offset(mut self, asset: Asset, offset_secs: i64) -> Result<Self, String> {
        if offset_secs.abs() > MAX_CALIBRATED_OFFSET_SECS {
            return Err(format!(
                "offset {offset_secs}s for {asset} exceeds ±{MAX_CALIBRATED_OFFSET_SECS}s"
            ));
        }
        self.offsets.insert(asset, offset_secs);
        Ok(self)
    }

    /// Cross-product match over both catalogs. O(N·M); fine at current catalog
    /// sizes (tens of live 15-minute markets per venue).
    pub fn match_catalogs(&self, kalshi: &[Market], polymarket: &[Market]) -> Vec<MatchedPair> {
        let now = Utc::now();
        let mut pairs = Vec::new();
        for ke in kalshi {
            for pe in polymarket {
                if let Some(asset) = self.are_equivalent(ke, pe) {
                    info!(
                        target: "bot",
                        kalshi = %ke.instrument,
                        polymarket = %pe.instrument,
                        %asset,
                        "matched equivalent pair"
                    );
                    pairs.push(MatchedPair::new(ke.clone(), pe.clone(), asset, now));
                }
            }
        }
        pairs
    }

    /// Full equivalence check; returns the shared asset on success.
    pub fn are_equivalent(&self, ke: &Market, pe: &Market) -> Option<Asset> {
        let asset_k = extract_asset(&ke.title)?;
        let asset_p = extract_asset(&pe.title)?;
        if asset_k != asset_p {
            debug!(target: "bot", k = %asset_k, p = %asset_p, "asset mismatch");
            return None;
        }

        let offset = self.offsets.get(&asset_k).copied().unwrap_or(0);
        let drift = (ke.resolution_time - pe.resolution_time).num_seconds() - offset;
        if drift.abs() > TIME_TOLERANCE_SECS {
            debug!(
                target: "bot",
                k = %ke.instrument,
                p = %pe.instrument,
                drift_secs = drift,
                "resolution time mismatch"
            );
            return None;
        }

        if !sources_equivalent(&ke.resolution_source, &pe.resolution_source) {
            debug!(
                target: "bot",
                k = %ke.resolution_source,
                p = %pe.resolution_source,
                "settlement source mismatch"
            );
            return None;
        }

        if !shapes_equivalent(&ke.title, &pe.title) {
            debug!(target: "bot", k = %ke.title, p = %pe.title, "shape mismatch");
            return None;
        }

        Some(asset_k)
    }
}

impl Default for EventMatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase, strip punctuation, drop stopwords, and look for a known asset
/// token. "BTC" and "Bitcoin" normalize to the same asset.
fn extract_asset(title: &str) -> Option<Asset> {
    normalized_tokens(title)
        .into_iter()
        .find_map(|t| Asset::from_token(&t))
}

fn normalized_tokens(title: &str) -> Vec<String> {
    title
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !TITLE_STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

fn sources_equivalent(a: &str, b: &str) -> bool {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    SOURCE_CLASSES.iter().any(|class| {
        class.iter().any(|s| a.contains(s)) && class.iter().any(|s| b.contains(s))
    })
}

/// Both titles must describe the same binary contract: either both are
/// threshold-free up/down rounds, or both carry a numeric threshold that
/// agrees within one venue tick.
fn shapes_equivalent(title_a: &str, title_b: &str) -> bool {
    match (extract_threshold(title_a), extract_threshold(title_b)) {
        (None, None) => true,
        (Some(a), Some(b)) => (a - b).abs() <= VENUE_TICK,
        _ => false,
    }
}

/// Pull a strike-style number out of a title ("$100,000", "100k", "3500.5").
fn extract_threshold(title: &str) -> Option<f64> {
    for raw in title.split_whitespace() {
        let token = raw.trim_start_matches('$').replace(',', "");
        let (digits, multiplier) = match token.strip_suffix(['k', 'K']) {
            Some(stripped) => (stripped, 1_000.0),
            None => (token.as_str(), 1.0),
        };
        if digits.is_empty() || !digits.chars().next().unwrap().is_ascii_digit() {
            continue;
        }
        if let Ok(value) = digits.parse::<f64>() {
            // Bare small integers ("15" in "next 15 mins") are durations, not strikes.
            if value * multiplier >= 100.0 {
                return Some(value * multiplier);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{OutcomeTokens, Venue};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, h, m, s).unwrap()
    }

    fn market(venue: Venue, title: &str, res: DateTime<Utc>, source: &str) -> Market {
        Market {
            venue,
            instrument: format!("{venue}-{title}"),
            title: title.to_string(),
            resolution_time: res,
            resolution_source: source.to_string(),
            yes_price: 0.5,
            no_price: 0.5,
            volume: 100.0,
            tokens: OutcomeTokens::default(),
        }
    }

    #[test]
    fn matches_btc_15m_pair() {
        let matcher = EventMatcher::new();
        let ke = market(
            Venue::Kalshi,
            "BTC price up in next 15 mins?",
            at(18, 45, 0),
            "CF Benchmarks",
        );
        let pe = market(
            Venue::Polymarket,
            "Bitcoin Up or Down - Jan 10 6:45PM",
            at(18, 45, 30),
            "Chainlink",
        );
        assert_eq!(matcher.are_equivalent(&ke, &pe), Some(Asset::Btc));
    }

    #[test]
    fn rejects_asset_mismatch() {
        let matcher = EventMatcher::new();
        let ke = market(Venue::Kalshi, "ETH price up in next 15 mins?", at(18, 45, 0), "Kalshi");
        let pe = market(
            Venue::Polymarket,
            "Bitcoin Up or Down - Jan 10 6:45PM",
            at(18, 45, 0),
            "Polymarket",
        );
        assert_eq!(matcher.are_equivalent(&ke, &pe), None);
    }

    #[test]
    fn rejects_time_drift_beyond_tolerance() {
        let matcher = EventMatcher::new();
        let ke = market(Venue::Kalshi, "BTC price up in next 15 mins?", at(18, 45, 0), "Kalshi");
        let pe = market(
            Venue::Polymarket,
            "Bitcoin Up or Down - Jan 10 7:00PM",
            at(19, 0, 0),
            "Polymarket",
        );
        assert_eq!(matcher.are_equivalent(&ke, &pe), None);
    }

    #[test]
    fn calibrated_offset_recovers_quantization_skew() {
        // Kalshi stamps the round close, Polymarket the round open, 900 s apart.
        let matcher = EventMatcher::new().with_offset(Asset::Btc, 900).unwrap();
        let ke = market(Venue::Kalshi, "BTC price up in next 15 mins?", at(19, 0, 0), "Kalshi");
        let pe = market(
            Venue::Polymarket,
            "Bitcoin Up or Down - Jan 10 6:45PM",
            at(18, 45, 0),
            "Polymarket",
        );
        assert_eq!(matcher.are_equivalent(&ke, &pe), Some(Asset::Btc));
    }

    #[test]
    fn offset_beyond_bound_is_rejected() {
        assert!(EventMatcher::new().with_offset(Asset::Btc, 901).is_err());
        assert!(EventMatcher::new().with_offset(Asset::Btc, -1200).is_err());
    }

    #[test]
    fn rejects_unknown_settlement_source() {
        let matcher = EventMatcher::new();
        let ke = market(
            Venue::Kalshi,
            "BTC price up in next 15 mins?",
            at(18, 45, 0),
            "SomeUnvettedIndex",
        );
        let pe = market(
            Venue::Polymarket,
            "Bitcoin Up or Down - Jan 10 6:45PM",
            at(18, 45, 0),
            "Polymarket",
        );
        assert_eq!(matcher.are_equivalent(&ke, &pe), None);
    }

    #[test]
    fn threshold_markets_must_agree_within_a_tick() {
        let matcher = EventMatcher::new();
        let ke = market(
            Venue::Kalshi,
            "Bitcoin above $100,000 at 6:45PM?",
            at(18, 45, 0),
            "Kalshi",
        );
        let pe_same = market(
            Venue::Polymarket,
            "Will Bitcoin be above 100k - Jan 10 6:45PM",
            at(18, 45, 0),
            "Polymarket",
        );
        let pe_other = market(
            Venue::Polymarket,
            "Will Bitcoin be above 101k - Jan 10 6:45PM",
            at(18, 45, 0),
            "Polymarket",
        );
        assert!(matcher.are_equivalent(&ke, &pe_same).is_some());
        assert!(matcher.are_equivalent(&ke, &pe_other).is_none());
    }

    #[test]
    fn catalog_match_is_cross_product() {
        let matcher = EventMatcher::new();
        let kalshi = vec![
            market(Venue::Kalshi, "BTC price up in next 15 mins?", at(18, 45, 0), "Kalshi"),
            market(Venue::Kalshi, "SOL price up in next 15 mins?", at(18, 45, 0), "Kalshi"),
        ];
        let poly = vec![
            market(
                Venue::Polymarket,
                "Solana Up or Down - Jan 10 6:45PM",
                at(18, 45, 0),
                "Polymarket",
            ),
            market(
                Venue::Polymarket,
                "Bitcoin Up or Down - Jan 10 6:45PM",
                at(18, 45, 0),
                "Polymarket",
            ),
        ];
        let pairs = matcher.match_catalogs(&kalshi, &poly);
        assert_eq!(pairs.len(), 2);
    }
}
