use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::warn;
use uuid::Uuid;

use crate::execution::order::{OrderAction, OrderStatus, VenueOrder};
use crate::market::{Market, OrderbookSnapshot, OutcomeTokens, PriceLevel, Side, Venue};

use super::auth::KalshiSigner;
use super::{ClientError, ClientResult};

const API_PREFIX: &str = "/trade-api/v2";
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome-book identifier for a Kalshi side. The encoding is private to this
/// adapter; everything else treats the result as opaque.
pub fn book_id(ticker: &str, side: Side) -> String {
    match side {
        Side::BuyYes => format!("{ticker}/yes"),
        Side::BuyNo => format!("{ticker}/no"),
    }
}

fn decode_book_id(book_id: &str) -> ClientResult<(&str, Side)> {
    match book_id.rsplit_once('/') {
        Some((ticker, "yes")) => Ok((ticker, Side::BuyYes)),
        Some((ticker, "no")) => Ok((ticker, Side::BuyNo)),
        _ => Err(ClientError::Config(format!("malformed kalshi book id: {book_id}"))),
    }
}

/// Kalshi REST adapter: catalog, books, balance, order management.
///
/// All requests are RSA-PSS signed and carry a bounded deadline; transient
/// failures retry with exponential backoff inside the adapter.
pub struct KalshiClient {
    http: Client,
    base_url: String,
    signer: KalshiSigner,
    max_retries: u32,
}

impl KalshiClient {
    pub fn new(base_url: &str, key_id: &str, secret: &str) -> ClientResult<Self> {
        let http = Client::builder()
            .user_agent("prediction-arb-bot/0.1")
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(ClientError::Http)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            signer: KalshiSigner::new(key_id, secret)?,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    /// Signed headers for the websocket handshake (same scheme as REST).
    pub fn ws_headers(&self) -> ClientResult<Vec<(&'static str, String)>> {
        self.signer.headers("GET", "/trade-api/ws/v2")
    }

    fn backoff(attempt: u32) -> Duration {
        let capped = attempt.min(5);
        Duration::from_millis((500 * (1_u64 << capped)).min(8_000))
    }

    async fn send_signed<TBody, TResp>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&TBody>,
    ) -> ClientResult<TResp>
    where
        TBody: Serialize + ?Sized,
        TResp: DeserializeOwned,
    {
        let full_path = format!("{API_PREFIX}{path}");
        let url = format!("{}{}", self.base_url, full_path);

        let body_json = match body {
            Some(body) => Some(serde_json::to_string(body)?),
            None => None,
        };

        let mut attempt = 0;
        loop {
            // Fresh timestamped signature per attempt.
            let headers = self.signer.headers(method.as_str(), &full_path)?;
            let mut req = self.http.request(method.clone(), &url).query(query);
            for (name, value) in &headers {
                req = req.header(*name, value);
            }
            if let Some(body) = &body_json {
                req = req.header("Content-Type", "application/json").body(body.clone());
            }

            match req.send().await {
                Ok(resp) => {
                    if resp.status().is_success() {
                        return Ok(resp.json::<TResp>().await?);
                    }
                    if resp.status().is_server_error() && attempt < self.max_retries {
                        attempt += 1;
                        sleep(Self::backoff(attempt)).await;
                        continue;
                    }
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(ClientError::HttpStatus { status, body });
                }
                Err(err) => {
                    if attempt < self.max_retries {
                        attempt += 1;
                        sleep(Self::backoff(attempt)).await;
                        continue;
                    }
                    return Err(ClientError::Http(err));
                }
            }
        }
    }

    /// Open markets for one series (e.g. `KXBTC15M`), normalized to the
    /// common market model. Prices arrive in cents and leave in [0, 1].
    pub async fn fetch_markets(&self, series_ticker: &str, limit: u32) -> ClientResult<Vec<Market>> {
        #[derive(Deserialize)]
        struct MarketsResponse {
            markets: Vec<KalshiMarketRow>,
        }

        let query = [
            ("limit", limit.to_string()),
            ("status", "open".to_string()),
            ("series_ticker", series_ticker.to_string()),
        ];
        let resp: MarketsResponse = self
            .send_signed::<(), _>(Method::GET, "/markets", &query, None)
            .await?;

        let mut markets = Vec::with_capacity(resp.markets.len());
        for row in resp.markets {
            match row.into_market() {
                Ok(m) => markets.push(m),
                Err(reason) => {
                    warn!(target: "bot", reason, "skipping malformed kalshi market");
                }
            }
        }
        Ok(markets)
    }

    /// Book for one outcome side, derived from the venue's combined yes/no
    /// book. Each side's resting orders are that side's asks; the bids are
    /// the price complement of the opposite side.
    pub async fn get_orderbook(&self, book_id_str: &str) -> ClientResult<OrderbookSnapshot> {
        #[derive(Deserialize)]
        struct BookResponse {
            orderbook: RawBook,
        }
        #[derive(Deserialize, Default)]
        struct RawBook {
            #[serde(default)]
            yes: Vec<(i64, f64)>,
            #[serde(default)]
            no: Vec<(i64, f64)>,
        }

        let (ticker, side) = decode_book_id(book_id_str)?;
        let path = format!("/markets/{ticker}/orderbook");
        let resp: BookResponse = self.send_signed::<(), _>(Method::GET, &path, &[], None).await?;

        let to_levels = |raw: &[(i64, f64)]| -> Vec<PriceLevel> {
            let mut levels: Vec<PriceLevel> = raw
                .iter()
                .map(|(cents, size)| PriceLevel {
                    price: *cents as f64 / 100.0,
                    size: *size,
                })
                .collect();
            levels.sort_by(|a, b| a.price.total_cmp(&b.price));
            levels
        };

        let (own, other) = match side {
            Side::BuyYes => (to_levels(&resp.orderbook.yes), to_levels(&resp.orderbook.no)),
            Side::BuyNo => (to_levels(&resp.orderbook.no), to_levels(&resp.orderbook.yes)),
        };

        let mut bids: Vec<PriceLevel> = other
            .iter()
            .map(|l| PriceLevel { price: 1.0 - l.price, size: l.size })
            .collect();
        bids.sort_by(|a, b| b.price.total_cmp(&a.price));

        Ok(OrderbookSnapshot {
            venue: Venue::Kalshi,
            book_id: book_id_str.to_string(),
            asks: own,
            bids,
            ts: Utc::now(),
        })
    }

    /// Authoritative cash balance in dollars (venue reports cents).
    pub async fn get_balance(&self) -> ClientResult<f64> {
        #[derive(Deserialize)]
        struct BalanceResponse {
            balance: i64,
        }
        let resp: BalanceResponse = self
            .send_signed::<(), _>(Method::GET, "/portfolio/balance", &[], None)
            .await?;
        Ok(resp.balance as f64 / 100.0)
    }

    pub async fn place_order(
        &self,
        ticker: &str,
        side: Side,
        action: OrderAction,
        price: f64,
        count: f64,
        client_order_id: &str,
    ) -> ClientResult<VenueOrder> {
        #[derive(Serialize)]
        struct PlaceOrderRequest<'a> {
            ticker: &'a str,
            action: &'a str,
            side: &'a str,
            count: i64,
            #[serde(rename = "type")]
            order_type: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            yes_price: Option<i64>,
            #[serde(skip_serializing_if = "Option::is_none")]
            no_price: Option<i64>,
            client_order_id: &'a str,
        }

        let cents = (price * 100.0).round() as i64;
        let (side_str, yes_price, no_price) = match side {
            Side::BuyYes => ("yes", Some(cents), None),
            Side::BuyNo => ("no", None, Some(cents)),
        };

        let payload = PlaceOrderRequest {
            ticker,
            action: match action {
                OrderAction::Buy => "buy",
                OrderAction::Sell => "sell",
            },
            side: side_str,
            count: count.round() as i64,
            order_type: "limit",
            yes_price,
            no_price,
            client_order_id,
        };

        let resp: OrderResponse = self
            .send_signed(Method::POST, "/portfolio/orders", &[], Some(&payload))
            .await?;
        Ok(resp.order.into_venue_order())
    }

    pub async fn get_order(&self, order_id: &str) -> ClientResult<VenueOrder> {
        let path = format!("/portfolio/orders/{order_id}");
        let resp: OrderResponse = self.send_signed::<(), _>(Method::GET, &path, &[], None).await?;
        Ok(resp.order.into_venue_order())
    }

    pub async fn cancel_order(&self, order_id: &str) -> ClientResult<()> {
        let path = format!("/portfolio/orders/{order_id}");
        let _: serde_json::Value = self
            .send_signed::<(), _>(Method::DELETE, &path, &[], None)
            .await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct OrderResponse {
    order: OrderRow,
}

#[derive(Deserialize)]
struct OrderRow {
    #[serde(default)]
    order_id: String,
    status: String,
    #[serde(default)]
    taker_fill_count: i64,
    #[serde(default)]
    maker_fill_count: i64,
    #[serde(default)]
    taker_fill_cost: i64,
    #[serde(default)]
    maker_fill_cost: i64,
}

impl OrderRow {
    fn into_venue_order(self) -> VenueOrder {
        let filled = (self.taker_fill_count + self.maker_fill_count) as f64;
        let cost = (self.taker_fill_cost + self.maker_fill_cost) as f64 / 100.0;
        let avg_price = if filled > 0.0 { cost / filled } else { 0.0 };
        let order_id = if self.order_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            self.order_id
        };
        VenueOrder {
            venue: Venue::Kalshi,
            order_id,
            status: map_status(&self.status, filled),
            filled_size: filled,
            avg_price,
        }
    }
}

fn map_status(status: &str, filled: f64) -> OrderStatus {
    match status.to_lowercase().as_str() {
        "resting" | "pending" | "open" => OrderStatus::Resting,
        "executed" | "filled" => OrderStatus::Filled,
        "canceled" | "cancelled" => {
            if filled > 0.0 {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Canceled
            }
        }
        _ => OrderStatus::Rejected,
    }
}

#[derive(Deserialize)]
struct KalshiMarketRow {
    ticker: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    yes_bid: Option<f64>,
    #[serde(default)]
    yes_ask: Option<f64>,
    #[serde(default)]
    close_time: Option<String>,
    #[serde(default)]
    expiration_time: Option<String>,
    #[serde(default)]
    settlement_source: Option<String>,
    #[serde(default)]
    volume: f64,
}

impl KalshiMarketRow {
    fn into_market(self) -> Result<Market, &'static str> {
        // close_time is the trading deadline used for matching; settlement can
        // be minutes later.
        let time_str = self
            .close_time
            .or(self.expiration_time)
            .ok_or("missing close_time")?;
        let resolution_time: DateTime<Utc> = time_str
            .parse::<DateTime<Utc>>()
            .map_err(|_| "unparseable close_time")?;

        let mut yes_price = match (self.yes_bid, self.yes_ask) {
            (Some(bid), Some(ask)) if bid > 0.0 && ask > 0.0 => (bid + ask) / 2.0,
            _ => 50.0,
        };
        // The venue quotes cents.
        if yes_price > 1.0 {
            yes_price /= 100.0;
        }

        let ticker = self.ticker;
        Ok(Market {
            venue: Venue::Kalshi,
            instrument: ticker.clone(),
            title: self.title,
            resolution_time,
            resolution_source: self.settlement_source.unwrap_or_else(|| "kalshi".to_string()),
            yes_price,
            no_price: 1.0 - yes_price,
            volume: self.volume,
            tokens: OutcomeTokens {
                yes: ticker.clone(),
                no: ticker,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn book_id_roundtrip() {
        let id = book_id("KXBTC15M-26JAN101845", Side::BuyNo);
        assert_eq!(id, "KXBTC15M-26JAN101845/no");
        let (ticker, side) = decode_book_id(&id).unwrap();
        assert_eq!(ticker, "KXBTC15M-26JAN101845");
        assert_eq!(side, Side::BuyNo);
        assert!(decode_book_id("KXBTC15M-26JAN101845").is_err());
    }

    #[test]
    fn status_mapping_honours_partial_cancels() {
        assert_eq!(map_status("resting", 0.0), OrderStatus::Resting);
        assert_eq!(map_status("executed", 10.0), OrderStatus::Filled);
        assert_eq!(map_status("canceled", 0.0), OrderStatus::Canceled);
        assert_eq!(map_status("canceled", 3.0), OrderStatus::PartiallyFilled);
        assert_eq!(map_status("weird", 0.0), OrderStatus::Rejected);
    }

    #[test]
    fn market_row_normalizes_cents() {
        let row = KalshiMarketRow {
            ticker: "KXBTC15M-26JAN101845".to_string(),
            title: "BTC price up in next 15 mins?".to_string(),
            yes_bid: Some(44.0),
            yes_ask: Some(46.0),
            close_time: Some("2026-01-10T18:45:00Z".to_string()),
            expiration_time: None,
            settlement_source: Some("CF Benchmarks".to_string()),
            volume: 1234.0,
        };
        let market = row.into_market().unwrap();
        assert!((market.yes_price - 0.45).abs() < 1e-9);
        assert!((market.no_price - 0.55).abs() < 1e-9);
        assert_eq!(market.resolution_source, "CF Benchmarks");
    }
}
