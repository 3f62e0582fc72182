use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::warn;
use uuid::Uuid;

use crate::execution::order::{OrderAction, OrderStatus, VenueOrder};
use crate::market::{Market, OrderbookSnapshot, OutcomeTokens, PriceLevel, Venue};

use super::auth::{build_poly_hmac_signature, current_unix_timestamp};
use super::{ClientError, ClientResult};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// USDC carries six decimals on chain.
const COLLATERAL_DECIMALS: f64 = 1e6;

/// Polymarket credentials for L2 (HMAC) auth on private CLOB endpoints.
#[derive(Clone)]
pub struct PolyCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
    pub address: String,
}

/// Polymarket adapter: Gamma catalog plus CLOB books, balance and orders.
///
/// Public endpoints are unauthenticated; private endpoints carry the five
/// `POLY_*` headers with an HMAC signature per request.
pub struct PolymarketClient {
    http: Client,
    gamma_url: String,
    clob_url: String,
    creds: PolyCredentials,
    max_retries: u32,
}

impl PolymarketClient {
    pub fn new(gamma_url: &str, clob_url: &str, creds: PolyCredentials) -> ClientResult<Self> {
        if creds.address.is_empty() {
            return Err(ClientError::Config(
                "polymarket funder address must be configured".to_string(),
            ));
        }
        let http = Client::builder()
            .user_agent("prediction-arb-bot/0.1")
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(ClientError::Http)?;
        Ok(Self {
            http,
            gamma_url: gamma_url.trim_end_matches('/').to_string(),
            clob_url: clob_url.trim_end_matches('/').to_string(),
            creds,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    fn backoff(attempt: u32) -> Duration {
        let capped = attempt.min(5);
        Duration::from_millis((500 * (1_u64 << capped)).min(8_000))
    }

    async fn send_private<TBody, TResp>(
        &self,
        method: Method,
        path: &str,
        body: Option<&TBody>,
    ) -> ClientResult<TResp>
    where
        TBody: Serialize + ?Sized,
        TResp: DeserializeOwned,
    {
        let url = format!("{}{}", self.clob_url, path);
        let body_json = match body {
            Some(body) => Some(serde_json::to_string(body)?),
            None => None,
        };

        let mut attempt = 0;
        loop {
            let timestamp = current_unix_timestamp();
            let signature = build_poly_hmac_signature(
                &self.creds.api_secret,
                timestamp,
                method.as_str(),
                path,
                body_json.as_deref(),
            )?;

            let mut req = self
                .http
                .request(method.clone(), &url)
                .header("POLY_ADDRESS", &self.creds.address)
                .header("POLY_SIGNATURE", &signature)
                .header("POLY_TIMESTAMP", timestamp.to_string())
                .header("POLY_API_KEY", &self.creds.api_key)
                .header("POLY_PASSPHRASE", &self.creds.api_passphrase);
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

    async fn get_public<TResp>(&self, url: String) -> ClientResult<TResp>
    where
        TResp: DeserializeOwned,
    {
        let resp = self.http.get(url).send().await?;
        if resp.status().is_success() {
            Ok(resp.json::<TResp>().await?)
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(ClientError::HttpStatus { status, body })
        }
    }

    /// Active events for one Gamma tag (the 15-minute series tag), ordered by
    /// end date so the currently tradable round comes first.
    pub async fn fetch_markets(&self, tag_id: u64, limit: u32) -> ClientResult<Vec<Market>> {
        let url = format!(
            "{}/events?limit={}&closed=false&tag_id={}&order=endDate:asc",
            self.gamma_url, limit, tag_id
        );
        let rows: Vec<GammaEventRow> = self.get_public(url).await?;

        let mut markets = Vec::with_capacity(rows.len());
        for row in rows {
            match row.into_market() {
                Ok(m) => markets.push(m),
                Err(reason) => {
                    warn!(target: "bot", reason, "skipping malformed polymarket event");
                }
            }
        }
        Ok(markets)
    }

    /// A token is tradable when its CLOB book exists and shows liquidity.
    /// Used after matching so only a handful of tokens are validated.
    pub async fn validate_token(&self, token_id: &str) -> bool {
        match self.get_orderbook(token_id).await {
            Ok(book) => !book.asks.is_empty() || !book.bids.is_empty(),
            Err(_) => false,
        }
    }

    pub async fn get_orderbook(&self, token_id: &str) -> ClientResult<OrderbookSnapshot> {
        #[derive(Deserialize)]
        struct RawLevel {
            price: String,
            size: String,
        }
        #[derive(Deserialize)]
        struct BookResponse {
            #[serde(default)]
            asks: Vec<RawLevel>,
            #[serde(default)]
            bids: Vec<RawLevel>,
        }

        let url = format!("{}/book?token_id={}", self.clob_url, token_id);
        let resp: BookResponse = self.get_public(url).await?;

        let parse = |levels: Vec<RawLevel>| -> Vec<PriceLevel> {
            levels
                .into_iter()
                .filter_map(|l| {
                    let price = l.price.parse::<f64>().ok()?;
                    let size = l.size.parse::<f64>().ok()?;
                    Some(PriceLevel { price, size })
                })
                .collect()
        };

        let mut asks = parse(resp.asks);
        let mut bids = parse(resp.bids);
        asks.sort_by(|a, b| a.price.total_cmp(&b.price));
        bids.sort_by(|a, b| b.price.total_cmp(&a.price));

        Ok(OrderbookSnapshot {
            venue: Venue::Polymarket,
            book_id: token_id.to_string(),
            asks,
            bids,
            ts: Utc::now(),
        })
    }

    /// Available collateral balance in dollars.
    pub async fn get_balance(&self) -> ClientResult<f64> {
        #[derive(Deserialize)]
        struct BalanceResponse {
            balance: String,
        }
        let resp: BalanceResponse = self
            .send_private::<(), _>(Method::GET, "/balance-allowance?asset_type=COLLATERAL", None)
            .await?;
        let raw = resp
            .balance
            .parse::<f64>()
            .map_err(|e| ClientError::Config(format!("unparseable balance: {e}")))?;
        Ok(raw / COLLATERAL_DECIMALS)
    }

    /// Trade `size` units of one outcome token at `price`. The outcome side
    /// is already encoded by the token itself, so only buy/sell remains.
    pub async fn place_order(
        &self,
        token_id: &str,
        action: OrderAction,
        price: f64,
        size: f64,
        client_order_id: &str,
    ) -> ClientResult<VenueOrder> {
        #[derive(Serialize)]
        struct PlaceOrderRequest<'a> {
            token_id: &'a str,
            side: &'a str,
            price: f64,
            size: f64,
            #[serde(rename = "type")]
            order_type: &'a str,
            client_order_id: &'a str,
        }

        let payload = PlaceOrderRequest {
            token_id,
            side: match action {
                OrderAction::Buy => "BUY",
                OrderAction::Sell => "SELL",
            },
            price,
            size,
            order_type: "GTC",
            client_order_id,
        };
        let resp: PolyOrderRow = self.send_private(Method::POST, "/order", Some(&payload)).await?;
        Ok(resp.into_venue_order())
    }

    pub async fn get_order(&self, order_id: &str) -> ClientResult<VenueOrder> {
        let path = format!("/data/order/{order_id}");
        let resp: PolyOrderRow = self.send_private::<(), _>(Method::GET, &path, None).await?;
        Ok(resp.into_venue_order())
    }

    pub async fn cancel_order(&self, order_id: &str) -> ClientResult<()> {
        #[derive(Serialize)]
        struct CancelRequest<'a> {
            #[serde(rename = "orderID")]
            order_id: &'a str,
        }
        let _: serde_json::Value = self
            .send_private(Method::DELETE, "/order", Some(&CancelRequest { order_id }))
            .await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct PolyOrderRow {
    #[serde(default, alias = "orderID")]
    id: String,
    status: String,
    #[serde(default)]
    size_matched: Option<String>,
    #[serde(default)]
    price: Option<String>,
}

impl PolyOrderRow {
    fn into_venue_order(self) -> VenueOrder {
        let filled = self
            .size_matched
            .as_deref()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        let avg_price = self
            .price
            .as_deref()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        let order_id = if self.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            self.id
        };
        VenueOrder {
            venue: Venue::Polymarket,
            order_id,
            status: map_status(&self.status, filled),
            filled_size: filled,
            avg_price,
        }
    }
}

fn map_status(status: &str, filled: f64) -> OrderStatus {
    match status.to_lowercase().as_str() {
        "live" | "open" | "delayed" => OrderStatus::Resting,
        "matched" | "filled" => OrderStatus::Filled,
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
struct GammaEventRow {
    #[serde(default)]
    title: String,
    #[serde(default)]
    slug: String,
    #[serde(rename = "endDate", default)]
    end_date: Option<String>,
    #[serde(default)]
    volume: Option<f64>,
    #[serde(default)]
    markets: Vec<GammaMarketRow>,
}

#[derive(Deserialize)]
struct GammaMarketRow {
    #[serde(rename = "outcomePrices", default)]
    outcome_prices: Option<String>,
    #[serde(rename = "clobTokenIds", default)]
    clob_token_ids: Option<String>,
}

impl GammaEventRow {
    fn into_market(self) -> Result<Market, &'static str> {
        let mk = self.markets.first().ok_or("event has no markets")?;

        // Gamma encodes both arrays as JSON strings inside JSON.
        let prices: Vec<String> = mk
            .outcome_prices
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_else(|| vec!["0.5".to_string(), "0.5".to_string()]);
        let yes_price = prices.first().and_then(|p| p.parse().ok()).unwrap_or(0.5);
        let no_price = prices.get(1).and_then(|p| p.parse().ok()).unwrap_or(1.0 - yes_price);

        let tokens: Vec<String> = mk
            .clob_token_ids
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .ok_or("missing clobTokenIds")?;
        if tokens.len() < 2 {
            return Err("expected two outcome tokens");
        }

        let end = self.end_date.ok_or("missing endDate")?;
        let resolution_time: DateTime<Utc> =
            end.parse::<DateTime<Utc>>().map_err(|_| "unparseable endDate")?;

        Ok(Market {
            venue: Venue::Polymarket,
            instrument: self.slug,
            title: self.title,
            resolution_time,
            resolution_source: "polymarket".to_string(),
            yes_price,
            no_price,
            volume: self.volume.unwrap_or(0.0),
            tokens: OutcomeTokens {
                yes: tokens[0].clone(),
                no: tokens[1].clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gamma_event_parses_nested_json_strings() {
        let row = GammaEventRow {
            title: "Bitcoin Up or Down - Jan 10 6:45PM".to_string(),
            slug: "btc-updown-15m-1768070700".to_string(),
            end_date: Some("2026-01-10T18:45:00Z".to_string()),
            volume: Some(5000.0),
            markets: vec![GammaMarketRow {
                outcome_prices: Some("[\"0.36\", \"0.64\"]".to_string()),
                clob_token_ids: Some("[\"tok-up\", \"tok-down\"]".to_string()),
            }],
        };
        let market = row.into_market().unwrap();
        assert!((market.yes_price - 0.36).abs() < 1e-9);
        assert_eq!(market.tokens.yes, "tok-up");
        assert_eq!(market.tokens.no, "tok-down");
    }

    #[test]
    fn gamma_event_without_tokens_is_rejected() {
        let row = GammaEventRow {
            title: "x".to_string(),
            slug: "x".to_string(),
            end_date: Some("2026-01-10T18:45:00Z".to_string()),
            volume: None,
            markets: vec![GammaMarketRow {
                outcome_prices: None,
                clob_token_ids: None,
            }],
        };
        assert!(row.into_market().is_err());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(map_status("live", 0.0), OrderStatus::Resting);
        assert_eq!(map_status("matched", 10.0), OrderStatus::Filled);
        assert_eq!(map_status("canceled", 4.0), OrderStatus::PartiallyFilled);
        assert_eq!(map_status("unknown", 0.0), OrderStatus::Rejected);
    }
}
