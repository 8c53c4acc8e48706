//! Kraken REST adapter.
//!
//! All private calls acquire the shared rate limiter first and feed its
//! circuit breaker from the error strings Kraken returns. Nonces come from
//! the shared monotonic generator.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::ratelimit::{NonceGen, RateLimiter};
use super::signing::sign_kraken;
use super::{ExchangeAdapter, OpenOrder, OrderInfo, TradeRecord};
use crate::engine::state::Side;

const TICKER_PATH: &str = "/0/public/Ticker";
const ADD_ORDER_PATH: &str = "/0/private/AddOrder";
const CANCEL_ORDER_PATH: &str = "/0/private/CancelOrder";
const OPEN_ORDERS_PATH: &str = "/0/private/OpenOrders";
const QUERY_ORDERS_PATH: &str = "/0/private/QueryOrders";
const TRADES_HISTORY_PATH: &str = "/0/private/TradesHistory";

/// Batched order queries accept at most this many txids per call.
pub const QUERY_ORDERS_BATCH: usize = 50;

pub struct Kraken {
    client: Client,
    base: String,
    api_key: String,
    api_secret: String,
    limiter: Arc<RateLimiter>,
    nonce: Arc<NonceGen>,
}

impl Kraken {
    pub fn new(
        base: String,
        api_key: String,
        api_secret: String,
        limiter: Arc<RateLimiter>,
        nonce: Arc<NonceGen>,
    ) -> Result<Self> {
        Ok(Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()?,
            base,
            api_key,
            api_secret,
            limiter,
            nonce,
        })
    }

    async fn private<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        self.limiter.consume(1.0);

        let nonce = self.nonce.next();
        let mut post_data = format!("nonce={}", nonce);
        for (k, v) in params {
            post_data.push('&');
            post_data.push_str(k);
            post_data.push('=');
            post_data.push_str(v);
        }

        let signature =
            sign_kraken(path, nonce, &post_data, &self.api_secret).map_err(|e| anyhow!(e))?;

        let url = format!("{}{}", self.base, path);
        let resp = self
            .client
            .post(&url)
            .header("API-Key", &self.api_key)
            .header("API-Sign", &signature)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(post_data)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(anyhow!("Kraken HTTP {}: {}", status, body));
        }

        let parsed: KrakenResp<T> = serde_json::from_str(&body)?;
        if !parsed.error.is_empty() {
            let error_str = format!("{:?}", parsed.error);
            if error_str.contains("EAPI:Rate limit") || error_str.contains("Temporary lockout") {
                self.limiter.report_rate_error();
            }
            return Err(anyhow!("Kraken API error: {}", error_str));
        }

        self.limiter.report_success();
        parsed.result.ok_or_else(|| anyhow!("missing result"))
    }

    fn parse_side(raw: &str) -> Result<Side> {
        match raw {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(anyhow!("unknown side: {}", other)),
        }
    }
}

#[derive(Deserialize, Debug)]
struct KrakenResp<T> {
    #[serde(default)]
    error: Vec<String>,
    result: Option<T>,
}

#[derive(Deserialize, Debug)]
struct AddOrderResult {
    txid: Vec<String>,
}

#[derive(Deserialize, Debug)]
struct CancelResult {
    #[serde(default)]
    count: u32,
}

#[derive(Deserialize, Debug, Clone, Default)]
struct RawOrderDescr {
    #[serde(default)]
    pair: String,
    #[serde(default, rename = "type")]
    side: String,
    #[serde(default)]
    price: String,
}

#[derive(Deserialize, Debug, Clone)]
struct RawOrderInfo {
    #[serde(default)]
    status: String,
    #[serde(default)]
    vol: String,
    #[serde(default)]
    vol_exec: String,
    #[serde(default)]
    cost: String,
    #[serde(default)]
    fee: String,
    #[serde(default)]
    price: String,
    #[serde(default)]
    descr: RawOrderDescr,
}

#[derive(Deserialize, Debug)]
struct OpenOrdersResult {
    open: HashMap<String, RawOrderInfo>,
}

#[derive(Deserialize, Debug)]
struct TradesHistoryResult {
    trades: HashMap<String, RawTrade>,
}

#[derive(Deserialize, Debug, Clone)]
struct RawTrade {
    #[serde(default)]
    ordertxid: String,
    #[serde(default)]
    pair: String,
    #[serde(default, rename = "type")]
    side: String,
    #[serde(default)]
    price: String,
    #[serde(default)]
    vol: String,
    #[serde(default)]
    cost: String,
    #[serde(default)]
    fee: String,
    #[serde(default)]
    time: f64,
}

fn parse_f64(raw: &str) -> f64 {
    raw.parse().unwrap_or(0.0)
}

#[derive(Deserialize, Debug)]
struct TickerInfo {
    /// Last trade closed: [price, lot volume].
    c: Vec<String>,
}

#[async_trait]
impl ExchangeAdapter for Kraken {
    async fn get_price(&self, pair: &str) -> Result<f64> {
        let url = format!("{}{}?pair={}", self.base, TICKER_PATH, pair);
        let resp = self.client.get(&url).send().await?;
        let data: KrakenResp<HashMap<String, TickerInfo>> = resp.json().await?;
        if !data.error.is_empty() {
            return Err(anyhow!("Kraken error: {:?}", data.error));
        }
        let result = data.result.ok_or_else(|| anyhow!("missing result"))?;
        let info = result
            .values()
            .next()
            .ok_or_else(|| anyhow!("no ticker for {}", pair))?;
        let price: f64 = info
            .c
            .first()
            .ok_or_else(|| anyhow!("empty ticker"))?
            .parse()?;
        if price <= 0.0 {
            return Err(anyhow!("non-positive price for {}", pair));
        }
        Ok(price)
    }

    async fn place_limit_order(
        &self,
        pair: &str,
        side: Side,
        volume: f64,
        price: f64,
        post_only: bool,
    ) -> Result<String> {
        let mut params = vec![
            ("ordertype", "limit".to_string()),
            ("type", side.as_str().to_string()),
            ("pair", pair.to_string()),
            ("volume", format!("{:.8}", volume)),
            ("price", format!("{}", price)),
        ];
        if post_only {
            params.push(("oflags", "post".to_string()));
        }
        let result: AddOrderResult = self.private(ADD_ORDER_PATH, &params).await?;
        result
            .txid
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("AddOrder returned no txid"))
    }

    async fn cancel_order(&self, txid: &str) -> Result<bool> {
        let params = vec![("txid", txid.to_string())];
        let result: CancelResult = self.private(CANCEL_ORDER_PATH, &params).await?;
        Ok(result.count > 0)
    }

    async fn query_orders(&self, txids: &[String]) -> Result<HashMap<String, OrderInfo>> {
        if txids.is_empty() {
            return Ok(HashMap::new());
        }
        if txids.len() > QUERY_ORDERS_BATCH {
            return Err(anyhow!(
                "query_orders limited to {} txids per call",
                QUERY_ORDERS_BATCH
            ));
        }
        let params = vec![("txid", txids.join(","))];
        let result: HashMap<String, RawOrderInfo> =
            self.private(QUERY_ORDERS_PATH, &params).await?;
        Ok(result
            .into_iter()
            .map(|(txid, raw)| {
                (
                    txid,
                    OrderInfo {
                        status: raw.status,
                        vol_exec: parse_f64(&raw.vol_exec),
                        cost: parse_f64(&raw.cost),
                        fee: parse_f64(&raw.fee),
                        price: parse_f64(&raw.price),
                    },
                )
            })
            .collect())
    }

    async fn get_trades_history(&self, since_ts: f64) -> Result<HashMap<String, TradeRecord>> {
        let params = vec![("start", format!("{}", since_ts))];
        let result: TradesHistoryResult = self.private(TRADES_HISTORY_PATH, &params).await?;
        let mut out = HashMap::new();
        for (trade_id, raw) in result.trades {
            let side = match Self::parse_side(&raw.side) {
                Ok(s) => s,
                Err(_) => continue,
            };
            out.insert(
                trade_id,
                TradeRecord {
                    ordertxid: raw.ordertxid,
                    pair: raw.pair,
                    side,
                    price: parse_f64(&raw.price),
                    volume: parse_f64(&raw.vol),
                    cost: parse_f64(&raw.cost),
                    fee: parse_f64(&raw.fee),
                    time: raw.time,
                },
            );
        }
        Ok(out)
    }

    async fn get_open_orders(&self) -> Result<HashMap<String, OpenOrder>> {
        let result: OpenOrdersResult = self.private(OPEN_ORDERS_PATH, &[]).await?;
        let mut out = HashMap::new();
        for (txid, raw) in result.open {
            let side = match Self::parse_side(&raw.descr.side) {
                Ok(s) => s,
                Err(_) => continue,
            };
            out.insert(
                txid.clone(),
                OpenOrder {
                    txid,
                    pair: raw.descr.pair.clone(),
                    side,
                    price: parse_f64(&raw.descr.price),
                    volume: parse_f64(&raw.vol),
                },
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_envelope_parses_error() {
        let raw = r#"{"error":["EAPI:Rate limit exceeded"],"result":null}"#;
        let parsed: KrakenResp<AddOrderResult> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.error.len(), 1);
        assert!(parsed.result.is_none());
    }

    #[test]
    fn test_open_orders_parsing() {
        let raw = r#"{
            "open": {
                "OABC-1": {
                    "status": "open",
                    "vol": "20.0",
                    "vol_exec": "0.0",
                    "descr": {"pair": "XDGUSD", "type": "buy", "price": "0.0998"}
                }
            }
        }"#;
        let parsed: OpenOrdersResult = serde_json::from_str(raw).unwrap();
        let o = parsed.open.get("OABC-1").unwrap();
        assert_eq!(o.descr.side, "buy");
        assert_eq!(parse_f64(&o.vol), 20.0);
        assert_eq!(parse_f64(&o.descr.price), 0.0998);
    }

    #[test]
    fn test_trade_history_parsing() {
        let raw = r#"{
            "trades": {
                "T-1": {
                    "ordertxid": "OABC-1",
                    "pair": "XDGUSD",
                    "type": "sell",
                    "price": "0.1008",
                    "vol": "20.0",
                    "cost": "2.016",
                    "fee": "0.00504",
                    "time": 1700000000.5
                }
            }
        }"#;
        let parsed: TradesHistoryResult = serde_json::from_str(raw).unwrap();
        let t = parsed.trades.get("T-1").unwrap();
        assert_eq!(t.ordertxid, "OABC-1");
        assert_eq!(t.side, "sell");
        assert_eq!(t.time, 1700000000.5);
    }

    #[test]
    fn test_ticker_parsing() {
        let raw = r#"{"error":[],"result":{"XDGUSD":{"c":["0.101","150.0"]}}}"#;
        let parsed: KrakenResp<HashMap<String, TickerInfo>> = serde_json::from_str(raw).unwrap();
        let result = parsed.result.unwrap();
        let info = result.get("XDGUSD").unwrap();
        assert_eq!(info.c[0], "0.101");
    }

    #[test]
    fn test_order_info_status_helpers() {
        let closed = OrderInfo {
            status: "closed".to_string(),
            vol_exec: 20.0,
            cost: 2.016,
            fee: 0.005,
            price: 0.1008,
        };
        assert!(closed.is_closed());
        assert!(!closed.is_canceled());

        let canceled = OrderInfo {
            status: "canceled".to_string(),
            vol_exec: 0.0,
            cost: 0.0,
            fee: 0.0,
            price: 0.0,
        };
        assert!(canceled.is_canceled());
    }
}
