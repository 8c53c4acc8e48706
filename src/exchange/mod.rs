//! Exchange adapter capability: the only way the runtime touches the venue.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::state::Side;

pub mod kraken;
pub mod ratelimit;
pub mod retry;
pub mod signing;

/// A live order as reported by the exchange's open-orders listing.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub txid: String,
    pub pair: String,
    pub side: Side,
    pub price: f64,
    pub volume: f64,
}

/// Result of querying a specific order by txid.
#[derive(Debug, Clone)]
pub struct OrderInfo {
    pub status: String,
    pub vol_exec: f64,
    pub cost: f64,
    pub fee: f64,
    pub price: f64,
}

impl OrderInfo {
    pub fn is_closed(&self) -> bool {
        self.status == "closed"
    }

    pub fn is_canceled(&self) -> bool {
        self.status == "canceled" || self.status == "expired"
    }
}

/// One execution row from trade history.
#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub ordertxid: String,
    pub pair: String,
    pub side: Side,
    pub price: f64,
    pub volume: f64,
    pub cost: f64,
    pub fee: f64,
    pub time: f64,
}

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn get_price(&self, pair: &str) -> Result<f64>;

    /// Place a limit order; returns the exchange txid.
    async fn place_limit_order(
        &self,
        pair: &str,
        side: Side,
        volume: f64,
        price: f64,
        post_only: bool,
    ) -> Result<String>;

    async fn cancel_order(&self, txid: &str) -> Result<bool>;

    /// Query up to 50 orders in one call.
    async fn query_orders(&self, txids: &[String]) -> Result<HashMap<String, OrderInfo>>;

    async fn get_trades_history(&self, since_ts: f64) -> Result<HashMap<String, TradeRecord>>;

    async fn get_open_orders(&self) -> Result<HashMap<String, OpenOrder>>;
}

#[cfg(test)]
pub mod mock {
    //! In-memory adapter for runtime tests: scripted fills, recorded calls.

    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockExchange {
        pub price: Mutex<f64>,
        pub next_txid: Mutex<u64>,
        pub placed: Mutex<Vec<(String, Side, f64, f64, bool)>>,
        pub canceled: Mutex<Vec<String>>,
        pub open_orders: Mutex<HashMap<String, OpenOrder>>,
        pub order_info: Mutex<HashMap<String, OrderInfo>>,
        pub trades: Mutex<HashMap<String, TradeRecord>>,
        pub fail_placements: Mutex<bool>,
    }

    impl MockExchange {
        pub fn new(price: f64) -> Self {
            Self {
                price: Mutex::new(price),
                next_txid: Mutex::new(1),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ExchangeAdapter for MockExchange {
        async fn get_price(&self, _pair: &str) -> Result<f64> {
            Ok(*self.price.lock().unwrap())
        }

        async fn place_limit_order(
            &self,
            pair: &str,
            side: Side,
            volume: f64,
            price: f64,
            post_only: bool,
        ) -> Result<String> {
            if *self.fail_placements.lock().unwrap() {
                anyhow::bail!("EOrder:Insufficient funds");
            }
            let mut next = self.next_txid.lock().unwrap();
            let txid = format!("MOCK-{}", *next);
            *next += 1;
            self.placed
                .lock()
                .unwrap()
                .push((txid.clone(), side, volume, price, post_only));
            self.open_orders.lock().unwrap().insert(
                txid.clone(),
                OpenOrder {
                    txid: txid.clone(),
                    pair: pair.to_string(),
                    side,
                    price,
                    volume,
                },
            );
            Ok(txid)
        }

        async fn cancel_order(&self, txid: &str) -> Result<bool> {
            self.canceled.lock().unwrap().push(txid.to_string());
            Ok(self.open_orders.lock().unwrap().remove(txid).is_some())
        }

        async fn query_orders(&self, txids: &[String]) -> Result<HashMap<String, OrderInfo>> {
            let info = self.order_info.lock().unwrap();
            Ok(txids
                .iter()
                .filter_map(|t| info.get(t).map(|i| (t.clone(), i.clone())))
                .collect())
        }

        async fn get_trades_history(&self, since_ts: f64) -> Result<HashMap<String, TradeRecord>> {
            Ok(self
                .trades
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, t)| t.time >= since_ts)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }

        async fn get_open_orders(&self) -> Result<HashMap<String, OpenOrder>> {
            Ok(self.open_orders.lock().unwrap().clone())
        }
    }
}
