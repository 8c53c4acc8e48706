//! Per-loop scheduler: drives every slot at a fixed cadence.
//!
//! One loop = one public price fetch, then per slot: price tick, a budgeted
//! batch query of working orders, synthesized fill events, timer tick. The
//! private-call budget bounds how much exchange traffic a single loop may
//! generate; slots that miss out catch up next loop.

use std::sync::Arc;

use anyhow::Result;

use crate::config::{now_ts, Config};
use crate::engine::events::Event;
use crate::exchange::kraken::QUERY_ORDERS_BATCH;
use crate::exchange::ratelimit::RateLimiter;
use crate::exchange::retry::{public_call, Backoff};
use crate::exchange::{ExchangeAdapter, OrderInfo};
use crate::logging::{json_log, obj, v_num, v_str};
use crate::slot::Slot;
use crate::storage::Store;

pub struct Scheduler {
    pub cfg: Config,
    pub slots: Vec<Slot>,
    pub store: Store,
    pub adapter: Arc<dyn ExchangeAdapter>,
    pub limiter: Arc<RateLimiter>,
    backoff: Backoff,
    last_snapshot_ts: f64,
    pub consecutive_errors: u32,
}

impl Scheduler {
    pub fn new(
        cfg: Config,
        slots: Vec<Slot>,
        store: Store,
        adapter: Arc<dyn ExchangeAdapter>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            cfg,
            slots,
            store,
            adapter,
            limiter,
            backoff: Backoff::default(),
            last_snapshot_ts: 0.0,
            consecutive_errors: 0,
        }
    }

    /// One full pass over all slots. Returns the number of private calls
    /// spent.
    pub async fn run_once(&mut self) -> Result<u32> {
        let adapter = self.adapter.clone();
        let pair = self.cfg.pair.clone();
        let backoff = self.backoff.clone();
        let price = match public_call(&backoff, &pair, "get_price", || {
            let adapter = adapter.clone();
            let pair = pair.clone();
            async move { adapter.get_price(&pair).await }
        })
        .await
        {
            Ok(p) => p,
            Err(e) => {
                self.consecutive_errors += 1;
                return Err(e);
            }
        };

        match self.drive_slots(price).await {
            Ok(used) => {
                self.consecutive_errors = 0;
                Ok(used)
            }
            Err(e) => {
                self.consecutive_errors += 1;
                Err(e)
            }
        }
    }

    async fn drive_slots(&mut self, price: f64) -> Result<u32> {
        let adapter = self.adapter.clone();
        let now = now_ts();
        let mut used: u32 = 0;

        for i in 0..self.slots.len() {
            if used >= self.cfg.max_api_calls_per_loop {
                json_log(
                    "scheduler",
                    obj(&[
                        ("status", v_str("budget_exhausted")),
                        ("used", v_num(f64::from(used))),
                        ("skipped_from_slot", v_num(self.slots[i].slot_id as f64)),
                    ]),
                );
                break;
            }

            let slot = &mut self.slots[i];
            slot.maybe_roll_day(now);

            slot.apply_event(
                Event::PriceTick {
                    price,
                    timestamp: now,
                },
                &mut self.store,
                adapter.as_ref(),
            )
            .await?;

            slot.ensure_bootstrapped(&mut self.store, adapter.as_ref())
                .await?;

            used += Self::poll_fills(slot, &mut self.store, adapter.as_ref(), now).await?;

            slot.apply_event(
                Event::TimerTick { timestamp: now },
                &mut self.store,
                adapter.as_ref(),
            )
            .await?;

            slot.check_daily_loss_limit(self.cfg.daily_loss_limit_usd);
        }

        if now - self.last_snapshot_ts >= self.cfg.snapshot_interval_secs as f64 {
            self.snapshot_all(now);
        }

        Ok(used)
    }

    /// Query the slot's working orders in txid batches and synthesize the
    /// fill/cancel events the reducer consumes.
    async fn poll_fills(
        slot: &mut Slot,
        store: &mut Store,
        adapter: &dyn ExchangeAdapter,
        now: f64,
    ) -> Result<u32> {
        let order_txids: Vec<(i64, String)> = slot
            .state
            .orders
            .iter()
            .filter(|o| !o.txid.is_empty())
            .map(|o| (o.local_id, o.txid.clone()))
            .collect();
        let recovery_txids: Vec<(i64, String)> = slot
            .state
            .recovery_orders
            .iter()
            .filter(|r| !r.txid.is_empty())
            .map(|r| (r.recovery_id, r.txid.clone()))
            .collect();

        let all: Vec<String> = order_txids
            .iter()
            .chain(recovery_txids.iter())
            .map(|(_, t)| t.clone())
            .collect();
        if all.is_empty() {
            return Ok(0);
        }

        let mut info: std::collections::HashMap<String, OrderInfo> =
            std::collections::HashMap::new();
        let mut calls = 0;
        for chunk in all.chunks(QUERY_ORDERS_BATCH) {
            calls += 1;
            match adapter.query_orders(chunk).await {
                Ok(batch) => info.extend(batch),
                Err(err) => {
                    json_log(
                        "scheduler",
                        obj(&[
                            ("status", v_str("query_orders_failed")),
                            ("slot_id", v_num(slot.slot_id as f64)),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                }
            }
        }

        for (local_id, txid) in order_txids {
            let Some(order_info) = info.get(&txid) else {
                continue;
            };
            if order_info.is_closed() && order_info.vol_exec > 0.0 {
                let order = slot.state.find_order(local_id).cloned();
                let Some(order) = order else { continue };
                let price = if order_info.vol_exec > 0.0 && order_info.cost > 0.0 {
                    order_info.cost / order_info.vol_exec
                } else {
                    order.price
                };
                slot.apply_event(
                    Event::FillEvent {
                        order_local_id: local_id,
                        txid: txid.clone(),
                        side: order.side,
                        price,
                        volume: order_info.vol_exec,
                        fee: order_info.fee,
                        timestamp: now,
                    },
                    store,
                    adapter,
                )
                .await?;
            } else if order_info.is_canceled() {
                // Cancelled out from under us (operator or exchange). Drop
                // the order; the next tick re-seeds through the usual paths.
                json_log(
                    "scheduler",
                    obj(&[
                        ("status", v_str("order_canceled_externally")),
                        ("slot_id", v_num(slot.slot_id as f64)),
                        ("txid", v_str(&txid)),
                    ]),
                );
                slot.state.remove_order(local_id);
            }
        }

        for (recovery_id, txid) in recovery_txids {
            let Some(order_info) = info.get(&txid) else {
                continue;
            };
            if order_info.is_closed() && order_info.vol_exec > 0.0 {
                let rec = slot.state.find_recovery(recovery_id).cloned();
                let Some(rec) = rec else { continue };
                let price = if order_info.cost > 0.0 {
                    order_info.cost / order_info.vol_exec
                } else {
                    rec.price
                };
                slot.apply_event(
                    Event::RecoveryFillEvent {
                        recovery_id,
                        txid: txid.clone(),
                        side: rec.side,
                        price,
                        volume: order_info.vol_exec,
                        fee: order_info.fee,
                        timestamp: now,
                    },
                    store,
                    adapter,
                )
                .await?;
            } else if order_info.is_canceled() {
                slot.apply_event(
                    Event::RecoveryCancelEvent {
                        recovery_id,
                        txid: txid.clone(),
                        timestamp: now,
                    },
                    store,
                    adapter,
                )
                .await?;
            }
        }

        Ok(calls)
    }

    fn snapshot_all(&mut self, now: f64) {
        for slot in &self.slots {
            // Snapshot failures are non-fatal: the loss window is bounded by
            // the events since the last good snapshot.
            if let Err(err) = slot.snapshot(&mut self.store) {
                json_log(
                    "scheduler",
                    obj(&[
                        ("status", v_str("snapshot_failed")),
                        ("slot_id", v_num(slot.slot_id as f64)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
            }
        }
        self.last_snapshot_ts = now;
    }

    /// Graceful shutdown: pull every working order off the book.
    pub async fn cancel_all_open_orders(&mut self) {
        for slot in &self.slots {
            for order in &slot.state.orders {
                if order.txid.is_empty() {
                    continue;
                }
                if let Err(err) = self.adapter.cancel_order(&order.txid).await {
                    json_log(
                        "scheduler",
                        obj(&[
                            ("status", v_str("shutdown_cancel_failed")),
                            ("txid", v_str(&order.txid)),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                }
            }
        }
    }

    pub fn status_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "pair": self.cfg.pair.clone(),
            "slots": self.slots.iter().map(|s| s.status_payload()).collect::<Vec<_>>(),
            "rate_budget": self.limiter.budget_available(),
            "circuit_open": self.limiter.circuit_open(),
            "consecutive_errors": self.consecutive_errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::{Role, Side};
    use crate::exchange::mock::MockExchange;
    use tempfile::NamedTempFile;

    fn test_config() -> Config {
        let mut cfg = Config::from_env();
        cfg.pair = "XDGUSD".to_string();
        cfg.num_slots = 1;
        cfg.max_api_calls_per_loop = 8;
        cfg.snapshot_interval_secs = 0;
        cfg.daily_loss_limit_usd = 0.0;
        cfg
    }

    fn scheduler_with(adapter: Arc<MockExchange>, cfg: Config) -> (Scheduler, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = Store::open(file.path().to_str().unwrap()).unwrap();
        let slots = (0..cfg.num_slots as i64)
            .map(|i| Slot::new(i, &cfg.pair, cfg.engine_config(), cfg.order_size_usd))
            .collect();
        let limiter = Arc::new(RateLimiter::default());
        let sched = Scheduler::new(cfg, slots, store, adapter, limiter);
        (sched, file)
    }

    #[tokio::test]
    async fn test_first_loop_bootstraps_slot() {
        let adapter = Arc::new(MockExchange::new(0.1));
        let (mut sched, _f) = scheduler_with(adapter.clone(), test_config());

        sched.run_once().await.unwrap();

        assert_eq!(sched.slots[0].state.orders.len(), 2);
        assert_eq!(adapter.placed.lock().unwrap().len(), 2);
        // Snapshot cadence 0 means every loop snapshots.
        assert!(sched.store.get_snapshot(0).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_closed_entry_synthesizes_fill_and_places_exit() {
        let adapter = Arc::new(MockExchange::new(0.1));
        let (mut sched, _f) = scheduler_with(adapter.clone(), test_config());
        sched.run_once().await.unwrap();

        // Mark the buy entry closed on the exchange.
        let buy = sched.slots[0]
            .state
            .orders
            .iter()
            .find(|o| o.side == Side::Buy)
            .unwrap()
            .clone();
        adapter.order_info.lock().unwrap().insert(
            buy.txid.clone(),
            OrderInfo {
                status: "closed".to_string(),
                vol_exec: 20.0,
                cost: 1.996,
                fee: 0.005,
                price: 0.0998,
            },
        );
        adapter.open_orders.lock().unwrap().remove(&buy.txid);

        sched.run_once().await.unwrap();

        let slot = &sched.slots[0];
        assert!(slot.state.find_order(buy.local_id).is_none());
        let exit = slot
            .state
            .orders
            .iter()
            .find(|o| o.role == Role::Exit)
            .expect("exit placed");
        assert_eq!(exit.volume, 20.0);
        assert!((exit.entry_price - 0.0998).abs() < 1e-9);

        // Next loop the filled order is gone from state, so nothing books
        // twice.
        let cycles_before = slot.state.completed_cycles.len();
        let fees_before = slot.state.total_fees;
        sched.run_once().await.unwrap();
        assert_eq!(sched.slots[0].state.completed_cycles.len(), cycles_before);
        assert_eq!(sched.slots[0].state.total_fees, fees_before);
    }

    #[tokio::test]
    async fn test_budget_cap_skips_tail_slots() {
        let mut cfg = test_config();
        cfg.num_slots = 3;
        cfg.max_api_calls_per_loop = 0;
        let adapter = Arc::new(MockExchange::new(0.1));
        let (mut sched, _f) = scheduler_with(adapter.clone(), cfg);

        let used = sched.run_once().await.unwrap();
        assert_eq!(used, 0);
        // Budget exhausted before the first slot: nothing bootstrapped.
        assert!(sched.slots.iter().all(|s| s.state.orders.is_empty()));
    }

    #[tokio::test]
    async fn test_price_failure_counts_scheduler_errors() {
        struct DeadExchange;
        #[async_trait::async_trait]
        impl ExchangeAdapter for DeadExchange {
            async fn get_price(&self, _pair: &str) -> Result<f64> {
                anyhow::bail!("network down")
            }
            async fn place_limit_order(
                &self,
                _pair: &str,
                _side: Side,
                _volume: f64,
                _price: f64,
                _post_only: bool,
            ) -> Result<String> {
                unreachable!()
            }
            async fn cancel_order(&self, _txid: &str) -> Result<bool> {
                unreachable!()
            }
            async fn query_orders(
                &self,
                _txids: &[String],
            ) -> Result<std::collections::HashMap<String, OrderInfo>> {
                unreachable!()
            }
            async fn get_trades_history(
                &self,
                _since_ts: f64,
            ) -> Result<std::collections::HashMap<String, crate::exchange::TradeRecord>> {
                unreachable!()
            }
            async fn get_open_orders(
                &self,
            ) -> Result<std::collections::HashMap<String, crate::exchange::OpenOrder>> {
                unreachable!()
            }
        }

        let file = NamedTempFile::new().unwrap();
        let store = Store::open(file.path().to_str().unwrap()).unwrap();
        let cfg = test_config();
        let slots = vec![Slot::new(0, &cfg.pair, cfg.engine_config(), 2.0)];
        let limiter = Arc::new(RateLimiter::default());
        let mut sched = Scheduler::new(cfg, slots, store, Arc::new(DeadExchange), limiter);

        assert!(sched.run_once().await.is_err());
        assert_eq!(sched.consecutive_errors, 1);
    }

    #[tokio::test]
    async fn test_recovery_cancel_synthesized_from_query() {
        let adapter = Arc::new(MockExchange::new(0.11));
        let (mut sched, _f) = scheduler_with(adapter.clone(), test_config());
        // Seed a recovery order whose exchange order was cancelled.
        sched.slots[0].state.market_price = 0.11;
        sched.slots[0]
            .state
            .recovery_orders
            .push(crate::engine::state::RecoveryOrder {
                recovery_id: 1,
                side: Side::Sell,
                price: 0.13,
                volume: 13.0,
                trade_id: crate::engine::state::TradeId::B,
                cycle: 1,
                entry_price: 0.108,
                orphaned_at: 2000.0,
                txid: "REC-1".to_string(),
                reason: "s2_timeout".to_string(),
            });
        sched.slots[0].state.next_recovery_id = 2;
        adapter.order_info.lock().unwrap().insert(
            "REC-1".to_string(),
            OrderInfo {
                status: "canceled".to_string(),
                vol_exec: 0.0,
                cost: 0.0,
                fee: 0.0,
                price: 0.0,
            },
        );

        sched.run_once().await.unwrap();

        assert!(sched.slots[0].state.recovery_orders.is_empty());
        assert!(sched.slots[0].state.completed_cycles.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all_on_shutdown() {
        let adapter = Arc::new(MockExchange::new(0.1));
        let (mut sched, _f) = scheduler_with(adapter.clone(), test_config());
        sched.run_once().await.unwrap();
        assert_eq!(sched.slots[0].state.orders.len(), 2);

        sched.cancel_all_open_orders().await;
        assert_eq!(adapter.canceled.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_status_payload_aggregates_slots() {
        let adapter = Arc::new(MockExchange::new(0.1));
        let (mut sched, _f) = scheduler_with(adapter.clone(), test_config());
        sched.run_once().await.unwrap();

        let payload = sched.status_payload();
        assert_eq!(payload["pair"], "XDGUSD");
        assert_eq!(payload["slots"].as_array().unwrap().len(), 1);
        assert_eq!(payload["circuit_open"], false);
    }
}
