//! Startup reconciliation: align persisted slot state with exchange reality.
//!
//! After restore, every persisted order is checked against the live book.
//! Orders that vanished are resolved through trade history: executions
//! aggregate into exactly one synthesized fill event per order, routed
//! through `apply_event` so the seen-txid guard keeps replays idempotent.
//! Live orders nobody owns are adopted into a fitting slot or cancelled.

use std::collections::HashMap;

use anyhow::Result;

use crate::engine::events::Event;
use crate::engine::state::{derive_phase, OrderState, Phase, Role, Side, TradeId};
use crate::exchange::{ExchangeAdapter, OpenOrder, TradeRecord};
use crate::logging::{json_log, obj, v_num, v_str};
use crate::slot::Slot;
use crate::storage::Store;

/// Adoption tolerance: fraction of the expected grid spacing an unowned
/// order's price may deviate from the expected entry price.
const ADOPTION_TOLERANCE: f64 = 0.30;

/// One aggregate execution reconstructed from trade history rows sharing an
/// ordertxid.
#[derive(Debug, Clone)]
struct AggregateFill {
    volume: f64,
    price: f64,
    fee: f64,
    ts: f64,
}

fn aggregate_for_order(trades: &HashMap<String, TradeRecord>, ordertxid: &str) -> Option<AggregateFill> {
    let mut volume = 0.0;
    let mut cost = 0.0;
    let mut fee = 0.0;
    let mut ts: f64 = 0.0;
    for trade in trades.values() {
        if trade.ordertxid == ordertxid {
            volume += trade.volume;
            cost += trade.cost;
            fee += trade.fee;
            ts = ts.max(trade.time);
        }
    }
    if volume <= 0.0 {
        return None;
    }
    Some(AggregateFill {
        volume,
        price: cost / volume,
        fee,
        ts,
    })
}

fn pair_matches(pair: &str, filters: &[String]) -> bool {
    let upper = pair.to_uppercase();
    filters.iter().any(|f| upper.contains(f))
}

pub async fn reconcile_on_startup(
    slots: &mut [Slot],
    store: &mut Store,
    adapter: &dyn ExchangeAdapter,
    pair_filters: &[String],
    market_price: f64,
    history_window_sec: f64,
) -> Result<()> {
    let live_all = adapter.get_open_orders().await?;
    let live: HashMap<String, OpenOrder> = live_all
        .into_iter()
        .filter(|(_, o)| pair_matches(&o.pair, pair_filters))
        .collect();

    let since = crate::config::now_ts() - history_window_sec;
    let trades_all = adapter.get_trades_history(since).await?;
    let trades: HashMap<String, TradeRecord> = trades_all
        .into_iter()
        .filter(|(_, t)| pair_matches(&t.pair, pair_filters))
        .collect();

    for slot in slots.iter_mut() {
        reconcile_slot_orders(slot, store, adapter, &live, &trades).await?;
        reconcile_slot_recoveries(slot, store, adapter, &live, &trades).await?;
    }

    adopt_or_cancel_orphans(slots, adapter, &live, market_price).await;
    Ok(())
}

async fn reconcile_slot_orders(
    slot: &mut Slot,
    store: &mut Store,
    adapter: &dyn ExchangeAdapter,
    live: &HashMap<String, OpenOrder>,
    trades: &HashMap<String, TradeRecord>,
) -> Result<()> {
    let persisted: Vec<OrderState> = slot.state.orders.clone();
    for order in persisted {
        if !order.txid.is_empty() && live.contains_key(&order.txid) {
            continue;
        }

        let fill = (!order.txid.is_empty())
            .then(|| aggregate_for_order(trades, &order.txid))
            .flatten();
        if let Some(fill) = fill {
            json_log(
                "reconcile",
                obj(&[
                    ("slot_id", v_num(slot.slot_id as f64)),
                    ("status", v_str("offline_fill_synthesized")),
                    ("txid", v_str(&order.txid)),
                    ("volume", v_num(fill.volume)),
                    ("price", v_num(fill.price)),
                ]),
            );
            slot.apply_event(
                Event::FillEvent {
                    order_local_id: order.local_id,
                    txid: order.txid.clone(),
                    side: order.side,
                    price: fill.price,
                    volume: fill.volume,
                    fee: fill.fee,
                    timestamp: fill.ts,
                },
                store,
                adapter,
            )
            .await?;
            continue;
        }

        // Vanished without a trace: cancelled externally or never placed.
        json_log(
            "reconcile",
            obj(&[
                ("slot_id", v_num(slot.slot_id as f64)),
                ("status", v_str("order_vanished_removed")),
                ("local_id", v_num(order.local_id as f64)),
                ("txid", v_str(&order.txid)),
            ]),
        );
        slot.state.remove_order(order.local_id);
    }
    Ok(())
}

async fn reconcile_slot_recoveries(
    slot: &mut Slot,
    store: &mut Store,
    adapter: &dyn ExchangeAdapter,
    live: &HashMap<String, OpenOrder>,
    trades: &HashMap<String, TradeRecord>,
) -> Result<()> {
    let recoveries = slot.state.recovery_orders.clone();
    for rec in recoveries {
        if !rec.txid.is_empty() && live.contains_key(&rec.txid) {
            continue;
        }

        if let Some(fill) = (!rec.txid.is_empty())
            .then(|| aggregate_for_order(trades, &rec.txid))
            .flatten()
        {
            slot.apply_event(
                Event::RecoveryFillEvent {
                    recovery_id: rec.recovery_id,
                    txid: rec.txid.clone(),
                    side: rec.side,
                    price: fill.price,
                    volume: fill.volume,
                    fee: fill.fee,
                    timestamp: fill.ts,
                },
                store,
                adapter,
            )
            .await?;
        } else {
            slot.apply_event(
                Event::RecoveryCancelEvent {
                    recovery_id: rec.recovery_id,
                    txid: rec.txid.clone(),
                    timestamp: crate::config::now_ts(),
                },
                store,
                adapter,
            )
            .await?;
        }
    }
    Ok(())
}

/// Any live order on our pair whose txid no slot owns is either adopted into
/// a slot missing that S0 side, or cancelled.
async fn adopt_or_cancel_orphans(
    slots: &mut [Slot],
    adapter: &dyn ExchangeAdapter,
    live: &HashMap<String, OpenOrder>,
    market_price: f64,
) {
    let owned: std::collections::HashSet<String> = slots
        .iter()
        .flat_map(|s| {
            s.state
                .orders
                .iter()
                .map(|o| o.txid.clone())
                .chain(s.state.recovery_orders.iter().map(|r| r.txid.clone()))
        })
        .filter(|t| !t.is_empty())
        .collect();

    for (txid, order) in live {
        if owned.contains(txid) {
            continue;
        }

        if market_price > 0.0 && try_adopt(slots, order, market_price) {
            json_log(
                "reconcile",
                obj(&[
                    ("status", v_str("orphan_adopted")),
                    ("txid", v_str(txid)),
                    ("side", v_str(order.side.as_str())),
                    ("price", v_num(order.price)),
                ]),
            );
            continue;
        }

        json_log(
            "reconcile",
            obj(&[
                ("status", v_str("orphan_cancelled")),
                ("txid", v_str(txid)),
                ("price", v_num(order.price)),
            ]),
        );
        if let Err(err) = adapter.cancel_order(txid).await {
            json_log(
                "reconcile",
                obj(&[
                    ("status", v_str("orphan_cancel_failed")),
                    ("txid", v_str(txid)),
                    ("error", v_str(&err.to_string())),
                ]),
            );
        }
    }
}

fn try_adopt(slots: &mut [Slot], order: &OpenOrder, market_price: f64) -> bool {
    for slot in slots.iter_mut() {
        if derive_phase(&slot.state) != Phase::S0 {
            continue;
        }
        let has_side = slot
            .state
            .entries()
            .any(|o| o.side == order.side);
        if has_side {
            continue;
        }

        let spacing = slot.cfg.entry_pct / 100.0 * market_price;
        let expected = match order.side {
            Side::Buy => market_price - spacing,
            Side::Sell => market_price + spacing,
        };
        if (order.price - expected).abs() > ADOPTION_TOLERANCE * spacing {
            continue;
        }

        let trade_id = match order.side {
            Side::Buy => TradeId::B,
            Side::Sell => TradeId::A,
        };
        let cycle = match trade_id {
            TradeId::A => slot.state.cycle_a,
            TradeId::B => slot.state.cycle_b,
        };
        let local_id = slot.state.next_order_id;
        slot.state.next_order_id = local_id + 1;
        slot.state.orders.push(OrderState {
            local_id,
            side: order.side,
            role: Role::Entry,
            price: order.price,
            volume: order.volume,
            trade_id,
            cycle,
            txid: order.txid.clone(),
            placed_at: slot.state.now,
            entry_price: 0.0,
            entry_fee: 0.0,
            entry_filled_at: 0.0,
        });
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::EngineConfig;
    use crate::exchange::mock::MockExchange;
    use crate::exchange::OpenOrder;
    use tempfile::NamedTempFile;

    fn temp_store() -> (Store, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = Store::open(file.path().to_str().unwrap()).unwrap();
        (store, file)
    }

    async fn seeded_slot(store: &mut Store, adapter: &MockExchange) -> Slot {
        let mut slot = Slot::new(0, "XDGUSD", EngineConfig::default(), 2.0);
        slot.state.market_price = 0.1;
        slot.ensure_bootstrapped(store, adapter).await.unwrap();
        slot
    }

    fn filters() -> Vec<String> {
        vec!["XDG".to_string(), "DOGE".to_string()]
    }

    #[tokio::test]
    async fn test_live_orders_are_kept() {
        let (mut store, _f) = temp_store();
        let adapter = MockExchange::new(0.1);
        let slot = seeded_slot(&mut store, &adapter).await;
        let mut slots = vec![slot];

        reconcile_on_startup(&mut slots, &mut store, &adapter, &filters(), 0.1, 21600.0)
            .await
            .unwrap();

        assert_eq!(slots[0].state.orders.len(), 2);
        assert!(adapter.canceled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vanished_order_with_trades_becomes_one_fill() {
        let (mut store, _f) = temp_store();
        let adapter = MockExchange::new(0.1);
        let slot = seeded_slot(&mut store, &adapter).await;
        let mut slots = vec![slot];

        // The buy entry filled in two partial executions while we were down.
        let buy = slots[0]
            .state
            .orders
            .iter()
            .find(|o| o.side == Side::Buy)
            .unwrap()
            .clone();
        adapter.open_orders.lock().unwrap().remove(&buy.txid);
        let now = crate::config::now_ts();
        for (i, (vol, cost, fee)) in [(12.0, 1.1976, 0.003), (8.0, 0.7984, 0.002)]
            .iter()
            .enumerate()
        {
            adapter.trades.lock().unwrap().insert(
                format!("T-{}", i),
                crate::exchange::TradeRecord {
                    ordertxid: buy.txid.clone(),
                    pair: "XDGUSD".to_string(),
                    side: Side::Buy,
                    price: 0.0998,
                    volume: *vol,
                    cost: *cost,
                    fee: *fee,
                    time: now - 100.0 + i as f64,
                },
            );
        }

        reconcile_on_startup(&mut slots, &mut store, &adapter, &filters(), 0.1, 21600.0)
            .await
            .unwrap();

        // Entry consumed, exit placed: one aggregate fill of 20 units.
        let slot = &slots[0];
        assert!((slot.state.total_fees - 0.005).abs() < 1e-12);
        let exit = slot.state.exits().next().expect("exit placed");
        assert_eq!(exit.volume, 20.0);
        assert!((exit.entry_price - 0.0998).abs() < 1e-9);
        assert!(slot.fill_txid_seen(&buy.txid));

        // Running reconcile again must not double-book: the seen-txid guard
        // drops the synthesized duplicate.
        let fees_before = slot.state.total_fees;
        reconcile_on_startup(&mut slots, &mut store, &adapter, &filters(), 0.1, 21600.0)
            .await
            .unwrap();
        assert_eq!(slots[0].state.total_fees, fees_before);
    }

    #[tokio::test]
    async fn test_vanished_order_without_trace_removed() {
        let (mut store, _f) = temp_store();
        let adapter = MockExchange::new(0.1);
        let slot = seeded_slot(&mut store, &adapter).await;
        let mut slots = vec![slot];

        let sell_txid = slots[0]
            .state
            .orders
            .iter()
            .find(|o| o.side == Side::Sell)
            .unwrap()
            .txid
            .clone();
        adapter.open_orders.lock().unwrap().remove(&sell_txid);

        reconcile_on_startup(&mut slots, &mut store, &adapter, &filters(), 0.1, 21600.0)
            .await
            .unwrap();

        assert_eq!(slots[0].state.orders.len(), 1);
        assert!(slots[0]
            .state
            .orders
            .iter()
            .all(|o| o.side == Side::Buy));
    }

    #[tokio::test]
    async fn test_orphan_adopted_within_tolerance() {
        let (mut store, _f) = temp_store();
        let adapter = MockExchange::new(0.1);
        let mut slot = Slot::new(0, "XDGUSD", EngineConfig::default(), 2.0);
        slot.state.market_price = 0.1;
        let mut slots = vec![slot];

        // A live buy at the expected B entry price, owned by nobody.
        adapter.open_orders.lock().unwrap().insert(
            "STRAY-1".to_string(),
            OpenOrder {
                txid: "STRAY-1".to_string(),
                pair: "XDGUSD".to_string(),
                side: Side::Buy,
                price: 0.0998,
                volume: 20.0,
            },
        );

        reconcile_on_startup(&mut slots, &mut store, &adapter, &filters(), 0.1, 21600.0)
            .await
            .unwrap();

        let slot = &slots[0];
        assert_eq!(slot.state.orders.len(), 1);
        let adopted = &slot.state.orders[0];
        assert_eq!(adopted.txid, "STRAY-1");
        assert_eq!(adopted.trade_id, TradeId::B);
        assert_eq!(adopted.role, Role::Entry);
        assert!(adapter.canceled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_outside_tolerance_cancelled() {
        let (mut store, _f) = temp_store();
        let adapter = MockExchange::new(0.1);
        let mut slot = Slot::new(0, "XDGUSD", EngineConfig::default(), 2.0);
        slot.state.market_price = 0.1;
        let mut slots = vec![slot];

        // Way off the expected spacing: cancel it.
        adapter.open_orders.lock().unwrap().insert(
            "STRAY-2".to_string(),
            OpenOrder {
                txid: "STRAY-2".to_string(),
                pair: "XDGUSD".to_string(),
                side: Side::Buy,
                price: 0.08,
                volume: 20.0,
            },
        );

        reconcile_on_startup(&mut slots, &mut store, &adapter, &filters(), 0.1, 21600.0)
            .await
            .unwrap();

        assert!(slots[0].state.orders.is_empty());
        assert_eq!(
            adapter.canceled.lock().unwrap().as_slice(),
            ["STRAY-2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_other_pair_orders_ignored() {
        let (mut store, _f) = temp_store();
        let adapter = MockExchange::new(0.1);
        let mut slots = vec![Slot::new(0, "XDGUSD", EngineConfig::default(), 2.0)];
        slots[0].state.market_price = 0.1;

        adapter.open_orders.lock().unwrap().insert(
            "OTHER-1".to_string(),
            OpenOrder {
                txid: "OTHER-1".to_string(),
                pair: "XXBTZUSD".to_string(),
                side: Side::Buy,
                price: 50000.0,
                volume: 0.001,
            },
        );

        reconcile_on_startup(&mut slots, &mut store, &adapter, &filters(), 0.1, 21600.0)
            .await
            .unwrap();

        assert!(slots[0].state.orders.is_empty());
        assert!(adapter.canceled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vanished_recovery_resolves_to_fill_or_cancel() {
        let (mut store, _f) = temp_store();
        let adapter = MockExchange::new(0.11);
        let mut slot = Slot::new(0, "XDGUSD", EngineConfig::default(), 2.0);
        slot.state.market_price = 0.11;
        for (id, txid) in [(1, "REC-FILLED"), (2, "REC-GONE")] {
            slot.state.recovery_orders.push(crate::engine::state::RecoveryOrder {
                recovery_id: id,
                side: Side::Sell,
                price: 0.13,
                volume: 13.0,
                trade_id: TradeId::B,
                cycle: 1,
                entry_price: 0.108,
                orphaned_at: 2000.0,
                txid: txid.to_string(),
                reason: "s2_timeout".to_string(),
            });
        }
        slot.state.next_recovery_id = 3;
        let now = crate::config::now_ts();
        adapter.trades.lock().unwrap().insert(
            "T-REC".to_string(),
            crate::exchange::TradeRecord {
                ordertxid: "REC-FILLED".to_string(),
                pair: "XDGUSD".to_string(),
                side: Side::Sell,
                price: 0.13,
                volume: 13.0,
                cost: 1.69,
                fee: 0.005,
                time: now - 50.0,
            },
        );
        let mut slots = vec![slot];

        reconcile_on_startup(&mut slots, &mut store, &adapter, &filters(), 0.11, 21600.0)
            .await
            .unwrap();

        let slot = &slots[0];
        assert!(slot.state.recovery_orders.is_empty());
        // One recovery booked a cycle, the other was just dropped.
        assert_eq!(slot.state.completed_cycles.len(), 1);
        assert!(slot.state.completed_cycles[0].from_recovery);
        assert!((slot.state.completed_cycles[0].net_profit - 0.281).abs() < 1e-9);
    }
}
