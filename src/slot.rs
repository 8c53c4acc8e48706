//! Slot runtime: one state machine driven against the exchange.
//!
//! A slot owns its `PairState` exclusively. `apply_event` is the only write
//! path: reduce, append the event-log row, commit, then execute the actions
//! in order. The append happens before any exchange side effect, so a crash
//! mid-action re-emits the same logical event on restart and the reducer's
//! unknown-id no-op keeps the books straight.

use std::collections::{HashSet, VecDeque};

use anyhow::{anyhow, Result};
use serde_json::json;

use crate::engine::events::{Action, Event};
use crate::engine::invariants::check_invariants;
use crate::engine::reducer::{bootstrap_orders, compute_order_volume, transition};
use crate::engine::state::{derive_phase, EngineConfig, PairState, Phase, Role, Side, TradeId};
use crate::exchange::ExchangeAdapter;
use crate::logging::{json_log, obj, v_num, v_str};
use crate::shadow::ShadowRunner;
use crate::storage::{EventRow, FillRow, SnapshotRow, Store};

const SEEN_TXID_CAP: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotMode {
    Running,
    Paused,
    Halted,
}

impl SlotMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotMode::Running => "RUNNING",
            SlotMode::Paused => "PAUSED",
            SlotMode::Halted => "HALTED",
        }
    }
}

/// Bounded set of applied fill txids; oldest entries age out.
#[derive(Debug, Default)]
struct SeenTxids {
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenTxids {
    fn contains(&self, txid: &str) -> bool {
        self.set.contains(txid)
    }

    fn insert(&mut self, txid: &str) {
        if self.set.insert(txid.to_string()) {
            self.order.push_back(txid.to_string());
            while self.order.len() > SEEN_TXID_CAP {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
    }
}

pub struct Slot {
    pub slot_id: i64,
    pub pair: String,
    pub cfg: EngineConfig,
    pub order_size_usd: f64,
    pub state: PairState,
    pub mode: SlotMode,
    pub last_error: Option<String>,
    pub shadow: Option<ShadowRunner>,
    pub last_event_id: i64,
    seen_fill_txids: SeenTxids,
    paused_by_loss_limit: bool,
    loss_day: i64,
}

impl Slot {
    pub fn new(slot_id: i64, pair: &str, cfg: EngineConfig, order_size_usd: f64) -> Self {
        Self {
            slot_id,
            pair: pair.to_string(),
            cfg,
            order_size_usd,
            state: PairState::new(0.0, 0.0),
            mode: SlotMode::Running,
            last_error: None,
            shadow: None,
            last_event_id: 0,
            seen_fill_txids: SeenTxids::default(),
            paused_by_loss_limit: false,
            loss_day: 0,
        }
    }

    pub fn fill_txid_seen(&self, txid: &str) -> bool {
        self.seen_fill_txids.contains(txid)
    }

    /// Run one event through the reducer, persist it, then execute the
    /// resulting actions against the exchange in order.
    pub async fn apply_event(
        &mut self,
        event: Event,
        store: &mut Store,
        adapter: &dyn ExchangeAdapter,
    ) -> Result<Vec<Action>> {
        if self.mode == SlotMode::Halted {
            return Ok(Vec::new());
        }

        if let Event::FillEvent { txid, .. } = &event {
            if !txid.is_empty() && self.seen_fill_txids.contains(txid) {
                json_log(
                    "slot",
                    obj(&[
                        ("slot_id", v_num(self.slot_id as f64)),
                        ("status", v_str("duplicate_fill_dropped")),
                        ("txid", v_str(txid)),
                    ]),
                );
                return Ok(Vec::new());
            }
        }

        let from_phase = derive_phase(&self.state);
        let shadow_pre = self
            .shadow
            .is_some()
            .then(|| self.state.clone());
        let mut next = self.state.clone();
        let actions = transition(&mut next, &event, &self.cfg, self.order_size_usd);
        let to_phase = derive_phase(&next);

        // Durable record first. If this fails the event is aborted: executing
        // actions without a log row risks double-booking on restart.
        let payload = serde_json::to_string(&event)?;
        let event_id = store
            .append_event(
                self.slot_id,
                from_phase.as_str(),
                to_phase.as_str(),
                event.kind(),
                &payload,
                event.timestamp(),
            )
            .map_err(|e| anyhow!("event log append failed, aborting event: {}", e))?;
        self.last_event_id = event_id;
        self.state = next;

        if let (Some(shadow), Some(pre)) = (self.shadow.as_mut(), shadow_pre) {
            shadow.observe(
                &pre,
                &event,
                &self.cfg,
                self.order_size_usd,
                &self.state,
                &actions,
            );
        }

        if let Event::FillEvent { txid, .. } = &event {
            if !txid.is_empty() {
                self.seen_fill_txids.insert(txid);
            }
        }

        for action in &actions {
            self.execute_action(action, store, adapter).await;
        }

        self.normalize_mode_flags();
        self.check_health();
        Ok(actions)
    }

    async fn execute_action(
        &mut self,
        action: &Action,
        store: &mut Store,
        adapter: &dyn ExchangeAdapter,
    ) {
        match action {
            Action::PlaceOrder {
                local_id,
                side,
                role,
                price,
                volume,
                post_only,
                reason,
                ..
            } => {
                if self.mode == SlotMode::Paused && *role == Role::Entry {
                    // No new exposure while paused; the order is dropped from
                    // state so invariant checks see the real book.
                    self.state.remove_order(*local_id);
                    return;
                }
                match adapter
                    .place_limit_order(&self.pair, *side, *volume, *price, *post_only)
                    .await
                {
                    Ok(txid) => {
                        self.state.bind_order_txid(*local_id, &txid);
                        json_log(
                            "slot",
                            obj(&[
                                ("slot_id", v_num(self.slot_id as f64)),
                                ("status", v_str("order_placed")),
                                ("local_id", v_num(*local_id as f64)),
                                ("txid", v_str(&txid)),
                                ("side", v_str(side.as_str())),
                                ("price", v_num(*price)),
                                ("volume", v_num(*volume)),
                                ("reason", v_str(reason)),
                            ]),
                        );
                    }
                    Err(err) => {
                        // Demote: drop the order, do not retry. Follow-up
                        // entries repopulate the slot on the next tick.
                        self.state.remove_order(*local_id);
                        self.last_error = Some(err.to_string());
                        json_log(
                            "slot",
                            obj(&[
                                ("slot_id", v_num(self.slot_id as f64)),
                                ("status", v_str("order_place_failed")),
                                ("local_id", v_num(*local_id as f64)),
                                ("error", v_str(&err.to_string())),
                            ]),
                        );
                    }
                }
            }

            Action::CancelOrder { txid, reason, .. } => {
                if txid.is_empty() {
                    return;
                }
                // Best-effort: a failed cancel is picked up by the next
                // reconcile.
                if let Err(err) = adapter.cancel_order(txid).await {
                    json_log(
                        "slot",
                        obj(&[
                            ("slot_id", v_num(self.slot_id as f64)),
                            ("status", v_str("cancel_failed")),
                            ("txid", v_str(txid)),
                            ("reason", v_str(reason)),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                }
            }

            Action::OrphanOrder {
                recovery_id,
                reason,
                ..
            } => {
                // The state already carries the recovery row. Pull the order
                // from the exchange; if the cancel loses a race with a fill,
                // the scheduler sees the closed order and books a recovery
                // cycle instead.
                let txid = self
                    .state
                    .recovery_orders
                    .iter()
                    .find(|r| r.recovery_id == *recovery_id)
                    .map(|r| r.txid.clone())
                    .unwrap_or_default();
                if txid.is_empty() {
                    return;
                }
                if let Err(err) = adapter.cancel_order(&txid).await {
                    json_log(
                        "slot",
                        obj(&[
                            ("slot_id", v_num(self.slot_id as f64)),
                            ("status", v_str("orphan_cancel_failed")),
                            ("txid", v_str(&txid)),
                            ("reason", v_str(reason)),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                }
            }

            Action::BookCycle {
                trade_id,
                cycle,
                net_profit,
                fees,
                ..
            } => {
                // Dashboard row; no exchange call.
                let side = match trade_id {
                    TradeId::A => Side::Buy,
                    TradeId::B => Side::Sell,
                };
                let record = self
                    .state
                    .completed_cycles
                    .iter()
                    .rev()
                    .find(|c| c.trade_id == *trade_id && c.cycle == *cycle);
                let (price, volume) = record.map(|c| (c.exit_price, c.volume)).unwrap_or((0.0, 0.0));
                if let Err(err) = store.append_fill(&FillRow {
                    ts: self.state.now,
                    slot_id: self.slot_id,
                    trade_id: trade_id.as_str().to_string(),
                    cycle: *cycle,
                    side: side.as_str().to_string(),
                    price,
                    volume,
                    profit: *net_profit,
                    fees: *fees,
                }) {
                    json_log(
                        "slot",
                        obj(&[
                            ("slot_id", v_num(self.slot_id as f64)),
                            ("status", v_str("fill_row_write_failed")),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                }
            }
        }
    }

    /// Re-derive the long/short-only flags from order composition. Only an
    /// S0 book is conclusive; mid-cycle phases keep their flags.
    fn normalize_mode_flags(&mut self) {
        if derive_phase(&self.state) != Phase::S0 {
            return;
        }
        let buys = self
            .state
            .entries()
            .filter(|o| o.side == Side::Buy)
            .count();
        let sells = self
            .state
            .entries()
            .filter(|o| o.side == Side::Sell)
            .count();
        if buys > 0 && sells == 0 {
            self.state.long_only = true;
            self.state.short_only = false;
        } else if sells > 0 && buys == 0 {
            self.state.short_only = true;
            self.state.long_only = false;
        } else {
            // Both sides present, or an empty book: no single-sided evidence.
            self.state.long_only = false;
            self.state.short_only = false;
        }
    }

    /// Invariant gate. Two transient S0 shapes are tolerated: min-size-wait
    /// (sizing refused at the current price) and bootstrap-pending (one
    /// entry placed, the other in flight). Anything else halts the slot.
    fn check_health(&mut self) {
        let violations = check_invariants(&self.state);
        if violations.is_empty() {
            return;
        }
        if self.violations_are_transient() {
            json_log(
                "slot",
                obj(&[
                    ("slot_id", v_num(self.slot_id as f64)),
                    ("status", v_str("transient_s0")),
                    ("violations", v_str(&violations.join("; "))),
                ]),
            );
            return;
        }
        self.mode = SlotMode::Halted;
        self.last_error = Some(violations.join("; "));
        json_log(
            "slot",
            obj(&[
                ("slot_id", v_num(self.slot_id as f64)),
                ("status", v_str("halted")),
                ("violations", v_str(&violations.join("; "))),
            ]),
        );
    }

    fn violations_are_transient(&self) -> bool {
        if derive_phase(&self.state) != Phase::S0 {
            return false;
        }
        if self.state.orders.iter().any(|o| o.role == Role::Exit) {
            return false;
        }
        let entries = self.state.entries().count();
        if entries >= 2 {
            return false;
        }
        // min-size-wait: the configured notional cannot be sized at the
        // current price, so a missing entry is expected.
        if compute_order_volume(self.state.market_price, &self.cfg, self.order_size_usd).is_none() {
            return true;
        }
        // bootstrap-pending: one entry on the book with the other in flight,
        // or an empty book awaiting (re-)bootstrap after a placement error.
        entries <= 1
    }

    /// Seed an empty slot with the initial S0 pair.
    pub async fn ensure_bootstrapped(
        &mut self,
        store: &mut Store,
        adapter: &dyn ExchangeAdapter,
    ) -> Result<()> {
        if self.mode != SlotMode::Running
            || !self.state.orders.is_empty()
            || !self.state.recovery_orders.is_empty()
            || self.state.market_price <= 0.0
        {
            return Ok(());
        }
        let (actions, orders) = bootstrap_orders(
            &mut self.state,
            &self.cfg,
            self.order_size_usd,
            true,
            true,
        );
        self.state.orders = orders;
        for action in &actions {
            self.execute_action(action, store, adapter).await;
        }
        self.normalize_mode_flags();
        self.check_health();
        Ok(())
    }

    /// Restore from a snapshot plus the events logged after it. Replay goes
    /// through the reducer with no side effects; fill txids are re-learned
    /// so replayed fills stay idempotent against reconciliation.
    pub fn restore(&mut self, snapshot: Option<SnapshotRow>, events: &[EventRow]) -> Result<()> {
        if let Some(snap) = snapshot {
            self.state = serde_json::from_str(&snap.state_json)?;
            self.last_event_id = snap.event_id;
        }
        for row in events {
            let event: Event = serde_json::from_str(&row.payload)?;
            if let Event::FillEvent { txid, .. } = &event {
                if !txid.is_empty() {
                    self.seen_fill_txids.insert(txid);
                }
            }
            transition(&mut self.state, &event, &self.cfg, self.order_size_usd);
            self.last_event_id = row.event_id;
        }
        Ok(())
    }

    pub fn snapshot(&self, store: &mut Store) -> Result<()> {
        let state_json = serde_json::to_string(&self.state)?;
        store.put_snapshot(self.slot_id, self.last_event_id, &state_json, self.state.now)
    }

    /// UTC day rollover: clear the daily loss tally and lift a loss-limit
    /// pause.
    pub fn maybe_roll_day(&mut self, now_ts: f64) {
        let day = (now_ts / 86_400.0) as i64;
        if day != self.loss_day {
            self.loss_day = day;
            self.state.today_realized_loss = 0.0;
            if self.paused_by_loss_limit {
                self.paused_by_loss_limit = false;
                if self.mode == SlotMode::Paused {
                    self.mode = SlotMode::Running;
                }
                json_log(
                    "slot",
                    obj(&[
                        ("slot_id", v_num(self.slot_id as f64)),
                        ("status", v_str("daily_reset_resumed")),
                    ]),
                );
            }
        }
    }

    /// Pause (not halt) the slot when today's realized loss crosses the
    /// limit; trading resumes after the daily reset.
    pub fn check_daily_loss_limit(&mut self, limit_usd: f64) {
        if limit_usd > 0.0
            && self.mode == SlotMode::Running
            && self.state.today_realized_loss >= limit_usd
        {
            self.mode = SlotMode::Paused;
            self.paused_by_loss_limit = true;
            json_log(
                "slot",
                obj(&[
                    ("slot_id", v_num(self.slot_id as f64)),
                    ("status", v_str("paused_daily_loss_limit")),
                    ("loss", v_num(self.state.today_realized_loss)),
                    ("limit", v_num(limit_usd)),
                ]),
            );
        }
    }

    pub fn status_payload(&self) -> serde_json::Value {
        json!({
            "slot_id": self.slot_id,
            "mode": self.mode.as_str(),
            "phase": derive_phase(&self.state).as_str(),
            "market_price": self.state.market_price,
            "open_orders": self.state.orders.len(),
            "recovery_orders": self.state.recovery_orders.len(),
            "completed_cycles": self.state.completed_cycles.len(),
            "total_profit": self.state.total_profit,
            "total_fees": self.state.total_fees,
            "total_round_trips": self.state.total_round_trips,
            "today_realized_loss": self.state.today_realized_loss,
            "long_only": self.state.long_only,
            "short_only": self.state.short_only,
            "last_error": self.last_error.clone(),
            "shadow": self.shadow.as_ref().map(|s| s.metrics.to_json()),
        })
    }
}
