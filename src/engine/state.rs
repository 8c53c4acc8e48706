//! Pair slot state: orders, recovery side-channel, cycle ledger, counters.
//!
//! `PairState` is the single unit of ownership for one slot. It is serialized
//! verbatim into snapshots and parity fixtures, so field names are stable.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Entry,
    Exit,
}

/// The two positions inside a slot: A is the short side (sell entry, buy
/// exit), B is the long side (buy entry, sell exit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeId {
    A,
    B,
}

impl TradeId {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeId::A => "A",
            TradeId::B => "B",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    S0,
    S1a,
    S1b,
    S2,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::S0 => "S0",
            Phase::S1a => "S1a",
            Phase::S1b => "S1b",
            Phase::S2 => "S2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshDirection {
    Up,
    Down,
}

/// Immutable per-slot engine parameters. Defaults mirror the production
/// DOGE/USD profile and double as fixture defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub entry_pct: f64,
    pub profit_pct: f64,
    pub refresh_pct: f64,
    pub order_size_usd: f64,
    pub price_decimals: i32,
    pub volume_decimals: i32,
    pub min_volume: f64,
    pub min_cost_usd: f64,
    pub maker_fee_pct: f64,
    pub stale_price_max_age_sec: f64,
    pub s1_orphan_after_sec: f64,
    pub s2_orphan_after_sec: f64,
    pub loss_backoff_start: u32,
    pub loss_cooldown_start: u32,
    pub loss_cooldown_sec: f64,
    pub backoff_factor: f64,
    pub backoff_max_multiplier: f64,
    pub max_consecutive_refreshes: u32,
    pub refresh_cooldown_sec: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            entry_pct: 0.2,
            profit_pct: 1.0,
            refresh_pct: 1.0,
            order_size_usd: 2.0,
            price_decimals: 6,
            volume_decimals: 0,
            min_volume: 13.0,
            min_cost_usd: 0.0,
            maker_fee_pct: 0.25,
            stale_price_max_age_sec: 60.0,
            s1_orphan_after_sec: 600.0,
            s2_orphan_after_sec: 1800.0,
            loss_backoff_start: 3,
            loss_cooldown_start: 5,
            loss_cooldown_sec: 900.0,
            backoff_factor: 0.5,
            backoff_max_multiplier: 5.0,
            max_consecutive_refreshes: 3,
            refresh_cooldown_sec: 300.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderState {
    pub local_id: i64,
    pub side: Side,
    pub role: Role,
    pub price: f64,
    pub volume: f64,
    pub trade_id: TradeId,
    pub cycle: u32,
    pub txid: String,
    pub placed_at: f64,
    // Exit-only carry-through from the entry fill.
    pub entry_price: f64,
    pub entry_fee: f64,
    pub entry_filled_at: f64,
}

impl Default for OrderState {
    fn default() -> Self {
        Self {
            local_id: 0,
            side: Side::Buy,
            role: Role::Entry,
            price: 0.0,
            volume: 0.0,
            trade_id: TradeId::B,
            cycle: 1,
            txid: String::new(),
            placed_at: 0.0,
            entry_price: 0.0,
            entry_fee: 0.0,
            entry_filled_at: 0.0,
        }
    }
}

/// An exit that aged out of its phase window, parked until it fills or is
/// cancelled externally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryOrder {
    pub recovery_id: i64,
    pub side: Side,
    pub price: f64,
    pub volume: f64,
    pub trade_id: TradeId,
    pub cycle: u32,
    pub entry_price: f64,
    pub orphaned_at: f64,
    pub txid: String,
    pub reason: String,
}

impl Default for RecoveryOrder {
    fn default() -> Self {
        Self {
            recovery_id: 0,
            side: Side::Sell,
            price: 0.0,
            volume: 0.0,
            trade_id: TradeId::B,
            cycle: 1,
            entry_price: 0.0,
            orphaned_at: 0.0,
            txid: String::new(),
            reason: "stale".to_string(),
        }
    }
}

/// One closed round trip. Append-only; never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleRecord {
    pub trade_id: TradeId,
    pub cycle: u32,
    pub entry_price: f64,
    pub exit_price: f64,
    pub volume: f64,
    pub gross_profit: f64,
    pub fees: f64,
    pub net_profit: f64,
    pub entry_time: f64,
    pub exit_time: f64,
    pub from_recovery: bool,
}

impl Default for CycleRecord {
    fn default() -> Self {
        Self {
            trade_id: TradeId::B,
            cycle: 1,
            entry_price: 0.0,
            exit_price: 0.0,
            volume: 0.0,
            gross_profit: 0.0,
            fees: 0.0,
            net_profit: 0.0,
            entry_time: 0.0,
            exit_time: 0.0,
            from_recovery: false,
        }
    }
}

fn one_u32() -> u32 {
    1
}

fn one_i64() -> i64 {
    1
}

fn default_profit_pct_runtime() -> f64 {
    1.0
}

/// Full reducer state for one slot. Owns its orders, recovery list, cycles
/// and counters by value; nothing here is shared across slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairState {
    pub market_price: f64,
    pub now: f64,
    #[serde(default)]
    pub orders: Vec<OrderState>,
    #[serde(default)]
    pub recovery_orders: Vec<RecoveryOrder>,
    #[serde(default)]
    pub completed_cycles: Vec<CycleRecord>,
    #[serde(default = "one_u32")]
    pub cycle_a: u32,
    #[serde(default = "one_u32")]
    pub cycle_b: u32,
    #[serde(default = "one_i64")]
    pub next_order_id: i64,
    #[serde(default = "one_i64")]
    pub next_recovery_id: i64,
    #[serde(default)]
    pub total_profit: f64,
    #[serde(default)]
    pub total_fees: f64,
    #[serde(default)]
    pub today_realized_loss: f64,
    #[serde(default)]
    pub total_round_trips: u64,
    #[serde(default)]
    pub s2_entered_at: Option<f64>,
    #[serde(default)]
    pub last_price_update_at: Option<f64>,
    #[serde(default)]
    pub consecutive_losses_a: u32,
    #[serde(default)]
    pub consecutive_losses_b: u32,
    #[serde(default)]
    pub cooldown_until_a: f64,
    #[serde(default)]
    pub cooldown_until_b: f64,
    #[serde(default)]
    pub long_only: bool,
    #[serde(default)]
    pub short_only: bool,
    // Anti-chase entry refresh tracking.
    #[serde(default)]
    pub consecutive_refreshes_a: u32,
    #[serde(default)]
    pub consecutive_refreshes_b: u32,
    #[serde(default)]
    pub last_refresh_direction_a: Option<RefreshDirection>,
    #[serde(default)]
    pub last_refresh_direction_b: Option<RefreshDirection>,
    #[serde(default)]
    pub refresh_cooldown_until_a: f64,
    #[serde(default)]
    pub refresh_cooldown_until_b: f64,
    /// Runtime-adjusted profit target used when pricing new exits; 0 falls
    /// back to the config value. Older snapshots stored this as
    /// `profit_pct`.
    #[serde(default = "default_profit_pct_runtime", alias = "profit_pct")]
    pub profit_pct_runtime: f64,
}

impl PairState {
    pub fn new(market_price: f64, now: f64) -> Self {
        Self {
            market_price,
            now,
            orders: Vec::new(),
            recovery_orders: Vec::new(),
            completed_cycles: Vec::new(),
            cycle_a: 1,
            cycle_b: 1,
            next_order_id: 1,
            next_recovery_id: 1,
            total_profit: 0.0,
            total_fees: 0.0,
            today_realized_loss: 0.0,
            total_round_trips: 0,
            s2_entered_at: None,
            last_price_update_at: None,
            consecutive_losses_a: 0,
            consecutive_losses_b: 0,
            cooldown_until_a: 0.0,
            cooldown_until_b: 0.0,
            long_only: false,
            short_only: false,
            consecutive_refreshes_a: 0,
            consecutive_refreshes_b: 0,
            last_refresh_direction_a: None,
            last_refresh_direction_b: None,
            refresh_cooldown_until_a: 0.0,
            refresh_cooldown_until_b: 0.0,
            profit_pct_runtime: 1.0,
        }
    }

    pub fn find_order(&self, local_id: i64) -> Option<&OrderState> {
        self.orders.iter().find(|o| o.local_id == local_id)
    }

    pub fn find_recovery(&self, recovery_id: i64) -> Option<&RecoveryOrder> {
        self.recovery_orders
            .iter()
            .find(|r| r.recovery_id == recovery_id)
    }

    pub fn remove_order(&mut self, local_id: i64) {
        self.orders.retain(|o| o.local_id != local_id);
    }

    pub fn remove_recovery(&mut self, recovery_id: i64) {
        self.recovery_orders.retain(|r| r.recovery_id != recovery_id);
    }

    /// Runtime patch: record the exchange txid after a confirmed placement.
    pub fn bind_order_txid(&mut self, local_id: i64, txid: &str) {
        if let Some(o) = self.orders.iter_mut().find(|o| o.local_id == local_id) {
            o.txid = txid.to_string();
        }
    }

    pub fn bind_recovery_txid(&mut self, recovery_id: i64, txid: &str) {
        if let Some(r) = self
            .recovery_orders
            .iter_mut()
            .find(|r| r.recovery_id == recovery_id)
        {
            r.txid = txid.to_string();
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &OrderState> {
        self.orders.iter().filter(|o| o.role == Role::Entry)
    }

    pub fn exits(&self) -> impl Iterator<Item = &OrderState> {
        self.orders.iter().filter(|o| o.role == Role::Exit)
    }
}

/// Phase is derived purely from order composition; it is never stored.
pub fn derive_phase(state: &PairState) -> Phase {
    let has_buy_exit = state
        .orders
        .iter()
        .any(|o| o.side == Side::Buy && o.role == Role::Exit);
    let has_sell_exit = state
        .orders
        .iter()
        .any(|o| o.side == Side::Sell && o.role == Role::Exit);

    if has_buy_exit && has_sell_exit {
        Phase::S2
    } else if has_buy_exit {
        Phase::S1a
    } else if has_sell_exit {
        Phase::S1b
    } else {
        Phase::S0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(local_id: i64, side: Side, trade_id: TradeId) -> OrderState {
        OrderState {
            local_id,
            side,
            role: Role::Entry,
            price: 0.1,
            volume: 20.0,
            trade_id,
            ..OrderState::default()
        }
    }

    fn exit(local_id: i64, side: Side, trade_id: TradeId) -> OrderState {
        OrderState {
            local_id,
            side,
            role: Role::Exit,
            price: 0.1,
            volume: 20.0,
            trade_id,
            entry_price: 0.099,
            ..OrderState::default()
        }
    }

    #[test]
    fn test_phase_derivation() {
        let mut st = PairState::new(0.1, 0.0);
        assert_eq!(derive_phase(&st), Phase::S0);

        st.orders.push(entry(1, Side::Buy, TradeId::B));
        st.orders.push(entry(2, Side::Sell, TradeId::A));
        assert_eq!(derive_phase(&st), Phase::S0);

        st.orders.push(exit(3, Side::Sell, TradeId::B));
        assert_eq!(derive_phase(&st), Phase::S1b);

        st.orders.push(exit(4, Side::Buy, TradeId::A));
        assert_eq!(derive_phase(&st), Phase::S2);

        st.orders.retain(|o| o.local_id != 3);
        assert_eq!(derive_phase(&st), Phase::S1a);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut st = PairState::new(0.1, 1000.0);
        st.orders.push(exit(7, Side::Sell, TradeId::B));
        st.recovery_orders.push(RecoveryOrder {
            recovery_id: 2,
            side: Side::Sell,
            price: 0.13,
            volume: 13.0,
            trade_id: TradeId::B,
            cycle: 3,
            entry_price: 0.108,
            orphaned_at: 900.0,
            txid: "TX-1".to_string(),
            reason: "s2_timeout".to_string(),
        });
        st.completed_cycles.push(CycleRecord {
            trade_id: TradeId::A,
            cycle: 1,
            entry_price: 0.1002,
            exit_price: 0.0992,
            volume: 20.0,
            gross_profit: 0.02,
            fees: 0.01,
            net_profit: 0.01,
            entry_time: 100.0,
            exit_time: 200.0,
            from_recovery: false,
        });
        st.last_refresh_direction_b = Some(RefreshDirection::Down);

        let json = serde_json::to_string(&st).unwrap();
        let back: PairState = serde_json::from_str(&json).unwrap();
        assert_eq!(st, back);
    }

    #[test]
    fn test_from_partial_dict_defaults() {
        // Fixtures supply only the fields they care about.
        let raw = r#"{"market_price": 0.1, "now": 0.0}"#;
        let st: PairState = serde_json::from_str(raw).unwrap();
        assert_eq!(st.cycle_a, 1);
        assert_eq!(st.cycle_b, 1);
        assert_eq!(st.next_order_id, 1);
        assert_eq!(st.next_recovery_id, 1);
        assert_eq!(st.profit_pct_runtime, 1.0);
        assert!(st.orders.is_empty());
        assert!(st.s2_entered_at.is_none());
    }

    #[test]
    fn test_refresh_direction_serializes_lowercase() {
        let json = serde_json::to_string(&RefreshDirection::Down).unwrap();
        assert_eq!(json, "\"down\"");
    }

    #[test]
    fn test_bind_txid() {
        let mut st = PairState::new(0.1, 0.0);
        st.orders.push(entry(1, Side::Buy, TradeId::B));
        st.bind_order_txid(1, "OABC-123");
        assert_eq!(st.orders[0].txid, "OABC-123");
        // Unknown ids are ignored.
        st.bind_order_txid(99, "nope");
        assert_eq!(st.orders.len(), 1);
    }
}
