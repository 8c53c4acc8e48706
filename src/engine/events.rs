//! Closed event and action unions for the pair reducer.
//!
//! Events are what the runtime feeds in (ticks, fills, recovery outcomes);
//! actions are what the reducer asks the runtime to do. Both serialize with
//! an external tag so event-log rows and fixtures stay self-describing.

use serde::{Deserialize, Serialize};

use super::state::{Role, Side, TradeId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Event {
    PriceTick {
        price: f64,
        timestamp: f64,
    },
    TimerTick {
        timestamp: f64,
    },
    FillEvent {
        order_local_id: i64,
        txid: String,
        side: Side,
        price: f64,
        volume: f64,
        fee: f64,
        timestamp: f64,
    },
    RecoveryFillEvent {
        recovery_id: i64,
        txid: String,
        side: Side,
        price: f64,
        volume: f64,
        fee: f64,
        timestamp: f64,
    },
    RecoveryCancelEvent {
        recovery_id: i64,
        txid: String,
        timestamp: f64,
    },
}

impl Event {
    pub fn timestamp(&self) -> f64 {
        match self {
            Event::PriceTick { timestamp, .. }
            | Event::TimerTick { timestamp }
            | Event::FillEvent { timestamp, .. }
            | Event::RecoveryFillEvent { timestamp, .. }
            | Event::RecoveryCancelEvent { timestamp, .. } => *timestamp,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::PriceTick { .. } => "PriceTick",
            Event::TimerTick { .. } => "TimerTick",
            Event::FillEvent { .. } => "FillEvent",
            Event::RecoveryFillEvent { .. } => "RecoveryFillEvent",
            Event::RecoveryCancelEvent { .. } => "RecoveryCancelEvent",
        }
    }
}

fn default_post_only() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Action {
    PlaceOrder {
        local_id: i64,
        side: Side,
        role: Role,
        price: f64,
        volume: f64,
        trade_id: TradeId,
        cycle: u32,
        #[serde(default = "default_post_only")]
        post_only: bool,
        #[serde(default)]
        reason: String,
    },
    CancelOrder {
        local_id: i64,
        txid: String,
        #[serde(default)]
        reason: String,
    },
    OrphanOrder {
        local_id: i64,
        recovery_id: i64,
        reason: String,
    },
    BookCycle {
        trade_id: TradeId,
        cycle: u32,
        net_profit: f64,
        gross_profit: f64,
        fees: f64,
        #[serde(default)]
        from_recovery: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_fixture_shape() {
        // Matches the on-disk fixture format: {"type": ..., "payload": {...}}.
        let raw = r#"{"type":"FillEvent","payload":{"order_local_id":2,"txid":"TX","side":"buy","price":0.0998,"volume":20.0,"fee":0.005,"timestamp":100.0}}"#;
        let ev: Event = serde_json::from_str(raw).unwrap();
        match &ev {
            Event::FillEvent {
                order_local_id,
                side,
                ..
            } => {
                assert_eq!(*order_local_id, 2);
                assert_eq!(*side, Side::Buy);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(ev.timestamp(), 100.0);
        assert_eq!(ev.kind(), "FillEvent");
    }

    #[test]
    fn test_action_round_trip() {
        let action = Action::PlaceOrder {
            local_id: 3,
            side: Side::Sell,
            role: Role::Exit,
            price: 0.1008,
            volume: 20.0,
            trade_id: TradeId::B,
            cycle: 1,
            post_only: true,
            reason: "entry_fill_exit".to_string(),
        };
        let json = serde_json::to_string(&action).unwrap();
        let back: Action = serde_json::from_str(&json).unwrap();
        assert_eq!(action, back);
    }

    #[test]
    fn test_timer_tick_payload() {
        let raw = r#"{"type":"TimerTick","payload":{"timestamp":4000.0}}"#;
        let ev: Event = serde_json::from_str(raw).unwrap();
        assert_eq!(ev, Event::TimerTick { timestamp: 4000.0 });
    }
}
