//! Cross-backend shadow check.
//!
//! Optionally runs a second reducer implementation on every event and
//! compares focused projections: completed-cycle counts, settled profit, and
//! the BookCycle actions. Each check starts from the authoritative pre-state,
//! so runtime-side mutations (bootstrap, adoption, demotion) can never put
//! the backends out of sync on their own. Divergences are counted and logged
//! but never touch the authoritative path.

use serde_json::json;

use crate::engine::events::{Action, Event};
use crate::engine::reducer::transition;
use crate::engine::state::{EngineConfig, PairState, TradeId};
use crate::logging::{json_log, obj, v_num, v_str};

pub trait ReducerBackend: Send {
    fn name(&self) -> &'static str;

    fn transition(
        &mut self,
        state: &mut PairState,
        event: &Event,
        cfg: &EngineConfig,
        order_size_usd: f64,
    ) -> Vec<Action>;
}

/// The in-tree reducer, usable as a shadow of itself for plumbing checks.
pub struct NativeBackend;

impl ReducerBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn transition(
        &mut self,
        state: &mut PairState,
        event: &Event,
        cfg: &EngineConfig,
        order_size_usd: f64,
    ) -> Vec<Action> {
        transition(state, event, cfg, order_size_usd)
    }
}

/// What the shadow comparison actually looks at. Everything else (ids,
/// prices of working orders) is allowed to drift between backends.
#[derive(Debug, Clone, PartialEq)]
struct FocusProjection {
    completed_cycles: usize,
    total_round_trips: u64,
    booked: Vec<(TradeId, u32, bool)>,
    total_profit: f64,
}

impl FocusProjection {
    fn of(state: &PairState, actions: &[Action]) -> Self {
        let booked = actions
            .iter()
            .filter_map(|a| match a {
                Action::BookCycle {
                    trade_id,
                    cycle,
                    from_recovery,
                    ..
                } => Some((*trade_id, *cycle, *from_recovery)),
                _ => None,
            })
            .collect();
        Self {
            completed_cycles: state.completed_cycles.len(),
            total_round_trips: state.total_round_trips,
            booked,
            total_profit: state.total_profit,
        }
    }

    fn matches(&self, other: &Self) -> bool {
        self.completed_cycles == other.completed_cycles
            && self.total_round_trips == other.total_round_trips
            && self.booked == other.booked
            && (self.total_profit - other.total_profit).abs() < 1e-9
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShadowMetrics {
    pub transition_checks: u64,
    pub divergences: u64,
    pub last_divergence_ts: Option<f64>,
    pub last_divergence_event: String,
}

impl ShadowMetrics {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "transition_checks": self.transition_checks,
            "divergences": self.divergences,
            "last_divergence_ts": self.last_divergence_ts,
            "last_divergence_event": self.last_divergence_event.clone(),
        })
    }
}

pub struct ShadowRunner {
    backend: Box<dyn ReducerBackend>,
    pub metrics: ShadowMetrics,
}

impl ShadowRunner {
    pub fn new(backend: Box<dyn ReducerBackend>) -> Self {
        Self {
            backend,
            metrics: ShadowMetrics::default(),
        }
    }

    /// Replay one event through the shadow backend from the authoritative
    /// pre-state and compare against what the authoritative reducer produced.
    pub fn observe(
        &mut self,
        pre_state: &PairState,
        event: &Event,
        cfg: &EngineConfig,
        order_size_usd: f64,
        post_state: &PairState,
        actions: &[Action],
    ) {
        self.metrics.transition_checks += 1;
        let mut shadow_state = pre_state.clone();
        let shadow_actions = self
            .backend
            .transition(&mut shadow_state, event, cfg, order_size_usd);

        let ours = FocusProjection::of(post_state, actions);
        let theirs = FocusProjection::of(&shadow_state, &shadow_actions);
        if !ours.matches(&theirs) {
            self.metrics.divergences += 1;
            self.metrics.last_divergence_ts = Some(event.timestamp());
            self.metrics.last_divergence_event = event.kind().to_string();
            json_log(
                "shadow",
                obj(&[
                    ("status", v_str("divergence")),
                    ("backend", v_str(self.backend.name())),
                    ("event", v_str(event.kind())),
                    ("checks", v_num(self.metrics.transition_checks as f64)),
                    ("divergences", v_num(self.metrics.divergences as f64)),
                ]),
            );
        }
    }
}
