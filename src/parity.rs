//! Scenario fixture harness.
//!
//! Fixtures are JSON files holding a config, an initial state, an event
//! sequence and an `expected` block of final-state assertions. The harness
//! drives the reducer event by event and is the regression gate for the
//! state machine: any reimplementation must reproduce these outcomes
//! byte for byte under the stable serialization.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::engine::events::{Action, Event};
use crate::engine::invariants::check_invariants;
use crate::engine::reducer::transition;
use crate::engine::state::{derive_phase, EngineConfig, PairState};

#[derive(Debug, Deserialize)]
pub struct Fixture {
    pub name: String,
    #[serde(default)]
    pub config: EngineConfig,
    pub initial_state: PairState,
    pub order_size_usd: f64,
    pub events: Vec<Event>,
    #[serde(default)]
    pub expected: serde_json::Map<String, Value>,
}

pub fn load_fixture(path: &Path) -> Result<Fixture> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read fixture {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("cannot parse fixture {}", path.display()))
}

pub fn load_fixture_dir(dir: &Path) -> Result<Vec<Fixture>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read fixture dir {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();
    paths.iter().map(|p| load_fixture(p)).collect()
}

/// Drive the fixture's events through the reducer, returning the final state
/// and every action emitted along the way.
pub fn run_scenario(fixture: &Fixture) -> (PairState, Vec<Action>) {
    let mut state = fixture.initial_state.clone();
    let mut actions = Vec::new();
    for event in &fixture.events {
        actions.extend(transition(
            &mut state,
            event,
            &fixture.config,
            fixture.order_size_usd,
        ));
    }
    (state, actions)
}

fn expect_f64(value: &Value) -> f64 {
    value.as_f64().unwrap_or(f64::NAN)
}

/// Check every assertion in the fixture's `expected` block against the final
/// state. Unknown keys are an error: a typo must not silently pass.
pub fn assert_expected(fixture: &Fixture, state: &PairState) -> Result<()> {
    let name = &fixture.name;
    for (key, value) in &fixture.expected {
        let ok = match key.as_str() {
            "phase" => derive_phase(state).as_str() == value.as_str().unwrap_or_default(),
            "open_orders" => state.orders.len() as i64 == value.as_i64().unwrap_or(-1),
            "recovery_orders" => state.recovery_orders.len() as i64 == value.as_i64().unwrap_or(-1),
            "completed_cycles" => {
                state.completed_cycles.len() as i64 == value.as_i64().unwrap_or(-1)
            }
            "round_trips" => state.total_round_trips as i64 == value.as_i64().unwrap_or(-1),
            "cycle_a" => i64::from(state.cycle_a) == value.as_i64().unwrap_or(-1),
            "cycle_b" => i64::from(state.cycle_b) == value.as_i64().unwrap_or(-1),
            "s2_entered_at" => match (state.s2_entered_at, value.as_f64()) {
                (None, None) => value.is_null(),
                (Some(actual), Some(expected)) => (actual - expected).abs() < 1e-9,
                _ => false,
            },
            "total_profit" => (state.total_profit - expect_f64(value)).abs() < 1e-9,
            "total_fees" => (state.total_fees - expect_f64(value)).abs() < 1e-9,
            "cooldown_until_a" => (state.cooldown_until_a - expect_f64(value)).abs() < 1e-9,
            "cooldown_until_b" => (state.cooldown_until_b - expect_f64(value)).abs() < 1e-9,
            "consecutive_refreshes_a" => {
                i64::from(state.consecutive_refreshes_a) == value.as_i64().unwrap_or(-1)
            }
            "consecutive_refreshes_b" => {
                i64::from(state.consecutive_refreshes_b) == value.as_i64().unwrap_or(-1)
            }
            "refresh_cooldown_until_a" => {
                (state.refresh_cooldown_until_a - expect_f64(value)).abs() < 1e-9
            }
            "refresh_cooldown_until_b" => {
                (state.refresh_cooldown_until_b - expect_f64(value)).abs() < 1e-9
            }
            "last_refresh_direction_a" => {
                serde_json::to_value(state.last_refresh_direction_a)? == *value
            }
            "last_refresh_direction_b" => {
                serde_json::to_value(state.last_refresh_direction_b)? == *value
            }
            "long_only" => state.long_only == value.as_bool().unwrap_or(!state.long_only),
            "short_only" => state.short_only == value.as_bool().unwrap_or(!state.short_only),
            "invariants" => {
                let expected: Vec<String> = serde_json::from_value(value.clone())?;
                check_invariants(state) == expected
            }
            other => return Err(anyhow!("{}: unknown expectation key '{}'", name, other)),
        };
        if !ok {
            return Err(anyhow!(
                "{}: expectation '{}' failed (expected {}, state: {})",
                name,
                key,
                value,
                serde_json::to_string(state)?
            ));
        }
    }
    Ok(())
}

/// Full gate for one fixture: run it twice and require byte-identical
/// results (determinism), then check the expectation block.
pub fn run_and_check(fixture: &Fixture) -> Result<()> {
    let (state_a, actions_a) = run_scenario(fixture);
    let (state_b, actions_b) = run_scenario(fixture);

    let a = (
        serde_json::to_string(&state_a)?,
        serde_json::to_string(&actions_a)?,
    );
    let b = (
        serde_json::to_string(&state_b)?,
        serde_json::to_string(&actions_b)?,
    );
    if a != b {
        return Err(anyhow!("{}: non-deterministic run", fixture.name));
    }

    assert_expected(fixture, &state_a)
}
