//! Cross-language parity gate: every JSON scenario under
//! `tests/fixtures/cross_language/` must reproduce its expected outcome,
//! deterministically, under the stable serialization.

use std::path::PathBuf;

use pairbot::engine::state::PairState;
use pairbot::parity::{load_fixture_dir, run_and_check, run_scenario};

fn fixture_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/cross_language")
}

#[test]
fn fixtures_exist() {
    let fixtures = load_fixture_dir(&fixture_dir()).unwrap();
    assert!(
        fixtures.len() >= 10,
        "expected at least 10 fixtures, found {}",
        fixtures.len()
    );
}

#[test]
fn all_fixtures_pass() {
    for fixture in load_fixture_dir(&fixture_dir()).unwrap() {
        run_and_check(&fixture).unwrap_or_else(|e| panic!("{}", e));
    }
}

#[test]
fn final_states_survive_serialization_round_trip() {
    for fixture in load_fixture_dir(&fixture_dir()).unwrap() {
        let (state, _) = run_scenario(&fixture);
        let json = serde_json::to_string(&state).unwrap();
        let back: PairState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back, "{}: round trip changed the state", fixture.name);
    }
}

#[test]
fn initial_states_survive_serialization_round_trip() {
    for fixture in load_fixture_dir(&fixture_dir()).unwrap() {
        let json = serde_json::to_string(&fixture.initial_state).unwrap();
        let back: PairState = serde_json::from_str(&json).unwrap();
        assert_eq!(fixture.initial_state, back, "{}", fixture.name);
    }
}

#[test]
fn totals_match_cycle_ledger() {
    for fixture in load_fixture_dir(&fixture_dir()).unwrap() {
        let (state, _) = run_scenario(&fixture);
        assert_eq!(
            state.completed_cycles.len() as u64,
            state.total_round_trips,
            "{}: round trips must equal the cycle ledger",
            fixture.name
        );
        let initial_profit = fixture.initial_state.total_profit;
        let booked: f64 = state.completed_cycles.iter().map(|c| c.net_profit).sum();
        assert!(
            (state.total_profit - initial_profit - booked).abs() < 1e-9,
            "{}: total_profit must track the cycle ledger",
            fixture.name
        );
    }
}
