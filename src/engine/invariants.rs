//! Strict invariant checker for the locked pair-state semantics.
//!
//! Violations come back as strings so the runtime can log them verbatim and
//! decide which patterns are transient (see `slot`).

use super::state::{derive_phase, PairState, Phase, Role, Side};

pub fn check_invariants(state: &PairState) -> Vec<String> {
    let mut violations = Vec::new();
    let phase = derive_phase(state);

    let buy_entries = state
        .orders
        .iter()
        .filter(|o| o.role == Role::Entry && o.side == Side::Buy)
        .count();
    let sell_entries = state
        .orders
        .iter()
        .filter(|o| o.role == Role::Entry && o.side == Side::Sell)
        .count();
    let buy_exits = state
        .orders
        .iter()
        .filter(|o| o.role == Role::Exit && o.side == Side::Buy)
        .count();
    let sell_exits = state
        .orders
        .iter()
        .filter(|o| o.role == Role::Exit && o.side == Side::Sell)
        .count();
    let entries = buy_entries + sell_entries;
    let exits = buy_exits + sell_exits;

    let mut ids: Vec<i64> = state.orders.iter().map(|o| o.local_id).collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.len() != state.orders.len() {
        violations.push("duplicate order local_id".to_string());
    }

    match phase {
        Phase::S0 => {
            if state.long_only {
                if buy_entries != 1 || sell_entries > 0 || exits > 0 {
                    violations.push("S0 long_only must be exactly one buy entry".to_string());
                }
            } else if state.short_only {
                if sell_entries != 1 || buy_entries > 0 || exits > 0 {
                    violations.push("S0 short_only must be exactly one sell entry".to_string());
                }
            } else if buy_entries != 1 || sell_entries != 1 || exits > 0 {
                violations.push("S0 must be exactly A sell entry + B buy entry".to_string());
            }
        }
        Phase::S1a => {
            if state.short_only {
                if buy_exits != 1 {
                    violations.push("S1a short_only must have one buy exit".to_string());
                }
            } else if buy_exits != 1 || buy_entries != 1 || sell_entries > 0 || sell_exits > 0 {
                violations.push("S1a must be one buy exit + one buy entry".to_string());
            }
        }
        Phase::S1b => {
            if state.long_only {
                if sell_exits != 1 {
                    violations.push("S1b long_only must have one sell exit".to_string());
                }
            } else if sell_exits != 1 || sell_entries != 1 || buy_entries > 0 || buy_exits > 0 {
                violations.push("S1b must be one sell exit + one sell entry".to_string());
            }
        }
        Phase::S2 => {
            if buy_exits != 1 || sell_exits != 1 || entries > 0 {
                violations.push("S2 must be one buy exit + one sell exit only".to_string());
            }
        }
    }

    if phase != Phase::S2 && state.s2_entered_at.is_some() {
        violations.push("s2_entered_at must be null outside S2".to_string());
    }

    for o in &state.orders {
        if o.cycle < 1 {
            violations.push("order cycle must be >= 1".to_string());
        }
        if o.role == Role::Exit && o.entry_price <= 0.0 {
            violations.push("exit must carry entry_price".to_string());
        }
        if o.volume <= 0.0 {
            violations.push("order volume must be > 0".to_string());
        }
    }

    if state.cycle_a < 1 || state.cycle_b < 1 {
        violations.push("cycle counters must be >= 1".to_string());
    }

    violations
}
