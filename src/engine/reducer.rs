//! Pure reducer: (PairState, Event, EngineConfig) -> actions.
//!
//! All slot state transitions happen here. The reducer performs no I/O,
//! reads no clock (time arrives on event timestamps) and uses no RNG, so the
//! same event sequence always produces the same state and action stream.
//! Unknown order or recovery ids degrade to a no-op apart from the `now`
//! update, which is what makes runtime replay duplicate-safe.

use super::events::{Action, Event};
use super::state::{
    derive_phase, EngineConfig, OrderState, PairState, Phase, RecoveryOrder, RefreshDirection,
    Role, Side, TradeId,
};

/// Away-from-zero rounding at `decimals` places; `decimals <= 0` rounds to a
/// whole number. The parity fixtures pin this rule.
fn round_to(value: f64, decimals: i32) -> f64 {
    if decimals <= 0 {
        value.round()
    } else {
        let scale = 10f64.powi(decimals);
        (value * scale).round() / scale
    }
}

fn round_price(price: f64, cfg: &EngineConfig) -> f64 {
    round_to(price, cfg.price_decimals)
}

fn entry_prices(market_price: f64, entry_pct: f64, cfg: &EngineConfig) -> (f64, f64) {
    let p = entry_pct / 100.0;
    let buy = round_price(market_price * (1.0 - p), cfg);
    let sell = round_price(market_price * (1.0 + p), cfg);
    (buy, sell)
}

/// Exit pricing with the no-instant-loss clamp: a sell exit never sits below
/// `market * (1 + entry_pct)`, a buy exit never above the mirror.
fn exit_price(
    entry_fill: f64,
    market_price: f64,
    side: Side,
    cfg: &EngineConfig,
    profit_pct: f64,
) -> f64 {
    let p = profit_pct / 100.0;
    let e = cfg.entry_pct / 100.0;
    match side {
        Side::Sell => round_price(
            (entry_fill * (1.0 + p)).max(market_price * (1.0 + e)),
            cfg,
        ),
        Side::Buy => round_price(
            (entry_fill * (1.0 - p)).min(market_price * (1.0 - e)),
            cfg,
        ),
    }
}

/// Size an order from the target notional. `None` means wait: the size does
/// not satisfy the exchange minimums and must not be silently raised to them.
pub fn compute_order_volume(price: f64, cfg: &EngineConfig, order_size_usd: f64) -> Option<f64> {
    if price <= 0.0 || order_size_usd <= 0.0 {
        return None;
    }
    if cfg.min_cost_usd > 0.0 && order_size_usd < cfg.min_cost_usd {
        return None;
    }

    let raw = order_size_usd / price;
    let vol = round_to(raw, cfg.volume_decimals);
    if vol < cfg.min_volume {
        return None;
    }
    if cfg.min_cost_usd > 0.0 && vol * price < cfg.min_cost_usd {
        return None;
    }
    Some(vol)
}

/// Multiplier applied to `entry_pct` after consecutive losses, pushing the
/// next entry further from market.
pub fn entry_backoff_multiplier(loss_count: u32, cfg: &EngineConfig) -> f64 {
    if loss_count < cfg.loss_backoff_start {
        return 1.0;
    }
    let mul = 1.0 + cfg.backoff_factor * f64::from(loss_count - cfg.loss_backoff_start + 1);
    mul.min(cfg.backoff_max_multiplier)
}

fn effective_profit_pct(state: &PairState, cfg: &EngineConfig) -> f64 {
    if state.profit_pct_runtime != 0.0 {
        state.profit_pct_runtime
    } else {
        cfg.profit_pct
    }
}

/// Build a fresh entry order at the backoff-adjusted side price. Consumes a
/// local id only when the order can actually be sized.
fn new_entry_order(
    state: &mut PairState,
    cfg: &EngineConfig,
    side: Side,
    trade_id: TradeId,
    cycle: u32,
    order_size_usd: f64,
    reason: &str,
) -> Option<(OrderState, Action)> {
    let (buy_price, sell_price) = entry_prices(state.market_price, cfg.entry_pct, cfg);
    let loss_count = match trade_id {
        TradeId::A => state.consecutive_losses_a,
        TradeId::B => state.consecutive_losses_b,
    };
    let mult = entry_backoff_multiplier(loss_count, cfg);
    let mut price = match side {
        Side::Buy => round_price(
            state.market_price * (1.0 - (cfg.entry_pct * mult) / 100.0),
            cfg,
        ),
        Side::Sell => round_price(
            state.market_price * (1.0 + (cfg.entry_pct * mult) / 100.0),
            cfg,
        ),
    };
    // Backoff rounding can collapse to zero on tiny prices; fall back to the
    // unmultiplied side price.
    if price <= 0.0 {
        price = match side {
            Side::Buy => buy_price,
            Side::Sell => sell_price,
        };
    }

    let volume = compute_order_volume(price, cfg, order_size_usd)?;
    let local_id = state.next_order_id;
    state.next_order_id = local_id + 1;

    let order = OrderState {
        local_id,
        side,
        role: Role::Entry,
        price,
        volume,
        trade_id,
        cycle,
        txid: String::new(),
        placed_at: state.now,
        entry_price: 0.0,
        entry_fee: 0.0,
        entry_filled_at: 0.0,
    };
    let action = Action::PlaceOrder {
        local_id,
        side,
        role: Role::Entry,
        price,
        volume,
        trade_id,
        cycle,
        post_only: true,
        reason: reason.to_string(),
    };
    Some((order, action))
}

/// Build fresh S0-style entries for a slot. The orders are returned rather
/// than installed: the runtime owns balance checks and may keep one side,
/// which is also where the long/short-only flags come from.
pub fn bootstrap_orders(
    state: &mut PairState,
    cfg: &EngineConfig,
    order_size_usd: f64,
    allow_long_only: bool,
    allow_short_only: bool,
) -> (Vec<Action>, Vec<OrderState>) {
    let mut actions = Vec::new();
    let mut orders = Vec::new();

    let buy = new_entry_order(
        state,
        cfg,
        Side::Buy,
        TradeId::B,
        state.cycle_b,
        order_size_usd,
        "bootstrap",
    );
    let have_buy = buy.is_some();
    if let Some((order, action)) = buy {
        orders.push(order);
        actions.push(action);
    }

    let sell = new_entry_order(
        state,
        cfg,
        Side::Sell,
        TradeId::A,
        state.cycle_a,
        order_size_usd,
        "bootstrap",
    );
    let have_sell = sell.is_some();
    if let Some((order, action)) = sell {
        orders.push(order);
        actions.push(action);
    }

    if allow_long_only && have_buy && !have_sell {
        state.long_only = true;
        state.short_only = false;
    } else if allow_short_only && have_sell && !have_buy {
        state.short_only = true;
        state.long_only = false;
    } else {
        state.long_only = false;
        state.short_only = false;
    }

    (actions, orders)
}

/// Public helper for runtime bootstrap/reseed paths: creates and installs a
/// single entry order.
pub fn add_entry_order(
    state: &mut PairState,
    cfg: &EngineConfig,
    side: Side,
    trade_id: TradeId,
    cycle: u32,
    order_size_usd: f64,
    reason: &str,
) -> Option<Action> {
    let (order, action) = new_entry_order(state, cfg, side, trade_id, cycle, order_size_usd, reason)?;
    state.orders.push(order);
    Some(action)
}

fn clear_s2_flag_if_not_s2(state: &mut PairState) {
    if state.s2_entered_at.is_some() && derive_phase(state) != Phase::S2 {
        state.s2_entered_at = None;
    }
}

struct BookedCycle {
    net_profit: f64,
}

/// Append a cycle record and roll the running totals. `total_fees` only takes
/// the exit fee here: entry fees book at entry-fill time.
fn book_cycle(
    state: &mut PairState,
    order: &OrderState,
    fill_price: f64,
    fill_fee: f64,
    timestamp: f64,
    from_recovery: bool,
) -> (BookedCycle, Action) {
    let volume = order.volume;
    let gross = match order.trade_id {
        TradeId::A => (order.entry_price - fill_price) * volume,
        TradeId::B => (fill_price - order.entry_price) * volume,
    };
    let fees = order.entry_fee + fill_fee;
    let net = gross - fees;

    state.completed_cycles.push(super::state::CycleRecord {
        trade_id: order.trade_id,
        cycle: order.cycle,
        entry_price: order.entry_price,
        exit_price: fill_price,
        volume,
        gross_profit: gross,
        fees,
        net_profit: net,
        entry_time: order.entry_filled_at,
        exit_time: timestamp,
        from_recovery,
    });
    state.total_profit += net;
    state.total_fees += fill_fee;
    state.total_round_trips += 1;
    if net < 0.0 {
        state.today_realized_loss += net.abs();
    }

    let action = Action::BookCycle {
        trade_id: order.trade_id,
        cycle: order.cycle,
        net_profit: net,
        gross_profit: gross,
        fees,
        from_recovery,
    };
    (BookedCycle { net_profit: net }, action)
}

fn update_loss_counters(state: &mut PairState, trade_id: TradeId, net_profit: f64, cfg: &EngineConfig) {
    match trade_id {
        TradeId::A => {
            state.consecutive_losses_a = if net_profit < 0.0 {
                state.consecutive_losses_a + 1
            } else {
                0
            };
            if state.consecutive_losses_a >= cfg.loss_cooldown_start {
                state.cooldown_until_a = state
                    .cooldown_until_a
                    .max(state.now + cfg.loss_cooldown_sec);
            }
        }
        TradeId::B => {
            state.consecutive_losses_b = if net_profit < 0.0 {
                state.consecutive_losses_b + 1
            } else {
                0
            };
            if state.consecutive_losses_b >= cfg.loss_cooldown_start {
                state.cooldown_until_b = state
                    .cooldown_until_b
                    .max(state.now + cfg.loss_cooldown_sec);
            }
        }
    }
}

/// Re-seed one side's entry after its cycle closed, unless mode flags or a
/// loss cooldown forbid it. A sizing failure skips silently; the next price
/// tick retries.
fn place_followup_entry(
    state: &mut PairState,
    cfg: &EngineConfig,
    trade_id: TradeId,
    order_size_usd: f64,
    reason: &str,
) -> Vec<Action> {
    let mut actions = Vec::new();
    let (side, cycle) = match trade_id {
        TradeId::A => {
            if state.long_only || state.now < state.cooldown_until_a {
                return actions;
            }
            (Side::Sell, state.cycle_a)
        }
        TradeId::B => {
            if state.short_only || state.now < state.cooldown_until_b {
                return actions;
            }
            (Side::Buy, state.cycle_b)
        }
    };
    if let Some((order, action)) =
        new_entry_order(state, cfg, side, trade_id, cycle, order_size_usd, reason)
    {
        state.orders.push(order);
        actions.push(action);
    }
    actions
}

/// Move a stale exit to the recovery side-channel, advance that trade's
/// cycle, and re-seed its entry.
fn orphan_exit(
    state: &mut PairState,
    cfg: &EngineConfig,
    order: OrderState,
    reason: &str,
    order_size_usd: f64,
) -> Vec<Action> {
    let mut actions = Vec::new();

    let recovery_id = state.next_recovery_id;
    state.next_recovery_id = recovery_id + 1;
    state.remove_order(order.local_id);
    state.recovery_orders.push(RecoveryOrder {
        recovery_id,
        side: order.side,
        price: order.price,
        volume: order.volume,
        trade_id: order.trade_id,
        cycle: order.cycle,
        entry_price: order.entry_price,
        orphaned_at: state.now,
        txid: order.txid.clone(),
        reason: reason.to_string(),
    });
    actions.push(Action::OrphanOrder {
        local_id: order.local_id,
        recovery_id,
        reason: reason.to_string(),
    });

    match order.trade_id {
        TradeId::A => {
            state.cycle_a += 1;
            actions.extend(place_followup_entry(
                state,
                cfg,
                TradeId::A,
                order_size_usd,
                "orphan_A",
            ));
        }
        TradeId::B => {
            state.cycle_b += 1;
            actions.extend(place_followup_entry(
                state,
                cfg,
                TradeId::B,
                order_size_usd,
                "orphan_B",
            ));
        }
    }
    actions
}

fn refresh_counters(state: &PairState, trade_id: TradeId) -> (u32, Option<RefreshDirection>, f64) {
    match trade_id {
        TradeId::A => (
            state.consecutive_refreshes_a,
            state.last_refresh_direction_a,
            state.refresh_cooldown_until_a,
        ),
        TradeId::B => (
            state.consecutive_refreshes_b,
            state.last_refresh_direction_b,
            state.refresh_cooldown_until_b,
        ),
    }
}

/// Replace at most one drifted entry per price tick. Consecutive refreshes in
/// the same direction are chase attempts; past the limit the trade sits out a
/// cooldown instead of following the market.
fn refresh_stale_entries(
    state: &mut PairState,
    cfg: &EngineConfig,
    order_size_usd: f64,
) -> Vec<Action> {
    let mut actions = Vec::new();
    let candidates: Vec<OrderState> = state.orders.clone();

    for o in candidates {
        if o.role != Role::Entry {
            continue;
        }
        let drift = if state.market_price > 0.0 {
            (o.price - state.market_price).abs() / state.market_price * 100.0
        } else {
            0.0
        };
        if drift <= cfg.refresh_pct {
            continue;
        }

        let trade_id = o.trade_id;
        let (count_now, _, cooldown_until) = refresh_counters(state, trade_id);
        if state.now < cooldown_until {
            continue;
        }

        // Cooldown just expired with the counter still at the limit: reset so
        // this refresh counts as 1 rather than re-tripping.
        if count_now >= cfg.max_consecutive_refreshes && cooldown_until > 0.0 {
            match trade_id {
                TradeId::A => {
                    state.consecutive_refreshes_a = 0;
                    state.refresh_cooldown_until_a = 0.0;
                }
                TradeId::B => {
                    state.consecutive_refreshes_b = 0;
                    state.refresh_cooldown_until_b = 0.0;
                }
            }
        }

        let direction = match o.side {
            Side::Buy => {
                if state.market_price < o.price {
                    RefreshDirection::Down
                } else {
                    RefreshDirection::Up
                }
            }
            Side::Sell => {
                if state.market_price > o.price {
                    RefreshDirection::Up
                } else {
                    RefreshDirection::Down
                }
            }
        };

        let (prev_count, prev_dir, _) = refresh_counters(state, trade_id);
        let count = if prev_dir == Some(direction) {
            prev_count + 1
        } else {
            1
        };

        if count >= cfg.max_consecutive_refreshes {
            let until = state.now + cfg.refresh_cooldown_sec;
            match trade_id {
                TradeId::A => {
                    state.consecutive_refreshes_a = count;
                    state.last_refresh_direction_a = Some(direction);
                    state.refresh_cooldown_until_a = until;
                }
                TradeId::B => {
                    state.consecutive_refreshes_b = count;
                    state.last_refresh_direction_b = Some(direction);
                    state.refresh_cooldown_until_b = until;
                }
            }
            break;
        }

        state.remove_order(o.local_id);
        actions.push(Action::CancelOrder {
            local_id: o.local_id,
            txid: o.txid.clone(),
            reason: "stale_entry".to_string(),
        });
        if let Some((new_entry, place_action)) = new_entry_order(
            state,
            cfg,
            o.side,
            trade_id,
            o.cycle,
            order_size_usd,
            "refresh_entry",
        ) {
            state.orders.push(new_entry);
            actions.push(place_action);
        }

        match trade_id {
            TradeId::A => {
                state.consecutive_refreshes_a = count;
                state.last_refresh_direction_a = Some(direction);
            }
            TradeId::B => {
                state.consecutive_refreshes_b = count;
                state.last_refresh_direction_b = Some(direction);
            }
        }
        break;
    }
    actions
}

/// Pure reducer for one event.
pub fn transition(
    state: &mut PairState,
    event: &Event,
    cfg: &EngineConfig,
    order_size_usd: f64,
) -> Vec<Action> {
    let mut actions = Vec::new();

    match event {
        Event::PriceTick { price, timestamp } => {
            state.now = *timestamp;
            state.market_price = *price;
            state.last_price_update_at = Some(*timestamp);
            actions.extend(refresh_stale_entries(state, cfg, order_size_usd));
        }

        Event::TimerTick { timestamp } => {
            state.now = *timestamp;
            let phase = derive_phase(state);
            if phase != Phase::S2 && state.s2_entered_at.is_some() {
                state.s2_entered_at = None;
            }

            // S1: orphan the lone exit once it aged out and the market moved
            // away from it.
            if phase == Phase::S1a || phase == Phase::S1b {
                let maybe_ex = state.exits().next().cloned();
                if let Some(ex) = maybe_ex {
                    let base = if ex.entry_filled_at > 0.0 {
                        ex.entry_filled_at
                    } else if ex.placed_at > 0.0 {
                        ex.placed_at
                    } else {
                        state.now
                    };
                    let age = state.now - base;
                    let moved_away = (ex.side == Side::Sell && state.market_price < ex.price)
                        || (ex.side == Side::Buy && state.market_price > ex.price);
                    if age >= cfg.s1_orphan_after_sec && moved_away {
                        actions.extend(orphan_exit(state, cfg, ex, "s1_timeout", order_size_usd));
                        return actions;
                    }
                }
                return actions;
            }

            // S2: start the clock on first sight, orphan the worse leg on
            // timeout. One orphan per tick; the buy leg is only worse when
            // strictly farther, so an exact tie pulls the sell exit.
            if phase == Phase::S2 {
                let entered_at = match state.s2_entered_at {
                    None => {
                        state.s2_entered_at = Some(state.now);
                        return actions;
                    }
                    Some(t) => t,
                };
                if state.now - entered_at >= cfg.s2_orphan_after_sec {
                    let buy_exit = state.exits().find(|o| o.side == Side::Buy).cloned();
                    let sell_exit = state.exits().find(|o| o.side == Side::Sell).cloned();
                    if let (Some(buy), Some(sell)) = (buy_exit, sell_exit) {
                        if state.market_price > 0.0 {
                            let buy_dist =
                                (buy.price - state.market_price).abs() / state.market_price;
                            let sell_dist =
                                (sell.price - state.market_price).abs() / state.market_price;
                            let worse = if buy_dist > sell_dist { buy } else { sell };
                            actions.extend(orphan_exit(
                                state,
                                cfg,
                                worse,
                                "s2_timeout",
                                order_size_usd,
                            ));
                            state.s2_entered_at = None;
                        }
                    }
                }
            } else if state.s2_entered_at.is_some() {
                state.s2_entered_at = None;
            }
        }

        Event::FillEvent {
            order_local_id,
            side: _,
            price,
            volume,
            fee,
            timestamp,
            ..
        } => {
            state.now = *timestamp;
            let order = match state.find_order(*order_local_id).cloned() {
                Some(o) => o,
                None => return actions,
            };
            state.remove_order(order.local_id);

            if order.role == Role::Entry {
                // Entry fee books immediately; the exit carries the fill data
                // it needs to settle the cycle later.
                state.total_fees += fee;
                let exit_side = order.side.opposite();
                let exit_local = state.next_order_id;
                state.next_order_id = exit_local + 1;
                let profit_pct = effective_profit_pct(state, cfg);
                let exit_order = OrderState {
                    local_id: exit_local,
                    side: exit_side,
                    role: Role::Exit,
                    price: exit_price(*price, state.market_price, exit_side, cfg, profit_pct),
                    volume: *volume,
                    trade_id: order.trade_id,
                    cycle: order.cycle,
                    txid: String::new(),
                    placed_at: *timestamp,
                    entry_price: *price,
                    entry_fee: *fee,
                    entry_filled_at: *timestamp,
                };
                actions.push(Action::PlaceOrder {
                    local_id: exit_local,
                    side: exit_side,
                    role: Role::Exit,
                    price: exit_order.price,
                    volume: exit_order.volume,
                    trade_id: exit_order.trade_id,
                    cycle: exit_order.cycle,
                    post_only: true,
                    reason: "entry_fill_exit".to_string(),
                });
                state.orders.push(exit_order);
                clear_s2_flag_if_not_s2(state);
                return actions;
            }

            // Exit filled: settle the round trip and re-seed the entry.
            let (booked, book_action) = book_cycle(state, &order, *price, *fee, *timestamp, false);
            update_loss_counters(state, order.trade_id, booked.net_profit, cfg);
            actions.push(book_action);

            match order.trade_id {
                TradeId::A => state.cycle_a = state.cycle_a.max(order.cycle + 1),
                TradeId::B => state.cycle_b = state.cycle_b.max(order.cycle + 1),
            }
            actions.extend(place_followup_entry(
                state,
                cfg,
                order.trade_id,
                order_size_usd,
                "cycle_complete",
            ));
            clear_s2_flag_if_not_s2(state);
        }

        Event::RecoveryFillEvent {
            recovery_id,
            price,
            fee,
            timestamp,
            ..
        } => {
            state.now = *timestamp;
            let rec = match state.find_recovery(*recovery_id).cloned() {
                Some(r) => r,
                None => return actions,
            };
            state.remove_recovery(rec.recovery_id);

            // Recovery cycles carry no entry fee: it was booked when the
            // original entry filled.
            let pseudo = OrderState {
                local_id: -1,
                side: rec.side,
                role: Role::Exit,
                price: rec.price,
                volume: rec.volume,
                trade_id: rec.trade_id,
                cycle: rec.cycle,
                txid: String::new(),
                placed_at: 0.0,
                entry_price: rec.entry_price,
                entry_fee: 0.0,
                entry_filled_at: rec.orphaned_at,
            };
            let (booked, book_action) = book_cycle(state, &pseudo, *price, *fee, *timestamp, true);
            update_loss_counters(state, rec.trade_id, booked.net_profit, cfg);
            actions.push(book_action);

            // Re-seed the trade if nothing of it is on the book; the orphan
            // path may already have done so.
            let trade_busy = state.orders.iter().any(|o| o.trade_id == rec.trade_id);
            if !trade_busy {
                actions.extend(place_followup_entry(
                    state,
                    cfg,
                    rec.trade_id,
                    order_size_usd,
                    "recovery_complete",
                ));
            }
            clear_s2_flag_if_not_s2(state);
        }

        Event::RecoveryCancelEvent {
            recovery_id,
            timestamp,
            ..
        } => {
            state.now = *timestamp;
            state.remove_recovery(*recovery_id);
            clear_s2_flag_if_not_s2(state);
        }
    }

    actions
}
