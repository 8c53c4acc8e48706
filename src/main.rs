use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::time::{sleep, Duration};

use pairbot::config::Config;
use pairbot::exchange::kraken::Kraken;
use pairbot::exchange::ratelimit::{NonceGen, RateLimiter};
use pairbot::exchange::ExchangeAdapter;
use pairbot::health;
use pairbot::logging::{json_log, obj, v_num, v_str};
use pairbot::reconcile::reconcile_on_startup;
use pairbot::scheduler::Scheduler;
use pairbot::shadow::{NativeBackend, ShadowRunner};
use pairbot::slot::Slot;
use pairbot::storage::Store;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    json_log(
        "startup",
        obj(&[
            ("pair", v_str(&cfg.pair)),
            ("slots", v_num(cfg.num_slots as f64)),
            ("order_size_usd", v_num(cfg.order_size_usd)),
            ("poll_secs", v_num(cfg.poll_secs as f64)),
            ("shadow", v_str(if cfg.shadow_enabled { "on" } else { "off" })),
        ]),
    );

    let api_key = cfg
        .api_key
        .clone()
        .ok_or_else(|| anyhow!("API_KEY not configured"))?;
    let api_secret = cfg
        .api_secret
        .clone()
        .ok_or_else(|| anyhow!("API_SECRET not configured"))?;

    let limiter = Arc::new(RateLimiter::default());
    let nonce = Arc::new(NonceGen::default());
    let adapter: Arc<dyn ExchangeAdapter> = Arc::new(Kraken::new(
        cfg.kraken_base.clone(),
        api_key,
        api_secret,
        limiter.clone(),
        nonce,
    )?);

    let mut store = Store::open(&cfg.sqlite_path)?;

    // Build slots and restore each from its snapshot plus the log tail.
    let engine_cfg = cfg.engine_config();
    let mut slots = Vec::with_capacity(cfg.num_slots);
    for i in 0..cfg.num_slots as i64 {
        let mut slot = Slot::new(i, &cfg.pair, engine_cfg.clone(), cfg.order_size_usd);
        let snapshot = store.get_snapshot(i)?;
        let after = snapshot.as_ref().map(|s| s.event_id).unwrap_or(0);
        let events = store.read_events_since(i, after)?;
        let replayed = events.len();
        slot.restore(snapshot, &events)?;
        if replayed > 0 {
            json_log(
                "startup",
                obj(&[
                    ("status", v_str("restored")),
                    ("slot_id", v_num(i as f64)),
                    ("replayed_events", v_num(replayed as f64)),
                ]),
            );
        }
        if cfg.shadow_enabled {
            slot.shadow = Some(ShadowRunner::new(Box::new(NativeBackend)));
        }
        slots.push(slot);
    }

    // Reconcile persisted state against exchange reality before trading.
    let price = adapter.get_price(&cfg.pair).await?;
    reconcile_on_startup(
        &mut slots,
        &mut store,
        adapter.as_ref(),
        &cfg.pair_filter_strings(),
        price,
        cfg.trade_history_window_sec,
    )
    .await?;

    let mut scheduler = Scheduler::new(cfg.clone(), slots, store, adapter, limiter);

    let status = health::new_shared_status();
    if cfg.health_port > 0 {
        let (listener, _) = health::bind(cfg.health_port).await?;
        tokio::spawn(health::serve(listener, status.clone()));
    }

    let mut shutdown = false;
    while !shutdown {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                shutdown = true;
            }
            result = scheduler.run_once() => {
                match result {
                    Ok(used) => {
                        json_log(
                            "scheduler",
                            obj(&[
                                ("status", v_str("loop_done")),
                                ("private_calls", v_num(f64::from(used))),
                            ]),
                        );
                    }
                    Err(err) => {
                        json_log(
                            "scheduler",
                            obj(&[
                                ("status", v_str("loop_error")),
                                ("error", v_str(&err.to_string())),
                                ("consecutive", v_num(f64::from(scheduler.consecutive_errors))),
                            ]),
                        );
                        if scheduler.consecutive_errors >= cfg.max_consecutive_errors {
                            json_log(
                                "scheduler",
                                obj(&[("status", v_str("too_many_errors_stopping"))]),
                            );
                            shutdown = true;
                        }
                    }
                }
                if let Ok(mut s) = status.lock() {
                    *s = scheduler.status_payload();
                }
                if !shutdown {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => { shutdown = true; }
                        _ = sleep(Duration::from_secs(cfg.poll_secs)) => {}
                    }
                }
            }
        }
    }

    // Leaving orders on the book with no bot managing them is worse than a
    // cold restart: pull everything before exit.
    json_log("shutdown", obj(&[("status", v_str("cancelling_open_orders"))]));
    scheduler.cancel_all_open_orders().await;
    json_log("shutdown", obj(&[("status", v_str("done"))]));
    Ok(())
}
