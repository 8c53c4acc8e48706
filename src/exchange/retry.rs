//! Jittered backoff for public endpoint calls.
//!
//! Private calls answer to the rate limiter's circuit breaker; public
//! endpoints (the ticker fetch) carry no call budget, so transient failures
//! are absorbed here before the scheduler counts a loop error. Delays double
//! per failure up to a cap, with jitter so restarted bots do not hammer the
//! venue in lockstep.

use anyhow::Result;
use rand::Rng;
use std::future::Future;
use tokio::time::{sleep, Duration};

use crate::logging::{json_log, obj, v_num, v_str};

#[derive(Clone, Debug)]
pub struct Backoff {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay_ms: 250,
            max_delay_ms: 4000,
            jitter: 0.25,
        }
    }
}

impl Backoff {
    fn delay(&self, failures: u32) -> Duration {
        let doubled = self
            .base_delay_ms
            .saturating_mul(1u64 << failures.min(16));
        let capped = doubled.min(self.max_delay_ms) as f64;
        let spread = capped * self.jitter;
        let jittered = if spread > 0.0 {
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

/// Run a public exchange call for `pair`, retrying transient failures.
/// Exhaustion returns the last error; the scheduler counts it against its
/// consecutive-error stop.
pub async fn public_call<F, Fut, T>(
    backoff: &Backoff,
    pair: &str,
    call: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut failures: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if failures + 1 < backoff.attempts => {
                let delay = backoff.delay(failures);
                failures += 1;
                json_log(
                    "exchange",
                    obj(&[
                        ("status", v_str("public_call_retry")),
                        ("call", v_str(call)),
                        ("pair", v_str(pair)),
                        ("failures", v_num(f64::from(failures))),
                        ("delay_ms", v_num(delay.as_millis() as f64)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
