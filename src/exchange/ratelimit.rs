//! Kraken-style call budget tracking.
//!
//! Standard tier: the counter starts at 15, each private call adds 1, and it
//! decays by 1 per second. We track the budget locally and open a circuit
//! with exponential backoff after rate-limit errors so the process never
//! hammers a locked-out key. One instance is shared process-wide; all
//! private calls acquire through it.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::config::now_ts;

/// Pure budget arithmetic, driven by an explicit clock so it can be tested
/// without waiting on wall time.
#[derive(Debug, Clone)]
struct Bucket {
    max_budget: f64,
    decay_rate: f64,
    budget: f64,
    last_decay: f64,
    consecutive_errors: u32,
    circuit_open_until: f64,
}

impl Bucket {
    fn new(max_budget: f64, decay_rate: f64, now: f64) -> Self {
        Self {
            max_budget,
            decay_rate,
            budget: max_budget,
            last_decay: now,
            consecutive_errors: 0,
            circuit_open_until: 0.0,
        }
    }

    fn decay(&mut self, now: f64) {
        let elapsed = now - self.last_decay;
        if elapsed > 0.0 {
            self.budget = self
                .max_budget
                .min(self.budget + elapsed * self.decay_rate);
            self.last_decay = now;
        }
    }

    /// Deduct `units`, allowing overdraft down to -2 so startup bursts are
    /// not blocked for minutes.
    fn deduct(&mut self, units: f64) {
        self.budget = (-2.0f64).max(self.budget - units);
    }

    fn record_rate_error(&mut self, now: f64) -> f64 {
        self.consecutive_errors += 1;
        let backoff = 60.0f64.min(5.0 * 2.0f64.powi(self.consecutive_errors as i32 - 1));
        self.circuit_open_until = now + backoff;
        self.budget = 0.0;
        backoff
    }

    fn record_success(&mut self) {
        self.consecutive_errors = 0;
        self.circuit_open_until = 0.0;
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    cond: Condvar,
}

impl RateLimiter {
    pub fn new(max_budget: f64, decay_rate: f64) -> Self {
        Self {
            bucket: Mutex::new(Bucket::new(max_budget, decay_rate, now_ts())),
            cond: Condvar::new(),
        }
    }

    /// Consume rate-limit units, blocking while the circuit is open and
    /// briefly when the budget is nearly exhausted.
    pub fn consume(&self, units: f64) {
        let mut bucket = self.bucket.lock().unwrap();

        let now = now_ts();
        if bucket.circuit_open_until > now {
            let wait = bucket.circuit_open_until - now;
            crate::logging::json_log(
                "rate_limiter",
                crate::logging::obj(&[
                    ("status", crate::logging::v_str("circuit_open")),
                    ("wait_sec", crate::logging::v_num(wait)),
                ]),
            );
            let (guard, _) = self
                .cond
                .wait_timeout(bucket, Duration::from_secs_f64(wait))
                .unwrap();
            bucket = guard;
            bucket.decay(now_ts());
        }

        bucket.decay(now_ts());

        if bucket.budget <= 1.0 {
            let (guard, _) = self
                .cond
                .wait_timeout(bucket, Duration::from_secs(2))
                .unwrap();
            bucket = guard;
            bucket.decay(now_ts());
        }

        bucket.deduct(units);
    }

    /// Called after a Kraken rate-limit or lockout error.
    pub fn report_rate_error(&self) {
        let mut bucket = self.bucket.lock().unwrap();
        let backoff = bucket.record_rate_error(now_ts());
        crate::logging::json_log(
            "rate_limiter",
            crate::logging::obj(&[
                ("status", crate::logging::v_str("rate_error")),
                (
                    "consecutive_errors",
                    crate::logging::v_num(f64::from(bucket.consecutive_errors)),
                ),
                ("backoff_sec", crate::logging::v_num(backoff)),
            ]),
        );
    }

    /// Called after a successful private call.
    pub fn report_success(&self) {
        let mut bucket = self.bucket.lock().unwrap();
        bucket.record_success();
        self.cond.notify_all();
    }

    /// Non-blocking view of the current budget.
    pub fn budget_available(&self) -> f64 {
        let mut bucket = self.bucket.lock().unwrap();
        bucket.decay(now_ts());
        bucket.budget
    }

    pub fn circuit_open(&self) -> bool {
        let bucket = self.bucket.lock().unwrap();
        bucket.circuit_open_until > now_ts()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(15.0, 1.0)
    }
}

/// Monotonic millisecond nonce with a floor of `last + 1`, so clock drift
/// can never hand the exchange a stale nonce.
#[derive(Debug, Default)]
pub struct NonceGen {
    last: Mutex<u64>,
}

impl NonceGen {
    pub fn next(&self) -> u64 {
        let mut last = self.last.lock().unwrap();
        let mut nonce = chrono::Utc::now().timestamp_millis() as u64;
        if nonce <= *last {
            nonce = *last + 1;
        }
        *last = nonce;
        nonce
    }
}
