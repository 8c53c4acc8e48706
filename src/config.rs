//! Env-driven runtime configuration.

use crate::engine::state::EngineConfig;

#[derive(Clone)]
pub struct Config {
    pub pair: String,
    pub order_size_usd: f64,
    pub entry_pct: f64,
    pub profit_pct: f64,
    pub refresh_pct: f64,
    pub price_decimals: i32,
    pub volume_decimals: i32,
    pub min_volume: f64,
    pub min_cost_usd: f64,
    pub maker_fee_pct: f64,
    pub s1_orphan_after_sec: f64,
    pub s2_orphan_after_sec: f64,
    pub loss_backoff_start: u32,
    pub loss_cooldown_start: u32,
    pub loss_cooldown_sec: f64,
    pub backoff_factor: f64,
    pub backoff_max_multiplier: f64,
    pub max_consecutive_refreshes: u32,
    pub refresh_cooldown_sec: f64,
    pub num_slots: usize,
    pub poll_secs: u64,
    pub max_api_calls_per_loop: u32,
    pub max_consecutive_errors: u32,
    pub snapshot_interval_secs: u64,
    pub daily_loss_limit_usd: f64,
    pub trade_history_window_sec: f64,
    pub sqlite_path: String,
    pub kraken_base: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub health_port: u16,
    pub shadow_enabled: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            pair: std::env::var("PAIR").unwrap_or_else(|_| "XDGUSD".to_string()),
            order_size_usd: env_f64("ORDER_SIZE_USD", 2.0),
            entry_pct: env_f64("ENTRY_PCT", 0.2),
            profit_pct: env_f64("PROFIT_PCT", 1.0),
            refresh_pct: env_f64("REFRESH_PCT", 1.0),
            price_decimals: env_parse("PRICE_DECIMALS", 6),
            volume_decimals: env_parse("VOLUME_DECIMALS", 0),
            min_volume: env_f64("MIN_VOLUME", 13.0),
            min_cost_usd: env_f64("MIN_COST_USD", 0.0),
            maker_fee_pct: env_f64("MAKER_FEE_PCT", 0.25),
            s1_orphan_after_sec: env_f64("S1_ORPHAN_SEC", 600.0),
            s2_orphan_after_sec: env_f64("S2_ORPHAN_SEC", 1800.0),
            loss_backoff_start: env_parse("LOSS_BACKOFF_START", 3),
            loss_cooldown_start: env_parse("LOSS_COOLDOWN_START", 5),
            loss_cooldown_sec: env_f64("LOSS_COOLDOWN_SEC", 900.0),
            backoff_factor: env_f64("BACKOFF_FACTOR", 0.5),
            backoff_max_multiplier: env_f64("BACKOFF_MAX_MULT", 5.0),
            max_consecutive_refreshes: env_parse("MAX_CONSECUTIVE_REFRESHES", 3),
            refresh_cooldown_sec: env_f64("REFRESH_COOLDOWN_SEC", 300.0),
            num_slots: env_parse("NUM_SLOTS", 1),
            poll_secs: env_parse("POLL_SECS", 15),
            max_api_calls_per_loop: env_parse("MAX_API_CALLS_PER_LOOP", 8),
            max_consecutive_errors: env_parse("MAX_CONSECUTIVE_ERRORS", 10),
            snapshot_interval_secs: env_parse("SNAPSHOT_SECS", 300),
            daily_loss_limit_usd: env_f64("DAILY_LOSS_LIMIT", 3.0),
            trade_history_window_sec: env_f64("TRADE_HISTORY_WINDOW_SEC", 21600.0),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./pairbot.sqlite".to_string()),
            kraken_base: std::env::var("KRAKEN_BASE")
                .unwrap_or_else(|_| "https://api.kraken.com".to_string()),
            api_key: std::env::var("API_KEY").ok(),
            api_secret: std::env::var("API_SECRET").ok(),
            health_port: env_parse("HEALTH_PORT", 0),
            shadow_enabled: std::env::var("SHADOW")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),
        }
    }

    /// Per-slot engine parameters derived from the runtime config.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            entry_pct: self.entry_pct,
            profit_pct: self.profit_pct,
            refresh_pct: self.refresh_pct,
            order_size_usd: self.order_size_usd,
            price_decimals: self.price_decimals,
            volume_decimals: self.volume_decimals,
            min_volume: self.min_volume,
            min_cost_usd: self.min_cost_usd,
            maker_fee_pct: self.maker_fee_pct,
            s1_orphan_after_sec: self.s1_orphan_after_sec,
            s2_orphan_after_sec: self.s2_orphan_after_sec,
            loss_backoff_start: self.loss_backoff_start,
            loss_cooldown_start: self.loss_cooldown_start,
            loss_cooldown_sec: self.loss_cooldown_sec,
            backoff_factor: self.backoff_factor,
            backoff_max_multiplier: self.backoff_max_multiplier,
            max_consecutive_refreshes: self.max_consecutive_refreshes,
            refresh_cooldown_sec: self.refresh_cooldown_sec,
            ..EngineConfig::default()
        }
    }

    /// Substrings that identify our pair in exchange order/trade listings,
    /// tolerating Kraken's XDG/DOGE aliasing.
    pub fn pair_filter_strings(&self) -> Vec<String> {
        if self.pair.to_uppercase().contains("XDG") || self.pair.to_uppercase().contains("DOGE") {
            vec!["XDG".to_string(), "DOGE".to_string()]
        } else {
            vec![self.pair.to_uppercase()]
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
