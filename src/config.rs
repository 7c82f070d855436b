use crate::error::{AppError, Result};

pub const GAMMA_API_URL: &str = "https://gamma-api.polymarket.com";
pub const CLOB_API_URL: &str = "https://clob.polymarket.com";

/// Collector schedule tick (seconds).
pub const POLL_INTERVAL_SECS: u64 = 300;

/// Primary baseline window: earliest point within this many hours wins.
pub const BASELINE_WINDOW_HOURS: i64 = 24;

/// How far back the seed step backfills a market seen for the first time.
pub const SEED_WINDOW_HOURS: i64 = 24;

/// At most one movement per (market, significance) inside this window.
pub const DEDUP_WINDOW_MINUTES: i64 = 60;

/// Probability used when a market carries no usable price data.
pub const NEUTRAL_PROBABILITY: f64 = 0.5;

/// Resolution requested from the CLOB prices-history endpoint (minutes).
pub const HISTORY_FIDELITY_MINUTES: u32 = 60;

/// Query surface caps.
pub const DETAIL_HISTORY_LIMIT: i64 = 1000;
pub const DETAIL_MOVEMENT_LIMIT: i64 = 10;
pub const DEFAULT_MOVEMENTS_LIMIT: i64 = 20;
pub const MAX_MOVEMENTS_LIMIT: i64 = 500;

/// Base delay for retried store writes; doubles per attempt.
pub const STORE_RETRY_BASE_MS: u64 = 100;

/// Absolute change-percent cutoffs. The minor cutoff is configurable
/// (`MOVEMENT_THRESHOLD`); these two are fixed.
pub mod significance_thresholds {
    pub const MAJOR_MIN: f64 = 25.0;
    pub const MODERATE_MIN: f64 = 15.0;
}

#[derive(Debug, Clone)]
pub struct Config {
    pub gamma_api_url: String,
    pub clob_api_url: String,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Minimum absolute change (percent) recorded as a minor movement (MOVEMENT_THRESHOLD)
    pub movement_threshold: f64,
    /// Fallback baseline window in minutes (MOVEMENT_LOOKBACK_MINUTES)
    pub lookback_minutes: i64,
    /// Collector tick in seconds (POLL_INTERVAL_SECS)
    pub poll_interval_secs: u64,
    /// Max markets requested per cycle (MARKET_LIMIT)
    pub market_limit: usize,
    /// Per-request upstream timeout (HTTP_TIMEOUT_SECS)
    pub http_timeout_secs: u64,
    /// Attempts for transient store write failures (STORE_RETRY_ATTEMPTS)
    pub store_retry_attempts: u32,
    /// Start the collector loop at boot (COLLECTOR_AUTOSTART)
    pub collector_autostart: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let movement_threshold = parse::<f64>("MOVEMENT_THRESHOLD", &var("MOVEMENT_THRESHOLD", "10"))?;
        if !movement_threshold.is_finite() || movement_threshold <= 0.0 {
            return Err(AppError::Config(
                "MOVEMENT_THRESHOLD must be a positive number".to_string(),
            ));
        }

        let lookback_minutes =
            parse::<i64>("MOVEMENT_LOOKBACK_MINUTES", &var("MOVEMENT_LOOKBACK_MINUTES", "60"))?;
        if lookback_minutes <= 0 {
            return Err(AppError::Config(
                "MOVEMENT_LOOKBACK_MINUTES must be greater than zero".to_string(),
            ));
        }

        let poll_interval_secs = parse::<u64>(
            "POLL_INTERVAL_SECS",
            &var("POLL_INTERVAL_SECS", &POLL_INTERVAL_SECS.to_string()),
        )?;
        if poll_interval_secs == 0 {
            return Err(AppError::Config(
                "POLL_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            gamma_api_url: var("GAMMA_API_URL", GAMMA_API_URL),
            clob_api_url: var("CLOB_API_URL", CLOB_API_URL),
            log_level: var("LOG_LEVEL", "info"),
            db_path: var("DB_PATH", "movements.db"),
            api_port: var("API_PORT", "3000")
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            movement_threshold,
            lookback_minutes,
            poll_interval_secs,
            market_limit: parse_positive("MARKET_LIMIT", &var("MARKET_LIMIT", "100"))?,
            http_timeout_secs: parse_positive("HTTP_TIMEOUT_SECS", &var("HTTP_TIMEOUT_SECS", "15"))?,
            store_retry_attempts: parse_positive(
                "STORE_RETRY_ATTEMPTS",
                &var("STORE_RETRY_ATTEMPTS", "3"),
            )?,
            collector_autostart: parse_bool(&var("COLLECTOR_AUTOSTART", "true")),
        })
    }
}

fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| AppError::Config(format!("{key} has an invalid value: {raw:?}")))
}

fn parse_positive<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let value = parse::<T>(key, raw)?;
    if value <= T::default() {
        return Err(AppError::Config(format!("{key} must be greater than zero")));
    }
    Ok(value)
}

fn parse_bool(raw: &str) -> bool {
    !matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}
