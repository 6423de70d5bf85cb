//! Ledger configuration and retry policy.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Backoff strategy between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every attempt.
    Fixed,
    /// base * 2^(attempt-1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// Bound on an optimistic retry loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = no retries).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(250),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => (base_ms * 2_f64.powi((attempt - 1) as i32)).min(max_ms),
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread so racing callers do not retry in lockstep.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Runtime configuration of the stock ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Postgres connection string; `None` runs on the in-memory stores.
    pub database_url: Option<String>,
    /// `min_stock` given to a stock level created by its first adjustment.
    pub default_min_stock: i64,
    /// Bounds the FIFO "oldest lot drained concurrently" retry loop.
    pub lot_race_retry: RetryPolicy,
    /// Bounds the version-checked write behind a "set stock to N" adjustment.
    pub stock_write_retry: RetryPolicy,
}

pub const DEFAULT_MIN_STOCK: i64 = 5;

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            default_min_stock: DEFAULT_MIN_STOCK,
            lot_race_retry: RetryPolicy {
                max_attempts: 16,
                ..RetryPolicy::default()
            },
            stock_write_retry: RetryPolicy::default(),
        }
    }
}

impl LedgerConfig {
    /// Load from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.database_url = lookup("STOCKFLOW_DATABASE_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .filter(|url| !url.trim().is_empty());

        if let Some(v) = lookup("STOCKFLOW_DEFAULT_MIN_STOCK") {
            config.default_min_stock = v
                .trim()
                .parse()
                .with_context(|| format!("STOCKFLOW_DEFAULT_MIN_STOCK is not an integer: {v:?}"))?;
            anyhow::ensure!(
                config.default_min_stock >= 0,
                "STOCKFLOW_DEFAULT_MIN_STOCK must be >= 0"
            );
        }

        if let Some(v) = lookup("STOCKFLOW_LOT_RACE_MAX_RETRIES") {
            config.lot_race_retry.max_attempts = parse_u32("STOCKFLOW_LOT_RACE_MAX_RETRIES", &v)?;
        }

        if let Some(v) = lookup("STOCKFLOW_STOCK_WRITE_MAX_RETRIES") {
            config.stock_write_retry.max_attempts = parse_u32("STOCKFLOW_STOCK_WRITE_MAX_RETRIES", &v)?;
        }

        if let Some(v) = lookup("STOCKFLOW_RETRY_BASE_DELAY_MS") {
            let delay = Duration::from_millis(u64::from(parse_u32("STOCKFLOW_RETRY_BASE_DELAY_MS", &v)?));
            config.lot_race_retry.base_delay = delay;
            config.stock_write_retry.base_delay = delay;
        }

        Ok(config)
    }
}

fn parse_u32(key: &str, value: &str) -> anyhow::Result<u32> {
    value
        .trim()
        .parse()
        .with_context(|| format!("{key} is not a non-negative integer: {value:?}"))
}
