//! Configuration for mastertrade.
//!
//! Structured loading from environment variables, organized by concern:
//! risk limits, strategy lifecycle, arbitrage, messaging, observability.

mod arbitrage_config;
mod lifecycle_config;
mod risk_limits;

pub use arbitrage_config::{ArbitrageConfig, WatchedVenue, Watchlist};
pub use lifecycle_config::LifecycleConfig;
pub use risk_limits::RiskLimitsConfig;

use crate::infrastructure::messaging::FabricConfig;
use crate::infrastructure::ratelimit::RateLimiterConfig;
use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Simulated venues and feeds; no external connectivity.
    Mock,
    /// Live venue adapters wired in by the embedding deployment.
    Live,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mock" => Ok(Mode::Mock),
            "live" => Ok(Mode::Live),
            _ => anyhow::bail!("Invalid MODE: {}. Must be 'mock' or 'live'", s),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

/// Main application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub db_url: String,
    pub symbols: Vec<String>,
    pub feed_tick: Duration,
    pub initial_balance_usd: f64,
    pub order_timeout_secs: u64,

    pub risk: RiskLimitsConfig,
    pub lifecycle: LifecycleConfig,
    pub arbitrage: ArbitrageConfig,
    pub fabric: FabricConfig,
    pub rate_limiter: RateLimiterConfig,
    pub observability: ObservabilityConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mode = env::var("MODE")
            .unwrap_or_else(|_| "mock".to_string())
            .parse::<Mode>()?;

        let symbols_str =
            env::var("SYMBOLS").unwrap_or_else(|_| "BTC/USDT,ETH/USDT".to_string());
        let symbols: Vec<String> = symbols_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let fabric = FabricConfig {
            default_prefetch: parse_u64("FABRIC_PREFETCH", 50)? as usize,
            max_redeliveries: parse_u64("FABRIC_MAX_REDELIVERIES", 3)? as u32,
            default_rpc_timeout: Duration::from_secs(parse_u64("RISK_RPC_TIMEOUT_SECS", 5)?),
            response_ttl: Duration::from_secs(parse_u64("FABRIC_RESPONSE_TTL_SECS", 30)?),
        };

        let rate_limiter = RateLimiterConfig {
            default_rate: parse_f64("RATE_LIMIT_DEFAULT", 10.0)?,
            min_rate: parse_f64("RATE_LIMIT_MIN", 0.1)?,
            max_rate: parse_f64("RATE_LIMIT_MAX", 100.0)?,
        };

        Ok(Self {
            mode,
            db_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/mastertrade.db".to_string()),
            symbols,
            feed_tick: Duration::from_millis(parse_u64("FEED_TICK_MS", 500)?),
            initial_balance_usd: parse_f64("INITIAL_BALANCE_USD", 100_000.0)?,
            order_timeout_secs: parse_u64("ORDER_TIMEOUT_SECS", 60)?,
            risk: RiskLimitsConfig::from_env()?,
            lifecycle: LifecycleConfig::from_env()?,
            arbitrage: ArbitrageConfig::from_env()?,
            fabric,
            rate_limiter,
            observability: ObservabilityConfig {
                enabled: parse_bool("OBSERVABILITY_ENABLED", true),
                interval_secs: parse_u64("OBSERVABILITY_INTERVAL", 60)?,
            },
        })
    }
}

fn parse_u64(key: &str, default: u64) -> Result<u64> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<u64>()
        .context(format!("Failed to parse {}", key))
}

fn parse_f64(key: &str, default: f64) -> Result<f64> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<f64>()
        .context(format!("Failed to parse {}", key))
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<bool>()
        .unwrap_or(default)
}
