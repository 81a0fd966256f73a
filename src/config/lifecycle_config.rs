//! Strategy lifecycle knobs: generation, backtest orchestration, daily
//! review, and activation.

use anyhow::{Context, Result};
use std::env;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Seed for the settings-table value; the store copy is authoritative.
    pub max_active_strategies: u32,
    pub min_stability_hours: i64,
    pub review_interval_hours: i64,
    pub activation_check_interval_secs: u64,

    // Backtest orchestration
    pub backtest_window_days: i64,
    pub min_backtest_candles: usize,
    pub backtest_parallelism: usize,

    // Review
    pub min_review_trades: usize,
    pub review_lookback_days: i64,

    // Activation admissibility
    pub min_candidate_sharpe: f64,
    pub max_candidate_drawdown: f64,
    pub min_candidate_trades: u32,
    pub max_inactive_days: i64,
    pub min_sentiment_alignment: f64,

    /// Progress broadcasts while generating/backtesting.
    pub progress_topic: String,
}

impl LifecycleConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            max_active_strategies: parse_u32("MAX_ACTIVE_STRATEGIES", 2)?,
            min_stability_hours: parse_i64("MIN_STABILITY_HOURS", 4)?,
            review_interval_hours: parse_i64("REVIEW_INTERVAL_HOURS", 24)?,
            activation_check_interval_secs: parse_i64("ACTIVATION_CHECK_INTERVAL_SECS", 900)?
                as u64,
            backtest_window_days: parse_i64("BACKTEST_WINDOW_DAYS", 90)?,
            min_backtest_candles: parse_i64("MIN_BACKTEST_CANDLES", 100)? as usize,
            backtest_parallelism: parse_i64("BACKTEST_PARALLELISM", 2)? as usize,
            min_review_trades: parse_i64("MIN_REVIEW_TRADES", 10)? as usize,
            review_lookback_days: parse_i64("REVIEW_LOOKBACK_DAYS", 30)?,
            min_candidate_sharpe: parse_f64("MIN_CANDIDATE_SHARPE", 0.5)?,
            max_candidate_drawdown: parse_f64("MAX_CANDIDATE_DRAWDOWN", -0.30)?,
            min_candidate_trades: parse_u32("MIN_CANDIDATE_TRADES", 5)?,
            max_inactive_days: parse_i64("MAX_INACTIVE_DAYS", 14)?,
            min_sentiment_alignment: parse_f64("MIN_SENTIMENT_ALIGNMENT", 0.45)?,
            progress_topic: env::var("GENERATION_PROGRESS_TOPIC")
                .unwrap_or_else(|_| "strategy.generation.progress".to_string()),
        })
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_active_strategies: 2,
            min_stability_hours: 4,
            review_interval_hours: 24,
            activation_check_interval_secs: 900,
            backtest_window_days: 90,
            min_backtest_candles: 100,
            backtest_parallelism: 2,
            min_review_trades: 10,
            review_lookback_days: 30,
            min_candidate_sharpe: 0.5,
            max_candidate_drawdown: -0.30,
            min_candidate_trades: 5,
            max_inactive_days: 14,
            min_sentiment_alignment: 0.45,
            progress_topic: "strategy.generation.progress".to_string(),
        }
    }
}

fn parse_u32(key: &str, default: u32) -> Result<u32> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<u32>()
        .context(format!("Failed to parse {}", key))
}

fn parse_i64(key: &str, default: i64) -> Result<i64> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<i64>()
        .context(format!("Failed to parse {}", key))
}

fn parse_f64(key: &str, default: f64) -> Result<f64> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<f64>()
        .context(format!("Failed to parse {}", key))
}
