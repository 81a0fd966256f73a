//! Risk decision core thresholds, loaded from environment variables.
//! Percent fields are in percent units (10.0 = 10%) to match the wire
//! contracts and stored documents.

use anyhow::{Context, Result};
use std::env;

#[derive(Debug, Clone)]
pub struct RiskLimitsConfig {
    // Account / sizing floor and ceilings
    pub min_account_balance_usd: f64,
    pub min_position_size_usd: f64,
    pub max_position_size_usd: f64,
    pub max_portfolio_risk_percent: f64,
    pub default_risk_per_trade_percent: f64,

    // Volatility and liquidity
    pub volatility_lookback_days: u32,
    pub default_volatility: f64,
    pub high_volatility_threshold: f64,
    pub low_liquidity_threshold_usd: f64,

    // Concentration and correlation
    pub max_single_position_percent: f64,
    pub max_correlated_exposure_percent: f64,
    pub correlation_cluster_threshold: f64,
    pub crypto_max_position_percent: f64,
    pub stablecoin_max_position_percent: f64,
    pub defi_max_position_percent: f64,

    // Stop-loss bounds
    pub min_stop_loss_percent: f64,
    pub max_stop_loss_percent: f64,
    pub default_stop_loss_percent: f64,

    // Gate scoring
    pub risk_score_threshold: f64,
    pub market_hours_risk_reduction: f64,
    pub max_leverage: f64,

    // Portfolio alert thresholds
    pub max_var_percent: f64,
    pub max_drawdown_percent: f64,
    pub hhi_alert_threshold: f64,
    pub illiquid_alert_percent: f64,

    // Advanced controller
    pub adjust_positions_interval_secs: u64,
    pub correlation_refresh_interval_secs: u64,
    pub risk_rpc_timeout_secs: u64,
}

impl RiskLimitsConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            min_account_balance_usd: parse_f64("MIN_ACCOUNT_BALANCE", 100.0)?,
            min_position_size_usd: parse_f64("MIN_POSITION_SIZE_USD", 10.0)?,
            max_position_size_usd: parse_f64("MAX_POSITION_SIZE_USD", 50_000.0)?,
            max_portfolio_risk_percent: parse_f64("MAX_PORTFOLIO_RISK_PERCENT", 2.0)?,
            default_risk_per_trade_percent: parse_f64("DEFAULT_RISK_PER_TRADE", 1.0)?,
            volatility_lookback_days: parse_f64("VOLATILITY_LOOKBACK_DAYS", 14.0)? as u32,
            default_volatility: parse_f64("DEFAULT_VOLATILITY", 0.03)?,
            high_volatility_threshold: parse_f64("HIGH_VOLATILITY_THRESHOLD", 0.05)?,
            low_liquidity_threshold_usd: parse_f64("LOW_LIQUIDITY_THRESHOLD", 100_000.0)?,
            max_single_position_percent: parse_f64("MAX_SINGLE_POSITION_PERCENT", 10.0)?,
            max_correlated_exposure_percent: parse_f64("MAX_CORRELATION_EXPOSURE", 20.0)?,
            correlation_cluster_threshold: parse_f64("CORRELATION_CLUSTER_THRESHOLD", 0.7)?,
            crypto_max_position_percent: parse_f64("CRYPTO_MAX_POSITION_PERCENT", 40.0)?,
            stablecoin_max_position_percent: parse_f64("STABLECOIN_MAX_POSITION_PERCENT", 60.0)?,
            defi_max_position_percent: parse_f64("DEFI_MAX_POSITION_PERCENT", 15.0)?,
            min_stop_loss_percent: parse_f64("MIN_STOP_LOSS_PERCENT", 0.5)?,
            max_stop_loss_percent: parse_f64("MAX_STOP_LOSS_PERCENT", 15.0)?,
            default_stop_loss_percent: parse_f64("DEFAULT_STOP_LOSS_PERCENT", 3.0)?,
            risk_score_threshold: parse_f64("RISK_SCORE_THRESHOLD", 7.0)?,
            market_hours_risk_reduction: parse_f64("MARKET_HOURS_RISK_REDUCTION", 0.8)?,
            max_leverage: parse_f64("MAX_LEVERAGE", 2.0)?,
            max_var_percent: parse_f64("MAX_VAR_PERCENT", 5.0)?,
            max_drawdown_percent: parse_f64("MAX_DRAWDOWN_PERCENT", 25.0)?,
            hhi_alert_threshold: parse_f64("HHI_ALERT_THRESHOLD", 0.5)?,
            illiquid_alert_percent: parse_f64("ILLIQUID_ALERT_PERCENT", 30.0)?,
            adjust_positions_interval_secs: parse_f64("ADJUST_POSITIONS_INTERVAL_SECS", 60.0)?
                as u64,
            correlation_refresh_interval_secs: parse_f64(
                "CORRELATION_REFRESH_INTERVAL_SECS",
                3600.0,
            )? as u64,
            risk_rpc_timeout_secs: parse_f64("RISK_RPC_TIMEOUT_SECS", 5.0)? as u64,
        })
    }
}

impl Default for RiskLimitsConfig {
    fn default() -> Self {
        // Defaults only; no environment reads.
        Self {
            min_account_balance_usd: 100.0,
            min_position_size_usd: 10.0,
            max_position_size_usd: 50_000.0,
            max_portfolio_risk_percent: 2.0,
            default_risk_per_trade_percent: 1.0,
            volatility_lookback_days: 14,
            default_volatility: 0.03,
            high_volatility_threshold: 0.05,
            low_liquidity_threshold_usd: 100_000.0,
            max_single_position_percent: 10.0,
            max_correlated_exposure_percent: 20.0,
            correlation_cluster_threshold: 0.7,
            crypto_max_position_percent: 40.0,
            stablecoin_max_position_percent: 60.0,
            defi_max_position_percent: 15.0,
            min_stop_loss_percent: 0.5,
            max_stop_loss_percent: 15.0,
            default_stop_loss_percent: 3.0,
            risk_score_threshold: 7.0,
            market_hours_risk_reduction: 0.8,
            max_leverage: 2.0,
            max_var_percent: 5.0,
            max_drawdown_percent: 25.0,
            hhi_alert_threshold: 0.5,
            illiquid_alert_percent: 30.0,
            adjust_positions_interval_secs: 60,
            correlation_refresh_interval_secs: 3600,
            risk_rpc_timeout_secs: 5,
        }
    }
}

fn parse_f64(key: &str, default: f64) -> Result<f64> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<f64>()
        .context(format!("Failed to parse {}", key))
}
