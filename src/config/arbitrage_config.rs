//! Arbitrage thresholds and the venue/pair watchlist. The watchlist can
//! be supplied as TOML so deployments swap venues without code changes.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct WatchedVenue {
    pub name: String,
    pub kind: String, // "cex" | "dex"
    #[serde(default)]
    pub chain: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Watchlist {
    pub venues: Vec<WatchedVenue>,
    pub pairs: Vec<String>,
    #[serde(default)]
    pub triangular_exchanges: Vec<String>,
    #[serde(default)]
    pub flash_loan_protocols: Vec<String>,
}

impl Default for Watchlist {
    fn default() -> Self {
        Self {
            venues: vec![
                WatchedVenue {
                    name: "binance".to_string(),
                    kind: "cex".to_string(),
                    chain: None,
                },
                WatchedVenue {
                    name: "kraken".to_string(),
                    kind: "cex".to_string(),
                    chain: None,
                },
                WatchedVenue {
                    name: "uniswap_v3".to_string(),
                    kind: "dex".to_string(),
                    chain: Some("ethereum".to_string()),
                },
                WatchedVenue {
                    name: "sushiswap".to_string(),
                    kind: "dex".to_string(),
                    chain: Some("ethereum".to_string()),
                },
            ],
            pairs: vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()],
            triangular_exchanges: vec!["binance".to_string()],
            flash_loan_protocols: vec!["aave_v3".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArbitrageConfig {
    pub min_profit_percent: f64,
    pub min_profit_usd: f64,
    pub auto_execute_min_profit_usd: f64,
    pub auto_execute_min_percent: f64,
    pub max_trade_amount_usd: f64,
    pub default_gas_cost_usd: f64,
    pub scan_interval_secs: u64,
    pub execution_timeout_secs: u64,
    pub triangular_fee_percent: f64,
    pub watchlist: Watchlist,
}

impl ArbitrageConfig {
    pub fn from_env() -> Result<Self> {
        let watchlist = match env::var("ARBITRAGE_WATCHLIST_TOML") {
            Ok(raw) => Self::parse_watchlist(&raw)?,
            Err(_) => Watchlist::default(),
        };
        Ok(Self {
            min_profit_percent: parse_f64("MIN_ARBITRAGE_PROFIT_PERCENT", 0.5)?,
            min_profit_usd: parse_f64("MIN_ARBITRAGE_PROFIT_USD", 50.0)?,
            auto_execute_min_profit_usd: parse_f64("AUTO_EXECUTE_MIN_PROFIT", 100.0)?,
            auto_execute_min_percent: parse_f64("AUTO_EXECUTE_MIN_PERCENT", 1.0)?,
            max_trade_amount_usd: parse_f64("MAX_ARBITRAGE_TRADE_USD", 25_000.0)?,
            default_gas_cost_usd: parse_f64("DEFAULT_GAS_COST_USD", 20.0)?,
            scan_interval_secs: parse_f64("ARBITRAGE_SCAN_INTERVAL_SECS", 5.0)? as u64,
            execution_timeout_secs: parse_f64("ARBITRAGE_EXECUTION_TIMEOUT_SECS", 120.0)? as u64,
            triangular_fee_percent: parse_f64("TRIANGULAR_FEE_PERCENT", 0.1)?,
            watchlist,
        })
    }

    pub fn parse_watchlist(raw: &str) -> Result<Watchlist> {
        toml::from_str(raw).context("Failed to parse arbitrage watchlist TOML")
    }
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        Self {
            min_profit_percent: 0.5,
            min_profit_usd: 50.0,
            auto_execute_min_profit_usd: 100.0,
            auto_execute_min_percent: 1.0,
            max_trade_amount_usd: 25_000.0,
            default_gas_cost_usd: 20.0,
            scan_interval_secs: 5,
            execution_timeout_secs: 120,
            triangular_fee_percent: 0.1,
            watchlist: Watchlist::default(),
        }
    }
}

fn parse_f64(key: &str, default: f64) -> Result<f64> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<f64>()
        .context(format!("Failed to parse {}", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watchlist_toml_parsing() {
        let raw = r#"
            pairs = ["BTC/USDT", "SOL/USDT"]
            triangular_exchanges = ["binance"]

            [[venues]]
            name = "binance"
            kind = "cex"

            [[venues]]
            name = "uniswap_v3"
            kind = "dex"
            chain = "arbitrum"
        "#;
        let watchlist = ArbitrageConfig::parse_watchlist(raw).unwrap();
        assert_eq!(watchlist.pairs.len(), 2);
        assert_eq!(watchlist.venues[1].chain.as_deref(), Some("arbitrum"));
        assert!(watchlist.flash_loan_protocols.is_empty());
    }

    #[test]
    fn test_default_watchlist_has_cex_and_dex() {
        let w = Watchlist::default();
        assert!(w.venues.iter().any(|v| v.kind == "cex"));
        assert!(w.venues.iter().any(|v| v.kind == "dex"));
    }
}
