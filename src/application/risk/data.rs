//! Read-side helpers shared by the risk services. Everything goes through
//! the store; the gate re-reads rather than trusting cached views, and
//! missing market data degrades to documented defaults instead of
//! synthesised series.

use crate::config::RiskLimitsConfig;
use crate::domain::store::{QueryFilter, Store, containers};
use crate::domain::trading::{AccountBalance, Position};
use anyhow::Result;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tracing::warn;

/// Strategy trade history digest for Kelly sizing.
#[derive(Debug, Clone, Copy)]
pub struct StrategyStats {
    pub win_rate: f64,
    pub avg_win_usd: f64,
    pub avg_loss_usd: f64,
    pub trade_count: usize,
}

pub struct RiskData {
    store: Arc<dyn Store>,
    limits: RiskLimitsConfig,
}

impl RiskData {
    pub fn new(store: Arc<dyn Store>, limits: RiskLimitsConfig) -> Self {
        Self { store, limits }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn account_balance(&self) -> Result<AccountBalance> {
        let doc = self
            .store
            .get(containers::ACCOUNT, "primary", "primary")
            .await?;
        match doc {
            Some(doc) => Ok(serde_json::from_value(doc)?),
            None => Ok(AccountBalance {
                total_balance_usd: Decimal::ZERO,
                available_balance_usd: Decimal::ZERO,
                updated_at: Utc::now(),
            }),
        }
    }

    pub async fn open_positions(&self) -> Result<Vec<Position>> {
        let docs = self
            .store
            .query(containers::POSITIONS, &QueryFilter::new())
            .await?;
        let mut positions = Vec::with_capacity(docs.len());
        for doc in docs {
            match serde_json::from_value::<Position>(doc) {
                Ok(p) => positions.push(p),
                Err(e) => warn!("RiskData: skipping malformed position document: {}", e),
            }
        }
        Ok(positions)
    }

    pub async fn position_for_symbol(&self, symbol: &str) -> Result<Option<Position>> {
        let docs = self
            .store
            .query(
                containers::POSITIONS,
                &QueryFilter::new().eq("symbol", symbol),
            )
            .await?;
        Ok(docs
            .into_iter()
            .next()
            .and_then(|d| serde_json::from_value(d).ok()))
    }

    pub async fn portfolio_value(&self) -> Result<Decimal> {
        let balance = self.account_balance().await?;
        let positions = self.open_positions().await?;
        let exposure: Decimal = positions.iter().map(|p| p.market_value()).sum();
        Ok(balance.available_balance_usd + exposure)
    }

    /// Daily close-to-close sigma over the lookback window. Falls back to
    /// the configured default when history is missing (never fabricates a
    /// series).
    pub async fn symbol_volatility(&self, symbol: &str, lookback_days: u32) -> f64 {
        match self.daily_returns(symbol, lookback_days as i64).await {
            Ok(returns) if returns.len() >= 2 => std_dev(&returns),
            _ => {
                warn!(
                    "RiskData: no history for {} volatility, using default {:.3}",
                    symbol, self.limits.default_volatility
                );
                self.limits.default_volatility
            }
        }
    }

    /// Average daily USD volume from symbol tracking, zero when unknown.
    pub async fn symbol_liquidity_usd(&self, symbol: &str) -> f64 {
        let doc = self
            .store
            .get(containers::SYMBOL_TRACKING, symbol, symbol)
            .await
            .ok()
            .flatten();
        doc.and_then(|d| d.get("avg_daily_volume_usd").and_then(|v| v.as_f64()))
            .unwrap_or(0.0)
    }

    pub async fn daily_returns(&self, symbol: &str, days: i64) -> Result<Vec<f64>> {
        let since = (Utc::now() - Duration::days(days)).timestamp();
        let docs = self
            .store
            .query(
                containers::MARKET_CANDLES,
                &QueryFilter::new()
                    .eq("symbol", symbol)
                    .gt("timestamp", since)
                    .order_asc("timestamp"),
            )
            .await?;
        let closes: Vec<f64> = docs
            .iter()
            .filter_map(|d| d.get("close"))
            .filter_map(|c| match c {
                serde_json::Value::String(s) => s.parse::<f64>().ok(),
                other => other.as_f64(),
            })
            .collect();
        Ok(pct_changes(&closes))
    }

    /// Weighted average sigma across positions; zero on an empty book.
    pub async fn portfolio_volatility(&self) -> Result<f64> {
        let positions = self.open_positions().await?;
        if positions.is_empty() {
            return Ok(0.0);
        }
        let total: f64 = positions
            .iter()
            .map(|p| p.market_value().to_f64().unwrap_or(0.0))
            .sum();
        if total <= 0.0 {
            return Ok(0.0);
        }
        let mut acc = 0.0;
        for p in &positions {
            let weight = p.market_value().to_f64().unwrap_or(0.0) / total;
            let sigma = self
                .symbol_volatility(&p.symbol, self.limits.volatility_lookback_days)
                .await;
            acc += weight * sigma;
        }
        Ok(acc)
    }

    /// Win/loss digest from the closed-trade history of one strategy.
    pub async fn strategy_stats(&self, strategy_id: &str) -> Result<StrategyStats> {
        let docs = self
            .store
            .query(
                containers::TRADES,
                &QueryFilter::new().eq("strategy_id", strategy_id),
            )
            .await?;
        let pnls: Vec<f64> = docs
            .iter()
            .filter_map(|d| d.get("pnl_usd"))
            .filter_map(|v| match v {
                serde_json::Value::String(s) => s.parse::<f64>().ok(),
                other => other.as_f64(),
            })
            .collect();
        if pnls.is_empty() {
            // Neutral prior for unseen strategies.
            return Ok(StrategyStats {
                win_rate: 0.5,
                avg_win_usd: 1.0,
                avg_loss_usd: 1.0,
                trade_count: 0,
            });
        }
        let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();
        Ok(StrategyStats {
            win_rate: wins.len() as f64 / pnls.len() as f64,
            avg_win_usd: mean(&wins).unwrap_or(1.0),
            avg_loss_usd: mean(&losses).map(f64::abs).unwrap_or(1.0),
            trade_count: pnls.len(),
        })
    }

    pub async fn active_strategy_count(&self) -> Result<usize> {
        let docs = self
            .store
            .query(
                containers::STRATEGIES,
                &QueryFilter::new().eq("is_active", true),
            )
            .await?;
        Ok(docs.len())
    }

    /// Fear & Greed style sentiment index (0-100); 50 when unavailable.
    pub async fn fear_greed_index(&self) -> f64 {
        let doc = self
            .store
            .get(containers::TRADING_CONFIG, "fear_greed", "market_sentiment")
            .await
            .ok()
            .flatten();
        doc.and_then(|d| d.get("value").and_then(|v| v.as_f64()))
            .unwrap_or(50.0)
    }
}

pub fn pct_changes(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

pub fn std_dev(values: &[f64]) -> f64 {
    let Some(m) = mean(values) else {
        return 0.0;
    };
    if values.len() < 2 {
        return 0.0;
    }
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::MemoryStore;
    use serde_json::json;

    fn data(store: Arc<dyn Store>) -> RiskData {
        RiskData::new(store, RiskLimitsConfig::default())
    }

    #[tokio::test]
    async fn test_volatility_falls_back_to_default() {
        let store = Arc::new(MemoryStore::new());
        let d = data(store);
        let sigma = d.symbol_volatility("BTC/USDT", 14).await;
        assert_eq!(sigma, 0.03);
    }

    #[tokio::test]
    async fn test_strategy_stats_neutral_prior() {
        let store = Arc::new(MemoryStore::new());
        let d = data(store);
        let stats = d.strategy_stats("unknown").await.unwrap();
        assert_eq!(stats.trade_count, 0);
        assert_eq!(stats.win_rate, 0.5);
    }

    #[tokio::test]
    async fn test_strategy_stats_from_trades() {
        let store = Arc::new(MemoryStore::new());
        for (i, pnl) in [50.0, -20.0, 30.0, -10.0].iter().enumerate() {
            store
                .upsert(
                    containers::TRADES,
                    &json!({"id": format!("t{}", i), "strategy_id": "s1", "pnl_usd": pnl}),
                )
                .await
                .unwrap();
        }
        let d = data(store);
        let stats = d.strategy_stats("s1").await.unwrap();
        assert_eq!(stats.trade_count, 4);
        assert!((stats.win_rate - 0.5).abs() < 1e-9);
        assert!((stats.avg_win_usd - 40.0).abs() < 1e-9);
        assert!((stats.avg_loss_usd - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_std_dev() {
        let values = [0.01, -0.01, 0.02, -0.02];
        let sigma = std_dev(&values);
        assert!(sigma > 0.0 && sigma < 0.03);
        assert_eq!(std_dev(&[0.01]), 0.0);
    }

    #[test]
    fn test_pct_changes_skips_zero_base() {
        let changes = pct_changes(&[100.0, 110.0, 0.0, 50.0]);
        assert_eq!(changes.len(), 2);
        assert!((changes[0] - 0.1).abs() < 1e-9);
    }
}
