//! Trait seams to the collaborators the control plane does not own:
//! venues, indicator math, ML forecasters, strategy generators, and the
//! backtest engine. Concrete implementations live in `infrastructure` or
//! out of tree.

use crate::domain::indicator::IndicatorConfig;
use crate::domain::market::Candle;
use crate::domain::risk::PricePrediction;
use crate::domain::strategy::{Strategy, StrategyType};
use crate::domain::trading::{AccountBalance, OrderRequest, VenueOrder};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Venue access for order placement and reconciliation. One implementation
/// per exchange/chain adapter; the gateway only sees this trait.
#[async_trait]
pub trait VenueClient: Send + Sync {
    fn name(&self) -> &str;

    async fn create_order(&self, request: &OrderRequest) -> Result<VenueOrder>;

    async fn fetch_order(&self, venue_order_id: &str) -> Result<VenueOrder>;

    async fn cancel_order(&self, venue_order_id: &str) -> Result<bool>;

    async fn fetch_balance(&self) -> Result<AccountBalance>;

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;
}

/// Indicator math behind the configuration manager.
#[async_trait]
pub trait IndicatorCalculator: Send + Sync {
    async fn calculate(
        &self,
        config: &IndicatorConfig,
        candles: &[Candle],
    ) -> Result<serde_json::Value>;
}

/// Optional ML forecaster consulted during position sizing. Absence of a
/// predictor is normal; predictions reshape size and confidence but never
/// veto a trade by themselves.
#[async_trait]
pub trait PricePredictor: Send + Sync {
    async fn predict(&self, symbol: &str) -> Result<PricePrediction>;
}

/// Pluggable strategy production. When no generator is wired in (or it
/// fails), the lifecycle engine falls back to parameterised templates.
#[async_trait]
pub trait StrategyGenerator: Send + Sync {
    async fn generate_systematic(
        &self,
        count: u32,
        types: &[StrategyType],
    ) -> Result<Vec<Strategy>>;

    async fn generate_improved(
        &self,
        base: &Strategy,
        target: &str,
        count: u32,
    ) -> Result<Vec<Strategy>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub win_rate: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub max_drawdown: f64,
    pub total_return: f64,
    pub cagr: f64,
    pub profit_factor: f64,
    pub total_trades: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub entry_ts: i64,
    pub exit_ts: i64,
    pub pnl_usd: Decimal,
    pub return_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    /// Unix epoch seconds.
    pub ts: i64,
    pub equity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub metrics: BacktestMetrics,
    pub trades: Vec<ClosedTrade>,
    pub equity_curve: Vec<EquityPoint>,
}

/// Strategy simulation over historical candles and sentiment windows.
#[async_trait]
pub trait BacktestEngine: Send + Sync {
    async fn run(
        &self,
        strategy: &Strategy,
        candles: &[Candle],
        symbol_sentiment: &[f64],
        global_sentiment: &[f64],
    ) -> Result<BacktestReport>;
}
