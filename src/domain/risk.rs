use crate::domain::trading::OrderSide;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Input to the position sizing engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSizeRequest {
    pub symbol: String,
    pub strategy_id: String,
    /// Signal conviction in [0, 1].
    pub signal_strength: f64,
    pub current_price: Decimal,
    /// Annualised daily sigma; looked up from history when absent.
    pub volatility: Option<f64>,
    pub stop_loss_percent: Option<f64>,
    pub risk_per_trade_percent: Option<f64>,
    pub order_side: OrderSide,
}

/// Per-dimension risk scores, each 0 (none) to 10 (severe).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskFactors {
    pub volatility_risk: f64,
    pub liquidity_risk: f64,
    pub asset_class_risk: f64,
    pub signal_risk: f64,
    pub time_risk: f64,
    pub concentration_risk: f64,
    pub prediction_alignment: f64,
}

impl RiskFactors {
    pub fn average(&self) -> f64 {
        (self.volatility_risk
            + self.liquidity_risk
            + self.asset_class_risk
            + self.signal_risk
            + self.time_risk
            + self.concentration_risk
            + self.prediction_alignment)
            / 7.0
    }

    pub fn as_map(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("volatility_risk".to_string(), self.volatility_risk),
            ("liquidity_risk".to_string(), self.liquidity_risk),
            ("asset_class_risk".to_string(), self.asset_class_risk),
            ("signal_risk".to_string(), self.signal_risk),
            ("time_risk".to_string(), self.time_risk),
            ("concentration_risk".to_string(), self.concentration_risk),
            ("prediction_alignment".to_string(), self.prediction_alignment),
        ])
    }
}

/// Output of the position sizing engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSizeResult {
    pub recommended_size_usd: Decimal,
    pub recommended_quantity: Decimal,
    pub position_risk_percent: f64,
    pub stop_loss_price: Decimal,
    pub stop_loss_percent: f64,
    pub max_loss_usd: Decimal,
    pub confidence_score: f64,
    pub risk_factors: RiskFactors,
    pub warnings: Vec<String>,
    pub approved: bool,
    pub rejection_reason: Option<String>,
    pub prediction: Option<PricePrediction>,
}

/// Forecast returned by the optional `PricePredictor` port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePrediction {
    pub symbol: String,
    pub predicted_change_percent: f64,
    pub direction: PredictedDirection,
    pub confidence: f64,
    pub horizon_hours: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictedDirection {
    Up,
    Down,
    Flat,
}

impl PredictedDirection {
    pub fn agrees_with(self, side: OrderSide) -> bool {
        matches!(
            (self, side),
            (PredictedDirection::Up, OrderSide::Buy) | (PredictedDirection::Down, OrderSide::Sell)
        )
    }

    pub fn opposes(self, side: OrderSide) -> bool {
        matches!(
            (self, side),
            (PredictedDirection::Down, OrderSide::Buy) | (PredictedDirection::Up, OrderSide::Sell)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Portfolio risk snapshot, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub ts: DateTime<Utc>,
    pub portfolio_value: Decimal,
    pub total_exposure: Decimal,
    pub cash: Decimal,
    pub leverage_ratio: f64,
    pub var_1d: Decimal,
    pub var_5d: Decimal,
    pub expected_shortfall: Decimal,
    pub max_drawdown: f64,
    pub current_drawdown: f64,
    pub hhi: f64,
    pub correlation_risk: f64,
    pub sector_exposure: BTreeMap<String, f64>,
    pub largest_position_percent: f64,
    pub positions_over_5_percent: u32,
    pub positions_over_10_percent: u32,
    pub avg_liquidity_usd: Decimal,
    pub illiquid_percent: f64,
    pub level: RiskLevel,
    /// Weighted composite, 0..100.
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAlert {
    pub id: String,
    pub alert_type: String,
    pub severity: RiskLevel,
    pub title: String,
    pub message: String,
    pub symbol: Option<String>,
    pub current_value: f64,
    pub threshold: f64,
    pub recommendation: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Drawdown-driven trading restriction ladder. Buckets are right-closed:
/// exactly 5% selects Warning, exactly 20% selects Level3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerLevel {
    Normal,
    Warning,
    Level1,
    Level2,
    Level3,
}

impl CircuitBreakerLevel {
    pub fn from_drawdown_percent(drawdown_pct: f64) -> Self {
        if drawdown_pct >= 20.0 {
            CircuitBreakerLevel::Level3
        } else if drawdown_pct >= 15.0 {
            CircuitBreakerLevel::Level2
        } else if drawdown_pct >= 10.0 {
            CircuitBreakerLevel::Level1
        } else if drawdown_pct >= 5.0 {
            CircuitBreakerLevel::Warning
        } else {
            CircuitBreakerLevel::Normal
        }
    }

    pub fn size_multiplier(self) -> f64 {
        match self {
            CircuitBreakerLevel::Normal => 1.0,
            CircuitBreakerLevel::Warning => 0.75,
            CircuitBreakerLevel::Level1 => 0.5,
            CircuitBreakerLevel::Level2 => 0.0,
            CircuitBreakerLevel::Level3 => 0.0,
        }
    }

    pub fn positions_allowed(self) -> bool {
        self < CircuitBreakerLevel::Level2
    }

    /// Level 3 additionally closes existing positions.
    pub fn close_all(self) -> bool {
        self == CircuitBreakerLevel::Level3
    }
}

impl fmt::Display for CircuitBreakerLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitBreakerLevel::Normal => "normal",
            CircuitBreakerLevel::Warning => "warning",
            CircuitBreakerLevel::Level1 => "level_1",
            CircuitBreakerLevel::Level2 => "level_2",
            CircuitBreakerLevel::Level3 => "level_3",
        };
        write!(f, "{}", s)
    }
}

/// Single-writer drawdown state; readers take snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownControl {
    pub peak_portfolio_value: Decimal,
    pub current_value: Decimal,
    pub current_drawdown_percent: f64,
    pub circuit_breaker_level: CircuitBreakerLevel,
    pub positions_allowed: bool,
    pub updated_at: DateTime<Utc>,
}

impl DrawdownControl {
    pub fn new(initial_value: Decimal) -> Self {
        Self {
            peak_portfolio_value: initial_value,
            current_value: initial_value,
            current_drawdown_percent: 0.0,
            circuit_breaker_level: CircuitBreakerLevel::Normal,
            positions_allowed: true,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskRegime {
    LowVolBullish,
    LowVolBearish,
    HighVolBullish,
    HighVolBearish,
    ExtremeVolatility,
    Crisis,
}

impl RiskRegime {
    pub fn size_multiplier(self) -> f64 {
        match self {
            RiskRegime::LowVolBullish | RiskRegime::LowVolBearish => 1.0,
            RiskRegime::HighVolBullish | RiskRegime::HighVolBearish => 0.5,
            RiskRegime::ExtremeVolatility | RiskRegime::Crisis => 0.25,
        }
    }

    pub fn is_high_vol(self) -> bool {
        matches!(self, RiskRegime::HighVolBullish | RiskRegime::HighVolBearish)
    }

    pub fn is_extreme(self) -> bool {
        matches!(self, RiskRegime::ExtremeVolatility | RiskRegime::Crisis)
    }
}

impl fmt::Display for RiskRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskRegime::LowVolBullish => "low_vol_bullish",
            RiskRegime::LowVolBearish => "low_vol_bearish",
            RiskRegime::HighVolBullish => "high_vol_bullish",
            RiskRegime::HighVolBearish => "high_vol_bearish",
            RiskRegime::ExtremeVolatility => "extreme_volatility",
            RiskRegime::Crisis => "crisis",
        };
        write!(f, "{}", s)
    }
}

/// Portfolio-wide correlation risk summary derived from the hourly matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationRiskMetrics {
    pub average_correlation: f64,
    /// Portfolio vol / weighted average vol; 1.0 means no diversification.
    pub diversification_ratio: f64,
    /// n / (1 + (n-1) * avg_corr), the number of independent bets.
    pub effective_assets: f64,
    /// min(100, avg_corr * 150).
    pub risk_score: f64,
    /// Groups of symbols pairwise correlated above the cluster threshold.
    pub clusters: Vec<Vec<String>>,
}

/// Regime- and volatility-adjusted stop parameters attached to every
/// approval result, including rejections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicStopLossParams {
    pub regime: RiskRegime,
    pub initial_stop_percent: f64,
    pub trailing_distance_percent: f64,
    pub atr_multiplier: f64,
    pub volatility_multiplier: f64,
}

/// Outcome of the advanced risk gate. Never an Err on the caller path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskApprovalResult {
    pub approved: bool,
    /// Multiplier applied to the requested size, 0..1.
    pub position_size_adjustment: f64,
    pub stop_loss_params: DynamicStopLossParams,
    pub risk_score: f64,
    pub risk_factors: BTreeMap<String, f64>,
    pub warnings: Vec<String>,
    pub rejections: Vec<String>,
    pub recommendations: Vec<String>,
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_breaker_buckets_right_closed() {
        assert_eq!(
            CircuitBreakerLevel::from_drawdown_percent(4.99),
            CircuitBreakerLevel::Normal
        );
        assert_eq!(
            CircuitBreakerLevel::from_drawdown_percent(5.0),
            CircuitBreakerLevel::Warning
        );
        assert_eq!(
            CircuitBreakerLevel::from_drawdown_percent(10.0),
            CircuitBreakerLevel::Level1
        );
        assert_eq!(
            CircuitBreakerLevel::from_drawdown_percent(15.0),
            CircuitBreakerLevel::Level2
        );
        assert_eq!(
            CircuitBreakerLevel::from_drawdown_percent(20.0),
            CircuitBreakerLevel::Level3
        );
    }

    #[test]
    fn test_positions_allowed_by_level() {
        assert!(CircuitBreakerLevel::Normal.positions_allowed());
        assert!(CircuitBreakerLevel::Warning.positions_allowed());
        assert!(CircuitBreakerLevel::Level1.positions_allowed());
        assert!(!CircuitBreakerLevel::Level2.positions_allowed());
        assert!(!CircuitBreakerLevel::Level3.positions_allowed());
        assert!(CircuitBreakerLevel::Level3.close_all());
    }

    #[test]
    fn test_size_multipliers() {
        assert_eq!(CircuitBreakerLevel::Warning.size_multiplier(), 0.75);
        assert_eq!(CircuitBreakerLevel::Level1.size_multiplier(), 0.5);
        assert_eq!(CircuitBreakerLevel::Level2.size_multiplier(), 0.0);
    }

    #[test]
    fn test_risk_factors_average() {
        let factors = RiskFactors {
            volatility_risk: 7.0,
            liquidity_risk: 7.0,
            asset_class_risk: 7.0,
            signal_risk: 7.0,
            time_risk: 7.0,
            concentration_risk: 7.0,
            prediction_alignment: 7.0,
        };
        assert!((factors.average() - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_prediction_direction_alignment() {
        assert!(PredictedDirection::Up.agrees_with(OrderSide::Buy));
        assert!(PredictedDirection::Down.agrees_with(OrderSide::Sell));
        assert!(PredictedDirection::Down.opposes(OrderSide::Buy));
        assert!(!PredictedDirection::Flat.agrees_with(OrderSide::Buy));
        assert!(!PredictedDirection::Flat.opposes(OrderSide::Sell));
    }
}
