//! Wire payloads exchanged over the fabric. Field names are the contract;
//! everything here is plain serde data with no behaviour beyond
//! construction helpers.

use crate::domain::risk::PricePrediction;
use crate::domain::trading::OrderSide;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Risk gate RPC (§ risk.check)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCheckRequest {
    pub request_id: String,
    pub symbol: String,
    pub strategy_id: String,
    pub order_type: String,
    pub order_side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub signal_strength: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCheckResponse {
    pub request_id: String,
    pub approved: bool,
    pub recommended_quantity: Decimal,
    pub max_loss_usd: Decimal,
    pub confidence_score: f64,
    pub risk_factors: BTreeMap<String, f64>,
    pub warnings: Vec<String>,
    pub stop_loss_price: Option<Decimal>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub price_prediction: Option<PricePrediction>,
}

impl RiskCheckResponse {
    /// The gate never surfaces internal failures as errors to the caller.
    pub fn internal_error(request_id: &str, detail: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            approved: false,
            recommended_quantity: Decimal::ZERO,
            max_loss_usd: Decimal::ZERO,
            confidence_score: 0.0,
            risk_factors: BTreeMap::from([("internal_error".to_string(), 10.0)]),
            warnings: Vec::new(),
            stop_loss_price: None,
            reason: format!("Risk check error: {}", detail),
            timestamp: Utc::now(),
            price_prediction: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Stop-loss trigger (§ order.execution)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossTriggerEvent {
    pub order_id: String,
    pub position_id: String,
    pub symbol: String,
    pub order_type: String,
    pub quantity: Decimal,
    pub trigger_price: Decimal,
    pub stop_price: Decimal,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl StopLossTriggerEvent {
    pub fn market_sell(
        order_id: &str,
        position_id: &str,
        symbol: &str,
        quantity: Decimal,
        trigger_price: Decimal,
        stop_price: Decimal,
    ) -> Self {
        Self {
            order_id: order_id.to_string(),
            position_id: position_id.to_string(),
            symbol: symbol.to_string(),
            order_type: "market_sell".to_string(),
            quantity,
            trigger_price,
            stop_price,
            reason: "stop_loss_triggered".to_string(),
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Portfolio update (§ portfolio.updates)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioRiskUpdate {
    pub update_id: String,
    pub portfolio_value: Decimal,
    pub total_exposure: Decimal,
    pub leverage_ratio: f64,
    pub var_1d: Decimal,
    pub current_drawdown: f64,
    pub risk_score: f64,
    pub risk_level: String,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Indicator configuration requests and responses (§ indicator_config)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigAddRequest {
    pub configuration: serde_json::Value,
    #[serde(default)]
    pub calculate_immediately: bool,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigUpdateRequest {
    pub configuration_id: String,
    pub strategy_id: String,
    pub updates: serde_json::Value,
    #[serde(default)]
    pub recalculate_immediately: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigRemoveRequest {
    pub configuration_id: String,
    pub strategy_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigBulkRequest {
    pub configuration_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSubscribeRequest {
    pub name: String,
    pub configuration_ids: Vec<String>,
    pub reply_to: String,
}

/// Envelope for all `config.request.*` responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub status: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ConfigResponse {
    pub fn success(action: &str, configuration_id: Option<String>, strategy_id: Option<String>) -> Self {
        Self {
            status: "success".to_string(),
            action: action.to_string(),
            configuration_id,
            strategy_id,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(action: &str, error: &str) -> Self {
        Self {
            status: "error".to_string(),
            action: action.to_string(),
            configuration_id: None,
            strategy_id: None,
            error: Some(error.to_string()),
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Strategy data requests (§ mastertrade.strategy.requests)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyDataType {
    TechnicalIndicators,
    VolumeProfile,
    OrderFlow,
    LiquidityZones,
    SentimentData,
    CorrelationMatrix,
    MacroIndicators,
    AlternativeData,
    CustomComposite,
}

impl fmt::Display for StrategyDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyDataType::TechnicalIndicators => "technical_indicators",
            StrategyDataType::VolumeProfile => "volume_profile",
            StrategyDataType::OrderFlow => "order_flow",
            StrategyDataType::LiquidityZones => "liquidity_zones",
            StrategyDataType::SentimentData => "sentiment_data",
            StrategyDataType::CorrelationMatrix => "correlation_matrix",
            StrategyDataType::MacroIndicators => "macro_indicators",
            StrategyDataType::AlternativeData => "alternative_data",
            StrategyDataType::CustomComposite => "custom_composite",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl fmt::Display for RequestPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestPriority::Low => "low",
            RequestPriority::Normal => "normal",
            RequestPriority::High => "high",
            RequestPriority::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDataRequest {
    pub request_id: String,
    pub strategy_id: String,
    pub data_type: StrategyDataType,
    pub priority: RequestPriority,
    pub symbols: Vec<String>,
    pub interval: Option<String>,
    pub lookback_periods: Option<u32>,
    pub parameters: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl StrategyDataRequest {
    pub fn routing_key(&self) -> String {
        super::topics::keys::strategy_request(&self.data_type.to_string(), &self.priority.to_string())
    }
}

/// Tagged market-data response payloads. The discriminator replaces the
/// free-form dicts the services used to exchange; consumers match on the
/// variant instead of probing keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "data_type", rename_all = "snake_case")]
pub enum MarketDataPayload {
    TechnicalIndicators {
        symbol: String,
        interval: String,
        values: serde_json::Value,
    },
    VolumeProfile {
        symbol: String,
        buckets: Vec<VolumeBucket>,
    },
    OrderFlow {
        symbol: String,
        buy_volume: Decimal,
        sell_volume: Decimal,
        imbalance: f64,
    },
    LiquidityZones {
        symbol: String,
        zones: Vec<LiquidityZone>,
    },
    SentimentData {
        symbol: Option<String>,
        polarity: f64,
        sample_count: u32,
    },
    CorrelationMatrix {
        symbols: Vec<String>,
        matrix: Vec<Vec<f64>>,
    },
    MacroIndicators {
        indicators: BTreeMap<String, f64>,
    },
    AlternativeData {
        source: String,
        values: serde_json::Value,
    },
    CustomComposite {
        components: Vec<serde_json::Value>,
    },
}

impl MarketDataPayload {
    pub fn data_type(&self) -> StrategyDataType {
        match self {
            MarketDataPayload::TechnicalIndicators { .. } => StrategyDataType::TechnicalIndicators,
            MarketDataPayload::VolumeProfile { .. } => StrategyDataType::VolumeProfile,
            MarketDataPayload::OrderFlow { .. } => StrategyDataType::OrderFlow,
            MarketDataPayload::LiquidityZones { .. } => StrategyDataType::LiquidityZones,
            MarketDataPayload::SentimentData { .. } => StrategyDataType::SentimentData,
            MarketDataPayload::CorrelationMatrix { .. } => StrategyDataType::CorrelationMatrix,
            MarketDataPayload::MacroIndicators { .. } => StrategyDataType::MacroIndicators,
            MarketDataPayload::AlternativeData { .. } => StrategyDataType::AlternativeData,
            MarketDataPayload::CustomComposite { .. } => StrategyDataType::CustomComposite,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeBucket {
    pub price_low: Decimal,
    pub price_high: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityZone {
    pub price: Decimal,
    pub depth_usd: Decimal,
    pub side: OrderSide,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataResponse {
    pub request_id: String,
    pub strategy_id: String,
    pub payload: MarketDataPayload,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Position fill events (§ portfolio.updates, portfolio.position.*)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionFillEvent {
    pub order_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_risk_check_request_roundtrip() {
        let req = RiskCheckRequest {
            request_id: "req-1".to_string(),
            symbol: "BTC/USDT".to_string(),
            strategy_id: "strat-1".to_string(),
            order_type: "market".to_string(),
            order_side: OrderSide::Buy,
            quantity: dec!(0.5),
            price: dec!(30000),
            signal_strength: 0.8,
            timestamp: Utc::now(),
            metadata: serde_json::json!({}),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"order_side\":\"BUY\""));
        let back: RiskCheckRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.request_id, "req-1");
    }

    #[test]
    fn test_market_data_payload_discriminator() {
        let payload = MarketDataPayload::OrderFlow {
            symbol: "ETH/USDT".to_string(),
            buy_volume: dec!(120),
            sell_volume: dec!(100),
            imbalance: 0.09,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["data_type"], "order_flow");
        let back: MarketDataPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.data_type(), StrategyDataType::OrderFlow);
    }

    #[test]
    fn test_strategy_request_routing_key() {
        let req = StrategyDataRequest {
            request_id: "r".to_string(),
            strategy_id: "s".to_string(),
            data_type: StrategyDataType::SentimentData,
            priority: RequestPriority::High,
            symbols: vec!["BTC/USDT".to_string()],
            interval: None,
            lookback_periods: None,
            parameters: serde_json::json!({}),
            timestamp: Utc::now(),
        };
        assert_eq!(req.routing_key(), "strategy.request.sentiment_data.high");
    }

    #[test]
    fn test_internal_error_response_shape() {
        let resp = RiskCheckResponse::internal_error("req-9", "store unreachable");
        assert!(!resp.approved);
        assert_eq!(resp.confidence_score, 0.0);
        assert_eq!(resp.risk_factors.get("internal_error"), Some(&10.0));
        assert!(resp.reason.starts_with("Risk check error:"));
    }

    #[test]
    fn test_stop_trigger_constructor() {
        let event = StopLossTriggerEvent::market_sell(
            "stop-1", "pos-1", "BTC/USDT", dec!(0.5), dec!(99.1), dec!(99.18),
        );
        assert_eq!(event.order_type, "market_sell");
        assert_eq!(event.reason, "stop_loss_triggered");
    }
}
