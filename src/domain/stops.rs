use crate::domain::trading::OrderSide;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopType {
    Fixed,
    Trailing,
    Volatility,
    Atr,
    #[serde(rename = "sr")]
    SupportResistance,
}

impl fmt::Display for StopType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopType::Fixed => "fixed",
            StopType::Trailing => "trailing",
            StopType::Volatility => "volatility",
            StopType::Atr => "atr",
            StopType::SupportResistance => "sr",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    Active,
    Triggered,
    Cancelled,
    Modified,
    Expired,
}

/// Per-order stop behaviour knobs. Percent fields are in percent units
/// (3.0 = 3%), matching the wire contracts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossConfig {
    pub stop_type: StopType,
    pub initial_stop_percent: f64,
    pub trailing_distance_percent: f64,
    pub min_profit_before_trail: f64,
    pub atr_multiplier: f64,
    pub volatility_multiplier: f64,
    pub support_resistance_buffer: f64,
    pub time_decay_enabled: bool,
    pub breakeven_protection: bool,
}

impl Default for StopLossConfig {
    fn default() -> Self {
        Self {
            stop_type: StopType::Fixed,
            initial_stop_percent: 3.0,
            trailing_distance_percent: 2.0,
            min_profit_before_trail: 1.0,
            atr_multiplier: 2.0,
            volatility_multiplier: 2.0,
            support_resistance_buffer: 0.5,
            time_decay_enabled: false,
            breakeven_protection: true,
        }
    }
}

/// A protective stop attached to one position.
///
/// Invariant while `status == Active` on a long position:
/// `stop_price <= current_price`, and `stop_price` never decreases.
/// Shorts are symmetric: `stop_price >= current_price`, never increases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossOrder {
    pub id: String,
    pub position_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub status: StopStatus,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub stop_price: Decimal,
    pub initial_stop_price: Decimal,
    pub highest_price: Decimal,
    pub lowest_price: Decimal,
    pub quantity: Decimal,
    pub config: StopLossConfig,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl StopLossOrder {
    /// Profit of the protected position, in percent of entry.
    pub fn profit_percent(&self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        if self.entry_price.is_zero() {
            return 0.0;
        }
        let raw = match self.side {
            OrderSide::Buy => (self.current_price - self.entry_price) / self.entry_price,
            OrderSide::Sell => (self.entry_price - self.current_price) / self.entry_price,
        };
        raw.to_f64().unwrap_or(0.0) * 100.0
    }

    /// True when the market has crossed the stop.
    pub fn is_breached(&self, price: Decimal) -> bool {
        match self.side {
            OrderSide::Buy => price <= self.stop_price,
            OrderSide::Sell => price >= self.stop_price,
        }
    }
}

/// Emitted whenever a stop moves by more than the update threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossUpdate {
    pub order_id: String,
    pub old_stop_price: Decimal,
    pub new_stop_price: Decimal,
    pub reason: String,
    pub ts: DateTime<Utc>,
}
