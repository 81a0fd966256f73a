use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::StopMarket => write!(f, "STOP_MARKET"),
        }
    }
}

/// Terminal and in-flight states reported by venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueOrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl VenueOrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            VenueOrderStatus::Filled
                | VenueOrderStatus::Canceled
                | VenueOrderStatus::Rejected
                | VenueOrderStatus::Expired
        )
    }
}

impl fmt::Display for VenueOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Order submitted to a venue through the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    /// Limit price; ignored for market orders.
    pub price: Option<Decimal>,
    pub strategy_id: String,
    pub signal_id: String,
}

/// Venue-side view of an order, as returned by `VenueClient`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueOrder {
    pub venue_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub status: VenueOrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An open position as read from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub strategy_id: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Market value in quote currency (USD for */USD pairs).
    pub fn market_value(&self) -> Decimal {
        self.quantity * self.current_price
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        match self.side {
            OrderSide::Buy => (self.current_price - self.entry_price) * self.quantity,
            OrderSide::Sell => (self.entry_price - self.current_price) * self.quantity,
        }
    }
}

/// Account-level balance snapshot used by the sizing engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub total_balance_usd: Decimal,
    pub available_balance_usd: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Coarse asset-class buckets for exposure limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    MajorCrypto,
    LargeCap,
    Stablecoin,
    Defi,
    Other,
}

const MAJORS: &[&str] = &["BTC", "ETH"];
const LARGE_CAPS: &[&str] = &["BNB", "SOL", "XRP", "ADA", "AVAX", "DOT", "LINK"];
const STABLECOINS: &[&str] = &["USDT", "USDC", "DAI", "BUSD", "TUSD"];
const DEFI: &[&str] = &["UNI", "AAVE", "COMP", "MKR", "CRV", "SNX", "SUSHI"];

/// Classify a pair symbol (`"BTC/USDT"` or bare base `"BTC"`) by its base asset.
pub fn asset_class(symbol: &str) -> AssetClass {
    let base = symbol.split('/').next().unwrap_or(symbol);
    if MAJORS.contains(&base) {
        AssetClass::MajorCrypto
    } else if LARGE_CAPS.contains(&base) {
        AssetClass::LargeCap
    } else if STABLECOINS.contains(&base) {
        AssetClass::Stablecoin
    } else if DEFI.contains(&base) {
        AssetClass::Defi
    } else {
        AssetClass::Other
    }
}

/// Per-class risk multiplier applied to volatility-derived stops.
pub fn risk_multiplier(symbol: &str) -> f64 {
    match asset_class(symbol) {
        AssetClass::MajorCrypto => 1.0,
        AssetClass::LargeCap => 1.2,
        AssetClass::Stablecoin => 0.1,
        AssetClass::Defi => 1.5,
        AssetClass::Other => 1.3,
    }
}

/// Lot-size rounding: 6 decimals for majors, 4 for stable pairs, 2 otherwise.
pub fn round_to_lot(quantity: Decimal, symbol: &str) -> Decimal {
    let dp = match asset_class(symbol) {
        AssetClass::MajorCrypto => 6,
        AssetClass::Stablecoin => 4,
        _ => 2,
    };
    quantity.round_dp(dp)
}
