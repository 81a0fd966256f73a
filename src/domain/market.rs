use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Venue category a quote came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceKind {
    Cex,
    Dex,
}

impl fmt::Display for PriceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceKind::Cex => write!(f, "cex"),
            PriceKind::Dex => write!(f, "dex"),
        }
    }
}

/// A single quote observed on a venue. Shared between the market cache and
/// the stores; consumers never mutate one in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePoint {
    pub kind: PriceKind,
    pub venue: String,
    /// Chain name for DEX quotes (e.g. "ethereum", "arbitrum").
    pub chain: Option<String>,
    /// DEX protocol for on-chain quotes (e.g. "uniswap_v3").
    pub dex: Option<String>,
    pub pair: String,
    pub price: Decimal,
    pub liquidity_usd: Option<Decimal>,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub ts: DateTime<Utc>,
}

impl PricePoint {
    pub fn cex(venue: &str, pair: &str, price: Decimal) -> Self {
        Self {
            kind: PriceKind::Cex,
            venue: venue.to_string(),
            chain: None,
            dex: None,
            pair: pair.to_string(),
            price,
            liquidity_usd: None,
            bid: None,
            ask: None,
            ts: Utc::now(),
        }
    }

    pub fn dex(venue: &str, chain: &str, dex: &str, pair: &str, price: Decimal) -> Self {
        Self {
            kind: PriceKind::Dex,
            venue: venue.to_string(),
            chain: Some(chain.to_string()),
            dex: Some(dex.to_string()),
            pair: pair.to_string(),
            price,
            liquidity_usd: None,
            bid: None,
            ask: None,
            ts: Utc::now(),
        }
    }

    pub fn with_liquidity(mut self, liquidity_usd: Decimal) -> Self {
        self.liquidity_usd = Some(liquidity_usd);
        self
    }

    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.ts).num_seconds()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Unix epoch seconds, candle open time.
    pub timestamp: i64,
}

/// Aggregated sentiment observation for a symbol (or the whole market when
/// `symbol` is `None`), polarity in [-1, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentSnapshot {
    pub symbol: Option<String>,
    pub polarity: f64,
    pub sample_count: u32,
    pub ts: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_point_age() {
        let mut point = PricePoint::cex("binance", "BTC/USDT", dec!(30000));
        point.ts = Utc::now() - Duration::seconds(45);
        let age = point.age_seconds(Utc::now());
        assert!((44..=46).contains(&age));
    }

    #[test]
    fn test_dex_constructor_sets_chain() {
        let point = PricePoint::dex("uniswap_v3", "ethereum", "uniswap_v3", "ETH/USDC", dec!(2000));
        assert_eq!(point.kind, PriceKind::Dex);
        assert_eq!(point.chain.as_deref(), Some("ethereum"));
    }
}
