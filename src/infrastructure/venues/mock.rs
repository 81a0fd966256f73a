//! Mock venue used by tests and the mock runtime mode. Orders fill
//! immediately at the stored price; candles are a deterministic random
//! walk so backtests have data without a live venue.

use crate::domain::market::Candle;
use crate::domain::ports::VenueClient;
use crate::domain::trading::{
    AccountBalance, OrderRequest, OrderSide, VenueOrder, VenueOrderStatus,
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

pub struct MockVenueClient {
    name: String,
    prices: RwLock<HashMap<String, Decimal>>,
    orders: RwLock<HashMap<String, VenueOrder>>,
    balance: RwLock<AccountBalance>,
    /// When false, created orders stay `New` until `fill_all` is called.
    immediate_fill: bool,
}

impl MockVenueClient {
    pub fn new(name: &str, starting_balance_usd: Decimal) -> Self {
        Self {
            name: name.to_string(),
            prices: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
            balance: RwLock::new(AccountBalance {
                total_balance_usd: starting_balance_usd,
                available_balance_usd: starting_balance_usd,
                updated_at: Utc::now(),
            }),
            immediate_fill: true,
        }
    }

    pub fn with_deferred_fills(mut self) -> Self {
        self.immediate_fill = false;
        self
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }

    async fn price_of(&self, symbol: &str) -> Decimal {
        self.prices
            .read()
            .await
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::from(100))
    }

    /// Transition all open orders to filled at current prices.
    pub async fn fill_all(&self) {
        let prices = self.prices.read().await.clone();
        let mut orders = self.orders.write().await;
        for order in orders.values_mut() {
            if !order.status.is_terminal() {
                let price = prices
                    .get(&order.symbol)
                    .copied()
                    .unwrap_or(Decimal::from(100));
                order.status = VenueOrderStatus::Filled;
                order.filled_quantity = order.quantity;
                order.avg_fill_price = Some(price);
                order.updated_at = Utc::now();
            }
        }
    }
}

#[async_trait]
impl VenueClient for MockVenueClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<VenueOrder> {
        let price = match request.price {
            Some(p) => p,
            None => self.price_of(&request.symbol).await,
        };
        let now = Utc::now();
        let (status, filled, avg) = if self.immediate_fill {
            (VenueOrderStatus::Filled, request.quantity, Some(price))
        } else {
            (VenueOrderStatus::New, Decimal::ZERO, None)
        };
        let order = VenueOrder {
            venue_order_id: Uuid::new_v4().to_string(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            filled_quantity: filled,
            avg_fill_price: avg,
            status,
            created_at: now,
            updated_at: now,
        };
        info!(
            "MockVenue[{}]: {} {} {} @ {} ({:?})",
            self.name, order.side, order.quantity, order.symbol, price, order.status
        );
        self.orders
            .write()
            .await
            .insert(order.venue_order_id.clone(), order.clone());
        Ok(order)
    }

    async fn fetch_order(&self, venue_order_id: &str) -> Result<VenueOrder> {
        self.orders
            .read()
            .await
            .get(venue_order_id)
            .cloned()
            .ok_or_else(|| anyhow!("MockVenue[{}]: unknown order {}", self.name, venue_order_id))
    }

    async fn cancel_order(&self, venue_order_id: &str) -> Result<bool> {
        let mut orders = self.orders.write().await;
        match orders.get_mut(venue_order_id) {
            Some(order) if !order.status.is_terminal() => {
                order.status = VenueOrderStatus::Canceled;
                order.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn fetch_balance(&self) -> Result<AccountBalance> {
        Ok(self.balance.read().await.clone())
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let step = timeframe_seconds(timeframe);
        let base = self.price_of(symbol).await;
        let mut base_f = rust_decimal::prelude::ToPrimitive::to_f64(&base).unwrap_or(100.0);

        let mut candles = Vec::new();
        let mut ts = start.timestamp();
        let end_ts = end.timestamp();
        let mut i: u64 = 0;
        while ts < end_ts {
            // Deterministic pseudo-walk keyed on the slot index.
            let seed = (i + 1).wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let step_pct = (((seed / 65_536) % 1_000) as f64 / 1_000.0 - 0.5) * 0.02;
            let open = base_f;
            let close = open * (1.0 + step_pct);
            let high = open.max(close) * 1.002;
            let low = open.min(close) * 0.998;
            base_f = close;
            candles.push(Candle {
                symbol: symbol.to_string(),
                open: Decimal::from_f64(open).unwrap_or(base),
                high: Decimal::from_f64(high).unwrap_or(base),
                low: Decimal::from_f64(low).unwrap_or(base),
                close: Decimal::from_f64(close).unwrap_or(base),
                volume: Decimal::from(1_000 + (seed % 9_000)),
                timestamp: ts,
            });
            ts += step;
            i += 1;
        }
        Ok(candles)
    }
}

fn timeframe_seconds(timeframe: &str) -> i64 {
    match timeframe {
        "1m" => 60,
        "5m" => 300,
        "15m" => 900,
        "1h" => 3_600,
        "4h" => 14_400,
        "1d" => 86_400,
        _ => 3_600,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::OrderType;
    use rust_decimal_macros::dec;

    fn request(symbol: &str) -> OrderRequest {
        OrderRequest {
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: dec!(0.5),
            price: None,
            strategy_id: "s1".to_string(),
            signal_id: "sig1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_immediate_fill_at_set_price() {
        let venue = MockVenueClient::new("mock", dec!(100000));
        venue.set_price("BTC/USDT", dec!(30000)).await;
        let order = venue.create_order(&request("BTC/USDT")).await.unwrap();
        assert_eq!(order.status, VenueOrderStatus::Filled);
        assert_eq!(order.avg_fill_price, Some(dec!(30000)));
    }

    #[tokio::test]
    async fn test_deferred_fill_lifecycle() {
        let venue = MockVenueClient::new("mock", dec!(100000)).with_deferred_fills();
        let order = venue.create_order(&request("ETH/USDT")).await.unwrap();
        assert_eq!(order.status, VenueOrderStatus::New);

        venue.fill_all().await;
        let fetched = venue.fetch_order(&order.venue_order_id).await.unwrap();
        assert_eq!(fetched.status, VenueOrderStatus::Filled);
        assert_eq!(fetched.filled_quantity, dec!(0.5));
    }

    #[tokio::test]
    async fn test_cancel_only_open_orders() {
        let venue = MockVenueClient::new("mock", dec!(100000)).with_deferred_fills();
        let order = venue.create_order(&request("ETH/USDT")).await.unwrap();
        assert!(venue.cancel_order(&order.venue_order_id).await.unwrap());
        assert!(!venue.cancel_order(&order.venue_order_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_candles_cover_window() {
        let venue = MockVenueClient::new("mock", dec!(100000));
        venue.set_price("BTC/USDT", dec!(30000)).await;
        let end = Utc::now();
        let start = end - chrono::Duration::days(5);
        let candles = venue
            .fetch_candles("BTC/USDT", "1h", start, end)
            .await
            .unwrap();
        assert_eq!(candles.len(), 120);
        assert!(candles.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }
}
