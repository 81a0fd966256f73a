//! Order gateway: turns approved signals into venue orders, tracks them
//! until terminal, reconciles against the venue on each sweep, and emits
//! `portfolio.position.*` events on fills. Submissions are idempotent on
//! `(strategy_id, symbol, signal_id)`.

use crate::domain::ports::VenueClient;
use crate::domain::store::{Store, containers};
use crate::domain::trading::{
    OrderRequest, OrderSide, OrderType, Position, VenueOrder, VenueOrderStatus,
};
use crate::infrastructure::messaging::contracts::{PositionFillEvent, StopLossTriggerEvent};
use crate::infrastructure::messaging::{
    HandlerOutcome, Message, MessageFabric, MessageHandler, topics,
};
use crate::infrastructure::observability::Metrics;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const EXECUTION_QUEUE: &str = "order_executor.instructions";

/// A signal the risk gate has already approved.
#[derive(Debug, Clone)]
pub struct ApprovedSignal {
    pub signal_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
}

type IdempotencyKey = (String, String, String);

struct TrackedOrder {
    venue_order: VenueOrder,
    signal: ApprovedSignal,
    submitted_at: DateTime<Utc>,
}

pub struct OrderGateway {
    venue: Arc<dyn VenueClient>,
    store: Arc<dyn Store>,
    fabric: MessageFabric,
    prom: Metrics,
    order_timeout_secs: i64,
    active: Mutex<HashMap<IdempotencyKey, TrackedOrder>>,
}

impl OrderGateway {
    pub fn new(
        venue: Arc<dyn VenueClient>,
        store: Arc<dyn Store>,
        fabric: MessageFabric,
        prom: Metrics,
        order_timeout_secs: i64,
    ) -> Self {
        Self {
            venue,
            store,
            fabric,
            prom,
            order_timeout_secs,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Consume stop-loss triggers and position reductions.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        self.fabric
            .subscribe(
                EXECUTION_QUEUE,
                &[
                    (topics::exchanges::ORDER_EXECUTION, topics::keys::STOP_LOSS_TRIGGER),
                    (topics::exchanges::ORDER_EXECUTION, "order.position.reduce"),
                ],
                Arc::clone(&self) as Arc<dyn MessageHandler>,
                Some(20),
            )
            .await?;
        info!("OrderGateway: consuming on {}", EXECUTION_QUEUE);
        Ok(())
    }

    /// Submit an approved signal. Duplicate submissions return the
    /// existing venue order.
    pub async fn submit(&self, signal: ApprovedSignal) -> Result<VenueOrder> {
        let key = (
            signal.strategy_id.clone(),
            signal.symbol.clone(),
            signal.signal_id.clone(),
        );
        {
            let active = self.active.lock().await;
            if let Some(existing) = active.get(&key) {
                info!(
                    "OrderGateway: duplicate signal {} for {}, returning existing order",
                    signal.signal_id, signal.symbol
                );
                return Ok(existing.venue_order.clone());
            }
        }

        let request = OrderRequest {
            symbol: signal.symbol.clone(),
            side: signal.side,
            order_type: if signal.limit_price.is_some() {
                OrderType::Limit
            } else {
                OrderType::Market
            },
            quantity: signal.quantity,
            price: signal.limit_price,
            strategy_id: signal.strategy_id.clone(),
            signal_id: signal.signal_id.clone(),
        };
        let venue_order = self.venue.create_order(&request).await?;
        self.prom
            .orders_total
            .with_label_values(&[self.venue.name(), &venue_order.status.to_string()])
            .inc();
        info!(
            "OrderGateway: submitted {} {} {} ({} on {})",
            signal.side, signal.quantity, signal.symbol, venue_order.venue_order_id, self.venue.name()
        );

        if venue_order.status.is_terminal() {
            self.settle(&signal, &venue_order).await;
        } else {
            self.active.lock().await.insert(
                key,
                TrackedOrder {
                    venue_order: venue_order.clone(),
                    signal,
                    submitted_at: Utc::now(),
                },
            );
        }
        Ok(venue_order)
    }

    /// Reconcile all active orders against the venue. Orders past the
    /// timeout are cancelled and dropped as failed.
    pub async fn reconcile(&self) -> Result<()> {
        let keys: Vec<IdempotencyKey> = self.active.lock().await.keys().cloned().collect();
        for key in keys {
            let (venue_order_id, signal, submitted_at) = {
                let active = self.active.lock().await;
                let Some(tracked) = active.get(&key) else { continue };
                (
                    tracked.venue_order.venue_order_id.clone(),
                    tracked.signal.clone(),
                    tracked.submitted_at,
                )
            };

            match self.venue.fetch_order(&venue_order_id).await {
                Ok(current) if current.status.is_terminal() => {
                    self.active.lock().await.remove(&key);
                    self.settle(&signal, &current).await;
                }
                Ok(_) => {
                    let age = (Utc::now() - submitted_at).num_seconds();
                    if age > self.order_timeout_secs {
                        warn!(
                            "OrderGateway: order {} timed out after {}s, cancelling",
                            venue_order_id, age
                        );
                        let _ = self.venue.cancel_order(&venue_order_id).await;
                        self.active.lock().await.remove(&key);
                        self.prom
                            .orders_total
                            .with_label_values(&[self.venue.name(), "failed"])
                            .inc();
                    }
                }
                Err(e) => warn!(
                    "OrderGateway: reconcile fetch failed for {}: {}",
                    venue_order_id, e
                ),
            }
        }
        Ok(())
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Update the position book and announce the fill.
    async fn settle(&self, signal: &ApprovedSignal, order: &VenueOrder) {
        if order.status != VenueOrderStatus::Filled {
            self.prom
                .orders_total
                .with_label_values(&[self.venue.name(), &order.status.to_string()])
                .inc();
            return;
        }
        let fill_price = order.avg_fill_price.unwrap_or(Decimal::ZERO);
        if let Err(e) = self.apply_fill(signal, order, fill_price).await {
            warn!("OrderGateway: position update failed: {}", e);
        }

        let event = PositionFillEvent {
            order_id: order.venue_order_id.clone(),
            strategy_id: signal.strategy_id.clone(),
            symbol: signal.symbol.clone(),
            side: signal.side,
            filled_quantity: order.filled_quantity,
            avg_fill_price: fill_price,
            timestamp: Utc::now(),
        };
        if let Err(e) = self
            .fabric
            .publish_json(
                topics::exchanges::PORTFOLIO_UPDATES,
                &topics::keys::portfolio_position(&signal.symbol),
                &event,
            )
            .await
        {
            warn!("OrderGateway: fill event publish failed: {}", e);
        }
    }

    async fn apply_fill(
        &self,
        signal: &ApprovedSignal,
        order: &VenueOrder,
        fill_price: Decimal,
    ) -> Result<()> {
        let existing = self
            .store
            .query(
                containers::POSITIONS,
                &crate::domain::store::QueryFilter::new().eq("symbol", signal.symbol.as_str()),
            )
            .await?
            .into_iter()
            .next()
            .and_then(|d| serde_json::from_value::<Position>(d).ok());

        match (existing, signal.side) {
            (Some(mut position), OrderSide::Buy) => {
                let total_cost = position.entry_price * position.quantity
                    + fill_price * order.filled_quantity;
                position.quantity += order.filled_quantity;
                if position.quantity > Decimal::ZERO {
                    position.entry_price = (total_cost / position.quantity).round_dp(8);
                }
                position.current_price = fill_price;
                self.store
                    .upsert(containers::POSITIONS, &serde_json::to_value(&position)?)
                    .await?;
            }
            (Some(mut position), OrderSide::Sell) => {
                position.quantity -= order.filled_quantity;
                position.current_price = fill_price;
                if position.quantity <= Decimal::ZERO {
                    self.store
                        .delete(containers::POSITIONS, &position.id, &position.symbol)
                        .await?;
                } else {
                    self.store
                        .upsert(containers::POSITIONS, &serde_json::to_value(&position)?)
                        .await?;
                }
            }
            (None, OrderSide::Buy) => {
                let position = Position {
                    id: Uuid::new_v4().to_string(),
                    symbol: signal.symbol.clone(),
                    strategy_id: signal.strategy_id.clone(),
                    side: OrderSide::Buy,
                    quantity: order.filled_quantity,
                    entry_price: fill_price,
                    current_price: fill_price,
                    opened_at: Utc::now(),
                };
                self.store
                    .upsert(containers::POSITIONS, &serde_json::to_value(&position)?)
                    .await?;
            }
            (None, OrderSide::Sell) => {
                warn!(
                    "OrderGateway: sell fill for {} with no tracked position",
                    signal.symbol
                );
            }
        }
        Ok(())
    }

    /// Reconciliation sweep driven by price updates and a fallback timer.
    pub async fn run_monitoring_loop(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(2));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!("OrderGateway: reconcile sweep failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("OrderGateway: shutdown");
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl MessageHandler for OrderGateway {
    async fn handle(&self, message: Message) -> HandlerOutcome {
        match message.routing_key.as_str() {
            topics::keys::STOP_LOSS_TRIGGER => {
                let event: StopLossTriggerEvent =
                    match serde_json::from_value(message.payload.clone()) {
                        Ok(e) => e,
                        Err(e) => {
                            warn!("OrderGateway: unparseable stop trigger: {}", e);
                            return HandlerOutcome::Nack;
                        }
                    };
                let signal = ApprovedSignal {
                    signal_id: event.order_id.clone(),
                    strategy_id: "stop_loss".to_string(),
                    symbol: event.symbol.clone(),
                    side: OrderSide::Sell,
                    quantity: event.quantity,
                    limit_price: None,
                };
                match self.submit(signal).await {
                    Ok(_) => HandlerOutcome::Ack,
                    Err(e) => {
                        warn!("OrderGateway: stop-loss sell failed: {}", e);
                        HandlerOutcome::Requeue
                    }
                }
            }
            "order.position.reduce" => {
                let symbol = message.payload.get("symbol").and_then(|v| v.as_str());
                let quantity = message
                    .payload
                    .get("quantity")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<Decimal>().ok());
                let position_id = message.payload.get("position_id").and_then(|v| v.as_str());
                let (Some(symbol), Some(quantity), Some(position_id)) =
                    (symbol, quantity, position_id)
                else {
                    warn!("OrderGateway: malformed reduction instruction");
                    return HandlerOutcome::Nack;
                };
                let signal = ApprovedSignal {
                    signal_id: format!("reduce-{}-{}", position_id, message.message_id),
                    strategy_id: "risk_reduction".to_string(),
                    symbol: symbol.to_string(),
                    side: OrderSide::Sell,
                    quantity,
                    limit_price: None,
                };
                match self.submit(signal).await {
                    Ok(_) => HandlerOutcome::Ack,
                    Err(e) => {
                        warn!("OrderGateway: reduction sell failed: {}", e);
                        HandlerOutcome::Requeue
                    }
                }
            }
            other => {
                warn!("OrderGateway: unknown routing key {}", other);
                HandlerOutcome::Nack
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::messaging::{FabricConfig, declare_core_topology};
    use crate::infrastructure::persistence::MemoryStore;
    use crate::infrastructure::venues::MockVenueClient;
    use rust_decimal_macros::dec;

    async fn gateway(deferred: bool) -> (Arc<MockVenueClient>, Arc<dyn Store>, Arc<OrderGateway>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let fabric = MessageFabric::new(FabricConfig::default());
        declare_core_topology(&fabric).await.unwrap();
        let venue = if deferred {
            Arc::new(MockVenueClient::new("mock", dec!(100000)).with_deferred_fills())
        } else {
            Arc::new(MockVenueClient::new("mock", dec!(100000)))
        };
        venue.set_price("BTC/USDT", dec!(30000)).await;
        let gateway = Arc::new(OrderGateway::new(
            Arc::clone(&venue) as Arc<dyn VenueClient>,
            Arc::clone(&store),
            fabric,
            Metrics::new().unwrap(),
            60,
        ));
        (venue, store, gateway)
    }

    fn signal(id: &str, side: OrderSide, quantity: Decimal) -> ApprovedSignal {
        ApprovedSignal {
            signal_id: id.to_string(),
            strategy_id: "strat-1".to_string(),
            symbol: "BTC/USDT".to_string(),
            side,
            quantity,
            limit_price: None,
        }
    }

    #[tokio::test]
    async fn test_fill_creates_position() {
        let (_venue, store, gateway) = gateway(false).await;
        let order = gateway.submit(signal("s1", OrderSide::Buy, dec!(0.5))).await.unwrap();
        assert_eq!(order.status, VenueOrderStatus::Filled);

        let positions = store
            .query(containers::POSITIONS, &crate::domain::store::QueryFilter::new())
            .await
            .unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0]["symbol"], "BTC/USDT");
        assert_eq!(positions[0]["quantity"], "0.5");
    }

    #[tokio::test]
    async fn test_duplicate_signal_returns_existing() {
        let (_venue, _store, gateway) = gateway(true).await;
        let first = gateway.submit(signal("dup", OrderSide::Buy, dec!(0.5))).await.unwrap();
        let second = gateway.submit(signal("dup", OrderSide::Buy, dec!(0.5))).await.unwrap();
        assert_eq!(first.venue_order_id, second.venue_order_id);
        assert_eq!(gateway.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_reconcile_settles_deferred_fill() {
        let (venue, store, gateway) = gateway(true).await;
        gateway.submit(signal("s2", OrderSide::Buy, dec!(0.25))).await.unwrap();
        assert_eq!(gateway.active_count().await, 1);

        venue.fill_all().await;
        gateway.reconcile().await.unwrap();
        assert_eq!(gateway.active_count().await, 0);

        let positions = store
            .query(containers::POSITIONS, &crate::domain::store::QueryFilter::new())
            .await
            .unwrap();
        assert_eq!(positions.len(), 1);
    }

    #[tokio::test]
    async fn test_sell_reduces_and_closes_position() {
        let (_venue, store, gateway) = gateway(false).await;
        gateway.submit(signal("open", OrderSide::Buy, dec!(0.5))).await.unwrap();
        gateway.submit(signal("trim", OrderSide::Sell, dec!(0.2))).await.unwrap();

        let positions = store
            .query(containers::POSITIONS, &crate::domain::store::QueryFilter::new())
            .await
            .unwrap();
        assert_eq!(positions[0]["quantity"], "0.3");

        gateway.submit(signal("close", OrderSide::Sell, dec!(0.3))).await.unwrap();
        let positions = store
            .query(containers::POSITIONS, &crate::domain::store::QueryFilter::new())
            .await
            .unwrap();
        assert!(positions.is_empty());
    }

    #[tokio::test]
    async fn test_stop_trigger_message_executes_sell() {
        let (_venue, store, gateway) = gateway(false).await;
        gateway.submit(signal("open", OrderSide::Buy, dec!(0.5))).await.unwrap();

        let event = StopLossTriggerEvent::market_sell(
            "stop-1", "pos-1", "BTC/USDT", dec!(0.5), dec!(29000), dec!(29100),
        );
        let message = Message::new(
            topics::exchanges::ORDER_EXECUTION,
            topics::keys::STOP_LOSS_TRIGGER,
            serde_json::to_value(&event).unwrap(),
        );
        assert_eq!(gateway.handle(message).await, HandlerOutcome::Ack);

        let positions = store
            .query(containers::POSITIONS, &crate::domain::store::QueryFilter::new())
            .await
            .unwrap();
        assert!(positions.is_empty());
    }
}
