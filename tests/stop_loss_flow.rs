//! Stop-loss lifecycle across services: a trailing stop tightens with
//! the market, triggers on a reversal, and the resulting high-priority
//! message drives the gateway to close the position.

use mastertrade::application::execution::{ApprovedSignal, OrderGateway};
use mastertrade::application::risk::{RiskData, StopLossManager};
use mastertrade::config::RiskLimitsConfig;
use mastertrade::domain::stops::{StopLossConfig, StopType};
use mastertrade::domain::store::{QueryFilter, Store, containers};
use mastertrade::domain::trading::OrderSide;
use mastertrade::infrastructure::messaging::{
    FabricConfig, MessageFabric, declare_core_topology,
};
use mastertrade::infrastructure::observability::Metrics;
use mastertrade::infrastructure::persistence::MemoryStore;
use mastertrade::infrastructure::venues::MockVenueClient;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn trigger_message_closes_position_through_gateway() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let fabric = MessageFabric::new(FabricConfig::default());
    declare_core_topology(&fabric).await.unwrap();
    let metrics = Metrics::new().unwrap();
    let limits = RiskLimitsConfig::default();

    let venue = Arc::new(MockVenueClient::new("mock", dec!(100000)));
    venue.set_price("BTC/USDT", dec!(99)).await;

    let gateway = Arc::new(OrderGateway::new(
        Arc::clone(&venue) as Arc<dyn mastertrade::domain::ports::VenueClient>,
        Arc::clone(&store),
        fabric.clone(),
        metrics.clone(),
        60,
    ));
    Arc::clone(&gateway).start().await.unwrap();

    let data = Arc::new(RiskData::new(Arc::clone(&store), limits.clone()));
    let manager = StopLossManager::new(data, fabric.clone(), metrics, limits);

    // Open a position the stop will protect.
    gateway
        .submit(ApprovedSignal {
            signal_id: "open-1".to_string(),
            strategy_id: "strat-1".to_string(),
            symbol: "BTC/USDT".to_string(),
            side: OrderSide::Buy,
            quantity: dec!(1),
            limit_price: Some(dec!(100)),
        })
        .await
        .unwrap();

    let stop = manager
        .create_stop(
            "pos-flow",
            "BTC/USDT",
            OrderSide::Buy,
            dec!(100),
            dec!(1),
            StopLossConfig {
                stop_type: StopType::Trailing,
                initial_stop_percent: 3.0,
                trailing_distance_percent: 2.0,
                min_profit_before_trail: 1.0,
                breakeven_protection: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(stop.stop_price, dec!(97));

    // Rally tightens the stop, reversal trips it.
    manager.on_price_update("BTC/USDT", dec!(101.2)).await;
    manager.on_price_update("BTC/USDT", dec!(99.1)).await;
    assert_eq!(manager.active_count().await, 0);

    // The trigger rides order.execution to the gateway, which sells.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let positions = store
        .query(containers::POSITIONS, &QueryFilter::new())
        .await
        .unwrap();
    assert!(positions.is_empty(), "position should be closed: {:?}", positions);

    // The persisted stop record is terminal.
    let stops = store
        .query(
            containers::STOP_LOSS_ORDERS,
            &QueryFilter::new().eq("id", stop.id.as_str()),
        )
        .await
        .unwrap();
    assert_eq!(stops[0]["status"], "triggered");
}
