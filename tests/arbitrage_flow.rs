//! Arbitrage invariant across detector and executor: every opportunity
//! marked executed has exactly one execution row, and that row reaches a
//! terminal status.

use mastertrade::application::arbitrage::{ArbitrageExecutor, ArbitrageMonitor};
use mastertrade::application::market_data::PriceCache;
use mastertrade::config::ArbitrageConfig;
use mastertrade::domain::market::PricePoint;
use mastertrade::domain::ports::VenueClient;
use mastertrade::domain::store::{QueryFilter, Store, containers};
use mastertrade::infrastructure::messaging::{
    FabricConfig, MessageFabric, declare_core_topology,
};
use mastertrade::infrastructure::observability::Metrics;
use mastertrade::infrastructure::persistence::MemoryStore;
use mastertrade::infrastructure::venues::MockVenueClient;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

async fn build_monitor(
    config: ArbitrageConfig,
) -> (Arc<PriceCache>, Arc<dyn Store>, ArbitrageMonitor) {
    let cache = Arc::new(PriceCache::default());
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let fabric = MessageFabric::new(FabricConfig::default());
    declare_core_topology(&fabric).await.unwrap();

    let binance = Arc::new(MockVenueClient::new("binance", dec!(1000000)));
    binance.set_price("BTC/USDT", dec!(30000)).await;
    let uniswap = Arc::new(MockVenueClient::new("uniswap_v3", dec!(1000000)));
    uniswap.set_price("BTC/USDT", dec!(30300)).await;
    let mut venues: HashMap<String, Arc<dyn VenueClient>> = HashMap::new();
    venues.insert("binance".to_string(), binance);
    venues.insert("uniswap_v3".to_string(), uniswap);

    let executor = Arc::new(ArbitrageExecutor::new(
        Arc::clone(&store),
        fabric.clone(),
        Metrics::new().unwrap(),
        config.clone(),
        venues,
    ));
    let monitor = ArbitrageMonitor::new(
        Arc::clone(&cache),
        Arc::clone(&store),
        fabric,
        Metrics::new().unwrap(),
        config,
        executor,
        Vec::new(),
    );
    (cache, store, monitor)
}

#[tokio::test]
async fn executed_opportunities_have_terminal_executions() {
    let (cache, store, monitor) = build_monitor(ArbitrageConfig::default()).await;
    cache.update(PricePoint::cex("binance", "BTC/USDT", dec!(30000)));
    cache.update(
        PricePoint::dex("uniswap_v3", "ethereum", "uniswap_v3", "BTC/USDT", dec!(30300))
            .with_liquidity(dec!(15150)),
    );

    let found = monitor.scan_once().await.unwrap();
    assert_eq!(found.len(), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let opportunities = store
        .query(containers::ARBITRAGE_OPPORTUNITIES, &QueryFilter::new())
        .await
        .unwrap();
    let executions = store
        .query(containers::ARBITRAGE_EXECUTIONS, &QueryFilter::new())
        .await
        .unwrap();

    for opp in &opportunities {
        if opp["executed"] == true {
            let execution_id = opp["execution_id"].as_str().expect("execution_id set");
            let matching: Vec<_> = executions
                .iter()
                .filter(|e| e["opportunity_id"] == opp["id"])
                .collect();
            assert_eq!(matching.len(), 1, "exactly one execution per opportunity");
            assert_eq!(matching[0]["id"], execution_id);
            assert_ne!(matching[0]["status"], "pending", "execution must terminate");
        }
    }
    assert!(opportunities.iter().any(|o| o["executed"] == true));
}

#[tokio::test]
async fn execution_timeout_marks_failed() {
    let mut config = ArbitrageConfig::default();
    config.execution_timeout_secs = 1;
    let (cache, store, monitor) = build_monitor(config).await;

    // A sell venue with no registered client: dispatch fails fast, but a
    // stuck pending row would also be caught by the watchdog.
    cache.update(PricePoint::cex("binance", "BTC/USDT", dec!(30000)));
    cache.update(
        PricePoint::dex("pancakeswap", "bsc", "pancakeswap", "BTC/USDT", dec!(30300))
            .with_liquidity(dec!(15150)),
    );

    monitor.scan_once().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let executions = store
        .query(containers::ARBITRAGE_EXECUTIONS, &QueryFilter::new())
        .await
        .unwrap();
    assert!(!executions.is_empty());
    for execution in &executions {
        assert_eq!(execution["status"], "failed");
        assert!(execution["error"].is_string());
    }
}
