//! Generation-to-activation pipeline: a job produces and backtests
//! strategies, and subsequent activation keeps the active set within the
//! configured cap.

use mastertrade::application::lifecycle::{
    ActivationManager, BacktestOrchestrator, CrossoverBacktestEngine, GenerationManager,
};
use mastertrade::config::LifecycleConfig;
use mastertrade::domain::store::{QueryFilter, Store, containers};
use mastertrade::domain::strategy::JobStatus;
use mastertrade::infrastructure::messaging::{
    FabricConfig, MessageFabric, declare_core_topology,
};
use mastertrade::infrastructure::observability::Metrics;
use mastertrade::infrastructure::persistence::MemoryStore;
use mastertrade::infrastructure::venues::MockVenueClient;
use chrono::Utc;
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

async fn wait_for_completion(manager: &GenerationManager, job_id: Uuid) -> JobStatus {
    for _ in 0..400 {
        if let Some(job) = manager.load_job(job_id).await.unwrap()
            && job.status.is_terminal()
        {
            return job.status;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("generation job never finished");
}

#[tokio::test]
async fn generation_then_activation_respects_cap() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let fabric = MessageFabric::new(FabricConfig::default());
    declare_core_topology(&fabric).await.unwrap();
    let venue = Arc::new(MockVenueClient::new("mock", dec!(100000)));
    venue.set_price("BTC/USDT", dec!(30000)).await;

    let config = LifecycleConfig::default();
    let backtester = Arc::new(BacktestOrchestrator::new(
        Arc::clone(&store),
        venue,
        Arc::new(CrossoverBacktestEngine::default()),
        config.clone(),
    ));
    let generation = Arc::new(GenerationManager::new(
        Arc::clone(&store),
        None,
        backtester,
        fabric,
        Metrics::new().unwrap(),
        config.clone(),
        vec!["BTC/USDT".to_string()],
    ));

    let job_id = generation.start_generation_job(4, vec![]).await.unwrap();
    assert_eq!(wait_for_completion(&generation, job_id).await, JobStatus::Completed);

    let strategies = store
        .query(containers::STRATEGIES, &QueryFilter::new())
        .await
        .unwrap();
    assert_eq!(strategies.len(), 4);
    let backtests = store
        .query(containers::BACKTEST_RESULTS, &QueryFilter::new())
        .await
        .unwrap();
    assert_eq!(backtests.len(), 4);

    // Make every candidate admissible: strong backtest numbers and a
    // fresh profitable trade history.
    let now = Utc::now();
    for (i, strategy) in strategies.iter().enumerate() {
        let id = strategy["id"].as_str().unwrap();
        store
            .upsert(
                containers::BACKTEST_RESULTS,
                &json!({
                    "id": format!("seed-bt-{}", i),
                    "strategy_id": id,
                    "sharpe": 1.4 + i as f64 * 0.2,
                    "total_return": 0.25,
                    "max_drawdown": -0.12,
                    "total_trades": 70,
                    "created_at": now.to_rfc3339(),
                }),
            )
            .await
            .unwrap();
        for t in 0..6 {
            store
                .upsert(
                    containers::TRADES,
                    &json!({
                        "id": format!("seed-t-{}-{}", i, t),
                        "strategy_id": id,
                        "pnl_usd": 40.0 + (t * (i + 2)) as f64,
                        "entry_ts": now.timestamp() - 86_400 * (t as i64 + 1) - 7_200,
                        "exit_ts": now.timestamp() - 86_400 * (t as i64 + 1),
                    }),
                )
                .await
                .unwrap();
        }
    }

    let activation = ActivationManager::new(Arc::clone(&store), config);
    let outcome = activation.check_and_update().await.unwrap();
    assert_eq!(outcome.activated.len(), 2);

    let active = store
        .query(containers::STRATEGIES, &QueryFilter::new().eq("is_active", true))
        .await
        .unwrap();
    assert_eq!(active.len(), 2);
    for strategy in &active {
        assert_eq!(strategy["status"], "active");
        assert_eq!(strategy["enabled"], true);
    }
}
