//! Application wiring: construct every service against the shared store
//! and fabric, start the long-lived tasks, and fan a shutdown flag out to
//! all of them.

use crate::application::arbitrage::{ArbitrageExecutor, ArbitrageMonitor};
use crate::application::execution::OrderGateway;
use crate::application::indicators::IndicatorConfigManager;
use crate::application::indicators::config_manager::BasicIndicatorCalculator;
use crate::application::lifecycle::{
    ActivationManager, BacktestOrchestrator, CrossoverBacktestEngine, DailyReviewer,
    GenerationManager,
};
use crate::application::market_data::feeds::{FeedVenue, SimulatedFeed};
use crate::application::market_data::{
    FlowDataService, PriceCache, StalenessThresholds, StrategyRequestHandler,
};
use crate::application::risk::{
    AdvancedRiskController, CorrelationTracker, PortfolioRiskController, PositionSizingEngine,
    RiskCheckService, RiskData, StopLossManager,
};
use crate::config::{Config, Mode};
use crate::domain::market::PriceKind;
use crate::domain::ports::VenueClient;
use crate::domain::store::{Store, containers};
use crate::infrastructure::messaging::{
    HandlerOutcome, Message, MessageFabric, MessageHandler, declare_core_topology, topics,
};
use crate::infrastructure::observability::{Metrics, MetricsReporter};
use crate::infrastructure::persistence::{MemoryStore, SqliteStore};
use crate::infrastructure::ratelimit::AdaptiveRateLimiter;
use crate::infrastructure::venues::MockVenueClient;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct Application {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub fabric: MessageFabric,
    pub metrics: Metrics,
    pub limiter: Arc<AdaptiveRateLimiter>,
    pub price_cache: Arc<PriceCache>,
    pub correlation: Arc<CorrelationTracker>,
    pub risk_data: Arc<RiskData>,
    pub stops: Arc<StopLossManager>,
    pub portfolio_risk: Arc<PortfolioRiskController>,
    pub advanced_risk: Arc<AdvancedRiskController>,
    pub risk_rpc: Arc<RiskCheckService>,
    pub arbitrage_monitor: Arc<ArbitrageMonitor>,
    pub generation: Arc<GenerationManager>,
    pub reviewer: Arc<DailyReviewer>,
    pub activation: Arc<ActivationManager>,
    pub indicators: Arc<IndicatorConfigManager>,
    pub strategy_requests: Arc<StrategyRequestHandler>,
    pub flow_data: Arc<FlowDataService>,
    pub gateway: Arc<OrderGateway>,
}

pub struct SystemHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl SystemHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Application {
    pub async fn build(config: Config) -> Result<Self> {
        info!("Building mastertrade application (mode: {:?})...", config.mode);

        let store: Arc<dyn Store> = match config.mode {
            Mode::Mock => Arc::new(MemoryStore::new()),
            Mode::Live => Arc::new(SqliteStore::new(&config.db_url).await?),
        };

        let fabric = MessageFabric::new(config.fabric.clone());
        declare_core_topology(&fabric).await?;
        let metrics = Metrics::new()?;
        let limiter = Arc::new(AdaptiveRateLimiter::new(config.rate_limiter.clone()));
        let price_cache = Arc::new(PriceCache::new(StalenessThresholds::default()));
        let correlation = Arc::new(CorrelationTracker::new(
            config.risk.correlation_cluster_threshold,
        ));

        // Seed the account document in mock mode so the risk services have
        // a balance to work with.
        if config.mode == Mode::Mock {
            let balance = Decimal::from_f64(config.initial_balance_usd)
                .unwrap_or(Decimal::from(100_000));
            store
                .upsert(
                    containers::ACCOUNT,
                    &serde_json::json!({
                        "id": "primary",
                        "total_balance_usd": balance.to_string(),
                        "available_balance_usd": balance.to_string(),
                        "updated_at": Utc::now().to_rfc3339(),
                    }),
                )
                .await?;
        }

        let risk_data = Arc::new(RiskData::new(Arc::clone(&store), config.risk.clone()));
        let stops = Arc::new(StopLossManager::new(
            Arc::clone(&risk_data),
            fabric.clone(),
            metrics.clone(),
            config.risk.clone(),
        ));
        let portfolio_risk = Arc::new(PortfolioRiskController::new(
            Arc::clone(&risk_data),
            Arc::clone(&correlation),
            fabric.clone(),
            metrics.clone(),
            config.risk.clone(),
        ));
        let advanced_risk = Arc::new(AdvancedRiskController::new(
            Arc::clone(&risk_data),
            Arc::clone(&correlation),
            Arc::clone(&stops),
            fabric.clone(),
            metrics.clone(),
            config.risk.clone(),
        ));
        let sizing = Arc::new(PositionSizingEngine::new(
            Arc::clone(&risk_data),
            config.risk.clone(),
            Arc::clone(&correlation),
            None,
        ));
        let risk_rpc = Arc::new(RiskCheckService::new(
            Arc::clone(&risk_data),
            sizing,
            Arc::clone(&advanced_risk),
            fabric.clone(),
        ));

        // Venue clients. In mock mode every watched venue is simulated.
        let mut venues: HashMap<String, Arc<dyn VenueClient>> = HashMap::new();
        let balance =
            Decimal::from_f64(config.initial_balance_usd).unwrap_or(Decimal::from(100_000));
        for watched in &config.arbitrage.watchlist.venues {
            let client = Arc::new(MockVenueClient::new(&watched.name, balance));
            venues.insert(watched.name.clone(), client);
        }
        let primary_venue: Arc<dyn VenueClient> = venues
            .values()
            .next()
            .cloned()
            .unwrap_or_else(|| Arc::new(MockVenueClient::new("mock", balance)));

        let executor = Arc::new(ArbitrageExecutor::new(
            Arc::clone(&store),
            fabric.clone(),
            metrics.clone(),
            config.arbitrage.clone(),
            venues.clone(),
        ));
        let arbitrage_monitor = Arc::new(ArbitrageMonitor::new(
            Arc::clone(&price_cache),
            Arc::clone(&store),
            fabric.clone(),
            metrics.clone(),
            config.arbitrage.clone(),
            executor,
            Vec::new(),
        ));

        let backtester = Arc::new(BacktestOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&primary_venue),
            Arc::new(CrossoverBacktestEngine::default()),
            config.lifecycle.clone(),
        ));
        let generation = Arc::new(GenerationManager::new(
            Arc::clone(&store),
            None,
            backtester,
            fabric.clone(),
            metrics.clone(),
            config.lifecycle.clone(),
            config.symbols.clone(),
        ));
        let reviewer = Arc::new(DailyReviewer::new(
            Arc::clone(&store),
            config.lifecycle.clone(),
        ));
        let activation = Arc::new(ActivationManager::new(
            Arc::clone(&store),
            config.lifecycle.clone(),
        ));

        let indicators = Arc::new(IndicatorConfigManager::new(
            Arc::clone(&store),
            Arc::new(BasicIndicatorCalculator),
            Arc::clone(&primary_venue),
            fabric.clone(),
            metrics.clone(),
            60,
        ));

        let strategy_requests = Arc::new(StrategyRequestHandler::new(
            Arc::clone(&store),
            Arc::clone(&correlation),
            fabric.clone(),
        ));
        let flow_data = Arc::new(FlowDataService::new(Arc::clone(&store)));

        let gateway = Arc::new(OrderGateway::new(
            primary_venue,
            Arc::clone(&store),
            fabric.clone(),
            metrics.clone(),
            config.order_timeout_secs as i64,
        ));

        Ok(Self {
            config,
            store,
            fabric,
            metrics,
            limiter,
            price_cache,
            correlation,
            risk_data,
            stops,
            portfolio_risk,
            advanced_risk,
            risk_rpc,
            arbitrage_monitor,
            generation,
            reviewer,
            activation,
            indicators,
            strategy_requests,
            flow_data,
            gateway,
        })
    }

    pub async fn start(&self) -> Result<SystemHandle> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        self.portfolio_risk.load_peak().await?;
        self.stops.load_active_stops().await?;
        self.advanced_risk.refresh_drawdown_control().await?;

        // Consumers.
        Arc::clone(&self.risk_rpc).start().await?;
        Arc::clone(&self.indicators).start().await?;
        Arc::clone(&self.strategy_requests).start().await?;
        Arc::clone(&self.gateway).start().await?;

        // Price ticks fan into the stop manager and gateway reconciliation.
        let tick_handler = Arc::new(PriceTickHandler {
            stops: Arc::clone(&self.stops),
        });
        self.fabric
            .subscribe(
                "risk_manager.price_ticks",
                &[(topics::exchanges::PORTFOLIO_UPDATES, "market.price.*")],
                tick_handler,
                Some(100),
            )
            .await?;

        // Feed task (simulated in mock mode; live adapters replace it).
        if self.config.mode == Mode::Mock {
            let venues: Vec<FeedVenue> = self
                .config
                .arbitrage
                .watchlist
                .venues
                .iter()
                .enumerate()
                .map(|(i, v)| FeedVenue {
                    venue: v.name.clone(),
                    kind: if v.kind == "dex" { PriceKind::Dex } else { PriceKind::Cex },
                    chain: v.chain.clone(),
                    skew_bps: i as f64 * 3.0,
                })
                .collect();
            let feed = SimulatedFeed::new(
                Arc::clone(&self.price_cache),
                self.fabric.clone(),
                Arc::clone(&self.limiter),
                venues,
                self.config.arbitrage.watchlist.pairs.clone(),
                self.config.feed_tick,
                shutdown_rx.clone(),
            );
            tokio::spawn(jittered(self.config.feed_tick, feed.run()));
        }

        // Detection, monitoring, and periodic risk sweeps.
        tokio::spawn(Arc::clone(&self.arbitrage_monitor).run(shutdown_rx.clone()));
        tokio::spawn(Arc::clone(&self.gateway).run_monitoring_loop(shutdown_rx.clone()));
        tokio::spawn(Arc::clone(&self.indicators).run_loops(shutdown_rx.clone()));

        let advanced = Arc::clone(&self.advanced_risk);
        let portfolio = Arc::clone(&self.portfolio_risk);
        let adjust_interval = Duration::from_secs(self.config.risk.adjust_positions_interval_secs);
        let mut risk_shutdown = shutdown_rx.clone();
        tokio::spawn(jittered(adjust_interval, async move {
            let mut ticker = tokio::time::interval(adjust_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = advanced.adjust_existing_positions().await {
                            warn!("RiskSweep: position adjustment failed: {}", e);
                        }
                        match portfolio.compute_metrics().await {
                            Ok(metrics) => {
                                let _ = portfolio.check_limits(&metrics).await;
                            }
                            Err(e) => warn!("RiskSweep: metrics recompute failed: {}", e),
                        }
                    }
                    _ = risk_shutdown.changed() => {
                        if *risk_shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }));

        // Hourly correlation refresh from stored history.
        let correlation = Arc::clone(&self.correlation);
        let risk_data = Arc::clone(&self.risk_data);
        let symbols = self.config.symbols.clone();
        let corr_interval =
            Duration::from_secs(self.config.risk.correlation_refresh_interval_secs);
        let mut corr_shutdown = shutdown_rx.clone();
        tokio::spawn(jittered(Duration::from_secs(5), async move {
            let mut ticker = tokio::time::interval(corr_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut returns = HashMap::new();
                        for symbol in &symbols {
                            if let Ok(series) = risk_data.daily_returns(symbol, 30).await
                                && series.len() >= 5
                            {
                                returns.insert(symbol.clone(), series);
                            }
                        }
                        if returns.len() >= 2 {
                            correlation.refresh(&returns, 5);
                        }
                    }
                    _ = corr_shutdown.changed() => {
                        if *corr_shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }));

        // Daily review and activation.
        tokio::spawn(crate::application::lifecycle::review::run_review_loop(
            Arc::clone(&self.reviewer),
            self.config.lifecycle.review_interval_hours,
            shutdown_rx.clone(),
        ));
        let activation = Arc::clone(&self.activation);
        let activation_interval =
            Duration::from_secs(self.config.lifecycle.activation_check_interval_secs);
        let mut act_shutdown = shutdown_rx.clone();
        tokio::spawn(jittered(Duration::from_secs(10), async move {
            let mut ticker = tokio::time::interval(activation_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = activation.check_and_update().await {
                            warn!("ActivationLoop: check failed: {}", e);
                        }
                    }
                    _ = act_shutdown.changed() => {
                        if *act_shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }));

        // Metrics reporter.
        if self.config.observability.enabled {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.config.observability.interval_secs,
                shutdown_rx,
            );
            tokio::spawn(reporter.run());
        }

        info!("mastertrade system running.");
        Ok(SystemHandle { shutdown_tx })
    }
}

/// Stagger loop start by up to 10% of the base interval so restarts do
/// not align every ticker.
async fn jittered<F: std::future::Future<Output = ()>>(base: Duration, fut: F) {
    let max_jitter_ms = (base.as_millis() as u64 / 10).max(1);
    let delay = rand::rng().random_range(0..max_jitter_ms);
    tokio::time::sleep(Duration::from_millis(delay)).await;
    fut.await;
}

/// Routes `market.price.*` ticks into the stop-loss manager.
struct PriceTickHandler {
    stops: Arc<StopLossManager>,
}

#[async_trait]
impl MessageHandler for PriceTickHandler {
    async fn handle(&self, message: Message) -> HandlerOutcome {
        let Some(pair) = message.payload.get("pair").and_then(|v| v.as_str()) else {
            return HandlerOutcome::Nack;
        };
        let Some(mid) = message.payload.get("mid").and_then(|v| v.as_f64()) else {
            return HandlerOutcome::Nack;
        };
        let Ok(price) = Decimal::from_str(&format!("{:.8}", mid)) else {
            return HandlerOutcome::Nack;
        };
        self.stops.on_price_update(pair, price).await;
        HandlerOutcome::Ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_config() -> Config {
        // Construct directly; from_env would read ambient variables.
        Config {
            mode: Mode::Mock,
            db_url: "sqlite://ignored".to_string(),
            symbols: vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()],
            feed_tick: Duration::from_millis(50),
            initial_balance_usd: 100_000.0,
            order_timeout_secs: 60,
            risk: Default::default(),
            lifecycle: Default::default(),
            arbitrage: Default::default(),
            fabric: Default::default(),
            rate_limiter: Default::default(),
            observability: crate::config::ObservabilityConfig {
                enabled: false,
                interval_secs: 60,
            },
        }
    }

    #[tokio::test]
    async fn test_build_and_start_mock_system() {
        let app = Application::build(mock_config()).await.unwrap();
        let handle = app.start().await.unwrap();

        // Let the simulated feed populate the cache.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!app.price_cache.is_empty());

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_risk_rpc_live_after_start() {
        let app = Application::build(mock_config()).await.unwrap();
        let handle = app.start().await.unwrap();

        let request = crate::infrastructure::messaging::contracts::RiskCheckRequest {
            request_id: "sys-1".to_string(),
            symbol: "BTC/USDT".to_string(),
            strategy_id: "strat-1".to_string(),
            order_type: "market".to_string(),
            order_side: crate::domain::trading::OrderSide::Buy,
            quantity: rust_decimal_macros::dec!(0.05),
            price: rust_decimal_macros::dec!(30000),
            signal_strength: 0.9,
            timestamp: Utc::now(),
            metadata: serde_json::json!({}),
        };
        let response = app
            .fabric
            .request(
                topics::exchanges::RISK_CHECK,
                topics::keys::RISK_CHECK_REQUEST,
                topics::keys::RISK_CHECK_RESPONSE,
                serde_json::to_value(&request).unwrap(),
                Some(Duration::from_secs(3)),
            )
            .await
            .unwrap();
        assert_eq!(response.payload["request_id"], "sys-1");
        handle.shutdown();
    }
}
