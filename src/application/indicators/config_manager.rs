//! Indicator configuration manager: owns `IndicatorConfig` documents,
//! serves `config.request.*` messages, and runs the periodic calculation
//! sweep. Results are cached per config, published when asked, and
//! persisted. Three consecutive calculation errors pause a config until
//! the next DB refresh.

use crate::domain::indicator::{
    IndicatorCalculationResult, IndicatorConfig, IndicatorSubscription,
};
use crate::domain::market::Candle;
use crate::domain::ports::{IndicatorCalculator, VenueClient};
use crate::domain::store::{QueryFilter, Store, containers};
use crate::infrastructure::messaging::contracts::{
    ConfigAddRequest, ConfigBulkRequest, ConfigRemoveRequest, ConfigResponse,
    ConfigSubscribeRequest, ConfigUpdateRequest,
};
use crate::infrastructure::messaging::{
    HandlerOutcome, Message, MessageFabric, MessageHandler, topics,
};
use crate::infrastructure::observability::Metrics;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CONFIG_QUEUE: &str = "market_data.indicator_config";
const MAX_CONSECUTIVE_ERRORS: u32 = 3;
const BULK_BATCH_SIZE: usize = 20;

pub struct IndicatorConfigManager {
    store: Arc<dyn Store>,
    calculator: Arc<dyn IndicatorCalculator>,
    venue: Arc<dyn VenueClient>,
    fabric: MessageFabric,
    prom: Metrics,
    update_interval_secs: i64,
    configs: Mutex<HashMap<String, IndicatorConfig>>,
    /// Configs benched after repeated errors, until the next refresh.
    paused: Mutex<HashSet<String>>,
    result_cache: Mutex<HashMap<String, IndicatorCalculationResult>>,
}

impl IndicatorConfigManager {
    pub fn new(
        store: Arc<dyn Store>,
        calculator: Arc<dyn IndicatorCalculator>,
        venue: Arc<dyn VenueClient>,
        fabric: MessageFabric,
        prom: Metrics,
        update_interval_secs: i64,
    ) -> Self {
        Self {
            store,
            calculator,
            venue,
            fabric,
            prom,
            update_interval_secs,
            configs: Mutex::new(HashMap::new()),
            paused: Mutex::new(HashSet::new()),
            result_cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        self.refresh_from_store().await?;
        // Prefetch 1: add/update/remove against the same configuration id
        // must be observable in submission order.
        self.fabric
            .subscribe(
                CONFIG_QUEUE,
                &[(topics::exchanges::INDICATOR_CONFIG, "config.request.*")],
                Arc::clone(&self) as Arc<dyn MessageHandler>,
                Some(1),
            )
            .await?;
        info!("IndicatorConfigManager: consuming on {}", CONFIG_QUEUE);
        Ok(())
    }

    /// Rehydrate the in-process cache and un-bench paused configs.
    pub async fn refresh_from_store(&self) -> Result<usize> {
        let docs = self
            .store
            .query(
                containers::INDICATOR_CONFIGS,
                &QueryFilter::new().eq("active", true),
            )
            .await?;
        let mut fresh = HashMap::with_capacity(docs.len());
        for doc in docs {
            match serde_json::from_value::<IndicatorConfig>(doc) {
                Ok(config) => {
                    fresh.insert(config.id.clone(), config);
                }
                Err(e) => warn!("IndicatorConfigManager: malformed config document: {}", e),
            }
        }
        let count = fresh.len();
        *self.configs.lock().await = fresh;
        self.paused.lock().await.clear();
        debug!("IndicatorConfigManager: cache refreshed ({} configs)", count);
        Ok(count)
    }

    /// One calculation sweep: due configs in priority order.
    pub async fn calculate_due(&self) -> usize {
        let now = Utc::now();
        let due: Vec<IndicatorConfig> = {
            let configs = self.configs.lock().await;
            let paused = self.paused.lock().await;
            let mut due: Vec<IndicatorConfig> = configs
                .values()
                .filter(|c| c.active && !paused.contains(&c.id))
                .filter(|c| c.continuous || c.last_calculated.is_none())
                .filter(|c| c.is_due(now, self.update_interval_secs))
                .cloned()
                .collect();
            due.sort_by(|a, b| b.priority.cmp(&a.priority));
            due
        };

        let mut calculated = 0;
        for config in due {
            match self.calculate_one(&config.id).await {
                Ok(_) => calculated += 1,
                Err(e) => debug!(
                    "IndicatorConfigManager: calculation of {} failed: {}",
                    config.id, e
                ),
            }
        }
        calculated
    }

    /// Calculate one config, serving from the result cache when the entry
    /// is younger than `cache_duration_min`.
    pub async fn calculate_one(&self, config_id: &str) -> Result<IndicatorCalculationResult> {
        let config = {
            let configs = self.configs.lock().await;
            configs
                .get(config_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown configuration {}", config_id))?
        };

        if let Some(cached) = self.cached_result(&config).await {
            return Ok(cached);
        }

        let started = std::time::Instant::now();
        let candles = self.fetch_candles(&config).await?;
        let outcome = self.calculator.calculate(&config, &candles).await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(values) => {
                let result = IndicatorCalculationResult {
                    configuration_id: config.id.clone(),
                    strategy_id: config.strategy_id.clone(),
                    symbol: config.symbol.clone(),
                    interval: config.interval.clone(),
                    indicator_type: config.indicator_type.clone(),
                    values,
                    calculated_at: Utc::now(),
                    duration_ms,
                };
                self.record_success(&config.id, duration_ms).await;
                self.prom
                    .indicator_calculations_total
                    .with_label_values(&["ok"])
                    .inc();
                self.result_cache
                    .lock()
                    .await
                    .insert(config.id.clone(), result.clone());
                self.persist_result(&result).await;
                if config.publish {
                    let key = topics::keys::indicator_result(&config.symbol, &config.interval);
                    if let Err(e) = self
                        .fabric
                        .publish_json(topics::exchanges::INDICATOR_RESULTS, &key, &result)
                        .await
                    {
                        warn!("IndicatorConfigManager: result publish failed: {}", e);
                    }
                }
                Ok(result)
            }
            Err(e) => {
                self.record_failure(&config.id).await;
                self.prom
                    .indicator_calculations_total
                    .with_label_values(&["error"])
                    .inc();
                Err(e)
            }
        }
    }

    async fn cached_result(&self, config: &IndicatorConfig) -> Option<IndicatorCalculationResult> {
        if config.continuous {
            return None;
        }
        let cache = self.result_cache.lock().await;
        let cached = cache.get(&config.id)?;
        let age = Utc::now() - cached.calculated_at;
        (age < Duration::minutes(config.cache_duration_min)).then(|| cached.clone())
    }

    async fn fetch_candles(&self, config: &IndicatorConfig) -> Result<Vec<Candle>> {
        let periods = config.periods_required.max(2) as i64;
        let span_secs = periods * interval_seconds(&config.interval);
        let end = Utc::now();
        let start = end - Duration::seconds(span_secs);
        self.venue
            .fetch_candles(&config.symbol, &config.interval, start, end)
            .await
    }

    async fn record_success(&self, config_id: &str, duration_ms: f64) {
        let mut configs = self.configs.lock().await;
        if let Some(config) = configs.get_mut(config_id) {
            config.record_calculation(duration_ms, Utc::now());
            let snapshot = config.clone();
            drop(configs);
            self.persist_config(&snapshot).await;
        }
    }

    async fn record_failure(&self, config_id: &str) {
        let mut configs = self.configs.lock().await;
        if let Some(config) = configs.get_mut(config_id) {
            config.record_error();
            let error_count = config.error_count;
            let snapshot = config.clone();
            drop(configs);
            self.persist_config(&snapshot).await;
            if error_count >= MAX_CONSECUTIVE_ERRORS {
                warn!(
                    "IndicatorConfigManager: {} paused after {} consecutive errors",
                    config_id, error_count
                );
                self.paused.lock().await.insert(config_id.to_string());
            }
        }
    }

    // ------------------------------------------------------------------
    // Request handlers
    // ------------------------------------------------------------------

    async fn handle_add(&self, request: ConfigAddRequest) -> ConfigResponse {
        let mut config: IndicatorConfig = match serde_json::from_value(request.configuration) {
            Ok(c) => c,
            Err(e) => return ConfigResponse::error("add", &format!("invalid configuration: {}", e)),
        };
        if config.id.is_empty() {
            config.id = Uuid::new_v4().to_string();
        }
        let (id, strategy_id) = (config.id.clone(), config.strategy_id.clone());
        self.persist_config(&config).await;
        self.configs.lock().await.insert(id.clone(), config);
        if request.calculate_immediately
            && let Err(e) = self.calculate_one(&id).await
        {
            warn!("IndicatorConfigManager: immediate calculation failed: {}", e);
        }
        ConfigResponse::success("add", Some(id), Some(strategy_id))
    }

    async fn handle_update(&self, request: ConfigUpdateRequest) -> ConfigResponse {
        let mut configs = self.configs.lock().await;
        let Some(config) = configs.get_mut(&request.configuration_id) else {
            return ConfigResponse::error("update", "configuration not found");
        };
        let mut doc = match serde_json::to_value(&*config) {
            Ok(d) => d,
            Err(e) => return ConfigResponse::error("update", &e.to_string()),
        };
        if let (Some(target), Some(updates)) = (doc.as_object_mut(), request.updates.as_object()) {
            for (key, value) in updates {
                target.insert(key.clone(), value.clone());
            }
        }
        match serde_json::from_value::<IndicatorConfig>(doc) {
            Ok(updated) => {
                *config = updated;
                let snapshot = config.clone();
                drop(configs);
                self.persist_config(&snapshot).await;
                if request.recalculate_immediately
                    && let Err(e) = self.calculate_one(&request.configuration_id).await
                {
                    warn!("IndicatorConfigManager: recalculation failed: {}", e);
                }
                ConfigResponse::success(
                    "update",
                    Some(request.configuration_id),
                    Some(request.strategy_id),
                )
            }
            Err(e) => ConfigResponse::error("update", &format!("invalid updates: {}", e)),
        }
    }

    async fn handle_remove(&self, request: ConfigRemoveRequest) -> ConfigResponse {
        self.configs.lock().await.remove(&request.configuration_id);
        self.result_cache.lock().await.remove(&request.configuration_id);
        match self
            .store
            .delete(
                containers::INDICATOR_CONFIGS,
                &request.configuration_id,
                &request.strategy_id,
            )
            .await
        {
            Ok(true) => ConfigResponse::success(
                "remove",
                Some(request.configuration_id),
                Some(request.strategy_id),
            ),
            Ok(false) => ConfigResponse::error("remove", "configuration not found"),
            Err(e) => ConfigResponse::error("remove", &e.to_string()),
        }
    }

    async fn handle_bulk(&self, request: ConfigBulkRequest) -> ConfigResponse {
        let batch: Vec<String> = request
            .configuration_ids
            .into_iter()
            .take(BULK_BATCH_SIZE)
            .collect();
        let mut calculated = 0;
        for id in &batch {
            if self.calculate_one(id).await.is_ok() {
                calculated += 1;
            }
        }
        info!(
            "IndicatorConfigManager: bulk batch done ({}/{} calculated)",
            calculated,
            batch.len()
        );
        ConfigResponse::success("bulk", None, None)
    }

    async fn handle_subscribe(&self, request: ConfigSubscribeRequest) -> ConfigResponse {
        let subscription = IndicatorSubscription {
            id: Uuid::new_v4().to_string(),
            name: request.name,
            configuration_ids: request.configuration_ids,
            reply_to: request.reply_to,
            created_at: Utc::now(),
        };
        match serde_json::to_value(&subscription) {
            Ok(doc) => {
                if let Err(e) = self
                    .store
                    .upsert(containers::INDICATOR_SUBSCRIPTIONS, &doc)
                    .await
                {
                    return ConfigResponse::error("subscribe", &e.to_string());
                }
                ConfigResponse::success("subscribe", Some(subscription.id), None)
            }
            Err(e) => ConfigResponse::error("subscribe", &e.to_string()),
        }
    }

    async fn persist_config(&self, config: &IndicatorConfig) {
        match serde_json::to_value(config) {
            Ok(doc) => {
                if let Err(e) = self.store.upsert(containers::INDICATOR_CONFIGS, &doc).await {
                    warn!("IndicatorConfigManager: config persist failed: {}", e);
                }
            }
            Err(e) => warn!("IndicatorConfigManager: config serialize failed: {}", e),
        }
    }

    async fn persist_result(&self, result: &IndicatorCalculationResult) {
        let mut doc = match serde_json::to_value(result) {
            Ok(d) => d,
            Err(e) => {
                warn!("IndicatorConfigManager: result serialize failed: {}", e);
                return;
            }
        };
        doc["id"] = serde_json::Value::String(Uuid::new_v4().to_string());
        if let Err(e) = self.store.upsert(containers::INDICATOR_RESULTS, &doc).await {
            warn!("IndicatorConfigManager: result persist failed: {}", e);
        }
    }

    /// Background loops: DB refresh every 5 minutes, calculation sweep on
    /// the configured interval.
    pub async fn run_loops(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut refresh = tokio::time::interval(std::time::Duration::from_secs(300));
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut calculate = tokio::time::interval(std::time::Duration::from_secs(
            self.update_interval_secs.max(1) as u64,
        ));
        calculate.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        refresh.tick().await;
        calculate.tick().await;

        loop {
            tokio::select! {
                _ = refresh.tick() => {
                    if let Err(e) = self.refresh_from_store().await {
                        warn!("IndicatorConfigManager: refresh failed: {}", e);
                    }
                }
                _ = calculate.tick() => {
                    let n = self.calculate_due().await;
                    if n > 0 {
                        debug!("IndicatorConfigManager: sweep calculated {} configs", n);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("IndicatorConfigManager: shutdown");
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl MessageHandler for IndicatorConfigManager {
    async fn handle(&self, message: Message) -> HandlerOutcome {
        let response = match message.routing_key.as_str() {
            topics::keys::CONFIG_REQUEST_ADD => {
                match serde_json::from_value::<ConfigAddRequest>(message.payload.clone()) {
                    Ok(request) => self.handle_add(request).await,
                    Err(e) => ConfigResponse::error("add", &e.to_string()),
                }
            }
            topics::keys::CONFIG_REQUEST_UPDATE => {
                match serde_json::from_value::<ConfigUpdateRequest>(message.payload.clone()) {
                    Ok(request) => self.handle_update(request).await,
                    Err(e) => ConfigResponse::error("update", &e.to_string()),
                }
            }
            topics::keys::CONFIG_REQUEST_REMOVE => {
                match serde_json::from_value::<ConfigRemoveRequest>(message.payload.clone()) {
                    Ok(request) => self.handle_remove(request).await,
                    Err(e) => ConfigResponse::error("remove", &e.to_string()),
                }
            }
            topics::keys::CONFIG_REQUEST_BULK => {
                match serde_json::from_value::<ConfigBulkRequest>(message.payload.clone()) {
                    Ok(request) => self.handle_bulk(request).await,
                    Err(e) => ConfigResponse::error("bulk", &e.to_string()),
                }
            }
            topics::keys::CONFIG_REQUEST_SUBSCRIBE => {
                match serde_json::from_value::<ConfigSubscribeRequest>(message.payload.clone()) {
                    Ok(request) => self.handle_subscribe(request).await,
                    Err(e) => ConfigResponse::error("subscribe", &e.to_string()),
                }
            }
            other => {
                warn!("IndicatorConfigManager: unknown routing key {}", other);
                return HandlerOutcome::Nack;
            }
        };

        if let Ok(payload) = serde_json::to_value(&response) {
            let _ = self
                .fabric
                .respond(
                    &message,
                    topics::exchanges::INDICATOR_CONFIG,
                    "config.response",
                    payload,
                )
                .await;
        }
        HandlerOutcome::Ack
    }
}

/// Minimal built-in calculator: last close, simple moving average over
/// the requested periods, and close-over-window change. Real indicator
/// math plugs in through the same port.
pub struct BasicIndicatorCalculator;

#[async_trait]
impl IndicatorCalculator for BasicIndicatorCalculator {
    async fn calculate(
        &self,
        config: &IndicatorConfig,
        candles: &[Candle],
    ) -> Result<serde_json::Value> {
        use rust_decimal::prelude::ToPrimitive;
        anyhow::ensure!(
            !candles.is_empty(),
            "no candles for {} {}",
            config.symbol,
            config.interval
        );
        let closes: Vec<f64> = candles.iter().filter_map(|c| c.close.to_f64()).collect();
        let window = (config.periods_required as usize).min(closes.len()).max(1);
        let tail = &closes[closes.len() - window..];
        let sma = tail.iter().sum::<f64>() / tail.len() as f64;
        let last = *closes.last().unwrap_or(&0.0);
        let first = tail.first().copied().unwrap_or(last);
        let change_percent = if first != 0.0 {
            (last - first) / first * 100.0
        } else {
            0.0
        };
        Ok(serde_json::json!({
            "last": last,
            "sma": sma,
            "change_percent": change_percent,
            "periods": window,
        }))
    }
}

fn interval_seconds(interval: &str) -> i64 {
    match interval {
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
    use crate::infrastructure::messaging::{FabricConfig, declare_core_topology};
    use crate::infrastructure::persistence::MemoryStore;
    use crate::infrastructure::venues::MockVenueClient;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedCalculator {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl IndicatorCalculator for FixedCalculator {
        async fn calculate(
            &self,
            config: &IndicatorConfig,
            candles: &[Candle],
        ) -> Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("calculator exploded");
            }
            Ok(json!({"indicator": config.indicator_type, "candles": candles.len()}))
        }
    }

    async fn manager(fail: bool) -> (Arc<dyn Store>, Arc<IndicatorConfigManager>, Arc<FixedCalculator>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let fabric = MessageFabric::new(FabricConfig::default());
        declare_core_topology(&fabric).await.unwrap();
        let venue = Arc::new(MockVenueClient::new("mock", dec!(100000)));
        venue.set_price("BTC/USDT", dec!(30000)).await;
        let calculator = Arc::new(FixedCalculator {
            calls: AtomicUsize::new(0),
            fail,
        });
        let manager = Arc::new(IndicatorConfigManager::new(
            Arc::clone(&store),
            Arc::clone(&calculator) as Arc<dyn IndicatorCalculator>,
            venue,
            fabric,
            Metrics::new().unwrap(),
            60,
        ));
        (store, manager, calculator)
    }

    fn config_doc(id: &str) -> serde_json::Value {
        serde_json::to_value(IndicatorConfig::new(
            id.to_string(),
            "strat-1".to_string(),
            "rsi".to_string(),
            "BTC/USDT".to_string(),
            "1h".to_string(),
            json!({"period": 14}),
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_add_then_remove_restores_store() {
        let (store, manager, _calc) = manager(false).await;
        let response = manager
            .handle_add(ConfigAddRequest {
                configuration: config_doc("cfg-1"),
                calculate_immediately: false,
                reply_to: None,
            })
            .await;
        assert_eq!(response.status, "success");

        let docs = store
            .query(containers::INDICATOR_CONFIGS, &QueryFilter::new())
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);

        let response = manager
            .handle_remove(ConfigRemoveRequest {
                configuration_id: "cfg-1".to_string(),
                strategy_id: "strat-1".to_string(),
            })
            .await;
        assert_eq!(response.status, "success");
        let docs = store
            .query(containers::INDICATOR_CONFIGS, &QueryFilter::new())
            .await
            .unwrap();
        assert!(docs.is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_is_error_envelope() {
        let (_store, manager, _calc) = manager(false).await;
        let response = manager
            .handle_remove(ConfigRemoveRequest {
                configuration_id: "ghost".to_string(),
                strategy_id: "strat-1".to_string(),
            })
            .await;
        assert_eq!(response.status, "error");
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn test_sweep_calculates_and_records_stats() {
        let (store, manager, calc) = manager(false).await;
        manager
            .handle_add(ConfigAddRequest {
                configuration: config_doc("cfg-1"),
                calculate_immediately: false,
                reply_to: None,
            })
            .await;
        let n = manager.calculate_due().await;
        assert_eq!(n, 1);
        assert_eq!(calc.calls.load(Ordering::SeqCst), 1);

        let docs = store
            .query(containers::INDICATOR_CONFIGS, &QueryFilter::new())
            .await
            .unwrap();
        assert_eq!(docs[0]["calc_count"], 1);
        assert!(docs[0]["last_calculated"].is_string());

        let results = store
            .query(containers::INDICATOR_RESULTS, &QueryFilter::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);

        // Freshly calculated: nothing due on the next sweep.
        assert_eq!(manager.calculate_due().await, 0);
    }

    #[tokio::test]
    async fn test_three_errors_pause_until_refresh() {
        let (_store, manager, calc) = manager(true).await;
        manager
            .handle_add(ConfigAddRequest {
                configuration: config_doc("cfg-err"),
                calculate_immediately: false,
                reply_to: None,
            })
            .await;

        for _ in 0..3 {
            let _ = manager.calculate_one("cfg-err").await;
        }
        assert_eq!(calc.calls.load(Ordering::SeqCst), 3);

        // Paused: the sweep skips it.
        assert_eq!(manager.calculate_due().await, 0);
        assert_eq!(calc.calls.load(Ordering::SeqCst), 3);

        // Refresh un-benches.
        manager.refresh_from_store().await.unwrap();
        let _ = manager.calculate_one("cfg-err").await;
        assert_eq!(calc.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let (_store, manager, _calc) = manager(false).await;
        manager
            .handle_add(ConfigAddRequest {
                configuration: config_doc("cfg-1"),
                calculate_immediately: false,
                reply_to: None,
            })
            .await;
        let response = manager
            .handle_update(ConfigUpdateRequest {
                configuration_id: "cfg-1".to_string(),
                strategy_id: "strat-1".to_string(),
                updates: json!({"priority": 9, "publish": false}),
                recalculate_immediately: false,
            })
            .await;
        assert_eq!(response.status, "success");
        let configs = manager.configs.lock().await;
        let config = configs.get("cfg-1").unwrap();
        assert_eq!(config.priority, 9);
        assert!(!config.publish);
    }

    #[tokio::test]
    async fn test_malformed_message_gets_error_response() {
        let (_store, manager, _calc) = manager(false).await;
        let message = Message::new(
            topics::exchanges::INDICATOR_CONFIG,
            topics::keys::CONFIG_REQUEST_ADD,
            json!({"configuration": 42}),
        );
        // Handler acks (a response envelope was produced).
        assert_eq!(manager.handle(message).await, HandlerOutcome::Ack);
    }
}
