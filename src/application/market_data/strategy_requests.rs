//! Serves `strategy.request.<data_type>.<priority>` messages with tagged
//! `MarketDataPayload` responses on `market.response.<data_type>`.
//! Technical indicators come from the stored calculation results,
//! sentiment from the sentiment container, and correlation from the
//! shared snapshot; the remaining data types answer from the symbol
//! tracking container where data exists.

use crate::application::risk::CorrelationTracker;
use crate::domain::store::{QueryFilter, Store, containers};
use crate::infrastructure::messaging::contracts::{
    MarketDataPayload, MarketDataResponse, StrategyDataRequest, StrategyDataType,
};
use crate::infrastructure::messaging::{
    HandlerOutcome, Message, MessageFabric, MessageHandler, topics,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

pub const STRATEGY_REQUEST_QUEUE: &str = "market_data.strategy_requests";

pub struct StrategyRequestHandler {
    store: Arc<dyn Store>,
    correlation: Arc<CorrelationTracker>,
    fabric: MessageFabric,
}

impl StrategyRequestHandler {
    pub fn new(
        store: Arc<dyn Store>,
        correlation: Arc<CorrelationTracker>,
        fabric: MessageFabric,
    ) -> Self {
        Self {
            store,
            correlation,
            fabric,
        }
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        self.fabric
            .subscribe(
                STRATEGY_REQUEST_QUEUE,
                &[
                    (topics::exchanges::STRATEGY_REQUESTS, "strategy.request.*.*"),
                    (
                        topics::exchanges::STRATEGY_REQUESTS,
                        topics::keys::STRATEGY_REQUEST_CANCEL,
                    ),
                ],
                Arc::clone(&self) as Arc<dyn MessageHandler>,
                Some(50),
            )
            .await?;
        info!(
            "StrategyRequestHandler: consuming on {}",
            STRATEGY_REQUEST_QUEUE
        );
        Ok(())
    }

    pub async fn serve(&self, request: &StrategyDataRequest) -> MarketDataPayload {
        let symbol = request.symbols.first().cloned().unwrap_or_default();
        match request.data_type {
            StrategyDataType::TechnicalIndicators => self.technical_indicators(request, &symbol).await,
            StrategyDataType::SentimentData => self.sentiment(&symbol).await,
            StrategyDataType::CorrelationMatrix => self.correlation_matrix(&request.symbols),
            other => self.from_symbol_tracking(other, &symbol).await,
        }
    }

    async fn technical_indicators(
        &self,
        request: &StrategyDataRequest,
        symbol: &str,
    ) -> MarketDataPayload {
        let interval = request.interval.clone().unwrap_or_else(|| "1h".to_string());
        let mut filter = QueryFilter::new()
            .eq("symbol", symbol)
            .eq("interval", interval.as_str())
            .order_desc("calculated_at")
            .limit(1);
        if let Some(periods) = request.lookback_periods {
            filter = filter.limit(periods as usize);
        }
        let values = self
            .store
            .query(containers::INDICATOR_RESULTS, &filter)
            .await
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|d| d.get("values").cloned())
            .unwrap_or(Value::Null);
        MarketDataPayload::TechnicalIndicators {
            symbol: symbol.to_string(),
            interval,
            values,
        }
    }

    async fn sentiment(&self, symbol: &str) -> MarketDataPayload {
        let docs = self
            .store
            .query(
                containers::SENTIMENT,
                &QueryFilter::new()
                    .eq("symbol", symbol)
                    .order_desc("ts")
                    .limit(1),
            )
            .await
            .unwrap_or_default();
        match docs.first() {
            Some(doc) => MarketDataPayload::SentimentData {
                symbol: Some(symbol.to_string()),
                polarity: doc.get("polarity").and_then(Value::as_f64).unwrap_or(0.0),
                sample_count: doc
                    .get("sample_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32,
            },
            None => MarketDataPayload::SentimentData {
                symbol: Some(symbol.to_string()),
                polarity: 0.0,
                sample_count: 0,
            },
        }
    }

    fn correlation_matrix(&self, symbols: &[String]) -> MarketDataPayload {
        let snapshot = self.correlation.snapshot();
        let requested: Vec<String> = if symbols.is_empty() {
            snapshot.symbols.clone()
        } else {
            symbols.to_vec()
        };
        let matrix: Vec<Vec<f64>> = requested
            .iter()
            .map(|a| {
                requested
                    .iter()
                    .map(|b| {
                        if a == b {
                            1.0
                        } else {
                            snapshot.pairwise(a, b).unwrap_or(0.0)
                        }
                    })
                    .collect()
            })
            .collect();
        MarketDataPayload::CorrelationMatrix {
            symbols: requested,
            matrix,
        }
    }

    /// Data types without a dedicated pipeline answer from whatever the
    /// symbol tracking document carries for them.
    async fn from_symbol_tracking(
        &self,
        data_type: StrategyDataType,
        symbol: &str,
    ) -> MarketDataPayload {
        let doc = self
            .store
            .get(containers::SYMBOL_TRACKING, symbol, symbol)
            .await
            .ok()
            .flatten()
            .unwrap_or(Value::Null);
        match data_type {
            StrategyDataType::MacroIndicators => {
                let mut indicators = BTreeMap::new();
                if let Some(map) = doc.get("macro").and_then(Value::as_object) {
                    for (key, value) in map {
                        if let Some(v) = value.as_f64() {
                            indicators.insert(key.clone(), v);
                        }
                    }
                }
                MarketDataPayload::MacroIndicators { indicators }
            }
            _ => MarketDataPayload::AlternativeData {
                source: "symbol_tracking".to_string(),
                values: doc.get(data_type.to_string().as_str()).cloned().unwrap_or(Value::Null),
            },
        }
    }
}

#[async_trait]
impl MessageHandler for StrategyRequestHandler {
    async fn handle(&self, message: Message) -> HandlerOutcome {
        if message.routing_key == topics::keys::STRATEGY_REQUEST_CANCEL {
            return HandlerOutcome::Ack;
        }
        let request: StrategyDataRequest = match serde_json::from_value(message.payload.clone()) {
            Ok(r) => r,
            Err(e) => {
                warn!("StrategyRequestHandler: unparseable request: {}", e);
                return HandlerOutcome::Nack;
            }
        };

        let payload = self.serve(&request).await;
        let response = MarketDataResponse {
            request_id: request.request_id.clone(),
            strategy_id: request.strategy_id.clone(),
            payload,
            timestamp: Utc::now(),
        };
        let key = topics::keys::market_response(&request.data_type.to_string());
        let value = match serde_json::to_value(&response) {
            Ok(v) => v,
            Err(e) => {
                warn!("StrategyRequestHandler: response serialize failed: {}", e);
                return HandlerOutcome::Ack;
            }
        };
        let mut out = Message::new(topics::exchanges::MARKET_RESPONSES, &key, value);
        if let Some(correlation_id) = &message.correlation_id {
            out = out.with_correlation_id(correlation_id);
        }
        if let Err(e) = self.fabric.publish(out).await {
            warn!("StrategyRequestHandler: response publish failed: {}", e);
        }
        HandlerOutcome::Ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::messaging::{FabricConfig, declare_core_topology};
    use crate::infrastructure::persistence::MemoryStore;
    use serde_json::json;
    use std::collections::HashMap;

    async fn handler() -> (Arc<dyn Store>, Arc<StrategyRequestHandler>, MessageFabric) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let fabric = MessageFabric::new(FabricConfig::default());
        declare_core_topology(&fabric).await.unwrap();
        let correlation = Arc::new(CorrelationTracker::new(0.7));
        let mut returns = HashMap::new();
        let base = vec![0.01, 0.02, -0.01, 0.03, -0.02, 0.01];
        returns.insert("BTC/USDT".to_string(), base.clone());
        returns.insert("ETH/USDT".to_string(), base);
        correlation.refresh(&returns, 3);
        let handler = Arc::new(StrategyRequestHandler::new(
            Arc::clone(&store),
            correlation,
            fabric.clone(),
        ));
        (store, handler, fabric)
    }

    fn request(data_type: StrategyDataType, symbols: Vec<&str>) -> StrategyDataRequest {
        StrategyDataRequest {
            request_id: "req-1".to_string(),
            strategy_id: "strat-1".to_string(),
            data_type,
            priority: crate::infrastructure::messaging::contracts::RequestPriority::Normal,
            symbols: symbols.into_iter().map(String::from).collect(),
            interval: Some("1h".to_string()),
            lookback_periods: None,
            parameters: json!({}),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_technical_indicators_from_stored_results() {
        let (store, handler, _fabric) = handler().await;
        store
            .upsert(
                containers::INDICATOR_RESULTS,
                &json!({
                    "id": "r1",
                    "symbol": "BTC/USDT",
                    "interval": "1h",
                    "values": {"rsi": 61.2},
                    "calculated_at": Utc::now().to_rfc3339(),
                }),
            )
            .await
            .unwrap();

        let payload = handler
            .serve(&request(StrategyDataType::TechnicalIndicators, vec!["BTC/USDT"]))
            .await;
        match payload {
            MarketDataPayload::TechnicalIndicators { symbol, values, .. } => {
                assert_eq!(symbol, "BTC/USDT");
                assert_eq!(values["rsi"], 61.2);
            }
            other => panic!("wrong payload variant: {:?}", other.data_type()),
        }
    }

    #[tokio::test]
    async fn test_correlation_matrix_shape() {
        let (_store, handler, _fabric) = handler().await;
        let payload = handler
            .serve(&request(
                StrategyDataType::CorrelationMatrix,
                vec!["BTC/USDT", "ETH/USDT"],
            ))
            .await;
        match payload {
            MarketDataPayload::CorrelationMatrix { symbols, matrix } => {
                assert_eq!(symbols.len(), 2);
                assert_eq!(matrix.len(), 2);
                assert_eq!(matrix[0][0], 1.0);
                assert!(matrix[0][1] > 0.9); // identical series correlate
            }
            other => panic!("wrong payload variant: {:?}", other.data_type()),
        }
    }

    #[tokio::test]
    async fn test_sentiment_defaults_when_missing() {
        let (_store, handler, _fabric) = handler().await;
        let payload = handler
            .serve(&request(StrategyDataType::SentimentData, vec!["BTC/USDT"]))
            .await;
        match payload {
            MarketDataPayload::SentimentData { polarity, sample_count, .. } => {
                assert_eq!(polarity, 0.0);
                assert_eq!(sample_count, 0);
            }
            other => panic!("wrong payload variant: {:?}", other.data_type()),
        }
    }

    #[tokio::test]
    async fn test_response_published_on_market_responses() {
        use crate::infrastructure::messaging::HandlerOutcome;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Probe {
            count: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl MessageHandler for Probe {
            async fn handle(&self, message: Message) -> HandlerOutcome {
                assert_eq!(message.payload["request_id"], "req-1");
                self.count.fetch_add(1, Ordering::SeqCst);
                HandlerOutcome::Ack
            }
        }

        let (_store, handler, fabric) = handler().await;
        Arc::clone(&handler).start().await.unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        fabric
            .subscribe(
                "probe.responses",
                &[(topics::exchanges::MARKET_RESPONSES, "market.response.*")],
                Arc::new(Probe {
                    count: Arc::clone(&count),
                }),
                None,
            )
            .await
            .unwrap();

        let req = request(StrategyDataType::SentimentData, vec!["BTC/USDT"]);
        fabric
            .publish(Message::new(
                topics::exchanges::STRATEGY_REQUESTS,
                &req.routing_key(),
                serde_json::to_value(&req).unwrap(),
            ))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
