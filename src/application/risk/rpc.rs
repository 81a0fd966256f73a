//! The on-wire risk gate. Consumes `risk.check.request`, runs the sizing
//! engine and the advanced controller, and publishes exactly one response
//! per request id on `risk.check.response`. Duplicate ids are dropped;
//! internal failures come back as `approved=false`, never as an error to
//! the caller.

use crate::application::risk::advanced_controller::AdvancedRiskController;
use crate::application::risk::data::RiskData;
use crate::application::risk::position_sizing::PositionSizingEngine;
use crate::domain::risk::PositionSizeRequest;
use crate::domain::store::{Store, containers};
use crate::domain::trading::OrderSide;
use crate::infrastructure::messaging::contracts::{RiskCheckRequest, RiskCheckResponse};
use crate::infrastructure::messaging::{
    HandlerOutcome, Message, MessageFabric, MessageHandler, topics,
};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const DEDUP_CAPACITY: usize = 4096;
pub const RISK_CHECK_QUEUE: &str = "risk_manager.checks";

struct DedupWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupWindow {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns false when the id was already recorded.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > DEDUP_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

pub struct RiskCheckService {
    data: Arc<RiskData>,
    sizing: Arc<PositionSizingEngine>,
    gate: Arc<AdvancedRiskController>,
    fabric: MessageFabric,
    dedup: Mutex<DedupWindow>,
}

impl RiskCheckService {
    pub fn new(
        data: Arc<RiskData>,
        sizing: Arc<PositionSizingEngine>,
        gate: Arc<AdvancedRiskController>,
        fabric: MessageFabric,
    ) -> Self {
        Self {
            data,
            sizing,
            gate,
            fabric,
            dedup: Mutex::new(DedupWindow::new()),
        }
    }

    /// Bind the consumer queue and start serving.
    pub async fn start(self: Arc<Self>) -> anyhow::Result<()> {
        self.fabric
            .subscribe(
                RISK_CHECK_QUEUE,
                &[(topics::exchanges::RISK_CHECK, topics::keys::RISK_CHECK_REQUEST)],
                Arc::clone(&self) as Arc<dyn MessageHandler>,
                Some(50),
            )
            .await?;
        info!("RiskCheckService: consuming on {}", RISK_CHECK_QUEUE);
        Ok(())
    }

    pub async fn evaluate(&self, request: &RiskCheckRequest) -> RiskCheckResponse {
        // SELL requires an existing position large enough to sell.
        if request.order_side == OrderSide::Sell {
            match self.data.position_for_symbol(&request.symbol).await {
                Ok(Some(position)) if position.quantity >= request.quantity => {}
                Ok(_) => {
                    return RiskCheckResponse {
                        request_id: request.request_id.clone(),
                        approved: false,
                        recommended_quantity: Decimal::ZERO,
                        max_loss_usd: Decimal::ZERO,
                        confidence_score: 0.0,
                        risk_factors: Default::default(),
                        warnings: Vec::new(),
                        stop_loss_price: None,
                        reason: format!(
                            "No position in {} with quantity >= {}",
                            request.symbol, request.quantity
                        ),
                        timestamp: Utc::now(),
                        price_prediction: None,
                    };
                }
                Err(e) => {
                    return RiskCheckResponse::internal_error(&request.request_id, &e.to_string());
                }
            }
        }

        let requested_usd = (request.quantity * request.price).to_f64().unwrap_or(0.0);
        let gate_result = self
            .gate
            .approve_new_position(
                &request.symbol,
                &request.strategy_id,
                request.signal_strength,
                requested_usd,
                request.price,
                None,
            )
            .await;

        if !gate_result.approved {
            return RiskCheckResponse {
                request_id: request.request_id.clone(),
                approved: false,
                recommended_quantity: Decimal::ZERO,
                max_loss_usd: Decimal::ZERO,
                confidence_score: 0.0,
                risk_factors: gate_result.risk_factors,
                warnings: gate_result.warnings,
                stop_loss_price: None,
                reason: gate_result.rejections.join("; "),
                timestamp: Utc::now(),
                price_prediction: None,
            };
        }

        let sizing_request = PositionSizeRequest {
            symbol: request.symbol.clone(),
            strategy_id: request.strategy_id.clone(),
            signal_strength: request.signal_strength,
            current_price: request.price,
            volatility: None,
            stop_loss_percent: Some(gate_result.stop_loss_params.initial_stop_percent),
            risk_per_trade_percent: None,
            order_side: request.order_side,
        };
        let sizing = self.sizing.calculate_size(&sizing_request).await;

        let mut warnings = gate_result.warnings;
        warnings.extend(sizing.warnings.iter().cloned());
        let mut risk_factors = gate_result.risk_factors;
        for (k, v) in sizing.risk_factors.as_map() {
            risk_factors.insert(k, v);
        }

        let adjusted = sizing.recommended_quantity
            * Decimal::from_f64_retain(gate_result.position_size_adjustment)
                .unwrap_or(Decimal::ONE);
        let recommended_quantity = crate::domain::trading::round_to_lot(
            adjusted.min(request.quantity),
            &request.symbol,
        );

        RiskCheckResponse {
            request_id: request.request_id.clone(),
            approved: sizing.approved,
            recommended_quantity,
            max_loss_usd: sizing.max_loss_usd,
            confidence_score: sizing.confidence_score,
            risk_factors,
            warnings,
            stop_loss_price: Some(sizing.stop_loss_price),
            reason: if sizing.approved {
                "approved".to_string()
            } else {
                sizing
                    .rejection_reason
                    .unwrap_or_else(|| "rejected by sizing".to_string())
            },
            timestamp: Utc::now(),
            price_prediction: sizing.prediction,
        }
    }

    async fn persist_decision(&self, request: &RiskCheckRequest, response: &RiskCheckResponse) {
        let doc = serde_json::json!({
            "id": request.request_id,
            "symbol": request.symbol,
            "strategy_id": request.strategy_id,
            "approved": response.approved,
            "recommended_quantity": response.recommended_quantity.to_string(),
            "reason": response.reason,
            "decided_at": response.timestamp.to_rfc3339(),
        });
        if let Err(e) = self.data.store().upsert(containers::RISK_CHECKS, &doc).await {
            warn!(
                "RiskCheckService: decision persist failed for {}: {}",
                request.request_id, e
            );
        }
    }
}

#[async_trait]
impl MessageHandler for RiskCheckService {
    async fn handle(&self, message: Message) -> HandlerOutcome {
        let request: RiskCheckRequest = match serde_json::from_value(message.payload.clone()) {
            Ok(r) => r,
            Err(e) => {
                warn!("RiskCheckService: unparseable request: {}", e);
                return HandlerOutcome::Nack;
            }
        };

        // At-least-once delivery: duplicates get no second decision.
        if !self.dedup.lock().await.insert(&request.request_id) {
            info!(
                "RiskCheckService: duplicate request {} dropped",
                request.request_id
            );
            return HandlerOutcome::Ack;
        }

        let response = self.evaluate(&request).await;
        self.persist_decision(&request, &response).await;

        let payload = match serde_json::to_value(&response) {
            Ok(v) => v,
            Err(e) => {
                warn!("RiskCheckService: response serialize failed: {}", e);
                return HandlerOutcome::Ack;
            }
        };
        if let Err(e) = self
            .fabric
            .respond(
                &message,
                topics::exchanges::RISK_CHECK,
                topics::keys::RISK_CHECK_RESPONSE,
                payload,
            )
            .await
        {
            warn!("RiskCheckService: response publish failed: {}", e);
        }
        HandlerOutcome::Ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::risk::correlation::CorrelationTracker;
    use crate::application::risk::stop_loss_manager::StopLossManager;
    use crate::config::RiskLimitsConfig;
    use crate::domain::store::Store;
    use crate::infrastructure::messaging::{FabricConfig, declare_core_topology};
    use crate::infrastructure::observability::Metrics;
    use crate::infrastructure::persistence::MemoryStore;
    use rust_decimal_macros::dec;
    use serde_json::json;

    async fn service(cash: &str) -> (Arc<dyn Store>, Arc<RiskCheckService>, MessageFabric) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store
            .upsert(
                containers::ACCOUNT,
                &json!({
                    "id": "primary",
                    "total_balance_usd": cash,
                    "available_balance_usd": cash,
                    "updated_at": Utc::now().to_rfc3339(),
                }),
            )
            .await
            .unwrap();
        let limits = RiskLimitsConfig::default();
        let data = Arc::new(RiskData::new(Arc::clone(&store), limits.clone()));
        let fabric = MessageFabric::new(FabricConfig::default());
        declare_core_topology(&fabric).await.unwrap();
        let correlation = Arc::new(CorrelationTracker::new(0.7));
        let stops = Arc::new(StopLossManager::new(
            Arc::clone(&data),
            fabric.clone(),
            Metrics::new().unwrap(),
            limits.clone(),
        ));
        let gate = Arc::new(AdvancedRiskController::new(
            Arc::clone(&data),
            Arc::clone(&correlation),
            stops,
            fabric.clone(),
            Metrics::new().unwrap(),
            limits.clone(),
        ));
        let sizing = Arc::new(PositionSizingEngine::new(
            Arc::clone(&data),
            limits,
            correlation,
            None,
        ));
        let svc = Arc::new(RiskCheckService::new(data, sizing, gate, fabric.clone()));
        (store, svc, fabric)
    }

    fn request(id: &str, side: OrderSide) -> RiskCheckRequest {
        RiskCheckRequest {
            request_id: id.to_string(),
            symbol: "BTC/USDT".to_string(),
            strategy_id: "strat-1".to_string(),
            order_type: "market".to_string(),
            order_side: side,
            quantity: dec!(0.05),
            price: dec!(30000),
            signal_strength: 0.9,
            timestamp: Utc::now(),
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn test_buy_request_approved_with_quantity() {
        let (_store, svc, _fabric) = service("100000").await;
        let response = svc.evaluate(&request("r1", OrderSide::Buy)).await;
        assert!(response.approved, "reason: {}", response.reason);
        assert!(response.recommended_quantity > Decimal::ZERO);
        assert!(response.recommended_quantity <= dec!(0.05));
        assert!(response.stop_loss_price.is_some());
    }

    #[tokio::test]
    async fn test_sell_without_position_rejected() {
        let (_store, svc, _fabric) = service("100000").await;
        let response = svc.evaluate(&request("r2", OrderSide::Sell)).await;
        assert!(!response.approved);
        assert!(response.reason.contains("No position"));
    }

    #[tokio::test]
    async fn test_sell_with_sufficient_position_passes_check() {
        let (store, svc, _fabric) = service("100000").await;
        store
            .upsert(
                containers::POSITIONS,
                &json!({
                    "id": "p1",
                    "symbol": "BTC/USDT",
                    "strategy_id": "strat-1",
                    "side": "BUY",
                    "quantity": "0.1",
                    "entry_price": "29000",
                    "current_price": "30000",
                    "opened_at": Utc::now().to_rfc3339(),
                }),
            )
            .await
            .unwrap();
        let response = svc.evaluate(&request("r3", OrderSide::Sell)).await;
        // Position check passes; outcome is then up to the gate/sizing.
        assert!(!response.reason.contains("No position"));
    }

    #[tokio::test]
    async fn test_duplicate_request_single_decision() {
        let (store, svc, _fabric) = service("100000").await;
        let msg = Message::new(
            topics::exchanges::RISK_CHECK,
            topics::keys::RISK_CHECK_REQUEST,
            serde_json::to_value(request("dup-1", OrderSide::Buy)).unwrap(),
        );
        assert_eq!(svc.handle(msg.clone()).await, HandlerOutcome::Ack);
        assert_eq!(svc.handle(msg).await, HandlerOutcome::Ack);

        let decisions = store
            .query(containers::RISK_CHECKS, &crate::domain::store::QueryFilter::new())
            .await
            .unwrap();
        assert_eq!(decisions.len(), 1);
    }

    #[tokio::test]
    async fn test_rpc_roundtrip_over_fabric() {
        let (_store, svc, fabric) = service("100000").await;
        svc.start().await.unwrap();

        let response = fabric
            .request(
                topics::exchanges::RISK_CHECK,
                topics::keys::RISK_CHECK_REQUEST,
                topics::keys::RISK_CHECK_RESPONSE,
                serde_json::to_value(request("rpc-1", OrderSide::Buy)).unwrap(),
                Some(std::time::Duration::from_secs(3)),
            )
            .await
            .unwrap();
        let parsed: RiskCheckResponse = serde_json::from_value(response.payload).unwrap();
        assert_eq!(parsed.request_id, "rpc-1");
        assert!(parsed.approved);
    }

    #[tokio::test]
    async fn test_malformed_request_nacked() {
        let (_store, svc, _fabric) = service("100000").await;
        let msg = Message::new(
            topics::exchanges::RISK_CHECK,
            topics::keys::RISK_CHECK_REQUEST,
            json!({"not": "a request"}),
        );
        assert_eq!(svc.handle(msg).await, HandlerOutcome::Nack);
    }
}
