//! In-process message fabric with the AMQP topology model: named
//! exchanges (direct / fanout / topic), durable queues, pattern bindings,
//! per-consumer prefetch, and reply-to request/response correlation.
//!
//! Delivery is at-least-once: a handler returning `Requeue` sees the
//! message again (bounded by `max_redeliveries`), so handlers must be
//! idempotent on their natural keys (request-id, opportunity-id, order-id).

use crate::domain::errors::FabricError;
use crate::infrastructure::messaging::topics::topic_matches;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: String,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Value,
    pub headers: BTreeMap<String, String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub priority: u8,
    pub persistent: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub redeliveries: u32,
    pub published_at: DateTime<Utc>,
}

impl Message {
    pub fn new(exchange: &str, routing_key: &str, payload: Value) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            headers: BTreeMap::new(),
            correlation_id: None,
            reply_to: None,
            priority: 0,
            persistent: false,
            expires_at: None,
            redeliveries: 0,
            published_at: Utc::now(),
        }
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_string());
        self
    }

    pub fn with_reply_to(mut self, queue: &str) -> Self {
        self.reply_to = Some(queue.to_string());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default());
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| now > e).unwrap_or(false)
    }
}

/// Consumer verdict for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Ack,
    /// Drop without redelivery (unparseable messages).
    Nack,
    /// Redeliver, bounded by `max_redeliveries`.
    Requeue,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> HandlerOutcome;
}

#[derive(Debug, Clone)]
struct Binding {
    pattern: String,
    queue: String,
}

struct Exchange {
    kind: ExchangeType,
    bindings: Vec<Binding>,
}

struct QueueState {
    tx: mpsc::UnboundedSender<Message>,
    rx: Option<mpsc::UnboundedReceiver<Message>>,
    durable: bool,
}

#[derive(Debug, Clone)]
pub struct FabricConfig {
    pub default_prefetch: usize,
    pub max_redeliveries: u32,
    pub default_rpc_timeout: Duration,
    pub response_ttl: Duration,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            default_prefetch: 50,
            max_redeliveries: 3,
            default_rpc_timeout: Duration::from_secs(5),
            response_ttl: Duration::from_secs(30),
        }
    }
}

/// The broker. Cheap to clone; all clones share topology.
pub struct MessageFabric {
    exchanges: Arc<RwLock<HashMap<String, Exchange>>>,
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
    config: FabricConfig,
}

impl Clone for MessageFabric {
    fn clone(&self) -> Self {
        Self {
            exchanges: Arc::clone(&self.exchanges),
            queues: Arc::clone(&self.queues),
            config: self.config.clone(),
        }
    }
}

impl MessageFabric {
    pub fn new(config: FabricConfig) -> Self {
        Self {
            exchanges: Arc::new(RwLock::new(HashMap::new())),
            queues: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> Result<(), FabricError> {
        let mut exchanges = self.exchanges.write().await;
        if let Some(existing) = exchanges.get(name) {
            if existing.kind != kind {
                return Err(FabricError::ExchangeTypeMismatch {
                    exchange: name.to_string(),
                });
            }
            return Ok(());
        }
        exchanges.insert(
            name.to_string(),
            Exchange {
                kind,
                bindings: Vec::new(),
            },
        );
        debug!("Fabric: declared exchange {} ({:?})", name, kind);
        Ok(())
    }

    pub async fn declare_queue(&self, name: &str, durable: bool) {
        let mut queues = self.queues.lock().await;
        if queues.contains_key(name) {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        queues.insert(
            name.to_string(),
            QueueState {
                tx,
                rx: Some(rx),
                durable,
            },
        );
        debug!("Fabric: declared queue {} (durable={})", name, durable);
    }

    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), FabricError> {
        {
            let queues = self.queues.lock().await;
            if !queues.contains_key(queue) {
                return Err(FabricError::UnknownQueue {
                    queue: queue.to_string(),
                });
            }
        }
        let mut exchanges = self.exchanges.write().await;
        let ex = exchanges
            .get_mut(exchange)
            .ok_or_else(|| FabricError::UnknownExchange {
                exchange: exchange.to_string(),
            })?;
        let duplicate = ex
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.pattern == pattern);
        if !duplicate {
            ex.bindings.push(Binding {
                pattern: pattern.to_string(),
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    /// Route a message. An empty exchange name is the default exchange:
    /// the routing key addresses a queue directly (reply-to delivery).
    pub async fn publish(&self, message: Message) -> Result<(), FabricError> {
        if message.exchange.is_empty() {
            let queues = self.queues.lock().await;
            return match queues.get(&message.routing_key) {
                Some(q) => {
                    let _ = q.tx.send(message);
                    Ok(())
                }
                None => {
                    warn!(
                        "Fabric: unroutable reply to queue {} dropped",
                        message.routing_key
                    );
                    Ok(())
                }
            };
        }

        let targets: Vec<String> = {
            let exchanges = self.exchanges.read().await;
            let ex = exchanges
                .get(&message.exchange)
                .ok_or_else(|| FabricError::UnknownExchange {
                    exchange: message.exchange.clone(),
                })?;
            ex.bindings
                .iter()
                .filter(|b| match ex.kind {
                    ExchangeType::Direct => b.pattern == message.routing_key,
                    ExchangeType::Fanout => true,
                    ExchangeType::Topic => topic_matches(&b.pattern, &message.routing_key),
                })
                .map(|b| b.queue.clone())
                .collect()
        };

        if targets.is_empty() {
            debug!(
                "Fabric: no binding for {}:{} - message dropped",
                message.exchange, message.routing_key
            );
            return Ok(());
        }

        let queues = self.queues.lock().await;
        for queue in targets {
            if let Some(q) = queues.get(&queue) {
                let _ = q.tx.send(message.clone());
            }
        }
        Ok(())
    }

    /// Serialize and publish a payload in one step.
    pub async fn publish_json<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), FabricError> {
        let value = serde_json::to_value(payload).map_err(|e| FabricError::PublishFailed {
            reason: e.to_string(),
        })?;
        self.publish(Message::new(exchange, routing_key, value)).await
    }

    /// Start a consumer on `queue` with the given bindings. The handler
    /// runs with at most `prefetch` messages in flight.
    pub async fn subscribe(
        &self,
        queue: &str,
        bindings: &[(&str, &str)],
        handler: Arc<dyn MessageHandler>,
        prefetch: Option<usize>,
    ) -> Result<(), FabricError> {
        self.declare_queue(queue, true).await;
        for (exchange, pattern) in bindings {
            self.bind_queue(queue, exchange, pattern).await?;
        }

        let mut rx = {
            let mut queues = self.queues.lock().await;
            let state = queues.get_mut(queue).ok_or_else(|| FabricError::UnknownQueue {
                queue: queue.to_string(),
            })?;
            state.rx.take().ok_or_else(|| FabricError::PublishFailed {
                reason: format!("queue {} already has a consumer", queue),
            })?
        };

        let prefetch = prefetch.unwrap_or(self.config.default_prefetch);
        let semaphore = Arc::new(tokio::sync::Semaphore::new(prefetch));
        let fabric = self.clone();
        let queue_name = queue.to_string();
        let max_redeliveries = self.config.max_redeliveries;

        tokio::spawn(async move {
            info!("Fabric: consumer started on {} (prefetch {})", queue_name, prefetch);
            while let Some(message) = rx.recv().await {
                if message.is_expired(Utc::now()) {
                    debug!(
                        "Fabric: expired message {} on {} dropped",
                        message.message_id, queue_name
                    );
                    continue;
                }
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let handler = Arc::clone(&handler);
                let fabric = fabric.clone();
                let queue_name = queue_name.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let mut msg = message;
                    match handler.handle(msg.clone()).await {
                        HandlerOutcome::Ack => {}
                        HandlerOutcome::Nack => {
                            warn!(
                                "Fabric: message {} nacked on {} (key {})",
                                msg.message_id, queue_name, msg.routing_key
                            );
                        }
                        HandlerOutcome::Requeue => {
                            msg.redeliveries += 1;
                            if msg.redeliveries > max_redeliveries {
                                error!(
                                    "Fabric: message {} exceeded {} redeliveries on {}, dropping",
                                    msg.message_id, max_redeliveries, queue_name
                                );
                            } else {
                                let queues = fabric.queues.lock().await;
                                if let Some(q) = queues.get(&queue_name) {
                                    let _ = q.tx.send(msg);
                                }
                            }
                        }
                    }
                });
            }
        });
        Ok(())
    }

    /// RPC over the fabric. Publishes the request with a fresh correlation
    /// id and a private reply queue bound to `response_key` on the same
    /// exchange, then waits for the correlated response. Responses carrying
    /// unknown correlation ids are acked and dropped.
    pub async fn request(
        &self,
        exchange: &str,
        routing_key: &str,
        response_key: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Message, FabricError> {
        let correlation_id = Uuid::new_v4().to_string();
        let reply_queue = format!("reply.{}", correlation_id);
        let timeout = timeout.unwrap_or(self.config.default_rpc_timeout);

        let (tx, rx) = oneshot::channel::<Message>();
        let handler = Arc::new(ReplyHandler {
            correlation_id: correlation_id.clone(),
            tx: Mutex::new(Some(tx)),
        });
        self.subscribe(&reply_queue, &[(exchange, response_key)], handler, Some(1))
            .await?;

        let message = Message::new(exchange, routing_key, payload)
            .with_correlation_id(&correlation_id)
            .with_reply_to(&reply_queue)
            .with_ttl(self.config.response_ttl);
        self.publish(message).await?;

        let result = tokio::time::timeout(timeout, rx).await;
        self.remove_queue(&reply_queue).await;

        match result {
            Ok(Ok(response)) => Ok(response),
            _ => Err(FabricError::RequestTimeout {
                routing_key: routing_key.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Publish a response for `request` on the response routing key,
    /// carrying the request's correlation id. Reply queues created by
    /// `request` are bound to that key and filter by correlation.
    pub async fn respond(
        &self,
        request: &Message,
        exchange: &str,
        response_key: &str,
        payload: Value,
    ) -> Result<(), FabricError> {
        let mut message = Message::new(exchange, response_key, payload)
            .with_ttl(self.config.response_ttl);
        if let Some(correlation_id) = &request.correlation_id {
            message = message.with_correlation_id(correlation_id);
        }
        self.publish(message).await
    }

    async fn remove_queue(&self, name: &str) {
        let mut queues = self.queues.lock().await;
        queues.remove(name);
        let mut exchanges = self.exchanges.write().await;
        for ex in exchanges.values_mut() {
            ex.bindings.retain(|b| b.queue != name);
        }
    }

    pub async fn queue_count(&self) -> usize {
        self.queues.lock().await.len()
    }
}

struct ReplyHandler {
    correlation_id: String,
    tx: Mutex<Option<oneshot::Sender<Message>>>,
}

#[async_trait]
impl MessageHandler for ReplyHandler {
    async fn handle(&self, message: Message) -> HandlerOutcome {
        if message.correlation_id.as_deref() == Some(self.correlation_id.as_str()) {
            if let Some(tx) = self.tx.lock().await.take() {
                let _ = tx.send(message);
            }
        }
        // Unknown correlation ids are acked and dropped.
        HandlerOutcome::Ack
    }
}

/// Declare the exchanges every service expects to exist.
pub async fn declare_core_topology(fabric: &MessageFabric) -> Result<(), FabricError> {
    use crate::infrastructure::messaging::topics::exchanges;
    fabric
        .declare_exchange(exchanges::RISK_CHECK, ExchangeType::Direct)
        .await?;
    fabric
        .declare_exchange(exchanges::RISK_ALERTS, ExchangeType::Fanout)
        .await?;
    fabric
        .declare_exchange(exchanges::PORTFOLIO_UPDATES, ExchangeType::Topic)
        .await?;
    fabric
        .declare_exchange(exchanges::ORDER_EXECUTION, ExchangeType::Direct)
        .await?;
    fabric
        .declare_exchange(exchanges::INDICATOR_CONFIG, ExchangeType::Topic)
        .await?;
    fabric
        .declare_exchange(exchanges::INDICATOR_RESULTS, ExchangeType::Topic)
        .await?;
    fabric
        .declare_exchange(exchanges::STRATEGY_REQUESTS, ExchangeType::Topic)
        .await?;
    fabric
        .declare_exchange(exchanges::MARKET_RESPONSES, ExchangeType::Topic)
        .await?;
    fabric
        .declare_exchange(exchanges::ARBITRAGE, ExchangeType::Topic)
        .await?;
    info!("Fabric: core topology declared");
    Ok(())
}
