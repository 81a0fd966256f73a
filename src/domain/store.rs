//! The persistence port. Document containers hold JSON documents keyed by
//! `id` plus a container-specific partition key field; the flow time-series
//! table is append-only with conflict-free inserts. Implementations live in
//! `infrastructure::persistence`.

use crate::domain::errors::StoreError;
use crate::domain::flow::{FlowAggregate, FlowBucket, FlowRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Document container names and their partition key fields.
pub mod containers {
    pub const STRATEGIES: &str = "strategies";
    pub const STRATEGY_REVIEWS: &str = "strategy_reviews";
    pub const BACKTEST_RESULTS: &str = "backtest_results";
    pub const GENERATION_JOBS: &str = "generation_jobs";
    pub const ARBITRAGE_OPPORTUNITIES: &str = "arbitrage_opportunities";
    pub const ARBITRAGE_EXECUTIONS: &str = "arbitrage_executions";
    pub const DEX_PRICES: &str = "dex_prices";
    pub const FLASH_LOAN_OPPORTUNITIES: &str = "flash_loan_opportunities";
    pub const TRIANGULAR_ARBITRAGE: &str = "triangular_arbitrage";
    pub const GAS_PRICES: &str = "gas_prices";
    pub const SYMBOL_TRACKING: &str = "symbol_tracking";
    pub const TRADING_CONFIG: &str = "trading_config";
    pub const POSITIONS: &str = "positions";
    pub const STOP_LOSS_ORDERS: &str = "stop_loss_orders";
    pub const RISK_METRICS: &str = "risk_metrics";
    pub const RISK_ALERTS: &str = "risk_alerts";
    pub const RISK_CHECKS: &str = "risk_checks";
    pub const INDICATOR_CONFIGS: &str = "indicator_configurations";
    pub const INDICATOR_RESULTS: &str = "indicator_results";
    pub const INDICATOR_SUBSCRIPTIONS: &str = "indicator_subscriptions";
    pub const ACCOUNT: &str = "account";
    pub const TRADES: &str = "trades";
    pub const SENTIMENT: &str = "sentiment";
    pub const MARKET_CANDLES: &str = "market_candles";

    /// The field a container is partitioned on.
    pub fn partition_field(container: &str) -> &'static str {
        match container {
            STRATEGY_REVIEWS | BACKTEST_RESULTS | INDICATOR_CONFIGS => "strategy_id",
            ARBITRAGE_OPPORTUNITIES | DEX_PRICES => "pair",
            ARBITRAGE_EXECUTIONS => "opportunity_id",
            FLASH_LOAN_OPPORTUNITIES => "protocol",
            TRIANGULAR_ARBITRAGE => "exchange",
            GAS_PRICES => "chain",
            SYMBOL_TRACKING | POSITIONS | INDICATOR_RESULTS | MARKET_CANDLES => "symbol",
            TRADING_CONFIG => "config_type",
            STOP_LOSS_ORDERS => "position_id",
            TRADES => "strategy_id",
            _ => "id",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone)]
pub struct Condition {
    /// Dot-separated JSON path, e.g. `"metadata.generated_at"`.
    pub field: String,
    pub op: Cmp,
    pub value: Value,
}

/// Field-predicate filter with optional ordering and limit.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub conditions: Vec<Condition>,
    pub order_by: Option<String>,
    pub descending: bool,
    pub limit: Option<usize>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.to_string(),
            op: Cmp::Eq,
            value: value.into(),
        });
        self
    }

    pub fn ne(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.to_string(),
            op: Cmp::Ne,
            value: value.into(),
        });
        self
    }

    pub fn gt(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.to_string(),
            op: Cmp::Gt,
            value: value.into(),
        });
        self
    }

    pub fn gte(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.to_string(),
            op: Cmp::Gte,
            value: value.into(),
        });
        self
    }

    pub fn lt(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.to_string(),
            op: Cmp::Lt,
            value: value.into(),
        });
        self
    }

    pub fn order_asc(mut self, field: &str) -> Self {
        self.order_by = Some(field.to_string());
        self.descending = false;
        self
    }

    pub fn order_desc(mut self, field: &str) -> Self {
        self.order_by = Some(field.to_string());
        self.descending = true;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Evaluate the conditions against one document.
    pub fn matches(&self, doc: &Value) -> bool {
        self.conditions.iter().all(|c| {
            let actual = lookup_path(doc, &c.field);
            match c.op {
                Cmp::Eq => actual == Some(&c.value),
                Cmp::Ne => actual != Some(&c.value),
                Cmp::Gt => compare(actual, &c.value).map(|o| o.is_gt()).unwrap_or(false),
                Cmp::Gte => compare(actual, &c.value).map(|o| o.is_ge()).unwrap_or(false),
                Cmp::Lt => compare(actual, &c.value).map(|o| o.is_lt()).unwrap_or(false),
                Cmp::Lte => compare(actual, &c.value).map(|o| o.is_le()).unwrap_or(false),
            }
        })
    }
}

pub fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = doc;
    for segment in path.split('.') {
        cur = cur.get(segment)?;
    }
    Some(cur)
}

/// Order numbers numerically and strings lexically (ISO-8601 timestamps
/// order correctly as strings).
pub fn compare(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let actual = actual?;
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

/// One operation inside a transactional batch. Batches are scoped to a
/// single container; backends apply them atomically where they can and by
/// best-effort compensation otherwise.
#[derive(Debug, Clone)]
pub enum StoreOp {
    Upsert(Value),
    Replace { id: String, doc: Value },
    Delete { id: String, partition_key: String },
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(
        &self,
        container: &str,
        id: &str,
        partition_key: &str,
    ) -> Result<Option<Value>, StoreError>;

    /// Insert or overwrite. Idempotent for identical `(id, partition, body)`.
    async fn upsert(&self, container: &str, doc: &Value) -> Result<(), StoreError>;

    /// Overwrite an existing document; returns false when the target does
    /// not exist (callers log a warning and continue).
    async fn replace(&self, container: &str, id: &str, doc: &Value) -> Result<bool, StoreError>;

    async fn delete(
        &self,
        container: &str,
        id: &str,
        partition_key: &str,
    ) -> Result<bool, StoreError>;

    async fn query(&self, container: &str, filter: &QueryFilter)
    -> Result<Vec<Value>, StoreError>;

    /// Single-container atomic batch.
    async fn transact(&self, container: &str, ops: Vec<StoreOp>) -> Result<(), StoreError>;

    /// Append flow rows; duplicate `(ts, asset, flow_type, tx_hash)` keys
    /// are silently dropped. Returns rows actually inserted.
    async fn append_flow(&self, rows: &[FlowRecord]) -> Result<u64, StoreError>;

    async fn flow_aggregate(
        &self,
        bucket: FlowBucket,
        asset: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FlowAggregate>, StoreError>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Extract `id` and the partition key from a document headed for `container`.
pub fn document_keys(container: &str, doc: &Value) -> Result<(String, String), StoreError> {
    let id = doc
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| StoreError::MissingField {
            container: container.to_string(),
            field: "id".to_string(),
        })?;
    let pk_field = containers::partition_field(container);
    let pk = doc
        .get(pk_field)
        .map(json_key_string)
        .ok_or_else(|| StoreError::MissingField {
            container: container.to_string(),
            field: pk_field.to_string(),
        })?;
    Ok((id, pk))
}

fn json_key_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches_eq_and_gt() {
        let doc = json!({"status": "active", "score": 7.5, "meta": {"kind": "x"}});
        let f = QueryFilter::new().eq("status", "active").gt("score", 5.0);
        assert!(f.matches(&doc));

        let f = QueryFilter::new().eq("status", "paused");
        assert!(!f.matches(&doc));
    }

    #[test]
    fn test_filter_nested_path() {
        let doc = json!({"meta": {"kind": "x"}});
        assert!(QueryFilter::new().eq("meta.kind", "x").matches(&doc));
        assert!(!QueryFilter::new().eq("meta.kind", "y").matches(&doc));
        assert!(!QueryFilter::new().eq("meta.missing", "x").matches(&doc));
    }

    #[test]
    fn test_filter_string_ordering_for_timestamps() {
        let doc = json!({"ts": "2026-07-02T00:00:00Z"});
        assert!(
            QueryFilter::new()
                .gt("ts", "2026-07-01T00:00:00Z")
                .matches(&doc)
        );
        assert!(
            !QueryFilter::new()
                .gt("ts", "2026-07-03T00:00:00Z")
                .matches(&doc)
        );
    }

    #[test]
    fn test_document_keys_partition_lookup() {
        let doc = json!({"id": "r1", "strategy_id": "s9", "grade": "A"});
        let (id, pk) = document_keys(containers::STRATEGY_REVIEWS, &doc).unwrap();
        assert_eq!(id, "r1");
        assert_eq!(pk, "s9");
    }

    #[test]
    fn test_document_keys_missing_field() {
        let doc = json!({"id": "r1"});
        let err = document_keys(containers::STRATEGY_REVIEWS, &doc).unwrap_err();
        assert!(err.to_string().contains("strategy_id"));
    }
}
