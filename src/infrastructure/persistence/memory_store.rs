//! Thread-safe in-memory `Store`, used by tests and the mock runtime mode.
//! Behaviour mirrors the SQLite implementation: same key extraction, same
//! conflict semantics for flow rows, same filter evaluation.

use crate::domain::errors::StoreError;
use crate::domain::flow::{FlowAggregate, FlowBucket, FlowRecord, FlowType};
use crate::domain::store::{QueryFilter, Store, StoreOp, document_keys, lookup_path};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

type DocKey = (String, String); // (id, partition_key)

#[derive(Default)]
struct Inner {
    containers: HashMap<String, HashMap<DocKey, Value>>,
    flow_rows: Vec<FlowRecord>,
    flow_keys: HashSet<(i64, String, FlowType, String)>,
    settings: HashMap<String, String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn container_len(&self, container: &str) -> usize {
        let inner = self.inner.read().await;
        inner.containers.get(container).map(|c| c.len()).unwrap_or(0)
    }
}

fn flow_key(row: &FlowRecord) -> (i64, String, FlowType, String) {
    (
        row.ts.timestamp(),
        row.asset.clone(),
        row.flow_type,
        row.tx_hash.clone().unwrap_or_default(),
    )
}

fn apply_order_and_limit(mut docs: Vec<Value>, filter: &QueryFilter) -> Vec<Value> {
    if let Some(field) = &filter.order_by {
        docs.sort_by(|a, b| {
            let av = lookup_path(a, field);
            let bv = lookup_path(b, field);
            let ord = match (av, bv) {
                (Some(Value::Number(x)), Some(Value::Number(y))) => x
                    .as_f64()
                    .partial_cmp(&y.as_f64())
                    .unwrap_or(std::cmp::Ordering::Equal),
                (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
                (Some(_), None) => std::cmp::Ordering::Greater,
                (None, Some(_)) => std::cmp::Ordering::Less,
                _ => std::cmp::Ordering::Equal,
            };
            if filter.descending { ord.reverse() } else { ord }
        });
    }
    if let Some(limit) = filter.limit {
        docs.truncate(limit);
    }
    docs
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(
        &self,
        container: &str,
        id: &str,
        partition_key: &str,
    ) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .containers
            .get(container)
            .and_then(|c| c.get(&(id.to_string(), partition_key.to_string())))
            .cloned())
    }

    async fn upsert(&self, container: &str, doc: &Value) -> Result<(), StoreError> {
        let (id, pk) = document_keys(container, doc)?;
        let mut inner = self.inner.write().await;
        inner
            .containers
            .entry(container.to_string())
            .or_default()
            .insert((id, pk), doc.clone());
        Ok(())
    }

    async fn replace(&self, container: &str, id: &str, doc: &Value) -> Result<bool, StoreError> {
        let (_, pk) = document_keys(container, doc)?;
        let mut inner = self.inner.write().await;
        let Some(c) = inner.containers.get_mut(container) else {
            return Ok(false);
        };
        let key = (id.to_string(), pk);
        if !c.contains_key(&key) {
            return Ok(false);
        }
        c.insert(key, doc.clone());
        Ok(true)
    }

    async fn delete(
        &self,
        container: &str,
        id: &str,
        partition_key: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .containers
            .get_mut(container)
            .map(|c| {
                c.remove(&(id.to_string(), partition_key.to_string()))
                    .is_some()
            })
            .unwrap_or(false))
    }

    async fn query(
        &self,
        container: &str,
        filter: &QueryFilter,
    ) -> Result<Vec<Value>, StoreError> {
        let inner = self.inner.read().await;
        let docs: Vec<Value> = inner
            .containers
            .get(container)
            .map(|c| c.values().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default();
        Ok(apply_order_and_limit(docs, filter))
    }

    async fn transact(&self, container: &str, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        // Validate keys first so a malformed op aborts before any write.
        let mut staged: Vec<(DocKey, Option<Value>)> = Vec::with_capacity(ops.len());
        for op in &ops {
            match op {
                StoreOp::Upsert(doc) => {
                    let (id, pk) = document_keys(container, doc)?;
                    staged.push(((id, pk), Some(doc.clone())));
                }
                StoreOp::Replace { id, doc } => {
                    let (_, pk) = document_keys(container, doc)?;
                    staged.push(((id.clone(), pk), Some(doc.clone())));
                }
                StoreOp::Delete { id, partition_key } => {
                    staged.push(((id.clone(), partition_key.clone()), None));
                }
            }
        }
        let mut inner = self.inner.write().await;
        let c = inner.containers.entry(container.to_string()).or_default();
        for (key, value) in staged {
            match value {
                Some(doc) => {
                    c.insert(key, doc);
                }
                None => {
                    c.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn append_flow(&self, rows: &[FlowRecord]) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let mut inserted = 0u64;
        for row in rows {
            let key = flow_key(row);
            if inner.flow_keys.insert(key) {
                inner.flow_rows.push(row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn flow_aggregate(
        &self,
        bucket: FlowBucket,
        asset: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FlowAggregate>, StoreError> {
        let inner = self.inner.read().await;
        let width = bucket.seconds();
        let mut grouped: BTreeMap<(i64, FlowType), (Decimal, Decimal, u64)> = BTreeMap::new();
        for row in inner
            .flow_rows
            .iter()
            .filter(|r| r.asset == asset && r.ts >= since)
        {
            let bucket_ts = row.ts.timestamp() / width * width;
            let entry = grouped
                .entry((bucket_ts, row.flow_type))
                .or_insert((Decimal::ZERO, Decimal::ZERO, 0));
            entry.0 += row.amount;
            entry.1 += row.usd_value.unwrap_or(Decimal::ZERO);
            entry.2 += 1;
        }
        Ok(grouped
            .into_iter()
            .filter_map(|((bucket_ts, flow_type), (amount, usd, count))| {
                DateTime::from_timestamp(bucket_ts, 0).map(|ts| FlowAggregate {
                    bucket: ts,
                    asset: asset.to_string(),
                    flow_type,
                    total_amount: amount,
                    total_usd_value: usd,
                    flow_count: count,
                })
            })
            .collect())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.settings.get(key).cloned())
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
