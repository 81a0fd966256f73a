//! On-chain flow analytics over the time-series store: batched ingestion
//! with validation, net exchange flow (a proxy for sell/buy pressure),
//! and whale-activity summaries from the hourly aggregates.

use crate::domain::errors::StoreError;
use crate::domain::flow::{FlowBucket, FlowRecord, FlowType};
use crate::domain::store::Store;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, warn};

/// Net exchange flow over a window. Positive `net_flow` means coins are
/// moving onto exchanges (sell pressure building).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct NetFlow {
    pub asset: String,
    pub total_inflow: Decimal,
    pub total_outflow: Decimal,
    pub net_flow: Decimal,
    pub inflow_usd: Decimal,
    pub outflow_usd: Decimal,
    pub net_flow_usd: Decimal,
    pub inflow_count: u64,
    pub outflow_count: u64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WhaleActivity {
    pub asset: String,
    pub transfer_count: u64,
    pub total_amount: Decimal,
    pub total_usd_value: Decimal,
    pub busiest_hour: Option<DateTime<Utc>>,
}

pub struct FlowDataService {
    store: Arc<dyn Store>,
}

impl FlowDataService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Validate and append a batch. Invalid rows are dropped with a
    /// warning; duplicates are absorbed by the conflict-free insert.
    /// Returns rows actually inserted.
    pub async fn record_batch(&self, rows: Vec<FlowRecord>) -> Result<u64, StoreError> {
        let now = Utc::now();
        let valid: Vec<FlowRecord> = rows
            .into_iter()
            .filter(|row| {
                if row.asset.is_empty() {
                    warn!("FlowDataService: dropping row with empty asset");
                    return false;
                }
                if row.amount <= Decimal::ZERO {
                    warn!(
                        "FlowDataService: dropping non-positive {} flow for {}",
                        row.flow_type, row.asset
                    );
                    return false;
                }
                // Clock skew guard: nothing from the future.
                if row.ts > now + Duration::minutes(5) {
                    warn!("FlowDataService: dropping future-dated flow for {}", row.asset);
                    return false;
                }
                true
            })
            .collect();
        if valid.is_empty() {
            return Ok(0);
        }
        let inserted = self.store.append_flow(&valid).await?;
        debug!(
            "FlowDataService: {} of {} rows inserted",
            inserted,
            valid.len()
        );
        Ok(inserted)
    }

    /// Exchange in/out balance for one asset since `since`.
    pub async fn net_flow(
        &self,
        asset: &str,
        since: DateTime<Utc>,
    ) -> Result<NetFlow, StoreError> {
        let aggregates = self
            .store
            .flow_aggregate(FlowBucket::Hourly, asset, since)
            .await?;
        let mut net = NetFlow {
            asset: asset.to_string(),
            ..Default::default()
        };
        for agg in aggregates {
            match agg.flow_type {
                FlowType::ExchangeIn => {
                    net.total_inflow += agg.total_amount;
                    net.inflow_usd += agg.total_usd_value;
                    net.inflow_count += agg.flow_count;
                }
                FlowType::ExchangeOut => {
                    net.total_outflow += agg.total_amount;
                    net.outflow_usd += agg.total_usd_value;
                    net.outflow_count += agg.flow_count;
                }
                _ => {}
            }
        }
        net.net_flow = net.total_inflow - net.total_outflow;
        net.net_flow_usd = net.inflow_usd - net.outflow_usd;
        Ok(net)
    }

    /// Whale transfer summary for one asset since `since`.
    pub async fn whale_activity(
        &self,
        asset: &str,
        since: DateTime<Utc>,
    ) -> Result<WhaleActivity, StoreError> {
        let aggregates = self
            .store
            .flow_aggregate(FlowBucket::Hourly, asset, since)
            .await?;
        let mut activity = WhaleActivity {
            asset: asset.to_string(),
            ..Default::default()
        };
        let mut busiest: Option<(DateTime<Utc>, u64)> = None;
        for agg in aggregates {
            if agg.flow_type != FlowType::WhaleTransfer {
                continue;
            }
            activity.transfer_count += agg.flow_count;
            activity.total_amount += agg.total_amount;
            activity.total_usd_value += agg.total_usd_value;
            if busiest.map(|(_, count)| agg.flow_count > count).unwrap_or(true) {
                busiest = Some((agg.bucket, agg.flow_count));
            }
        }
        activity.busiest_hour = busiest.map(|(bucket, _)| bucket);
        Ok(activity)
    }
}
