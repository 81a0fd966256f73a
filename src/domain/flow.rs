use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    ExchangeIn,
    ExchangeOut,
    WhaleTransfer,
    LargeTx,
    SmartMoney,
    MinerOut,
}

impl fmt::Display for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowType::ExchangeIn => "exchange_in",
            FlowType::ExchangeOut => "exchange_out",
            FlowType::WhaleTransfer => "whale_transfer",
            FlowType::LargeTx => "large_tx",
            FlowType::SmartMoney => "smart_money",
            FlowType::MinerOut => "miner_out",
        };
        write!(f, "{}", s)
    }
}

/// On-chain flow observation. Time-series row keyed by
/// `(ts, asset, flow_type, tx_hash)`; duplicate keys are dropped on insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub ts: DateTime<Utc>,
    pub asset: String,
    pub flow_type: FlowType,
    pub amount: Decimal,
    pub source: Option<String>,
    pub tx_hash: Option<String>,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub usd_value: Option<Decimal>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowBucket {
    Hourly,
    Daily,
}

impl FlowBucket {
    pub fn seconds(self) -> i64 {
        match self {
            FlowBucket::Hourly => 3600,
            FlowBucket::Daily => 86400,
        }
    }
}

/// Continuous-aggregate row over `(bucket, asset, flow_type)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowAggregate {
    pub bucket: DateTime<Utc>,
    pub asset: String,
    pub flow_type: FlowType,
    pub total_amount: Decimal,
    pub total_usd_value: Decimal,
    pub flow_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&FlowType::WhaleTransfer).unwrap(),
            "\"whale_transfer\""
        );
        let ft: FlowType = serde_json::from_str("\"miner_out\"").unwrap();
        assert_eq!(ft, FlowType::MinerOut);
    }

    #[test]
    fn test_bucket_widths() {
        assert_eq!(FlowBucket::Hourly.seconds(), 3600);
        assert_eq!(FlowBucket::Daily.seconds(), 86400);
    }
}
