use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrageType {
    CexDex,
    IntraChain,
    CrossChain,
    Triangular,
    FlashLoan,
}

impl fmt::Display for ArbitrageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArbitrageType::CexDex => "cex_dex",
            ArbitrageType::IntraChain => "intra_chain",
            ArbitrageType::CrossChain => "cross_chain",
            ArbitrageType::Triangular => "triangular",
            ArbitrageType::FlashLoan => "flash_loan",
        };
        write!(f, "{}", s)
    }
}

/// A detected price discrepancy worth evaluating.
///
/// Invariant: `sell_price >= buy_price` and
/// `profit_percent == (sell - buy) / buy * 100`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    pub id: String,
    pub pair: String,
    pub buy_venue: String,
    pub sell_venue: String,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub profit_percent: f64,
    pub estimated_profit_usd: Decimal,
    pub trade_amount: Decimal,
    pub gas_cost_usd: Decimal,
    pub opportunity_type: ArbitrageType,
    pub ts: DateTime<Utc>,
    pub executed: bool,
    pub execution_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Filled,
    Partial,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Pending)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Filled => "filled",
            ExecutionStatus::Partial => "partial",
            ExecutionStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Bookkeeping record for one attempted execution of an opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageExecution {
    pub id: String,
    pub opportunity_id: String,
    pub opportunity_type: ArbitrageType,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub tx_hashes: Vec<String>,
    pub actual_profit_usd: Option<Decimal>,
    pub gas_used_usd: Option<Decimal>,
    pub error: Option<String>,
}

impl ArbitrageExecution {
    pub fn pending(id: String, opportunity_id: String, opportunity_type: ArbitrageType) -> Self {
        Self {
            id,
            opportunity_id,
            opportunity_type,
            started_at: Utc::now(),
            completed_at: None,
            status: ExecutionStatus::Pending,
            tx_hashes: Vec::new(),
            actual_profit_usd: None,
            gas_used_usd: None,
            error: None,
        }
    }
}

/// One leg of a triangular cycle: convert `from` into `to` at `rate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriangularLeg {
    pub from: String,
    pub to: String,
    pub pair: String,
    pub rate: Decimal,
}

/// A closed cycle whose product of rates after fees exceeds 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriangularCycle {
    pub exchange: String,
    pub legs: Vec<TriangularLeg>,
    /// Product of leg rates net of per-leg fees.
    pub gross_rate: f64,
    pub profit_percent: f64,
}

/// Candidate path supplied by a flash-loan handler along with its costs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashLoanCandidate {
    pub protocol: String,
    pub token: String,
    pub path: Vec<String>,
    pub loan_amount: Decimal,
    pub expected_return: Decimal,
    pub gas_estimate_usd: Decimal,
    pub fee_percent: f64,
}
