use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    Draft,
    PaperTrading,
    Active,
    Inactive,
    Paused,
    Replaced,
    Retired,
}

impl StrategyStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, StrategyStatus::Replaced | StrategyStatus::Retired)
    }
}

impl fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyStatus::Draft => "draft",
            StrategyStatus::PaperTrading => "paper_trading",
            StrategyStatus::Active => "active",
            StrategyStatus::Inactive => "inactive",
            StrategyStatus::Paused => "paused",
            StrategyStatus::Replaced => "replaced",
            StrategyStatus::Retired => "retired",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    Momentum,
    MeanReversion,
    Breakout,
    BtcCorrelation,
    #[serde(other)]
    Custom,
}

impl fmt::Display for StrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyType::Momentum => "momentum",
            StrategyType::MeanReversion => "mean_reversion",
            StrategyType::Breakout => "breakout",
            StrategyType::BtcCorrelation => "btc_correlation",
            StrategyType::Custom => "custom",
        };
        write!(f, "{}", s)
    }
}

/// A trading strategy definition with its lifecycle state.
///
/// Invariant: `is_active` implies `status == Active && enabled`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: Uuid,
    pub name: String,
    pub strategy_type: StrategyType,
    pub symbol: String,
    pub timeframe: String,
    pub parameters: serde_json::Value,
    pub status: StrategyStatus,
    pub is_active: bool,
    pub enabled: bool,
    /// Fraction of capital allocated, 0..1.
    pub allocation: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl Strategy {
    /// Enforces the activation invariant; returns false when the strategy
    /// cannot be activated from its current state.
    pub fn activate(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || !self.enabled {
            return false;
        }
        self.status = StrategyStatus::Active;
        self.is_active = true;
        self.updated_at = now;
        true
    }

    pub fn deactivate(&mut self, now: DateTime<Utc>) {
        if self.status == StrategyStatus::Active {
            self.status = StrategyStatus::Inactive;
        }
        self.is_active = false;
        self.updated_at = now;
    }

    pub fn invariant_holds(&self) -> bool {
        !self.is_active || (self.status == StrategyStatus::Active && self.enabled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    A,
    B,
    C,
    D,
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grade::APlus => write!(f, "A+"),
            Grade::A => write!(f, "A"),
            Grade::B => write!(f, "B"),
            Grade::C => write!(f, "C"),
            Grade::D => write!(f, "D"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    #[serde(rename = "keep")]
    KeepAsIs,
    Optimize,
    #[serde(rename = "modify")]
    ModifyLogic,
    Replace,
    Pause,
    #[serde(rename = "inc_alloc")]
    IncreaseAllocation,
    #[serde(rename = "dec_alloc")]
    DecreaseAllocation,
}

/// Append-only daily review record for one strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyReview {
    pub strategy_id: Uuid,
    pub ts: DateTime<Utc>,
    pub grade: Grade,
    pub decision: ReviewDecision,
    pub confidence: f64,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub param_adjustments: serde_json::Value,
    pub allocation_change: f64,
    pub replacement_candidates: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Generating,
    Backtesting,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Generating => "generating",
            JobStatus::Backtesting => "backtesting",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Progress record of a background strategy generation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub total: u32,
    pub generated: u32,
    pub backtested: u32,
    pub passed: u32,
    pub failed: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub current_strategy: Option<String>,
}

impl GenerationJob {
    pub fn new(job_id: Uuid, total: u32, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            status: JobStatus::Pending,
            total,
            generated: 0,
            backtested: 0,
            passed: 0,
            failed: 0,
            started_at: now,
            completed_at: None,
            current_strategy: None,
        }
    }
}

/// Backtest outcome persisted per strategy.
///
/// Invariants: `0 <= win_rate <= 1`, `max_drawdown <= 0`, `profit_factor >= 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub strategy_id: Uuid,
    pub job_id: Uuid,
    pub win_rate: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub max_drawdown: f64,
    pub total_return: f64,
    pub cagr: f64,
    pub profit_factor: f64,
    pub total_trades: u32,
    pub monthly_returns: Vec<f64>,
    pub passed_criteria: bool,
    pub duration_days: u32,
    /// True when the engine could not run on real candles and the summary
    /// was synthesised instead.
    #[serde(default)]
    pub simulated: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy() -> Strategy {
        Strategy {
            id: Uuid::new_v4(),
            name: "momentum-btc-1".to_string(),
            strategy_type: StrategyType::Momentum,
            symbol: "BTC/USDT".to_string(),
            timeframe: "1h".to_string(),
            parameters: serde_json::json!({}),
            status: StrategyStatus::PaperTrading,
            is_active: false,
            enabled: true,
            allocation: 0.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn test_activation_invariant() {
        let mut s = strategy();
        assert!(s.activate(Utc::now()));
        assert!(s.is_active);
        assert_eq!(s.status, StrategyStatus::Active);
        assert!(s.invariant_holds());

        s.deactivate(Utc::now());
        assert!(!s.is_active);
        assert_eq!(s.status, StrategyStatus::Inactive);
        assert!(s.invariant_holds());
    }

    #[test]
    fn test_terminal_states_block_activation() {
        let mut s = strategy();
        s.status = StrategyStatus::Retired;
        assert!(!s.activate(Utc::now()));
        assert!(!s.is_active);
    }

    #[test]
    fn test_disabled_blocks_activation() {
        let mut s = strategy();
        s.enabled = false;
        assert!(!s.activate(Utc::now()));
    }

    #[test]
    fn test_grade_wire_format() {
        assert_eq!(serde_json::to_string(&Grade::APlus).unwrap(), "\"A+\"");
        let g: Grade = serde_json::from_str("\"A+\"").unwrap();
        assert_eq!(g, Grade::APlus);
    }

    #[test]
    fn test_decision_wire_format() {
        assert_eq!(
            serde_json::to_string(&ReviewDecision::IncreaseAllocation).unwrap(),
            "\"inc_alloc\""
        );
        assert_eq!(
            serde_json::to_string(&ReviewDecision::KeepAsIs).unwrap(),
            "\"keep\""
        );
    }
}
