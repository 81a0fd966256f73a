use rust_decimal::Decimal;
use thiserror::Error;

/// Errors produced by the message fabric
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("Unknown exchange: {exchange}")]
    UnknownExchange { exchange: String },

    #[error("Unknown queue: {queue}")]
    UnknownQueue { queue: String },

    #[error("Exchange {exchange} already declared with a different type")]
    ExchangeTypeMismatch { exchange: String },

    #[error("Request timed out after {timeout_ms}ms (routing key: {routing_key})")]
    RequestTimeout { routing_key: String, timeout_ms: u64 },

    #[error("Publish failed: {reason}")]
    PublishFailed { reason: String },

    #[error("Malformed payload: {reason}")]
    MalformedPayload { reason: String },
}

/// Errors produced by the persistence adapter
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unknown container: {container}")]
    UnknownContainer { container: String },

    #[error("Document missing required field '{field}' in container {container}")]
    MissingField { container: String, field: String },

    #[error("Transaction aborted: {reason}")]
    TransactionAborted { reason: String },

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Errors internal to the risk decision core. A risk *rejection* is not an
/// error; it is a normal `approved=false` result. These variants cover the
/// paths where the gate itself could not complete its work.
#[derive(Debug, Error)]
pub enum RiskError {
    #[error("Account state unavailable: {reason}")]
    AccountUnavailable { reason: String },

    #[error("Position not found: {position_id}")]
    PositionNotFound { position_id: String },

    #[error("Stop-loss order not found: {order_id}")]
    StopNotFound { order_id: String },

    #[error("Invalid stop configuration for {symbol}: {reason}")]
    InvalidStopConfig { symbol: String, reason: String },

    #[error("Stop invariant violated on {order_id}: stop moved from {old} to {new} against position")]
    StopWidened {
        order_id: String,
        old: Decimal,
        new: Decimal,
    },

    #[error("Portfolio snapshot invalid: {reason}")]
    InvalidPortfolio { reason: String },
}

/// Errors in arbitrage detection and execution
#[derive(Debug, Error)]
pub enum ArbitrageError {
    #[error("Opportunity {opportunity_id} not found")]
    OpportunityNotFound { opportunity_id: String },

    #[error("Execution {execution_id} not found")]
    ExecutionNotFound { execution_id: String },

    #[error("Venue order failed on {venue}: {reason}")]
    VenueOrderFailed { venue: String, reason: String },

    #[error("Execution timed out after {timeout_secs}s")]
    ExecutionTimeout { timeout_secs: u64 },

    #[error("Insufficient depth on {venue} for {pair}: wanted {wanted}, available {available}")]
    InsufficientDepth {
        venue: String,
        pair: String,
        wanted: Decimal,
        available: Decimal,
    },
}

/// Errors in the strategy lifecycle engine
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Generation job {job_id} not found")]
    JobNotFound { job_id: String },

    #[error("Generation job {job_id} is not cancellable (status: {status})")]
    NotCancellable { job_id: String, status: String },

    #[error("Strategy {strategy_id} not found")]
    StrategyNotFound { strategy_id: String },

    #[error("Insufficient data for backtest of {symbol}: {candles} candles (need {required})")]
    InsufficientData {
        symbol: String,
        candles: usize,
        required: usize,
    },

    #[error("Activation blocked by stability window: {remaining_minutes} minutes remaining")]
    StabilityWindow { remaining_minutes: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_stop_widened_formatting() {
        let err = RiskError::StopWidened {
            order_id: "stop-1".to_string(),
            old: dec!(99.5),
            new: dec!(98.0),
        };
        let msg = err.to_string();
        assert!(msg.contains("stop-1"));
        assert!(msg.contains("99.5"));
        assert!(msg.contains("98.0"));
    }

    #[test]
    fn test_fabric_timeout_formatting() {
        let err = FabricError::RequestTimeout {
            routing_key: "risk.check.request".to_string(),
            timeout_ms: 5000,
        };
        assert!(err.to_string().contains("risk.check.request"));
        assert!(err.to_string().contains("5000"));
    }
}
