use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persistent configuration of one scheduled indicator calculation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    pub id: String,
    pub strategy_id: String,
    pub indicator_type: String,
    pub symbol: String,
    pub interval: String,
    pub parameters: serde_json::Value,
    pub periods_required: u32,
    pub output_fields: Vec<String>,
    pub active: bool,
    /// Higher priority configs are calculated first in each sweep.
    pub priority: i32,
    pub cache_duration_min: i64,
    /// Recalculate on every sweep rather than on demand.
    pub continuous: bool,
    /// Publish results on the indicator_results exchange.
    pub publish: bool,
    pub last_calculated: Option<DateTime<Utc>>,
    pub calc_count: u64,
    /// Exponentially smoothed calculation latency.
    pub avg_calc_ms: f64,
    pub error_count: u32,
}

impl IndicatorConfig {
    pub fn new(
        id: String,
        strategy_id: String,
        indicator_type: String,
        symbol: String,
        interval: String,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            id,
            strategy_id,
            indicator_type,
            symbol,
            interval,
            parameters,
            periods_required: 50,
            output_fields: Vec::new(),
            active: true,
            priority: 0,
            cache_duration_min: 5,
            continuous: true,
            publish: true,
            last_calculated: None,
            calc_count: 0,
            avg_calc_ms: 0.0,
            error_count: 0,
        }
    }

    /// Smooth latency with the same 0.9/0.1 blend across all configs.
    pub fn record_calculation(&mut self, duration_ms: f64, now: DateTime<Utc>) {
        self.calc_count += 1;
        self.avg_calc_ms = if self.calc_count == 1 {
            duration_ms
        } else {
            self.avg_calc_ms * 0.9 + duration_ms * 0.1
        };
        self.last_calculated = Some(now);
        self.error_count = 0;
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
    }

    /// Due when never calculated or older than the update interval.
    pub fn is_due(&self, now: DateTime<Utc>, update_interval_secs: i64) -> bool {
        match self.last_calculated {
            None => true,
            Some(ts) => (now - ts).num_seconds() >= update_interval_secs,
        }
    }
}

/// Output of one indicator calculation, persisted and optionally published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorCalculationResult {
    pub configuration_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub interval: String,
    pub indicator_type: String,
    pub values: serde_json::Value,
    pub calculated_at: DateTime<Utc>,
    pub duration_ms: f64,
}

/// A named subscription binding a consumer to a set of configurations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSubscription {
    pub id: String,
    pub name: String,
    pub configuration_ids: Vec<String>,
    pub reply_to: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn config() -> IndicatorConfig {
        IndicatorConfig::new(
            "cfg-1".to_string(),
            "strat-1".to_string(),
            "rsi".to_string(),
            "BTC/USDT".to_string(),
            "1h".to_string(),
            serde_json::json!({"period": 14}),
        )
    }

    #[test]
    fn test_due_when_never_calculated() {
        let cfg = config();
        assert!(cfg.is_due(Utc::now(), 60));
    }

    #[test]
    fn test_due_after_interval() {
        let mut cfg = config();
        let now = Utc::now();
        cfg.last_calculated = Some(now - Duration::seconds(61));
        assert!(cfg.is_due(now, 60));
        cfg.last_calculated = Some(now - Duration::seconds(30));
        assert!(!cfg.is_due(now, 60));
    }

    #[test]
    fn test_latency_smoothing() {
        let mut cfg = config();
        let now = Utc::now();
        cfg.record_calculation(100.0, now);
        assert_eq!(cfg.avg_calc_ms, 100.0);
        cfg.record_calculation(200.0, now);
        assert!((cfg.avg_calc_ms - 110.0).abs() < 1e-9);
        assert_eq!(cfg.calc_count, 2);
    }

    #[test]
    fn test_error_reset_on_success() {
        let mut cfg = config();
        cfg.record_error();
        cfg.record_error();
        assert_eq!(cfg.error_count, 2);
        cfg.record_calculation(50.0, Utc::now());
        assert_eq!(cfg.error_count, 0);
    }
}
