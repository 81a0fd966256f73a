//! Prometheus metrics definitions for mastertrade
//!
//! All metrics use the `mastertrade_` prefix and are read-only.

use prometheus::{
    CounterVec, Gauge, Opts, Registry,
    core::{AtomicF64, GenericGauge},
};
use std::sync::Arc;

/// Prometheus metrics for the control plane
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    /// Total portfolio value in USD
    pub portfolio_value_usd: GenericGauge<AtomicF64>,
    /// Current portfolio drawdown (0-1)
    pub drawdown_current: GenericGauge<AtomicF64>,
    /// Composite portfolio risk score (0-100)
    pub risk_score: GenericGauge<AtomicF64>,
    /// Circuit breaker level (0=normal .. 4=level_3)
    pub circuit_breaker_level: GenericGauge<AtomicF64>,
    /// Risk checks by outcome
    pub risk_checks_total: CounterVec,
    /// Stop-loss triggers by stop type
    pub stop_triggers_total: CounterVec,
    /// Arbitrage opportunities by type and disposition
    pub arbitrage_opportunities_total: CounterVec,
    /// Arbitrage executions by terminal status
    pub arbitrage_executions_total: CounterVec,
    /// Rate limiter 429 violations by endpoint
    pub rate_limit_violations_total: CounterVec,
    /// Orders submitted by venue and status
    pub orders_total: CounterVec,
    /// Generation job strategies by result
    pub generation_strategies_total: CounterVec,
    /// Indicator calculations by outcome
    pub indicator_calculations_total: CounterVec,
}

impl Metrics {
    /// Create a new Metrics instance with all gauges and counters registered
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let portfolio_value_usd = Gauge::with_opts(Opts::new(
            "mastertrade_portfolio_value_usd",
            "Total portfolio value in USD",
        ))?;
        registry.register(Box::new(portfolio_value_usd.clone()))?;

        let drawdown_current = Gauge::with_opts(Opts::new(
            "mastertrade_drawdown_current",
            "Current portfolio drawdown (0-1)",
        ))?;
        registry.register(Box::new(drawdown_current.clone()))?;

        let risk_score = Gauge::with_opts(Opts::new(
            "mastertrade_risk_score",
            "Composite portfolio risk score (0-100)",
        ))?;
        registry.register(Box::new(risk_score.clone()))?;

        let circuit_breaker_level = Gauge::with_opts(Opts::new(
            "mastertrade_circuit_breaker_level",
            "Circuit breaker level (0=normal, 4=level_3)",
        ))?;
        registry.register(Box::new(circuit_breaker_level.clone()))?;

        let risk_checks_total = CounterVec::new(
            Opts::new("mastertrade_risk_checks_total", "Risk checks by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(risk_checks_total.clone()))?;

        let stop_triggers_total = CounterVec::new(
            Opts::new(
                "mastertrade_stop_triggers_total",
                "Stop-loss triggers by stop type",
            ),
            &["stop_type"],
        )?;
        registry.register(Box::new(stop_triggers_total.clone()))?;

        let arbitrage_opportunities_total = CounterVec::new(
            Opts::new(
                "mastertrade_arbitrage_opportunities_total",
                "Arbitrage opportunities by type and disposition",
            ),
            &["type", "disposition"],
        )?;
        registry.register(Box::new(arbitrage_opportunities_total.clone()))?;

        let arbitrage_executions_total = CounterVec::new(
            Opts::new(
                "mastertrade_arbitrage_executions_total",
                "Arbitrage executions by terminal status",
            ),
            &["type", "status"],
        )?;
        registry.register(Box::new(arbitrage_executions_total.clone()))?;

        let rate_limit_violations_total = CounterVec::new(
            Opts::new(
                "mastertrade_rate_limit_violations_total",
                "429 responses by endpoint",
            ),
            &["endpoint"],
        )?;
        registry.register(Box::new(rate_limit_violations_total.clone()))?;

        let orders_total = CounterVec::new(
            Opts::new("mastertrade_orders_total", "Orders by venue and status"),
            &["venue", "status"],
        )?;
        registry.register(Box::new(orders_total.clone()))?;

        let generation_strategies_total = CounterVec::new(
            Opts::new(
                "mastertrade_generation_strategies_total",
                "Generated strategies by backtest result",
            ),
            &["result"],
        )?;
        registry.register(Box::new(generation_strategies_total.clone()))?;

        let indicator_calculations_total = CounterVec::new(
            Opts::new(
                "mastertrade_indicator_calculations_total",
                "Indicator calculations by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(indicator_calculations_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            portfolio_value_usd,
            drawdown_current,
            risk_score,
            circuit_breaker_level,
            risk_checks_total,
            stop_triggers_total,
            arbitrage_opportunities_total,
            arbitrage_executions_total,
            rate_limit_violations_total,
            orders_total,
            generation_strategies_total,
            indicator_calculations_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
