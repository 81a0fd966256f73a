//! Push-based metrics reporter.
//!
//! Periodically serialises the Prometheus registry to stdout as a
//! `METRICS_JSON:` line. This process only SENDS data, never accepts
//! requests.

use crate::infrastructure::observability::metrics::Metrics;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::info;

#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub gauges: BTreeMap<String, f64>,
    pub counters: BTreeMap<String, f64>,
}

pub struct MetricsReporter {
    metrics: Metrics,
    start_time: Instant,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl MetricsReporter {
    pub fn new(metrics: Metrics, interval_seconds: u64, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            metrics,
            start_time: Instant::now(),
            interval: Duration::from_secs(interval_seconds),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(
            "MetricsReporter: push-based metrics started (interval: {:?})",
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.collect();
                    match serde_json::to_string(&snapshot) {
                        Ok(json) => println!("METRICS_JSON:{}", json),
                        Err(e) => tracing::warn!("MetricsReporter: serialization failed: {}", e),
                    }
                }
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!("MetricsReporter: shutdown");
                        return;
                    }
                }
            }
        }
    }

    fn collect(&self) -> MetricsSnapshot {
        let mut gauges = BTreeMap::new();
        let mut counters = BTreeMap::new();

        for family in self.metrics.registry().gather() {
            for metric in family.get_metric() {
                let mut name = family.name().to_string();
                let labels: Vec<String> = metric
                    .get_label()
                    .iter()
                    .map(|l| format!("{}={}", l.name(), l.value()))
                    .collect();
                if !labels.is_empty() {
                    name = format!("{}{{{}}}", name, labels.join(","));
                }
                if metric.gauge.is_some() {
                    gauges.insert(name, metric.get_gauge().value());
                } else if metric.counter.is_some() {
                    counters.insert(name, metric.get_counter().value());
                }
            }
        }

        MetricsSnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            gauges,
            counters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_includes_labelled_counters() {
        let metrics = Metrics::new().unwrap();
        metrics
            .risk_checks_total
            .with_label_values(&["rejected"])
            .inc();
        metrics.portfolio_value_usd.set(50_000.0);

        let (_tx, rx) = watch::channel(false);
        let reporter = MetricsReporter::new(metrics, 60, rx);
        let snapshot = reporter.collect();

        assert_eq!(
            snapshot.counters["mastertrade_risk_checks_total{outcome=rejected}"],
            1.0
        );
        assert_eq!(
            snapshot.gauges["mastertrade_portfolio_value_usd"],
            50_000.0
        );
    }
}
