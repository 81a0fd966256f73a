//! Portfolio-wide risk metrics: parametric VaR, concentration, drawdown,
//! correlation and liquidity, rolled into a 0-100 score. Each recompute
//! persists the snapshot, publishes `portfolio.risk.update`, and emits
//! alerts for breached limits.

use crate::application::risk::correlation::CorrelationTracker;
use crate::application::risk::data::RiskData;
use crate::config::RiskLimitsConfig;
use crate::domain::risk::{RiskAlert, RiskLevel, RiskMetrics};
use crate::domain::store::{Store, containers};
use crate::domain::trading::{Position, asset_class};
use crate::infrastructure::messaging::contracts::PortfolioRiskUpdate;
use crate::infrastructure::messaging::{MessageFabric, topics};
use crate::infrastructure::observability::Metrics;
use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub struct PortfolioRiskController {
    data: Arc<RiskData>,
    correlation: Arc<CorrelationTracker>,
    fabric: MessageFabric,
    prom: Metrics,
    limits: RiskLimitsConfig,
    /// Monotone high-water mark; compare-and-set on every recompute.
    peak_value: Mutex<Decimal>,
}

impl PortfolioRiskController {
    pub fn new(
        data: Arc<RiskData>,
        correlation: Arc<CorrelationTracker>,
        fabric: MessageFabric,
        prom: Metrics,
        limits: RiskLimitsConfig,
    ) -> Self {
        Self {
            data,
            correlation,
            fabric,
            prom,
            limits,
            peak_value: Mutex::new(Decimal::ZERO),
        }
    }

    /// Restore the persisted high-water mark.
    pub async fn load_peak(&self) -> Result<()> {
        let doc = self
            .data
            .store()
            .get(containers::TRADING_CONFIG, "portfolio_peak", "risk_state")
            .await?;
        if let Some(doc) = doc
            && let Some(peak) = doc.get("peak_value").and_then(|v| v.as_str())
            && let Ok(value) = peak.parse::<Decimal>()
        {
            *self.peak_value.lock().await = value;
            info!("PortfolioRisk: restored peak value {}", value);
        }
        Ok(())
    }

    pub async fn peak_value(&self) -> Decimal {
        *self.peak_value.lock().await
    }

    /// `peak = max(peak, pv)`; persists only when the mark advances.
    async fn advance_peak(&self, portfolio_value: Decimal) -> Decimal {
        let mut peak = self.peak_value.lock().await;
        if portfolio_value > *peak {
            *peak = portfolio_value;
            let doc = serde_json::json!({
                "id": "portfolio_peak",
                "config_type": "risk_state",
                "peak_value": peak.to_string(),
                "updated_at": Utc::now().to_rfc3339(),
            });
            if let Err(e) = self.data.store().upsert(containers::TRADING_CONFIG, &doc).await {
                warn!("PortfolioRisk: peak persist failed: {}", e);
            }
        }
        *peak
    }

    pub async fn compute_metrics(&self) -> Result<RiskMetrics> {
        let balance = self.data.account_balance().await?;
        let positions = self.data.open_positions().await?;

        let cash = balance.available_balance_usd;
        let exposure: Decimal = positions.iter().map(|p| p.market_value()).sum();
        let portfolio_value = cash + exposure;
        let pv_f = portfolio_value.to_f64().unwrap_or(0.0);
        let exposure_f = exposure.to_f64().unwrap_or(0.0);
        let leverage = if pv_f > 0.0 { exposure_f / pv_f } else { 0.0 };

        // Per-position weights and sigmas.
        let mut weights_vols: HashMap<String, (f64, f64)> = HashMap::new();
        let mut weighted_sigma_sq = 0.0;
        for p in &positions {
            let value = p.market_value().to_f64().unwrap_or(0.0);
            let weight = if pv_f > 0.0 { value / pv_f } else { 0.0 };
            let sigma = self
                .data
                .symbol_volatility(&p.symbol, self.limits.volatility_lookback_days)
                .await;
            weighted_sigma_sq += (weight * sigma).powi(2);
            weights_vols.insert(p.symbol.clone(), (weight, sigma));
        }

        // Parametric VaR at 95%, correlation-free fallback.
        let z95 = Normal::new(0.0, 1.0)
            .map(|n| n.inverse_cdf(0.95))
            .unwrap_or(1.645);
        let portfolio_sigma = weighted_sigma_sq.sqrt();
        let var_1d_f = z95 * portfolio_sigma * pv_f;
        let var_5d_f = var_1d_f * 5.0_f64.sqrt();
        let es_f = var_1d_f * 1.3;

        // Drawdown against the monotone peak.
        let peak = self.advance_peak(portfolio_value).await;
        let peak_f = peak.to_f64().unwrap_or(0.0);
        let current_drawdown = if peak_f > 0.0 {
            ((peak_f - pv_f) / peak_f).max(0.0)
        } else {
            0.0
        };
        let max_drawdown = self.historical_max_drawdown().await.max(current_drawdown);

        // Concentration.
        let hhi: f64 = weights_vols.values().map(|(w, _)| w * w).sum();
        let correlation_metrics = self.correlation.risk_metrics(&weights_vols);
        let snapshot = self.correlation.snapshot();
        let mut correlation_risk = 0.0;
        let syms: Vec<&Position> = positions.iter().collect();
        for (i, a) in syms.iter().enumerate() {
            for b in syms.iter().skip(i + 1) {
                let (wa, _) = weights_vols.get(&a.symbol).copied().unwrap_or((0.0, 0.0));
                let (wb, _) = weights_vols.get(&b.symbol).copied().unwrap_or((0.0, 0.0));
                let rho = snapshot.pairwise(&a.symbol, &b.symbol).unwrap_or(0.0);
                correlation_risk += rho.abs() * wa * wb;
            }
        }

        // Sector (asset-class) exposure and position-size distribution.
        let mut sector_exposure: BTreeMap<String, f64> = BTreeMap::new();
        let mut largest_pct = 0.0f64;
        let mut over_5 = 0u32;
        let mut over_10 = 0u32;
        for p in &positions {
            let value = p.market_value().to_f64().unwrap_or(0.0);
            let pct = if pv_f > 0.0 { value / pv_f * 100.0 } else { 0.0 };
            largest_pct = largest_pct.max(pct);
            if pct > 5.0 {
                over_5 += 1;
            }
            if pct > 10.0 {
                over_10 += 1;
            }
            *sector_exposure
                .entry(format!("{:?}", asset_class(&p.symbol)))
                .or_insert(0.0) += pct;
        }

        // Liquidity.
        let mut liquidity_sum = 0.0;
        let mut illiquid_value = 0.0;
        for p in &positions {
            let volume = self.data.symbol_liquidity_usd(&p.symbol).await;
            liquidity_sum += volume;
            if volume < self.limits.low_liquidity_threshold_usd {
                illiquid_value += p.market_value().to_f64().unwrap_or(0.0);
            }
        }
        let avg_liquidity = if positions.is_empty() {
            0.0
        } else {
            liquidity_sum / positions.len() as f64
        };
        let illiquid_percent = if exposure_f > 0.0 {
            illiquid_value / exposure_f * 100.0
        } else {
            0.0
        };
        let liquidity_score = (avg_liquidity / 100_000.0).min(10.0);

        let score = risk_score(
            if pv_f > 0.0 { var_1d_f / pv_f * 100.0 } else { 0.0 },
            leverage,
            hhi,
            current_drawdown * 100.0,
            correlation_metrics.risk_score,
            liquidity_score,
        );
        let level = risk_level(score);

        let metrics = RiskMetrics {
            ts: Utc::now(),
            portfolio_value,
            total_exposure: exposure,
            cash,
            leverage_ratio: leverage,
            var_1d: Decimal::from_f64(var_1d_f).unwrap_or(Decimal::ZERO).round_dp(2),
            var_5d: Decimal::from_f64(var_5d_f).unwrap_or(Decimal::ZERO).round_dp(2),
            expected_shortfall: Decimal::from_f64(es_f).unwrap_or(Decimal::ZERO).round_dp(2),
            max_drawdown,
            current_drawdown,
            hhi,
            correlation_risk,
            sector_exposure,
            largest_position_percent: largest_pct,
            positions_over_5_percent: over_5,
            positions_over_10_percent: over_10,
            avg_liquidity_usd: Decimal::from_f64(avg_liquidity).unwrap_or(Decimal::ZERO),
            illiquid_percent,
            level,
            score,
        };

        self.persist_metrics(&metrics).await;
        self.publish_update(&metrics).await;
        self.prom.portfolio_value_usd.set(pv_f);
        self.prom.drawdown_current.set(current_drawdown);
        self.prom.risk_score.set(score);

        Ok(metrics)
    }

    /// Breach checks; each breach stores and returns a `RiskAlert` and is
    /// broadcast on the fanout alert exchange.
    pub async fn check_limits(&self, metrics: &RiskMetrics) -> Vec<RiskAlert> {
        let mut alerts = Vec::new();
        let pv = metrics.portfolio_value.to_f64().unwrap_or(0.0);
        let var_pct = if pv > 0.0 {
            metrics.var_1d.to_f64().unwrap_or(0.0) / pv * 100.0
        } else {
            0.0
        };

        if metrics.largest_position_percent > self.limits.max_single_position_percent {
            alerts.push(alert(
                "position_concentration",
                RiskLevel::High,
                "Position exceeds single-position limit",
                &format!(
                    "Largest position is {:.1}% of portfolio (limit {:.1}%)",
                    metrics.largest_position_percent, self.limits.max_single_position_percent
                ),
                metrics.largest_position_percent,
                self.limits.max_single_position_percent,
                "Reduce the oversized position",
            ));
        }
        if metrics.correlation_risk * 100.0 > self.limits.max_correlated_exposure_percent {
            alerts.push(alert(
                "correlation_risk",
                RiskLevel::High,
                "Correlated exposure above limit",
                &format!(
                    "Correlation-weighted exposure {:.1}% (limit {:.1}%)",
                    metrics.correlation_risk * 100.0,
                    self.limits.max_correlated_exposure_percent
                ),
                metrics.correlation_risk * 100.0,
                self.limits.max_correlated_exposure_percent,
                "Diversify across uncorrelated assets",
            ));
        }
        if var_pct > self.limits.max_var_percent {
            alerts.push(alert(
                "var_breach",
                RiskLevel::Critical,
                "VaR above limit",
                &format!(
                    "1-day VaR is {:.1}% of portfolio (limit {:.1}%)",
                    var_pct, self.limits.max_var_percent
                ),
                var_pct,
                self.limits.max_var_percent,
                "Reduce exposure or hedge",
            ));
        }
        if metrics.current_drawdown * 100.0 > self.limits.max_drawdown_percent {
            alerts.push(alert(
                "drawdown_breach",
                RiskLevel::Critical,
                "Drawdown above limit",
                &format!(
                    "Current drawdown {:.1}% (limit {:.1}%)",
                    metrics.current_drawdown * 100.0,
                    self.limits.max_drawdown_percent
                ),
                metrics.current_drawdown * 100.0,
                self.limits.max_drawdown_percent,
                "Circuit breakers will restrict new positions",
            ));
        }
        if metrics.hhi > self.limits.hhi_alert_threshold {
            alerts.push(alert(
                "concentration_hhi",
                RiskLevel::Medium,
                "Portfolio concentration high",
                &format!(
                    "HHI {:.2} indicates lack of diversification (limit {:.2})",
                    metrics.hhi, self.limits.hhi_alert_threshold
                ),
                metrics.hhi,
                self.limits.hhi_alert_threshold,
                "Spread exposure across more assets",
            ));
        }
        if metrics.illiquid_percent > self.limits.illiquid_alert_percent {
            alerts.push(alert(
                "illiquidity",
                RiskLevel::Medium,
                "Illiquid share of book is high",
                &format!(
                    "{:.1}% of exposure is in illiquid assets (limit {:.1}%)",
                    metrics.illiquid_percent, self.limits.illiquid_alert_percent
                ),
                metrics.illiquid_percent,
                self.limits.illiquid_alert_percent,
                "Prefer liquid venues for new positions",
            ));
        }

        for a in &alerts {
            if let Ok(doc) = serde_json::to_value(a) {
                let _ = self.data.store().upsert(containers::RISK_ALERTS, &doc).await;
            }
            let _ = self
                .fabric
                .publish_json(topics::exchanges::RISK_ALERTS, "", a)
                .await;
        }
        alerts
    }

    async fn historical_max_drawdown(&self) -> f64 {
        let docs = self
            .data
            .store()
            .query(
                containers::RISK_METRICS,
                &crate::domain::store::QueryFilter::new()
                    .order_desc("ts")
                    .limit(500),
            )
            .await
            .unwrap_or_default();
        docs.iter()
            .filter_map(|d| d.get("current_drawdown").and_then(|v| v.as_f64()))
            .fold(0.0, f64::max)
    }

    async fn persist_metrics(&self, metrics: &RiskMetrics) {
        let mut doc = match serde_json::to_value(metrics) {
            Ok(v) => v,
            Err(e) => {
                warn!("PortfolioRisk: metrics serialize failed: {}", e);
                return;
            }
        };
        // Append-only: every snapshot gets its own id.
        doc["id"] = serde_json::Value::String(Uuid::new_v4().to_string());
        if let Err(e) = self.data.store().upsert(containers::RISK_METRICS, &doc).await {
            warn!("PortfolioRisk: metrics persist failed: {}", e);
        }
    }

    async fn publish_update(&self, metrics: &RiskMetrics) {
        let update = PortfolioRiskUpdate {
            update_id: Uuid::new_v4().to_string(),
            portfolio_value: metrics.portfolio_value,
            total_exposure: metrics.total_exposure,
            leverage_ratio: metrics.leverage_ratio,
            var_1d: metrics.var_1d,
            current_drawdown: metrics.current_drawdown,
            risk_score: metrics.score,
            risk_level: metrics.level.to_string(),
            timestamp: metrics.ts,
        };
        if let Err(e) = self
            .fabric
            .publish_json(
                topics::exchanges::PORTFOLIO_UPDATES,
                topics::keys::PORTFOLIO_RISK_UPDATE,
                &update,
            )
            .await
        {
            warn!("PortfolioRisk: update publish failed: {}", e);
        }
    }
}

/// Weighted blend: var 25, leverage 20, concentration 20, drawdown 15,
/// correlation 10, liquidity 10.
fn risk_score(
    var_percent: f64,
    leverage: f64,
    hhi: f64,
    drawdown_percent: f64,
    correlation_score: f64,
    liquidity_score: f64,
) -> f64 {
    let var_n = (var_percent * 10.0).min(100.0);
    let leverage_n = (leverage * 50.0).min(100.0);
    let concentration_n = (hhi * 200.0).min(100.0);
    let drawdown_n = (drawdown_percent * 5.0).min(100.0);
    let correlation_n = correlation_score.min(100.0);
    let liquidity_n = ((10.0 - liquidity_score) * 10.0).max(0.0);

    (var_n * 0.25
        + leverage_n * 0.20
        + concentration_n * 0.20
        + drawdown_n * 0.15
        + correlation_n * 0.10
        + liquidity_n * 0.10)
        .clamp(0.0, 100.0)
}

fn risk_level(score: f64) -> RiskLevel {
    if score >= 80.0 {
        RiskLevel::Critical
    } else if score >= 60.0 {
        RiskLevel::High
    } else if score >= 30.0 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

fn alert(
    alert_type: &str,
    severity: RiskLevel,
    title: &str,
    message: &str,
    current: f64,
    threshold: f64,
    recommendation: &str,
) -> RiskAlert {
    RiskAlert {
        id: Uuid::new_v4().to_string(),
        alert_type: alert_type.to_string(),
        severity,
        title: title.to_string(),
        message: message.to_string(),
        symbol: None,
        current_value: current,
        threshold,
        recommendation: recommendation.to_string(),
        created_at: Utc::now(),
        resolved_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::store::Store;
    use crate::infrastructure::messaging::{FabricConfig, declare_core_topology};
    use crate::infrastructure::persistence::MemoryStore;
    use rust_decimal_macros::dec;
    use serde_json::json;

    async fn controller(store: Arc<dyn Store>) -> PortfolioRiskController {
        let limits = RiskLimitsConfig::default();
        let data = Arc::new(RiskData::new(store, limits.clone()));
        let fabric = MessageFabric::new(FabricConfig::default());
        declare_core_topology(&fabric).await.unwrap();
        PortfolioRiskController::new(
            data,
            Arc::new(CorrelationTracker::new(0.7)),
            fabric,
            Metrics::new().unwrap(),
            limits,
        )
    }

    async fn seed_account(store: &Arc<dyn Store>, cash: &str) {
        store
            .upsert(
                containers::ACCOUNT,
                &json!({
                    "id": "primary",
                    "total_balance_usd": cash,
                    "available_balance_usd": cash,
                    "updated_at": Utc::now().to_rfc3339(),
                }),
            )
            .await
            .unwrap();
    }

    async fn seed_position(store: &Arc<dyn Store>, id: &str, symbol: &str, qty: &str, price: &str) {
        store
            .upsert(
                containers::POSITIONS,
                &json!({
                    "id": id,
                    "symbol": symbol,
                    "strategy_id": "s1",
                    "side": "BUY",
                    "quantity": qty,
                    "entry_price": price,
                    "current_price": price,
                    "opened_at": Utc::now().to_rfc3339(),
                }),
            )
            .await
            .unwrap();
    }

    #[test]
    fn test_risk_score_blend() {
        // All-calm portfolio scores low; liquidity 10 contributes zero.
        let calm = risk_score(0.5, 0.3, 0.1, 1.0, 5.0, 10.0);
        assert!(calm < 15.0, "calm score {}", calm);
        // Stressed portfolio pegs high.
        let stressed = risk_score(12.0, 2.5, 0.8, 30.0, 90.0, 0.0);
        assert!(stressed > 80.0, "stressed score {}", stressed);
    }

    #[test]
    fn test_risk_level_bands() {
        assert_eq!(risk_level(10.0), RiskLevel::Low);
        assert_eq!(risk_level(30.0), RiskLevel::Medium);
        assert_eq!(risk_level(60.0), RiskLevel::High);
        assert_eq!(risk_level(80.0), RiskLevel::Critical);
    }

    #[tokio::test]
    async fn test_peak_monotone_nondecreasing() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        seed_account(&store, "100000").await;
        let ctl = controller(Arc::clone(&store)).await;

        ctl.compute_metrics().await.unwrap();
        assert_eq!(ctl.peak_value().await, dec!(100000));

        // Portfolio shrinks; peak holds.
        seed_account(&store, "80000").await;
        let metrics = ctl.compute_metrics().await.unwrap();
        assert_eq!(ctl.peak_value().await, dec!(100000));
        assert!((metrics.current_drawdown - 0.2).abs() < 1e-9);

        // New high advances the peak.
        seed_account(&store, "120000").await;
        ctl.compute_metrics().await.unwrap();
        assert_eq!(ctl.peak_value().await, dec!(120000));
    }

    #[tokio::test]
    async fn test_metrics_snapshot_persisted_append_only() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        seed_account(&store, "100000").await;
        let ctl = controller(Arc::clone(&store)).await;
        ctl.compute_metrics().await.unwrap();
        ctl.compute_metrics().await.unwrap();
        let docs = store
            .query(containers::RISK_METRICS, &crate::domain::store::QueryFilter::new())
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[tokio::test]
    async fn test_concentration_alert_fires() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        seed_account(&store, "5000").await;
        // One position worth ~80% of the portfolio.
        seed_position(&store, "p1", "BTC/USDT", "0.67", "30000").await;
        let ctl = controller(Arc::clone(&store)).await;
        let metrics = ctl.compute_metrics().await.unwrap();
        assert!(metrics.largest_position_percent > 10.0);

        let alerts = ctl.check_limits(&metrics).await;
        assert!(alerts.iter().any(|a| a.alert_type == "position_concentration"));
        // HHI of a one-position book is high too.
        assert!(alerts.iter().any(|a| a.alert_type == "concentration_hhi"));
    }

    #[tokio::test]
    async fn test_var_zero_on_empty_book() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        seed_account(&store, "50000").await;
        let ctl = controller(Arc::clone(&store)).await;
        let metrics = ctl.compute_metrics().await.unwrap();
        assert_eq!(metrics.var_1d, Decimal::ZERO);
        assert_eq!(metrics.level, RiskLevel::Low);
    }
}
