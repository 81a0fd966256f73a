//! The approval gate the rest of the platform goes through. Aggregates
//! circuit breakers, risk regime, correlation structure, leverage and
//! concentration into a single size multiplier, and attaches regime-aware
//! stop parameters to every result, rejections included.

use crate::application::risk::correlation::CorrelationTracker;
use crate::application::risk::data::RiskData;
use crate::application::risk::stop_loss_manager::{MarketInputs, StopLossManager};
use crate::config::RiskLimitsConfig;
use crate::domain::risk::{
    CircuitBreakerLevel, DrawdownControl, DynamicStopLossParams, RiskApprovalResult, RiskRegime,
};
use crate::domain::store::{Store, containers};
use crate::domain::trading::{AssetClass, asset_class};
use crate::infrastructure::messaging::{MessageFabric, topics};
use crate::infrastructure::observability::Metrics;
use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Summary of one periodic `adjust_existing_positions` sweep.
#[derive(Debug, Clone, Default)]
pub struct AdjustmentSummary {
    pub close_all: bool,
    pub closed_positions: Vec<String>,
    pub reduced_positions: Vec<String>,
    pub stops_tightened: u32,
}

pub struct AdvancedRiskController {
    data: Arc<RiskData>,
    correlation: Arc<CorrelationTracker>,
    stops: Arc<StopLossManager>,
    fabric: MessageFabric,
    prom: Metrics,
    limits: RiskLimitsConfig,
    /// Single-writer state; readers snapshot under the read lock.
    drawdown: RwLock<DrawdownControl>,
}

impl AdvancedRiskController {
    pub fn new(
        data: Arc<RiskData>,
        correlation: Arc<CorrelationTracker>,
        stops: Arc<StopLossManager>,
        fabric: MessageFabric,
        prom: Metrics,
        limits: RiskLimitsConfig,
    ) -> Self {
        Self {
            data,
            correlation,
            stops,
            fabric,
            prom,
            limits,
            drawdown: RwLock::new(DrawdownControl::new(Decimal::ZERO)),
        }
    }

    pub async fn drawdown_snapshot(&self) -> DrawdownControl {
        self.drawdown.read().await.clone()
    }

    /// Recompute drawdown state from the store. `peak = max(peak, pv)` is
    /// compare-and-set through the persisted high-water mark.
    pub async fn refresh_drawdown_control(&self) -> Result<DrawdownControl> {
        let pv = self.data.portfolio_value().await?;

        let stored_peak = self
            .data
            .store()
            .get(containers::TRADING_CONFIG, "portfolio_peak", "risk_state")
            .await?
            .and_then(|d| {
                d.get("peak_value")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<Decimal>().ok())
            })
            .unwrap_or(Decimal::ZERO);

        let peak = stored_peak.max(pv);
        if peak > stored_peak {
            let doc = json!({
                "id": "portfolio_peak",
                "config_type": "risk_state",
                "peak_value": peak.to_string(),
                "updated_at": Utc::now().to_rfc3339(),
            });
            if let Err(e) = self.data.store().upsert(containers::TRADING_CONFIG, &doc).await {
                warn!("AdvancedRisk: peak persist failed: {}", e);
            }
        }

        let drawdown_pct = if peak > Decimal::ZERO {
            ((peak - pv) / peak).to_f64().unwrap_or(0.0).max(0.0) * 100.0
        } else {
            0.0
        };
        let level = CircuitBreakerLevel::from_drawdown_percent(drawdown_pct);

        let control = DrawdownControl {
            peak_portfolio_value: peak,
            current_value: pv,
            current_drawdown_percent: drawdown_pct,
            circuit_breaker_level: level,
            positions_allowed: level.positions_allowed(),
            updated_at: Utc::now(),
        };
        if level != CircuitBreakerLevel::Normal {
            warn!(
                "AdvancedRisk: drawdown {:.2}% -> circuit breaker {}",
                drawdown_pct, level
            );
        }
        self.prom.circuit_breaker_level.set(level as u8 as f64);
        *self.drawdown.write().await = control.clone();
        Ok(control)
    }

    /// Classify the market regime from volatility, 30-day trend, and the
    /// fear/greed index.
    pub async fn determine_regime(&self, volatility: Option<f64>) -> RiskRegime {
        let sigma = match volatility {
            Some(v) => v,
            None => {
                self.data
                    .symbol_volatility("BTC/USDT", self.limits.volatility_lookback_days)
                    .await
            }
        };
        let fear_greed = self.data.fear_greed_index().await;
        if fear_greed < 20.0 {
            return RiskRegime::Crisis;
        }
        if sigma >= 2.0 * self.limits.high_volatility_threshold {
            return RiskRegime::ExtremeVolatility;
        }

        let mean_return = self
            .data
            .daily_returns("BTC/USDT", 30)
            .await
            .ok()
            .filter(|r| !r.is_empty())
            .map(|r| r.iter().sum::<f64>() / r.len() as f64)
            .unwrap_or(0.0);
        let bullish = mean_return >= 0.0;
        let high_vol = sigma > self.limits.high_volatility_threshold;
        match (high_vol, bullish) {
            (true, true) => RiskRegime::HighVolBullish,
            (true, false) => RiskRegime::HighVolBearish,
            (false, true) => RiskRegime::LowVolBullish,
            (false, false) => RiskRegime::LowVolBearish,
        }
    }

    pub async fn approve_new_position(
        &self,
        symbol: &str,
        strategy_id: &str,
        signal_strength: f64,
        requested_size_usd: f64,
        current_price: Decimal,
        volatility: Option<f64>,
    ) -> RiskApprovalResult {
        match self
            .approve_inner(symbol, strategy_id, signal_strength, requested_size_usd, current_price, volatility)
            .await
        {
            Ok(result) => {
                let outcome = if result.approved { "approved" } else { "rejected" };
                self.prom.risk_checks_total.with_label_values(&[outcome]).inc();
                result
            }
            Err(e) => {
                warn!("AdvancedRisk: gate error for {}: {}", symbol, e);
                self.prom.risk_checks_total.with_label_values(&["error"]).inc();
                let sigma = volatility.unwrap_or(self.limits.default_volatility);
                RiskApprovalResult {
                    approved: false,
                    position_size_adjustment: 0.0,
                    stop_loss_params: self.stop_params(RiskRegime::LowVolBullish, sigma),
                    risk_score: 100.0,
                    risk_factors: BTreeMap::from([("internal_error".to_string(), 10.0)]),
                    warnings: Vec::new(),
                    rejections: vec![format!("Risk check error: {}", e)],
                    recommendations: Vec::new(),
                    metadata: json!({}),
                }
            }
        }
    }

    async fn approve_inner(
        &self,
        symbol: &str,
        strategy_id: &str,
        signal_strength: f64,
        requested_size_usd: f64,
        current_price: Decimal,
        volatility: Option<f64>,
    ) -> Result<RiskApprovalResult> {
        let mut warnings = Vec::new();
        let mut rejections = Vec::new();
        let mut recommendations = Vec::new();
        let mut risk_factors = BTreeMap::new();

        // Step 1: drawdown and circuit breaker.
        let control = self.refresh_drawdown_control().await?;
        risk_factors.insert(
            "circuit_breaker".to_string(),
            (control.circuit_breaker_level as u8) as f64 * 2.5,
        );

        let sigma = match volatility {
            Some(v) => v,
            None => {
                self.data
                    .symbol_volatility(symbol, self.limits.volatility_lookback_days)
                    .await
            }
        };
        let regime = self.determine_regime(Some(sigma)).await;
        risk_factors.insert("regime".to_string(), regime_score(regime));
        let stop_params = self.stop_params(regime, sigma);

        // Step 2: halted books reject outright but still ship stop params.
        if !control.positions_allowed {
            rejections.push(format!(
                "Circuit breaker {} active",
                control.circuit_breaker_level
            ));
            return Ok(RiskApprovalResult {
                approved: false,
                position_size_adjustment: 0.0,
                stop_loss_params: stop_params,
                risk_score: 95.0,
                risk_factors,
                warnings,
                rejections,
                recommendations,
                metadata: json!({
                    "drawdown_percent": control.current_drawdown_percent,
                    "circuit_breaker": control.circuit_breaker_level.to_string(),
                    "regime": regime.to_string(),
                }),
            });
        }

        let positions = self.data.open_positions().await?;
        let pv = self.data.portfolio_value().await?.to_f64().unwrap_or(0.0);

        // Step 4: correlation structure.
        let mut weights_vols: HashMap<String, (f64, f64)> = HashMap::new();
        for p in &positions {
            let value = p.market_value().to_f64().unwrap_or(0.0);
            let weight = if pv > 0.0 { value / pv } else { 0.0 };
            let sym_sigma = self
                .data
                .symbol_volatility(&p.symbol, self.limits.volatility_lookback_days)
                .await;
            weights_vols.insert(p.symbol.clone(), (weight, sym_sigma));
        }
        let corr = self.correlation.risk_metrics(&weights_vols);
        risk_factors.insert("correlation".to_string(), corr.risk_score / 10.0);

        // Step 5: multiplier aggregation.
        let mut multiplier = control.circuit_breaker_level.size_multiplier();
        if control.circuit_breaker_level == CircuitBreakerLevel::Warning {
            warnings.push(format!(
                "Drawdown warning: {:.1}% from peak",
                control.current_drawdown_percent
            ));
        }

        if regime.is_high_vol() {
            multiplier *= 0.5;
            warnings.push("High volatility regime: position size reduced by 50%".to_string());
        } else if regime.is_extreme() {
            multiplier *= 0.25;
            warnings.push("Extreme volatility regime: position size reduced by 75%".to_string());
        }

        let exposure: f64 = positions
            .iter()
            .map(|p| p.market_value().to_f64().unwrap_or(0.0))
            .sum();
        let leverage = if pv > 0.0 { exposure / pv } else { 0.0 };
        if leverage >= 0.9 * self.limits.max_leverage {
            multiplier *= 0.5;
            warnings.push(format!(
                "Leverage {:.2}x near limit {:.1}x",
                leverage, self.limits.max_leverage
            ));
        }

        // Concentration: scale the request into the single-position room.
        let adjusted_request = requested_size_usd * multiplier;
        let symbol_exposure: f64 = positions
            .iter()
            .filter(|p| p.symbol == symbol)
            .map(|p| p.market_value().to_f64().unwrap_or(0.0))
            .sum();
        let single_cap = pv * self.limits.max_single_position_percent / 100.0;
        if adjusted_request > 0.0 && pv > 0.0 {
            let room = (single_cap - symbol_exposure).max(0.0);
            let concentration_multiplier = (room / adjusted_request).clamp(0.0, 1.0);
            if concentration_multiplier < 1.0 {
                warnings.push(format!(
                    "Concentration limits: position size reduced by {:.0}%",
                    (1.0 - concentration_multiplier) * 100.0
                ));
            }
            if concentration_multiplier == 0.0 {
                rejections.push(format!(
                    "No remaining capacity for {} under single-position limit",
                    symbol
                ));
            }
            multiplier *= concentration_multiplier;
        }
        risk_factors.insert(
            "concentration".to_string(),
            if pv > 0.0 { (symbol_exposure / pv * 20.0).min(10.0) } else { 0.0 },
        );

        // Asset-class room.
        let class = asset_class(symbol);
        let class_cap_pct = match class {
            AssetClass::Stablecoin => self.limits.stablecoin_max_position_percent,
            AssetClass::Defi => self.limits.defi_max_position_percent,
            _ => self.limits.crypto_max_position_percent,
        };
        let class_exposure: f64 = positions
            .iter()
            .filter(|p| asset_class(&p.symbol) == class)
            .map(|p| p.market_value().to_f64().unwrap_or(0.0))
            .sum();
        if pv > 0.0 {
            let class_room = (pv * class_cap_pct / 100.0 - class_exposure).max(0.0);
            let scaled = requested_size_usd * multiplier;
            if scaled > class_room {
                if class_room <= 0.0 {
                    multiplier = 0.0;
                    rejections.push(format!("{:?} allocation is exhausted", class));
                } else {
                    multiplier *= class_room / scaled;
                    warnings.push(format!("{:?} exposure near cap", class));
                }
            }
        }

        // Correlation score gate.
        if corr.risk_score > 80.0 {
            multiplier *= 0.5;
            warnings.push(format!(
                "Portfolio correlation score {:.0} is elevated",
                corr.risk_score
            ));
            recommendations.push("Add uncorrelated assets before sizing up".to_string());
        }

        // Step 6: floor.
        if multiplier < 0.1 {
            rejections.push(format!(
                "Aggregate size multiplier {:.2} below viability floor",
                multiplier
            ));
        }
        let approved = rejections.is_empty();
        if approved && multiplier < 1.0 {
            recommendations.push(format!(
                "Position approved with {:.0}% of requested size",
                multiplier * 100.0
            ));
        }

        risk_factors.insert("signal".to_string(), (1.0 - signal_strength) * 5.0);
        let risk_score = (risk_factors.values().sum::<f64>()
            / risk_factors.len().max(1) as f64
            * 10.0)
            .clamp(0.0, 100.0);

        // Keep the stop manager's view of this symbol current.
        self.stops
            .set_market_inputs(
                symbol,
                MarketInputs {
                    volatility: sigma,
                    ..Default::default()
                },
            )
            .await;

        info!(
            "AdvancedRisk: {} {} ${:.0} -> approved={} multiplier={:.2} regime={}",
            strategy_id, symbol, requested_size_usd, approved, multiplier, regime
        );

        Ok(RiskApprovalResult {
            approved,
            position_size_adjustment: if approved { multiplier } else { 0.0 },
            stop_loss_params: stop_params,
            risk_score,
            risk_factors,
            warnings,
            rejections,
            recommendations,
            metadata: json!({
                "drawdown_percent": control.current_drawdown_percent,
                "circuit_breaker": control.circuit_breaker_level.to_string(),
                "regime": regime.to_string(),
                "leverage": leverage,
                "effective_assets": corr.effective_assets,
                "price": current_price.to_string(),
            }),
        })
    }

    /// Regime- and volatility-adjusted stop parameters; the stop distance
    /// is clamped to [0.5%, 15%].
    pub fn stop_params(&self, regime: RiskRegime, sigma: f64) -> DynamicStopLossParams {
        let regime_widening = match regime {
            RiskRegime::LowVolBullish | RiskRegime::LowVolBearish => 1.0,
            RiskRegime::HighVolBullish | RiskRegime::HighVolBearish => 1.25,
            RiskRegime::ExtremeVolatility | RiskRegime::Crisis => 1.5,
        };
        let stop_pct = (2.0 * sigma * 100.0 * regime_widening)
            .clamp(self.limits.min_stop_loss_percent, self.limits.max_stop_loss_percent);
        DynamicStopLossParams {
            regime,
            initial_stop_percent: stop_pct,
            trailing_distance_percent: (stop_pct / 2.0).max(0.5),
            atr_multiplier: 2.0 * regime_widening,
            volatility_multiplier: 2.0 * regime_widening,
        }
    }

    /// Periodic sweep over open positions: Level 3 closes the book;
    /// otherwise stops tighten with the regime and oversized risk is
    /// trimmed. Reductions go out as `order.position.reduce` instructions.
    pub async fn adjust_existing_positions(&self) -> Result<AdjustmentSummary> {
        let mut summary = AdjustmentSummary::default();
        let control = self.refresh_drawdown_control().await?;
        let positions = self.data.open_positions().await?;

        if control.circuit_breaker_level.close_all() {
            warn!(
                "AdvancedRisk: circuit breaker LEVEL 3 at {:.2}% drawdown - closing all positions",
                control.current_drawdown_percent
            );
            summary.close_all = true;
            for p in &positions {
                self.publish_reduction(p.id.as_str(), &p.symbol, p.quantity, "circuit_breaker_level_3")
                    .await;
                summary.closed_positions.push(p.id.clone());
            }
            return Ok(summary);
        }

        let regime = self.determine_regime(None).await;
        let metrics_limit = self.limits.max_var_percent;

        for p in &positions {
            let sigma = self
                .data
                .symbol_volatility(&p.symbol, self.limits.volatility_lookback_days)
                .await;
            self.stops
                .set_market_inputs(
                    &p.symbol,
                    MarketInputs {
                        volatility: sigma,
                        ..Default::default()
                    },
                )
                .await;

            // Regime change tightens stops; the manager's monotonicity
            // rule guarantees we never widen.
            if regime.is_high_vol() || regime.is_extreme() {
                if let Some(stop) = self.stops.stop_for_position(&p.id).await {
                    let params = self.stop_params(regime, sigma);
                    let mut config = stop.config.clone();
                    config.initial_stop_percent = params.initial_stop_percent;
                    config.trailing_distance_percent = params.trailing_distance_percent;
                    config.volatility_multiplier = params.volatility_multiplier;
                    if self.stops.modify_stop(&stop.id, config).await? {
                        summary.stops_tightened += 1;
                    }
                }
            }

            if regime == RiskRegime::Crisis {
                let half = (p.quantity / Decimal::from(2)).round_dp(8);
                self.publish_reduction(&p.id, &p.symbol, half, "crisis_regime").await;
                summary.reduced_positions.push(p.id.clone());
                continue;
            }

            // Oversized VaR trims 30%.
            let pv = self.data.portfolio_value().await?.to_f64().unwrap_or(0.0);
            if pv > 0.0 {
                let weight = p.market_value().to_f64().unwrap_or(0.0) / pv;
                let var_contrib_pct = 1.645 * weight * sigma * 100.0;
                if var_contrib_pct > 1.2 * metrics_limit {
                    let trim = (p.quantity * Decimal::new(3, 1)).round_dp(8);
                    self.publish_reduction(&p.id, &p.symbol, trim, "var_limit").await;
                    summary.reduced_positions.push(p.id.clone());
                }
            }
        }
        Ok(summary)
    }

    async fn publish_reduction(
        &self,
        position_id: &str,
        symbol: &str,
        quantity: Decimal,
        reason: &str,
    ) {
        let payload = json!({
            "position_id": position_id,
            "symbol": symbol,
            "order_type": "market_sell",
            "quantity": quantity.to_string(),
            "reason": reason,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Err(e) = self
            .fabric
            .publish_json(topics::exchanges::ORDER_EXECUTION, "order.position.reduce", &payload)
            .await
        {
            warn!("AdvancedRisk: reduction publish failed: {}", e);
        }
    }
}

fn regime_score(regime: RiskRegime) -> f64 {
    match regime {
        RiskRegime::LowVolBullish => 2.0,
        RiskRegime::LowVolBearish => 3.0,
        RiskRegime::HighVolBullish => 5.0,
        RiskRegime::HighVolBearish => 6.0,
        RiskRegime::ExtremeVolatility => 8.0,
        RiskRegime::Crisis => 10.0,
    }
}
