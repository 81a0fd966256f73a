//! Position sizing engine: a 0.40/0.35/0.25 blend of volatility-targeted,
//! quarter-Kelly, and risk-parity candidates, shaped by signal strength,
//! market conditions, portfolio constraints, and an optional price
//! prediction. Rejection is a normal result, never an error.

use crate::application::risk::correlation::CorrelationTracker;
use crate::application::risk::data::RiskData;
use crate::config::RiskLimitsConfig;
use crate::domain::ports::PricePredictor;
use crate::domain::risk::{PositionSizeRequest, PositionSizeResult, RiskFactors};
use crate::domain::trading::{AssetClass, OrderSide, asset_class, risk_multiplier, round_to_lot};
use chrono::{Timelike, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use std::sync::Arc;
use tracing::{info, warn};

pub struct PositionSizingEngine {
    data: Arc<RiskData>,
    limits: RiskLimitsConfig,
    correlation: Arc<CorrelationTracker>,
    predictor: Option<Arc<dyn PricePredictor>>,
}

impl PositionSizingEngine {
    pub fn new(
        data: Arc<RiskData>,
        limits: RiskLimitsConfig,
        correlation: Arc<CorrelationTracker>,
        predictor: Option<Arc<dyn PricePredictor>>,
    ) -> Self {
        Self {
            data,
            limits,
            correlation,
            predictor,
        }
    }

    pub async fn calculate_size(&self, request: &PositionSizeRequest) -> PositionSizeResult {
        match self.calculate_inner(request).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    "PositionSizing: error for {}: {} - rejecting",
                    request.symbol, e
                );
                rejection(
                    request,
                    &format!("Calculation error: {}", e),
                    RiskFactors {
                        prediction_alignment: 5.0,
                        ..high_risk_factors()
                    },
                )
            }
        }
    }

    async fn calculate_inner(
        &self,
        request: &PositionSizeRequest,
    ) -> anyhow::Result<PositionSizeResult> {
        let balance = self
            .data
            .account_balance()
            .await?
            .available_balance_usd
            .to_f64()
            .unwrap_or(0.0);

        if balance < self.limits.min_account_balance_usd {
            return Ok(rejection(
                request,
                "Insufficient account balance",
                high_risk_factors(),
            ));
        }

        let volatility = match request.volatility {
            Some(v) => v,
            None => {
                self.data
                    .symbol_volatility(&request.symbol, self.limits.volatility_lookback_days)
                    .await
            }
        };
        let liquidity = self.data.symbol_liquidity_usd(&request.symbol).await;

        // Three candidates, blended.
        let vol_size = volatility_based_size(
            balance,
            request
                .risk_per_trade_percent
                .unwrap_or(self.limits.default_risk_per_trade_percent),
            volatility,
            self.limits.high_volatility_threshold,
        );
        let kelly_size = self.kelly_size(request, balance).await?;
        let parity_size = self.risk_parity_size(balance, volatility).await?;
        let mut size = vol_size * 0.40 + kelly_size * 0.35 + parity_size * 0.25;

        // Signal step function and market conditions.
        size *= signal_adjustment(request.signal_strength);
        let hour = Utc::now().hour();
        if is_off_hours(hour) {
            size *= self.limits.market_hours_risk_reduction;
        }
        size *= self.regime_multiplier().await;

        // Portfolio constraints.
        let positions = self.data.open_positions().await?;
        let portfolio_value = self.data.portfolio_value().await?.to_f64().unwrap_or(balance);

        let max_single = portfolio_value * self.limits.max_single_position_percent / 100.0;
        if size > max_single {
            info!(
                "PositionSizing: {} capped by single-position limit ${:.0} -> ${:.0}",
                request.symbol, size, max_single
            );
            size = max_single;
        }

        // Correlation-weighted exposure cap.
        let snapshot = self.correlation.snapshot();
        let correlated_exposure: f64 = positions
            .iter()
            .filter(|p| p.symbol != request.symbol)
            .map(|p| {
                let rho = snapshot.pairwise(&request.symbol, &p.symbol).unwrap_or(0.0);
                rho.abs() * p.market_value().to_f64().unwrap_or(0.0)
            })
            .sum();
        let correlation_limit =
            portfolio_value * self.limits.max_correlated_exposure_percent / 100.0;
        if correlated_exposure + size > correlation_limit {
            let room = (correlation_limit - correlated_exposure).max(0.0);
            info!(
                "PositionSizing: {} correlated exposure ${:.0} near limit ${:.0}, size ${:.0} -> ${:.0}",
                request.symbol, correlated_exposure, correlation_limit, size, room
            );
            size = size.min(room);
        }

        // Asset-class caps.
        let class = asset_class(&request.symbol);
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
        let class_cap = balance * class_cap_pct / 100.0;
        if class_exposure + size > class_cap {
            size = (class_cap - class_exposure).max(0.0);
        }

        // Quantity, lot rounding, stop-loss distance.
        let price = request.current_price.to_f64().unwrap_or(0.0);
        if price <= 0.0 {
            return Ok(rejection(request, "Invalid price", high_risk_factors()));
        }
        let quantity = round_to_lot(
            Decimal::from_f64(size / price).unwrap_or(Decimal::ZERO),
            &request.symbol,
        );
        let size_usd = (quantity * request.current_price).to_f64().unwrap_or(0.0);

        let stop_pct = request.stop_loss_percent.unwrap_or_else(|| {
            (2.0 * volatility * 100.0 * risk_multiplier(&request.symbol)).clamp(
                self.limits.min_stop_loss_percent,
                self.limits.max_stop_loss_percent,
            )
        });
        let stop_price = match request.order_side {
            OrderSide::Buy => request.current_price
                * Decimal::from_f64(1.0 - stop_pct / 100.0).unwrap_or(Decimal::ONE),
            OrderSide::Sell => request.current_price
                * Decimal::from_f64(1.0 + stop_pct / 100.0).unwrap_or(Decimal::ONE),
        };
        let max_loss_usd = size_usd * stop_pct / 100.0;

        // Risk factors and confidence.
        let concentration = if portfolio_value > 0.0 {
            positions
                .iter()
                .filter(|p| p.symbol == request.symbol)
                .map(|p| p.market_value().to_f64().unwrap_or(0.0))
                .sum::<f64>()
                / portfolio_value
        } else {
            0.0
        };
        let mut factors = RiskFactors {
            volatility_risk: (volatility / 0.1 * 10.0).min(10.0),
            liquidity_risk: (10.0 - liquidity / 100_000.0).max(0.0),
            asset_class_risk: risk_multiplier(&request.symbol) * 2.0,
            signal_risk: (1.0 - request.signal_strength) * 5.0,
            time_risk: if is_off_hours(hour) { 3.0 } else { 1.0 },
            concentration_risk: (concentration * 10.0).min(10.0),
            prediction_alignment: 5.0,
        };
        let mut confidence = confidence_score(&factors);

        let mut warnings = Vec::new();
        if balance > 0.0 && size_usd / balance > 0.10 {
            warnings.push(format!(
                "Large position size: {:.1}% of available balance",
                size_usd / balance * 100.0
            ));
        }
        if volatility > self.limits.high_volatility_threshold {
            warnings.push(format!(
                "High volatility asset: {:.1}% daily volatility",
                volatility * 100.0
            ));
        }
        if liquidity < self.limits.low_liquidity_threshold_usd {
            warnings.push(format!("Low liquidity asset: ${:.0} daily volume", liquidity));
        }
        if is_off_hours(hour) {
            warnings.push("Trading during off-market hours".to_string());
        }
        if portfolio_value > 0.0 && (class_exposure + size_usd) / portfolio_value > 0.3 {
            warnings.push(format!("High {:?} exposure in portfolio", class));
        }

        // Optional forecast reshapes alignment risk and confidence; it
        // never vetoes on its own.
        let mut prediction = None;
        if let Some(predictor) = &self.predictor {
            match predictor.predict(&request.symbol).await {
                Ok(p) => {
                    let impact = (p.predicted_change_percent.abs() / 2.0).min(5.0);
                    if p.direction.agrees_with(request.order_side) {
                        factors.prediction_alignment = (5.0 - impact).max(0.0);
                        confidence = (confidence + impact / 50.0).min(1.0);
                    } else if p.direction.opposes(request.order_side) {
                        factors.prediction_alignment = (5.0 + impact).min(10.0);
                        confidence = (confidence - impact / 40.0).max(0.0);
                        warnings.push(format!(
                            "Price prediction suggests {:?} with {:.2}% change",
                            p.direction, p.predicted_change_percent
                        ));
                    }
                    prediction = Some(p);
                }
                Err(e) => warn!("PositionSizing: predictor failed for {}: {}", request.symbol, e),
            }
        }

        // Approval.
        let avg_risk = factors.average();
        let mut rejection_reason = None;
        if size_usd < self.limits.min_position_size_usd {
            rejection_reason = Some(format!(
                "Position ${:.2} below minimum ${:.2}",
                size_usd, self.limits.min_position_size_usd
            ));
        } else if size_usd > self.limits.max_position_size_usd {
            rejection_reason = Some(format!(
                "Position ${:.0} above maximum ${:.0}",
                size_usd, self.limits.max_position_size_usd
            ));
        } else if max_loss_usd > balance * self.limits.max_portfolio_risk_percent / 100.0 {
            rejection_reason = Some(format!(
                "Max loss ${:.2} exceeds portfolio risk budget",
                max_loss_usd
            ));
        } else if avg_risk > self.limits.risk_score_threshold {
            rejection_reason = Some(format!(
                "Average risk {:.1} above threshold {:.1}",
                avg_risk, self.limits.risk_score_threshold
            ));
        }
        let approved = rejection_reason.is_none();

        info!(
            "PositionSizing: {} {} -> ${:.2} ({} @ {:.2}), approved={}",
            request.order_side, request.symbol, size_usd, quantity, price, approved
        );

        Ok(PositionSizeResult {
            recommended_size_usd: Decimal::from_f64(size_usd).unwrap_or(Decimal::ZERO),
            recommended_quantity: quantity,
            position_risk_percent: if balance > 0.0 {
                max_loss_usd / balance * 100.0
            } else {
                0.0
            },
            stop_loss_price: stop_price.round_dp(8),
            stop_loss_percent: stop_pct,
            max_loss_usd: Decimal::from_f64(max_loss_usd).unwrap_or(Decimal::ZERO),
            confidence_score: confidence,
            risk_factors: factors,
            warnings,
            approved,
            rejection_reason,
            prediction,
        })
    }

    async fn kelly_size(
        &self,
        request: &PositionSizeRequest,
        balance: f64,
    ) -> anyhow::Result<f64> {
        let stats = self.data.strategy_stats(&request.strategy_id).await?;
        let b = if stats.avg_loss_usd > 0.0 {
            stats.avg_win_usd / stats.avg_loss_usd
        } else {
            0.0
        };
        let p = stats.win_rate;
        if b <= 0.0 || p <= 0.0 {
            return Ok(balance * 0.02);
        }
        let kelly = (b * p - (1.0 - p)) / b;
        let fraction = (kelly * 0.25).clamp(0.0, 0.25) * request.signal_strength;
        Ok(balance * fraction)
    }

    async fn risk_parity_size(&self, balance: f64, volatility: f64) -> anyhow::Result<f64> {
        let strategies = self.data.active_strategy_count().await? + 1;
        let target_contribution = 1.0 / strategies as f64;
        let portfolio_vol = self.data.portfolio_volatility().await?;
        if portfolio_vol > 0.0 && volatility > 0.0 {
            let target_position_vol = target_contribution * portfolio_vol;
            Ok((balance * target_position_vol / volatility).min(balance * 0.15))
        } else {
            Ok(balance * 0.05)
        }
    }

    /// Simple regime read from recent portfolio-wide returns: bull +10%,
    /// bear -20%, high-vol -30%.
    async fn regime_multiplier(&self) -> f64 {
        let returns = match self.data.daily_returns("BTC/USDT", 30).await {
            Ok(r) if !r.is_empty() => r,
            _ => return 1.0,
        };
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let sigma = super::data::std_dev(&returns);
        if sigma > self.limits.high_volatility_threshold {
            0.7
        } else if mean > 0.001 {
            1.1
        } else if mean < -0.001 {
            0.8
        } else {
            1.0
        }
    }
}

/// `balance * target_risk% * clamp(0.02/sigma, 0.1, 2.0)`, cut 40% above
/// the high-vol threshold, capped at 20% of balance.
pub fn volatility_based_size(
    balance: f64,
    target_risk_percent: f64,
    volatility: f64,
    high_vol_threshold: f64,
) -> f64 {
    if volatility <= 0.0 {
        return balance * 0.01;
    }
    let vol_multiplier = (0.02 / volatility).clamp(0.1, 2.0);
    let mut size = balance * (target_risk_percent / 100.0) * vol_multiplier;
    if volatility > high_vol_threshold {
        size *= 0.6;
    }
    size.min(balance * 0.2)
}

/// Step function: stronger signals get disproportionately larger positions.
pub fn signal_adjustment(signal_strength: f64) -> f64 {
    if signal_strength >= 0.8 {
        1.0
    } else if signal_strength >= 0.6 {
        0.8
    } else if signal_strength >= 0.4 {
        0.6
    } else if signal_strength >= 0.2 {
        0.4
    } else {
        0.2
    }
}

fn is_off_hours(hour_utc: u32) -> bool {
    hour_utc < 6 || hour_utc > 22
}

fn confidence_score(factors: &RiskFactors) -> f64 {
    let weighted = factors.volatility_risk * 0.25
        + factors.liquidity_risk * 0.20
        + factors.asset_class_risk * 0.15
        + factors.signal_risk * 0.20
        + factors.time_risk * 0.10
        + factors.concentration_risk * 0.10;
    let average = weighted / 1.0;
    ((10.0 - average) / 10.0).max(0.1)
}

fn high_risk_factors() -> RiskFactors {
    RiskFactors {
        volatility_risk: 10.0,
        liquidity_risk: 10.0,
        asset_class_risk: 10.0,
        signal_risk: 10.0,
        time_risk: 10.0,
        concentration_risk: 10.0,
        prediction_alignment: 10.0,
    }
}

fn rejection(
    request: &PositionSizeRequest,
    reason: &str,
    factors: RiskFactors,
) -> PositionSizeResult {
    PositionSizeResult {
        recommended_size_usd: Decimal::ZERO,
        recommended_quantity: Decimal::ZERO,
        position_risk_percent: 0.0,
        stop_loss_price: request.current_price,
        stop_loss_percent: 0.0,
        max_loss_usd: Decimal::ZERO,
        confidence_score: 0.0,
        risk_factors: factors,
        warnings: vec![reason.to_string()],
        approved: false,
        rejection_reason: Some(reason.to_string()),
        prediction: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::risk::correlation::CorrelationTracker;
    use crate::domain::store::{Store, containers};
    use crate::infrastructure::persistence::MemoryStore;
    use serde_json::json;

    #[test]
    fn test_volatility_sizing_reference_case() {
        // Balance 100k, 1% target risk, sigma 0.02 -> exactly 1000.
        let size = volatility_based_size(100_000.0, 1.0, 0.02, 0.05);
        assert!((size - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_volatility_sizing_high_vol_case() {
        // Balance 50k, sigma 0.06: 50000*0.01*0.3333 = 166.67, *0.6 = 100.
        let size = volatility_based_size(50_000.0, 1.0, 0.06, 0.05);
        assert!((size - 100.0).abs() < 0.01, "size was {}", size);
    }

    #[test]
    fn test_volatility_sizing_clamps_multiplier() {
        // Tiny sigma: multiplier clamps at 2.0, then 20%-of-balance cap.
        let size = volatility_based_size(100_000.0, 15.0, 0.001, 0.05);
        assert!((size - 20_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_signal_step_function() {
        assert_eq!(signal_adjustment(0.95), 1.0);
        assert_eq!(signal_adjustment(0.8), 1.0);
        assert_eq!(signal_adjustment(0.7), 0.8);
        assert_eq!(signal_adjustment(0.5), 0.6);
        assert_eq!(signal_adjustment(0.3), 0.4);
        assert_eq!(signal_adjustment(0.1), 0.2);
    }

    #[test]
    fn test_confidence_inverts_risk() {
        let low = confidence_score(&RiskFactors::default());
        assert!(low > 0.9);
        let high = confidence_score(&high_risk_factors());
        assert!((high - 0.1).abs() < 1e-9);
    }

    async fn engine_with_balance(balance: f64) -> PositionSizingEngine {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store
            .upsert(
                containers::ACCOUNT,
                &json!({
                    "id": "primary",
                    "total_balance_usd": balance.to_string(),
                    "available_balance_usd": balance.to_string(),
                    "updated_at": Utc::now().to_rfc3339(),
                }),
            )
            .await
            .unwrap();
        let limits = RiskLimitsConfig::default();
        let data = Arc::new(RiskData::new(Arc::clone(&store), limits.clone()));
        PositionSizingEngine::new(
            data,
            limits,
            Arc::new(CorrelationTracker::new(0.7)),
            None,
        )
    }

    fn request(symbol: &str, signal: f64) -> PositionSizeRequest {
        PositionSizeRequest {
            symbol: symbol.to_string(),
            strategy_id: "s1".to_string(),
            signal_strength: signal,
            current_price: rust_decimal_macros::dec!(30000),
            volatility: Some(0.02),
            stop_loss_percent: None,
            risk_per_trade_percent: Some(1.0),
            order_side: OrderSide::Buy,
        }
    }

    #[tokio::test]
    async fn test_rejects_below_min_balance() {
        let engine = engine_with_balance(50.0).await;
        let result = engine.calculate_size(&request("BTC/USDT", 0.8)).await;
        assert!(!result.approved);
        assert_eq!(
            result.rejection_reason.as_deref(),
            Some("Insufficient account balance")
        );
    }

    #[tokio::test]
    async fn test_sizes_and_approves_normal_request() {
        let engine = engine_with_balance(100_000.0).await;
        let result = engine.calculate_size(&request("BTC/USDT", 0.9)).await;
        assert!(result.approved, "rejected: {:?}", result.rejection_reason);
        assert!(result.recommended_quantity > Decimal::ZERO);
        // Long stop sits below entry.
        assert!(result.stop_loss_price < rust_decimal_macros::dec!(30000));
        assert!(result.max_loss_usd > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_weak_signal_shrinks_size() {
        let engine = engine_with_balance(100_000.0).await;
        let strong = engine.calculate_size(&request("BTC/USDT", 0.9)).await;
        let weak = engine.calculate_size(&request("BTC/USDT", 0.45)).await;
        assert!(weak.recommended_size_usd < strong.recommended_size_usd);
    }

    #[tokio::test]
    async fn test_stop_percent_derived_from_volatility() {
        let engine = engine_with_balance(100_000.0).await;
        let result = engine.calculate_size(&request("BTC/USDT", 0.8)).await;
        // 2 * 0.02 * 100 * 1.0 (major) = 4.0%
        assert!((result.stop_loss_percent - 4.0).abs() < 1e-9);
    }
}
