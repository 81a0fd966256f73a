//! Deterministic fallback strategy templates. When no external generator
//! is wired in (or it fails), generation still yields fewer-but-valid
//! strategies from these parameterised families.

use crate::domain::strategy::{Strategy, StrategyStatus, StrategyType};
use chrono::Utc;
use rand::Rng;
use serde_json::json;
use uuid::Uuid;

const TEMPLATE_TYPES: &[StrategyType] = &[
    StrategyType::Momentum,
    StrategyType::MeanReversion,
    StrategyType::Breakout,
    StrategyType::BtcCorrelation,
];

/// Produce `count` template strategies cycling through the requested
/// types (all four families when `types` is empty). Parameters get a
/// small jitter so repeated jobs explore the neighbourhood.
pub fn generate_templates(
    count: u32,
    types: &[StrategyType],
    symbols: &[String],
) -> Vec<Strategy> {
    let families: Vec<StrategyType> = if types.is_empty() {
        TEMPLATE_TYPES.to_vec()
    } else {
        types.to_vec()
    };
    let mut rng = rand::rng();
    let mut out = Vec::with_capacity(count as usize);

    for i in 0..count {
        let family = families[i as usize % families.len()];
        let symbol = symbols
            .get(i as usize % symbols.len().max(1))
            .cloned()
            .unwrap_or_else(|| "BTC/USDT".to_string());
        fn jitter(rng: &mut impl Rng, base: f64, spread: f64) -> f64 {
            let j: f64 = rng.random_range(-spread..=spread);
            ((base + j) * 1000.0).round() / 1000.0
        }

        let parameters = match family {
            StrategyType::Momentum => json!({
                "lookback_periods": rng.random_range(10..=30),
                "entry_threshold": jitter(&mut rng, 0.02, 0.005),
                "exit_threshold": jitter(&mut rng, 0.01, 0.003),
                "volume_filter": true,
            }),
            StrategyType::MeanReversion => json!({
                "band_periods": rng.random_range(14..=28),
                "band_width_sigma": jitter(&mut rng, 2.0, 0.4),
                "rsi_oversold": rng.random_range(25..=35),
                "rsi_overbought": rng.random_range(65..=75),
            }),
            StrategyType::Breakout => json!({
                "channel_periods": rng.random_range(20..=50),
                "breakout_threshold": jitter(&mut rng, 0.015, 0.005),
                "confirmation_candles": rng.random_range(1..=3),
                "volatility_threshold": jitter(&mut rng, 0.04, 0.01),
            }),
            StrategyType::BtcCorrelation => json!({
                "correlation_window": rng.random_range(20..=40),
                "min_correlation": jitter(&mut rng, 0.6, 0.1),
                "lag_candles": rng.random_range(1..=4),
                "entry_threshold": jitter(&mut rng, 0.015, 0.005),
            }),
            StrategyType::Custom => json!({}),
        };

        let now = Utc::now();
        let id = Uuid::new_v4();
        out.push(Strategy {
            id,
            name: format!("{}-{}-{}", family, symbol.replace('/', ""), &id.to_string()[..8]),
            strategy_type: family,
            symbol,
            timeframe: "1h".to_string(),
            parameters,
            status: StrategyStatus::PaperTrading,
            is_active: false,
            enabled: true,
            allocation: 0.0,
            created_at: now,
            updated_at: now,
            metadata: json!({
                "generated_at": now.to_rfc3339(),
                "generator": "template",
            }),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_and_cycling() {
        let symbols = vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()];
        let strategies = generate_templates(8, &[], &symbols);
        assert_eq!(strategies.len(), 8);
        // All four families represented when cycling 8 through 4.
        for family in TEMPLATE_TYPES {
            assert_eq!(
                strategies.iter().filter(|s| s.strategy_type == *family).count(),
                2
            );
        }
    }

    #[test]
    fn test_requested_types_only() {
        let symbols = vec!["BTC/USDT".to_string()];
        let strategies = generate_templates(4, &[StrategyType::Momentum], &symbols);
        assert!(strategies.iter().all(|s| s.strategy_type == StrategyType::Momentum));
    }

    #[test]
    fn test_generated_strategies_are_paper_trading() {
        let strategies = generate_templates(3, &[], &["BTC/USDT".to_string()]);
        for s in &strategies {
            assert_eq!(s.status, StrategyStatus::PaperTrading);
            assert!(!s.is_active);
            assert!(s.invariant_holds());
            assert!(s.metadata.get("generated_at").is_some());
            assert!(s.parameters.is_object());
        }
    }

    #[test]
    fn test_zero_count() {
        assert!(generate_templates(0, &[], &["BTC/USDT".to_string()]).is_empty());
    }
}
