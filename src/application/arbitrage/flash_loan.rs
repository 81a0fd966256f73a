//! Flash-loan opportunity evaluation. Candidate paths come from a
//! protocol handler (the piece that knows pools and routing); this module
//! only does the economics: loan fee, gas, and the profit floor.

use crate::domain::arbitrage::FlashLoanCandidate;
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;

/// Supplies candidate arbitrage paths for one protocol, together with
/// gas estimates and protocol fee.
#[async_trait]
pub trait FlashLoanHandler: Send + Sync {
    fn protocol(&self) -> &str;

    async fn candidates(&self, tokens: &[String]) -> Result<Vec<FlashLoanCandidate>>;
}

#[derive(Debug, Clone)]
pub struct EvaluatedFlashLoan {
    pub candidate: FlashLoanCandidate,
    pub net_profit_usd: Decimal,
}

/// Net out the loan fee and gas; keep candidates clearing the floor.
pub fn evaluate_candidates(
    candidates: Vec<FlashLoanCandidate>,
    min_profit_usd: f64,
) -> Vec<EvaluatedFlashLoan> {
    let floor = Decimal::from_f64(min_profit_usd).unwrap_or(Decimal::ZERO);
    let mut evaluated: Vec<EvaluatedFlashLoan> = candidates
        .into_iter()
        .filter_map(|c| {
            let fee = c.loan_amount * Decimal::from_f64(c.fee_percent / 100.0)?;
            let net = c.expected_return - c.loan_amount - fee - c.gas_estimate_usd;
            (net >= floor).then_some(EvaluatedFlashLoan {
                candidate: c,
                net_profit_usd: net,
            })
        })
        .collect();
    evaluated.sort_by(|a, b| b.net_profit_usd.cmp(&a.net_profit_usd));
    evaluated
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candidate(loan: Decimal, ret: Decimal, gas: Decimal, fee_pct: f64) -> FlashLoanCandidate {
        FlashLoanCandidate {
            protocol: "aave_v3".to_string(),
            token: "USDC".to_string(),
            path: vec!["USDC".into(), "WETH".into(), "USDC".into()],
            loan_amount: loan,
            expected_return: ret,
            gas_estimate_usd: gas,
            fee_percent: fee_pct,
        }
    }

    #[test]
    fn test_profitable_candidate_kept() {
        // Loan 100k at 0.09%: fee 90. Return 100500, gas 50 -> net 360.
        let kept = evaluate_candidates(
            vec![candidate(dec!(100000), dec!(100500), dec!(50), 0.09)],
            50.0,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].net_profit_usd, dec!(360));
    }

    #[test]
    fn test_fee_and_gas_erase_profit() {
        // Net: 100100 - 100000 - 90 - 50 = -40.
        let kept = evaluate_candidates(
            vec![candidate(dec!(100000), dec!(100100), dec!(50), 0.09)],
            50.0,
        );
        assert!(kept.is_empty());
    }

    #[test]
    fn test_ranked_by_net_profit() {
        let kept = evaluate_candidates(
            vec![
                candidate(dec!(100000), dec!(100300), dec!(10), 0.0),
                candidate(dec!(100000), dec!(100900), dec!(10), 0.0),
            ],
            50.0,
        );
        assert_eq!(kept.len(), 2);
        assert!(kept[0].net_profit_usd > kept[1].net_profit_usd);
    }
}
