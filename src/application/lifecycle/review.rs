//! Daily strategy review: live performance over the last 30 days, a
//! composite grade against the backtest baseline, and a decision applied
//! atomically per strategy.

use crate::config::LifecycleConfig;
use crate::domain::store::{QueryFilter, Store, StoreOp, containers};
use crate::domain::strategy::{Grade, ReviewDecision, Strategy, StrategyReview, StrategyStatus};
use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Live trading digest for one strategy over the review window.
#[derive(Debug, Clone)]
pub struct LivePerformance {
    pub sharpe: f64,
    pub sortino: f64,
    pub max_drawdown: f64,
    pub calmar: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub total_trades: usize,
    pub avg_duration_hours: f64,
    pub inactive_days: i64,
    /// Mean daily return on volatile days vs calm days.
    pub volatile_regime_return: f64,
    pub normal_regime_return: f64,
}

/// Grade + decision + confidence for one assessment.
#[derive(Debug, Clone)]
pub struct Assessment {
    pub grade: Grade,
    pub decision: ReviewDecision,
    pub confidence: f64,
    pub degradation: f64,
}

/// Composite score: Sharpe 40, drawdown 25, win rate 15, degradation 20.
pub fn grade_performance(perf: &LivePerformance, backtest_sharpe: f64) -> Assessment {
    let degradation = if backtest_sharpe.abs() > f64::EPSILON {
        (perf.sharpe - backtest_sharpe).abs() / backtest_sharpe.abs()
    } else {
        0.0
    };

    let sharpe_score = ((perf.sharpe + 1.0) / 3.0 * 100.0).clamp(0.0, 100.0);
    let dd_score = ((1.0 - perf.max_drawdown.abs() / 0.4) * 100.0).clamp(0.0, 100.0);
    let win_score = (perf.win_rate * 100.0).clamp(0.0, 100.0);
    let degradation_score = ((1.0 - degradation) * 100.0).clamp(0.0, 100.0);

    let composite = sharpe_score * 0.40
        + dd_score * 0.25
        + win_score * 0.15
        + degradation_score * 0.20;

    let grade = if composite >= 85.0 {
        Grade::APlus
    } else if composite >= 70.0 {
        Grade::A
    } else if composite >= 55.0 {
        Grade::B
    } else if composite >= 40.0 {
        Grade::C
    } else {
        Grade::D
    };

    let decision = match grade {
        Grade::APlus => {
            if degradation < 0.10 {
                ReviewDecision::IncreaseAllocation
            } else {
                ReviewDecision::KeepAsIs
            }
        }
        Grade::A => {
            if degradation > 0.20 {
                ReviewDecision::Optimize
            } else {
                ReviewDecision::KeepAsIs
            }
        }
        Grade::B => {
            if degradation > 0.30 {
                ReviewDecision::ModifyLogic
            } else if perf.inactive_days > 7 {
                ReviewDecision::Optimize
            } else {
                ReviewDecision::DecreaseAllocation
            }
        }
        Grade::C => {
            if degradation > 0.50 {
                ReviewDecision::Replace
            } else if perf.max_drawdown < -0.30 {
                ReviewDecision::Pause
            } else {
                ReviewDecision::ModifyLogic
            }
        }
        Grade::D => {
            if perf.sharpe < -0.5 || perf.max_drawdown < -0.40 {
                ReviewDecision::Pause
            } else {
                ReviewDecision::Replace
            }
        }
    };

    let mut confidence = match decision {
        ReviewDecision::Pause | ReviewDecision::Replace => 0.95,
        _ => 0.85,
    };
    if perf.total_trades < 20 {
        confidence *= 0.8;
    }
    if perf.inactive_days > 14 {
        confidence *= 0.7;
    }

    Assessment {
        grade,
        decision,
        confidence,
        degradation,
    }
}

/// Parameter adjustment heuristics keyed by what the numbers say.
pub fn parameter_adjustments(perf: &LivePerformance) -> Value {
    let mut adjustments = serde_json::Map::new();
    if perf.win_rate < 0.40 {
        adjustments.insert("entry_threshold_factor".to_string(), json!(1.1));
    }
    if perf.total_trades < 15 {
        adjustments.insert("entry_threshold_factor".to_string(), json!(0.9));
    }
    if perf.volatile_regime_return < perf.normal_regime_return {
        adjustments.insert("volatility_threshold_factor".to_string(), json!(1.2));
    }
    Value::Object(adjustments)
}

pub struct DailyReviewer {
    store: Arc<dyn Store>,
    config: LifecycleConfig,
}

impl DailyReviewer {
    pub fn new(store: Arc<dyn Store>, config: LifecycleConfig) -> Self {
        Self { store, config }
    }

    /// Review every active strategy once. Strategies with too few recent
    /// trades are skipped.
    pub async fn review_all(&self) -> Result<Vec<StrategyReview>> {
        let docs = self
            .store
            .query(
                containers::STRATEGIES,
                &QueryFilter::new().eq("is_active", true),
            )
            .await?;
        let mut reviews = Vec::new();
        for doc in docs {
            let strategy: Strategy = match serde_json::from_value(doc) {
                Ok(s) => s,
                Err(e) => {
                    warn!("DailyReviewer: malformed strategy document: {}", e);
                    continue;
                }
            };
            match self.review_strategy(&strategy).await {
                Ok(Some(review)) => reviews.push(review),
                Ok(None) => {}
                Err(e) => warn!("DailyReviewer: review of {} failed: {}", strategy.name, e),
            }
        }
        Ok(reviews)
    }

    pub async fn review_strategy(&self, strategy: &Strategy) -> Result<Option<StrategyReview>> {
        let Some(perf) = self.compute_performance(strategy).await? else {
            info!(
                "DailyReviewer: {} has too few recent trades, skipping",
                strategy.name
            );
            return Ok(None);
        };
        let backtest_sharpe = self.latest_backtest_sharpe(strategy.id).await?;
        let assessment = grade_performance(&perf, backtest_sharpe);
        let adjustments = parameter_adjustments(&perf);

        let replacement_candidates = if assessment.decision == ReviewDecision::Replace {
            self.replacement_candidates(strategy, perf.sharpe).await?
        } else {
            Vec::new()
        };

        let allocation_change = match assessment.decision {
            ReviewDecision::IncreaseAllocation => 0.05,
            ReviewDecision::DecreaseAllocation => -0.05,
            _ => 0.0,
        };

        let mut strengths = Vec::new();
        let mut weaknesses = Vec::new();
        if perf.sharpe >= 1.0 {
            strengths.push(format!("Strong risk-adjusted returns (Sharpe {:.2})", perf.sharpe));
        } else if perf.sharpe < 0.0 {
            weaknesses.push(format!("Negative risk-adjusted returns (Sharpe {:.2})", perf.sharpe));
        }
        if perf.win_rate >= 0.55 {
            strengths.push(format!("Win rate {:.0}%", perf.win_rate * 100.0));
        } else if perf.win_rate < 0.45 {
            weaknesses.push(format!("Win rate {:.0}%", perf.win_rate * 100.0));
        }
        if perf.max_drawdown < -0.20 {
            weaknesses.push(format!("Deep drawdown {:.0}%", perf.max_drawdown * 100.0));
        }
        if assessment.degradation > 0.20 {
            weaknesses.push(format!(
                "Sharpe degraded {:.0}% vs backtest",
                assessment.degradation * 100.0
            ));
        }

        let review = StrategyReview {
            strategy_id: strategy.id,
            ts: Utc::now(),
            grade: assessment.grade,
            decision: assessment.decision,
            confidence: assessment.confidence,
            strengths,
            weaknesses,
            param_adjustments: adjustments,
            allocation_change,
            replacement_candidates,
        };
        self.persist_review(&review).await?;
        self.apply_review(strategy, &review).await?;
        info!(
            "DailyReviewer: {} graded {} -> {:?} (confidence {:.2})",
            strategy.name, review.grade, review.decision, review.confidence
        );
        Ok(Some(review))
    }

    /// Live digest from the last 30 days of closed trades; `None` when
    /// fewer than the minimum.
    async fn compute_performance(&self, strategy: &Strategy) -> Result<Option<LivePerformance>> {
        let since = Utc::now() - Duration::days(self.config.review_lookback_days);
        let docs = self
            .store
            .query(
                containers::TRADES,
                &QueryFilter::new()
                    .eq("strategy_id", strategy.id.to_string())
                    .gt("exit_ts", since.timestamp())
                    .order_asc("exit_ts"),
            )
            .await?;
        if docs.len() < self.config.min_review_trades {
            return Ok(None);
        }

        let mut daily_pnl: std::collections::BTreeMap<i64, f64> = std::collections::BTreeMap::new();
        let mut wins = 0usize;
        let mut gross_profit = 0.0;
        let mut gross_loss = 0.0;
        let mut duration_sum_hours = 0.0;
        let mut last_exit = 0i64;
        for doc in &docs {
            let pnl = doc
                .get("pnl_usd")
                .and_then(|v| match v {
                    Value::String(s) => s.parse::<f64>().ok(),
                    other => other.as_f64(),
                })
                .unwrap_or(0.0);
            let exit_ts = doc.get("exit_ts").and_then(|v| v.as_i64()).unwrap_or(0);
            let entry_ts = doc.get("entry_ts").and_then(|v| v.as_i64()).unwrap_or(exit_ts);
            *daily_pnl.entry(exit_ts / 86_400).or_insert(0.0) += pnl;
            if pnl > 0.0 {
                wins += 1;
                gross_profit += pnl;
            } else {
                gross_loss += -pnl;
            }
            duration_sum_hours += (exit_ts - entry_ts) as f64 / 3_600.0;
            last_exit = last_exit.max(exit_ts);
        }

        // Normalise by a nominal risk base to get return series.
        let base = 10_000.0;
        let daily_returns: Vec<f64> = daily_pnl.values().map(|p| p / base).collect();
        let mean = daily_returns.iter().sum::<f64>() / daily_returns.len() as f64;
        let sigma = super::super::risk::data::std_dev(&daily_returns);
        let downside: Vec<f64> = daily_returns.iter().copied().filter(|r| *r < 0.0).collect();
        let downside_sigma = super::super::risk::data::std_dev(&downside);

        let annual = 252.0_f64.sqrt();
        let sharpe = if sigma > 0.0 { mean / sigma * annual } else { 0.0 };
        let sortino = if downside_sigma > 0.0 {
            mean / downside_sigma * annual
        } else {
            sharpe
        };

        // Drawdown over the cumulative pnl curve.
        let mut equity = base;
        let mut peak = base;
        let mut max_dd = 0.0f64;
        for pnl in daily_pnl.values() {
            equity += pnl;
            peak = peak.max(equity);
            if peak > 0.0 {
                max_dd = max_dd.min((equity - peak) / peak);
            }
        }
        let annual_return = mean * 252.0;
        let calmar = if max_dd.abs() > f64::EPSILON {
            annual_return / max_dd.abs()
        } else {
            0.0
        };

        // Regime split by daily absolute move.
        let threshold = sigma.max(1e-9) * 1.5;
        let (mut volatile_sum, mut volatile_n, mut normal_sum, mut normal_n) = (0.0, 0usize, 0.0, 0usize);
        for r in &daily_returns {
            if r.abs() > threshold {
                volatile_sum += r;
                volatile_n += 1;
            } else {
                normal_sum += r;
                normal_n += 1;
            }
        }

        let inactive_days = if last_exit > 0 {
            (Utc::now().timestamp() - last_exit) / 86_400
        } else {
            self.config.review_lookback_days
        };

        Ok(Some(LivePerformance {
            sharpe,
            sortino,
            max_drawdown: max_dd,
            calmar,
            win_rate: wins as f64 / docs.len() as f64,
            profit_factor: if gross_loss > 0.0 {
                gross_profit / gross_loss
            } else {
                gross_profit
            },
            total_trades: docs.len(),
            avg_duration_hours: duration_sum_hours / docs.len() as f64,
            inactive_days,
            volatile_regime_return: if volatile_n > 0 { volatile_sum / volatile_n as f64 } else { 0.0 },
            normal_regime_return: if normal_n > 0 { normal_sum / normal_n as f64 } else { 0.0 },
        }))
    }

    async fn latest_backtest_sharpe(&self, strategy_id: Uuid) -> Result<f64> {
        let docs = self
            .store
            .query(
                containers::BACKTEST_RESULTS,
                &QueryFilter::new()
                    .eq("strategy_id", strategy_id.to_string())
                    .order_desc("created_at")
                    .limit(1),
            )
            .await?;
        Ok(docs
            .first()
            .and_then(|d| d.get("sharpe").and_then(|v| v.as_f64()))
            .unwrap_or(0.0))
    }

    /// Same-type strategies with backtest Sharpe at least 1.2x the
    /// incumbent's live Sharpe.
    async fn replacement_candidates(
        &self,
        incumbent: &Strategy,
        live_sharpe: f64,
    ) -> Result<Vec<Uuid>> {
        let threshold = (live_sharpe * 1.2).max(0.5);
        let strategies = self
            .store
            .query(
                containers::STRATEGIES,
                &QueryFilter::new().eq("is_active", false),
            )
            .await?;
        let mut candidates = Vec::new();
        for doc in strategies {
            let Ok(candidate) = serde_json::from_value::<Strategy>(doc) else {
                continue;
            };
            if candidate.id == incumbent.id
                || candidate.strategy_type != incumbent.strategy_type
                || candidate.status.is_terminal()
            {
                continue;
            }
            let sharpe = self.latest_backtest_sharpe(candidate.id).await?;
            if sharpe >= threshold {
                candidates.push(candidate.id);
            }
        }
        Ok(candidates)
    }

    async fn persist_review(&self, review: &StrategyReview) -> Result<()> {
        let mut doc = serde_json::to_value(review)?;
        doc["id"] = Value::String(Uuid::new_v4().to_string());
        self.store.upsert(containers::STRATEGY_REVIEWS, &doc).await?;
        Ok(())
    }

    /// Execute the decision as one transactional batch on the strategies
    /// container.
    async fn apply_review(&self, strategy: &Strategy, review: &StrategyReview) -> Result<()> {
        let now = Utc::now();
        let mut updated = strategy.clone();
        updated.updated_at = now;

        match review.decision {
            ReviewDecision::KeepAsIs => return Ok(()),
            ReviewDecision::IncreaseAllocation | ReviewDecision::DecreaseAllocation => {
                updated.allocation = (updated.allocation + review.allocation_change).clamp(0.0, 1.0);
            }
            ReviewDecision::Optimize | ReviewDecision::ModifyLogic => {
                merge_parameters(&mut updated.parameters, &review.param_adjustments);
            }
            ReviewDecision::Pause => {
                updated.status = StrategyStatus::Paused;
                updated.is_active = false;
            }
            ReviewDecision::Replace => {
                return self.apply_replacement(strategy, review).await;
            }
        }

        let doc = serde_json::to_value(&updated)?;
        self.store
            .transact(containers::STRATEGIES, vec![StoreOp::Upsert(doc)])
            .await?;
        Ok(())
    }

    async fn apply_replacement(&self, strategy: &Strategy, review: &StrategyReview) -> Result<()> {
        let Some(replacement_id) = review.replacement_candidates.first() else {
            // No candidate available: pause instead of trading a strategy
            // the review condemned.
            let mut updated = strategy.clone();
            updated.status = StrategyStatus::Paused;
            updated.is_active = false;
            updated.updated_at = Utc::now();
            let doc = serde_json::to_value(&updated)?;
            self.store
                .transact(containers::STRATEGIES, vec![StoreOp::Upsert(doc)])
                .await?;
            return Ok(());
        };

        let id = replacement_id.to_string();
        let Some(replacement_doc) = self.store.get(containers::STRATEGIES, &id, &id).await? else {
            warn!("DailyReviewer: replacement candidate {} vanished", id);
            return Ok(());
        };
        let mut replacement: Strategy = serde_json::from_value(replacement_doc)?;

        let now = Utc::now();
        let mut old = strategy.clone();
        old.status = StrategyStatus::Replaced;
        old.is_active = false;
        old.updated_at = now;
        set_metadata(&mut old.metadata, "replaced_by", json!(replacement.id.to_string()));

        replacement.activate(now);
        replacement.allocation = strategy.allocation;
        set_metadata(&mut replacement.metadata, "replaces", json!(strategy.id.to_string()));

        self.store
            .transact(
                containers::STRATEGIES,
                vec![
                    StoreOp::Upsert(serde_json::to_value(&old)?),
                    StoreOp::Upsert(serde_json::to_value(&replacement)?),
                ],
            )
            .await?;
        info!(
            "DailyReviewer: {} replaced by {}",
            strategy.name, replacement.name
        );
        Ok(())
    }
}

fn merge_parameters(parameters: &mut Value, adjustments: &Value) {
    if let (Value::Object(params), Value::Object(adj)) = (parameters, adjustments) {
        for (key, value) in adj {
            params.insert(key.clone(), value.clone());
        }
    }
}

fn set_metadata(metadata: &mut Value, key: &str, value: Value) {
    if !metadata.is_object() {
        *metadata = json!({});
    }
    if let Value::Object(map) = metadata {
        map.insert(key.to_string(), value);
    }
}

/// Iterate reviews on a fixed cadence until shutdown.
pub async fn run_review_loop(
    reviewer: Arc<DailyReviewer>,
    interval_hours: i64,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
        (interval_hours * 3_600) as u64,
    ));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match reviewer.review_all().await {
                    Ok(reviews) => info!("DailyReviewer: cycle complete, {} reviews", reviews.len()),
                    Err(e) => warn!("DailyReviewer: cycle failed: {}", e),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::strategy::StrategyType;
    use crate::infrastructure::persistence::MemoryStore;

    fn performance(sharpe: f64, dd: f64, win: f64, trades: usize) -> LivePerformance {
        LivePerformance {
            sharpe,
            sortino: sharpe,
            max_drawdown: dd,
            calmar: 0.0,
            win_rate: win,
            profit_factor: 1.2,
            total_trades: trades,
            avg_duration_hours: 6.0,
            inactive_days: 1,
            volatile_regime_return: 0.0,
            normal_regime_return: 0.0,
        }
    }

    #[test]
    fn test_escalation_reference_case() {
        // Sharpe -0.6 and drawdown -0.45 grade D and pause at 0.95.
        let perf = performance(-0.6, -0.45, 0.35, 25);
        let a = grade_performance(&perf, 1.5);
        assert_eq!(a.grade, Grade::D);
        assert_eq!(a.decision, ReviewDecision::Pause);
        assert!((a.confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_top_grade_increases_allocation() {
        let perf = performance(2.2, -0.05, 0.62, 40);
        let a = grade_performance(&perf, 2.1);
        assert_eq!(a.grade, Grade::APlus);
        assert_eq!(a.decision, ReviewDecision::IncreaseAllocation);
        assert!(a.degradation < 0.10);
    }

    #[test]
    fn test_a_grade_with_degradation_optimizes() {
        let perf = performance(1.4, -0.08, 0.55, 40);
        let a = grade_performance(&perf, 2.5);
        assert_eq!(a.grade, Grade::A);
        assert!(a.degradation > 0.20);
        assert_eq!(a.decision, ReviewDecision::Optimize);
    }

    #[test]
    fn test_confidence_reductions() {
        let mut perf = performance(-0.6, -0.45, 0.35, 15);
        let a = grade_performance(&perf, 1.5);
        assert!((a.confidence - 0.95 * 0.8).abs() < 1e-9);

        perf.total_trades = 25;
        perf.inactive_days = 20;
        let a = grade_performance(&perf, 1.5);
        assert!((a.confidence - 0.95 * 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_c_grade_deep_drawdown_pauses() {
        // Mid grade with a -35% drawdown and mild degradation.
        let perf = performance(0.9, -0.35, 0.48, 30);
        let a = grade_performance(&perf, 1.0);
        assert_eq!(a.grade, Grade::C);
        assert_eq!(a.decision, ReviewDecision::Pause);
    }

    #[test]
    fn test_parameter_heuristics() {
        let mut perf = performance(0.5, -0.1, 0.30, 30);
        let adj = parameter_adjustments(&perf);
        assert_eq!(adj["entry_threshold_factor"], 1.1);

        perf.win_rate = 0.5;
        perf.total_trades = 10;
        let adj = parameter_adjustments(&perf);
        assert_eq!(adj["entry_threshold_factor"], 0.9);

        perf.volatile_regime_return = -0.01;
        perf.normal_regime_return = 0.01;
        let adj = parameter_adjustments(&perf);
        assert_eq!(adj["volatility_threshold_factor"], 1.2);
    }

    #[tokio::test]
    async fn test_skips_strategy_with_few_trades() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let reviewer = DailyReviewer::new(Arc::clone(&store), LifecycleConfig::default());
        let strategy = Strategy {
            id: Uuid::new_v4(),
            name: "quiet".to_string(),
            strategy_type: StrategyType::Momentum,
            symbol: "BTC/USDT".to_string(),
            timeframe: "1h".to_string(),
            parameters: json!({}),
            status: StrategyStatus::Active,
            is_active: true,
            enabled: true,
            allocation: 0.2,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata: json!({}),
        };
        let review = reviewer.review_strategy(&strategy).await.unwrap();
        assert!(review.is_none());
    }

    #[tokio::test]
    async fn test_pause_applied_to_store() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let reviewer = DailyReviewer::new(Arc::clone(&store), LifecycleConfig::default());
        let strategy_id = Uuid::new_v4();
        let strategy = Strategy {
            id: strategy_id,
            name: "loser".to_string(),
            strategy_type: StrategyType::Momentum,
            symbol: "BTC/USDT".to_string(),
            timeframe: "1h".to_string(),
            parameters: json!({}),
            status: StrategyStatus::Active,
            is_active: true,
            enabled: true,
            allocation: 0.2,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata: json!({}),
        };
        store
            .upsert(containers::STRATEGIES, &serde_json::to_value(&strategy).unwrap())
            .await
            .unwrap();

        // 12 losing trades inside the window.
        let now = Utc::now().timestamp();
        for i in 0..12 {
            store
                .upsert(
                    containers::TRADES,
                    &json!({
                        "id": format!("t{}", i),
                        "strategy_id": strategy_id.to_string(),
                        "pnl_usd": -400.0 - (i as f64 * 10.0),
                        "entry_ts": now - 86_400 * (i + 1) - 3_600,
                        "exit_ts": now - 86_400 * (i + 1),
                    }),
                )
                .await
                .unwrap();
        }

        let review = reviewer.review_strategy(&strategy).await.unwrap().unwrap();
        assert!(matches!(
            review.decision,
            ReviewDecision::Pause | ReviewDecision::Replace
        ));

        let id = strategy_id.to_string();
        let stored = store.get(containers::STRATEGIES, &id, &id).await.unwrap().unwrap();
        assert_eq!(stored["is_active"], false);
        let status = stored["status"].as_str().unwrap();
        assert!(status == "paused" || status == "replaced");
    }
}
