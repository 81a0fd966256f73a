//! Automatic activation of the top-N strategies under a stability window.
//! The `MAX_ACTIVE_STRATEGIES` setting in the store is authoritative; the
//! config value only seeds it.

use crate::config::LifecycleConfig;
use crate::domain::store::{QueryFilter, Store, StoreOp, containers};
use crate::domain::strategy::{Strategy, StrategyStatus};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub const MAX_ACTIVE_SETTING: &str = "MAX_ACTIVE_STRATEGIES";

/// Normalised 0..10 component scores for one candidate.
#[derive(Debug, Clone)]
pub struct CandidateScore {
    pub strategy_id: Uuid,
    pub performance: f64,
    pub backtest: f64,
    pub market_alignment: f64,
    pub risk: f64,
    pub sentiment_alignment: f64,
    pub overall: f64,
    pub admissible: bool,
}

/// Overall = 0.35 perf + 0.20 backtest + 0.15 market + 0.15 risk +
/// 0.15 sentiment.
pub fn overall_score(
    performance: f64,
    backtest: f64,
    market_alignment: f64,
    risk: f64,
    sentiment_alignment: f64,
) -> f64 {
    performance * 0.35
        + backtest * 0.20
        + market_alignment * 0.15
        + risk * 0.15
        + sentiment_alignment * 0.15
}

/// The activation set difference: top-N admissible candidates versus the
/// currently active set.
pub fn select_changes(
    current_active: &[Uuid],
    scored: &[CandidateScore],
    max_active: usize,
) -> (Vec<Uuid>, Vec<Uuid>) {
    let mut ranked: Vec<&CandidateScore> = scored
        .iter()
        .filter(|s| s.admissible && s.overall > 0.0)
        .collect();
    ranked.sort_by(|a, b| b.overall.partial_cmp(&a.overall).unwrap_or(std::cmp::Ordering::Equal));
    let optimal: Vec<Uuid> = ranked.iter().take(max_active).map(|s| s.strategy_id).collect();

    let activate: Vec<Uuid> = optimal
        .iter()
        .filter(|id| !current_active.contains(id))
        .copied()
        .collect();
    let deactivate: Vec<Uuid> = current_active
        .iter()
        .filter(|id| !optimal.contains(id))
        .copied()
        .collect();
    (activate, deactivate)
}

pub struct ActivationManager {
    store: Arc<dyn Store>,
    config: LifecycleConfig,
}

impl ActivationManager {
    pub fn new(store: Arc<dyn Store>, config: LifecycleConfig) -> Self {
        Self { store, config }
    }

    /// The settings table is authoritative; a missing key is seeded with
    /// the default and 2 is the ultimate fallback.
    pub async fn max_active_strategies(&self) -> usize {
        match self.store.get_setting(MAX_ACTIVE_SETTING).await {
            Ok(Some(value)) => value.parse::<usize>().unwrap_or(2),
            Ok(None) => {
                let default = self.config.max_active_strategies.to_string();
                if let Err(e) = self.store.put_setting(MAX_ACTIVE_SETTING, &default).await {
                    warn!("ActivationManager: seeding {} failed: {}", MAX_ACTIVE_SETTING, e);
                }
                self.config.max_active_strategies as usize
            }
            Err(e) => {
                warn!("ActivationManager: settings read failed: {}", e);
                2
            }
        }
    }

    /// One activation pass. No-ops inside the stability window.
    pub async fn check_and_update(&self) -> Result<ActivationOutcome> {
        if let Some(last) = self.last_check().await? {
            let elapsed = Utc::now() - last;
            if elapsed < Duration::hours(self.config.min_stability_hours) {
                let remaining =
                    Duration::hours(self.config.min_stability_hours) - elapsed;
                info!(
                    "ActivationManager: stability window active, {} minutes remaining",
                    remaining.num_minutes()
                );
                return Ok(ActivationOutcome::default());
            }
        }

        let max_active = self.max_active_strategies().await;
        let strategies = self.load_candidates().await?;
        let current_active: Vec<Uuid> = strategies
            .iter()
            .filter(|s| s.is_active)
            .map(|s| s.id)
            .collect();

        let mut scored = Vec::with_capacity(strategies.len());
        for strategy in &strategies {
            scored.push(self.evaluate(strategy).await?);
        }

        let (activate, deactivate) = select_changes(&current_active, &scored, max_active);
        if activate.is_empty() && deactivate.is_empty() {
            self.record_check().await?;
            return Ok(ActivationOutcome::default());
        }

        // Deactivate first so the active count never exceeds the cap.
        let now = Utc::now();
        let mut ops = Vec::new();
        for strategy in &strategies {
            if deactivate.contains(&strategy.id) {
                let mut updated = strategy.clone();
                updated.deactivate(now);
                set_metadata(&mut updated.metadata, "auto_deactivated", json!(true));
                set_metadata(
                    &mut updated.metadata,
                    "deactivated_at",
                    json!(now.to_rfc3339()),
                );
                ops.push(StoreOp::Upsert(serde_json::to_value(&updated)?));
            }
        }
        for strategy in &strategies {
            if activate.contains(&strategy.id) {
                let mut updated = strategy.clone();
                if !updated.activate(now) {
                    warn!(
                        "ActivationManager: {} not activatable (status {})",
                        updated.name, updated.status
                    );
                    continue;
                }
                set_metadata(&mut updated.metadata, "auto_deactivated", json!(false));
                set_metadata(&mut updated.metadata, "activated_at", json!(now.to_rfc3339()));
                ops.push(StoreOp::Upsert(serde_json::to_value(&updated)?));
            }
        }
        self.store.transact(containers::STRATEGIES, ops).await?;
        self.record_check().await?;

        info!(
            "ActivationManager: change set applied (reason: automatic_optimization, activate: {:?}, deactivate: {:?})",
            activate, deactivate
        );
        Ok(ActivationOutcome {
            activated: activate,
            deactivated: deactivate,
        })
    }

    async fn load_candidates(&self) -> Result<Vec<Strategy>> {
        let docs = self
            .store
            .query(containers::STRATEGIES, &QueryFilter::new())
            .await?;
        Ok(docs
            .into_iter()
            .filter_map(|d| serde_json::from_value::<Strategy>(d).ok())
            .filter(|s| !s.status.is_terminal() && s.enabled)
            .filter(|s| s.status != StrategyStatus::Paused || s.is_active)
            .collect())
    }

    pub async fn evaluate(&self, strategy: &Strategy) -> Result<CandidateScore> {
        let trades = self.recent_trades(strategy.id, 30).await?;
        let backtest = self.latest_backtest(strategy.id).await?;

        // Performance: live Sharpe, drawdown, win rate, total return.
        let (live_sharpe, live_dd, live_win, total_return) = trade_stats(&trades);
        let performance = (normalise(live_sharpe, -1.0, 3.0) * 0.4
            + (1.0 - (live_dd.abs() / 0.4).min(1.0)) * 0.25
            + live_win * 0.15
            + normalise(total_return, -0.2, 0.4) * 0.2)
            * 10.0;

        // Backtest prior: Sharpe + return weighted.
        let (bt_sharpe, bt_return, bt_dd, bt_trades) = backtest
            .as_ref()
            .map(|b| {
                (
                    b.get("sharpe").and_then(Value::as_f64).unwrap_or(0.0),
                    b.get("total_return").and_then(Value::as_f64).unwrap_or(0.0),
                    b.get("max_drawdown").and_then(Value::as_f64).unwrap_or(0.0),
                    b.get("total_trades").and_then(Value::as_u64).unwrap_or(0) as u32,
                )
            })
            .unwrap_or((0.0, 0.0, 0.0, 0));
        let backtest_score =
            (normalise(bt_sharpe, 0.0, 3.0) * 0.6 + normalise(bt_return, 0.0, 0.5) * 0.4) * 10.0;

        // Market alignment: trade recency (7-day window) and 7-day PnL.
        let week_ago = Utc::now().timestamp() - 7 * 86_400;
        let week_trades: Vec<&Value> = trades
            .iter()
            .filter(|t| t.get("exit_ts").and_then(Value::as_i64).unwrap_or(0) >= week_ago)
            .collect();
        let week_pnl: f64 = week_trades
            .iter()
            .filter_map(|t| pnl_of(t))
            .sum();
        let recency = (week_trades.len() as f64 / 5.0).min(1.0);
        let market_alignment = (recency * 0.5 + normalise(week_pnl, -500.0, 500.0) * 0.5) * 10.0;

        // Risk: 0.7 drawdown + 0.3 win rate.
        let dd_score = 1.0 - (live_dd.abs() / 0.4).min(1.0);
        let risk = (dd_score * 0.7 + live_win * 0.3) * 10.0;

        let sentiment_alignment = self.sentiment_alignment(&strategy.symbol).await * 10.0;

        let live_sharpe_or_bt = if trades.is_empty() { bt_sharpe } else { live_sharpe };
        let inactive_days = trades
            .iter()
            .filter_map(|t| t.get("exit_ts").and_then(Value::as_i64))
            .max()
            .map(|last| (Utc::now().timestamp() - last) / 86_400)
            .unwrap_or(i64::MAX);
        let effective_dd = if trades.is_empty() { bt_dd } else { live_dd };
        let effective_trades = trades.len() as u32 + bt_trades;

        let overall = overall_score(
            performance,
            backtest_score,
            market_alignment,
            risk,
            sentiment_alignment,
        );
        let admissible = live_sharpe_or_bt >= self.config.min_candidate_sharpe
            && effective_dd >= self.config.max_candidate_drawdown
            && effective_trades >= self.config.min_candidate_trades
            && inactive_days <= self.config.max_inactive_days
            && overall > 0.0
            && sentiment_alignment / 10.0 >= self.config.min_sentiment_alignment;

        Ok(CandidateScore {
            strategy_id: strategy.id,
            performance,
            backtest: backtest_score,
            market_alignment,
            risk,
            sentiment_alignment,
            overall,
            admissible,
        })
    }

    /// Aggregated polarity (symbol 0.65 + global 0.35) mapped to [0, 1],
    /// halved when the freshest sample is older than 12 hours.
    async fn sentiment_alignment(&self, symbol: &str) -> f64 {
        let symbol_sent = self.latest_sentiment(Some(symbol)).await;
        let global_sent = self.latest_sentiment(None).await;
        let (polarity, freshest) = match (symbol_sent, global_sent) {
            (Some((sp, st)), Some((gp, gt))) => (sp * 0.65 + gp * 0.35, st.max(gt)),
            (Some((sp, st)), None) => (sp, st),
            (None, Some((gp, gt))) => (gp, gt),
            (None, None) => return 0.5,
        };
        let mut aligned = (polarity + 1.0) / 2.0;
        if Utc::now() - freshest > Duration::hours(12) {
            aligned *= 0.5;
        }
        aligned.clamp(0.0, 1.0)
    }

    async fn latest_sentiment(&self, symbol: Option<&str>) -> Option<(f64, DateTime<Utc>)> {
        let mut filter = QueryFilter::new().order_desc("ts").limit(1);
        filter = match symbol {
            Some(s) => filter.eq("symbol", s),
            None => filter.eq("symbol", Value::Null),
        };
        let docs = self.store.query(containers::SENTIMENT, &filter).await.ok()?;
        let doc = docs.first()?;
        let polarity = doc.get("polarity").and_then(Value::as_f64)?;
        let ts = doc
            .get("ts")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())?
            .with_timezone(&Utc);
        Some((polarity, ts))
    }

    async fn recent_trades(&self, strategy_id: Uuid, days: i64) -> Result<Vec<Value>> {
        let since = Utc::now().timestamp() - days * 86_400;
        self.store
            .query(
                containers::TRADES,
                &QueryFilter::new()
                    .eq("strategy_id", strategy_id.to_string())
                    .gt("exit_ts", since),
            )
            .await
            .map_err(Into::into)
    }

    async fn latest_backtest(&self, strategy_id: Uuid) -> Result<Option<Value>> {
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
        Ok(docs.into_iter().next())
    }

    async fn last_check(&self) -> Result<Option<DateTime<Utc>>> {
        let doc = self
            .store
            .get(containers::TRADING_CONFIG, "activation_state", "lifecycle")
            .await?;
        Ok(doc
            .and_then(|d| d.get("last_check").and_then(|v| v.as_str()).map(str::to_string))
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    async fn record_check(&self) -> Result<()> {
        let doc = json!({
            "id": "activation_state",
            "config_type": "lifecycle",
            "last_check": Utc::now().to_rfc3339(),
        });
        self.store.upsert(containers::TRADING_CONFIG, &doc).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActivationOutcome {
    pub activated: Vec<Uuid>,
    pub deactivated: Vec<Uuid>,
}

fn trade_stats(trades: &[Value]) -> (f64, f64, f64, f64) {
    if trades.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }
    let pnls: Vec<f64> = trades.iter().filter_map(pnl_of).collect();
    if pnls.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }
    let base = 10_000.0;
    let returns: Vec<f64> = pnls.iter().map(|p| p / base).collect();
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let sigma = crate::application::risk::data::std_dev(&returns);
    let sharpe = if sigma > 0.0 {
        mean / sigma * 252.0_f64.sqrt()
    } else if mean > 0.0 {
        1.0
    } else {
        0.0
    };

    let mut equity = base;
    let mut peak = base;
    let mut max_dd = 0.0f64;
    for p in &pnls {
        equity += p;
        peak = peak.max(equity);
        if peak > 0.0 {
            max_dd = max_dd.min((equity - peak) / peak);
        }
    }
    let wins = pnls.iter().filter(|p| **p > 0.0).count();
    let win_rate = wins as f64 / pnls.len() as f64;
    let total_return = (equity - base) / base;
    (sharpe, max_dd, win_rate, total_return)
}

fn pnl_of(trade: &Value) -> Option<f64> {
    match trade.get("pnl_usd")? {
        Value::String(s) => s.parse::<f64>().ok(),
        other => other.as_f64(),
    }
}

fn normalise(value: f64, low: f64, high: f64) -> f64 {
    ((value - low) / (high - low)).clamp(0.0, 1.0)
}

fn set_metadata(metadata: &mut Value, key: &str, value: Value) {
    if !metadata.is_object() {
        *metadata = json!({});
    }
    if let Value::Object(map) = metadata {
        map.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::MemoryStore;
    use crate::domain::strategy::StrategyType;

    fn score(id: Uuid, overall: f64) -> CandidateScore {
        CandidateScore {
            strategy_id: id,
            performance: overall,
            backtest: overall,
            market_alignment: overall,
            risk: overall,
            sentiment_alignment: overall,
            overall,
            admissible: true,
        }
    }

    #[test]
    fn test_activation_swap_reference_case() {
        // Current {A, B} scoring {5.2, 4.1}; candidates add C=6.0, D=4.5.
        let (a, b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let scored = vec![score(a, 5.2), score(b, 4.1), score(c, 6.0), score(d, 4.5)];
        let (activate, deactivate) = select_changes(&[a, b], &scored, 2);
        assert_eq!(activate, vec![c]);
        assert_eq!(deactivate, vec![b]);
    }

    #[test]
    fn test_no_change_when_current_is_optimal() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let scored = vec![score(a, 6.0), score(b, 5.0)];
        let (activate, deactivate) = select_changes(&[a, b], &scored, 2);
        assert!(activate.is_empty());
        assert!(deactivate.is_empty());
    }

    #[test]
    fn test_inadmissible_candidates_excluded() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut high = score(b, 9.0);
        high.admissible = false;
        let scored = vec![score(a, 3.0), high];
        let (activate, deactivate) = select_changes(&[], &scored, 2);
        assert_eq!(activate, vec![a]);
        assert!(deactivate.is_empty());
    }

    #[test]
    fn test_zero_overall_excluded() {
        let a = Uuid::new_v4();
        let scored = vec![score(a, 0.0)];
        let (activate, _) = select_changes(&[], &scored, 2);
        assert!(activate.is_empty());
    }

    #[test]
    fn test_overall_weights() {
        let overall = overall_score(10.0, 10.0, 10.0, 10.0, 10.0);
        assert!((overall - 10.0).abs() < 1e-9);
        let perf_only = overall_score(10.0, 0.0, 0.0, 0.0, 0.0);
        assert!((perf_only - 3.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_settings_seeded_with_default() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let manager = ActivationManager::new(Arc::clone(&store), LifecycleConfig::default());
        assert_eq!(manager.max_active_strategies().await, 2);
        // Seeded and subsequently authoritative.
        store.put_setting(MAX_ACTIVE_SETTING, "3").await.unwrap();
        assert_eq!(manager.max_active_strategies().await, 3);
    }

    #[tokio::test]
    async fn test_active_count_never_exceeds_cap() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let manager = ActivationManager::new(Arc::clone(&store), LifecycleConfig::default());
        let now = Utc::now();

        // Five paper strategies, each with a passing backtest and fresh
        // profitable trades so they are admissible.
        for i in 0..5 {
            let id = Uuid::new_v4();
            let strategy = Strategy {
                id,
                name: format!("cand-{}", i),
                strategy_type: StrategyType::Momentum,
                symbol: "BTC/USDT".to_string(),
                timeframe: "1h".to_string(),
                parameters: json!({}),
                status: StrategyStatus::PaperTrading,
                is_active: false,
                enabled: true,
                allocation: 0.0,
                created_at: now,
                updated_at: now,
                metadata: json!({}),
            };
            store
                .upsert(containers::STRATEGIES, &serde_json::to_value(&strategy).unwrap())
                .await
                .unwrap();
            store
                .upsert(
                    containers::BACKTEST_RESULTS,
                    &json!({
                        "id": format!("bt-{}", i),
                        "strategy_id": id.to_string(),
                        "sharpe": 1.5 + i as f64 * 0.1,
                        "total_return": 0.3,
                        "max_drawdown": -0.1,
                        "total_trades": 60,
                        "created_at": now.to_rfc3339(),
                    }),
                )
                .await
                .unwrap();
            for t in 0..6 {
                store
                    .upsert(
                        containers::TRADES,
                        &json!({
                            "id": format!("t-{}-{}", i, t),
                            "strategy_id": id.to_string(),
                            "pnl_usd": 50.0 + t as f64 * (5.0 + i as f64),
                            "entry_ts": now.timestamp() - 86_400 * (t + 1) - 3_600,
                            "exit_ts": now.timestamp() - 86_400 * (t + 1),
                        }),
                    )
                    .await
                    .unwrap();
            }
        }

        let outcome = manager.check_and_update().await.unwrap();
        assert_eq!(outcome.activated.len(), 2);

        let active = store
            .query(containers::STRATEGIES, &QueryFilter::new().eq("is_active", true))
            .await
            .unwrap();
        assert_eq!(active.len(), 2);

        // Second run inside the stability window is a no-op.
        let again = manager.check_and_update().await.unwrap();
        assert!(again.activated.is_empty());
        assert!(again.deactivated.is_empty());
    }
}
