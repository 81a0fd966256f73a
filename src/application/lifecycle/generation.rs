//! Background strategy generation jobs: produce candidates (pluggable
//! generator with template fallback), persist them as paper-trading
//! strategies, and backtest each one, with live progress counters and
//! prompt cancellation.

use crate::application::lifecycle::backtest::BacktestOrchestrator;
use crate::application::lifecycle::templates::generate_templates;
use crate::config::LifecycleConfig;
use crate::domain::errors::LifecycleError;
use crate::domain::ports::StrategyGenerator;
use crate::domain::store::{Store, containers};
use crate::domain::strategy::{GenerationJob, JobStatus, Strategy, StrategyType};
use crate::infrastructure::messaging::{MessageFabric, topics};
use crate::infrastructure::observability::Metrics;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};
use uuid::Uuid;

struct JobHandle {
    cancel_tx: watch::Sender<bool>,
}

pub struct GenerationManager {
    store: Arc<dyn Store>,
    generator: Option<Arc<dyn StrategyGenerator>>,
    backtester: Arc<BacktestOrchestrator>,
    fabric: MessageFabric,
    prom: Metrics,
    config: LifecycleConfig,
    symbols: Vec<String>,
    jobs: Mutex<HashMap<Uuid, JobHandle>>,
}

impl GenerationManager {
    pub fn new(
        store: Arc<dyn Store>,
        generator: Option<Arc<dyn StrategyGenerator>>,
        backtester: Arc<BacktestOrchestrator>,
        fabric: MessageFabric,
        prom: Metrics,
        config: LifecycleConfig,
        symbols: Vec<String>,
    ) -> Self {
        Self {
            store,
            generator,
            backtester,
            fabric,
            prom,
            config,
            symbols,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a generation job and return its id immediately.
    pub async fn start_generation_job(
        self: &Arc<Self>,
        num_strategies: u32,
        types: Vec<StrategyType>,
    ) -> Result<Uuid> {
        let job_id = Uuid::new_v4();
        let job = GenerationJob::new(job_id, num_strategies, Utc::now());
        self.persist_job(&job).await?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.jobs.lock().await.insert(job_id, JobHandle { cancel_tx });

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.run_job(job, types, cancel_rx).await {
                warn!("GenerationManager: job {} failed: {}", job_id, e);
                if let Ok(Some(mut job)) = manager.load_job(job_id).await {
                    job.status = JobStatus::Failed;
                    job.completed_at = Some(Utc::now());
                    let _ = manager.persist_job(&job).await;
                }
            }
            manager.jobs.lock().await.remove(&job_id);
        });
        info!(
            "GenerationManager: job {} started ({} strategies)",
            job_id, num_strategies
        );
        Ok(job_id)
    }

    pub async fn cancel_job(&self, job_id: Uuid) -> Result<(), LifecycleError> {
        let jobs = self.jobs.lock().await;
        match jobs.get(&job_id) {
            Some(handle) => {
                let _ = handle.cancel_tx.send(true);
                Ok(())
            }
            None => Err(LifecycleError::JobNotFound {
                job_id: job_id.to_string(),
            }),
        }
    }

    pub async fn load_job(&self, job_id: Uuid) -> Result<Option<GenerationJob>> {
        let id = job_id.to_string();
        let doc = self.store.get(containers::GENERATION_JOBS, &id, &id).await?;
        Ok(doc.and_then(|d| serde_json::from_value(d).ok()))
    }

    async fn run_job(
        &self,
        mut job: GenerationJob,
        types: Vec<StrategyType>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        // Empty jobs complete without entering the pipeline.
        if job.total == 0 {
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
            self.persist_job(&job).await?;
            return Ok(());
        }

        // Phase 1: generation.
        job.status = JobStatus::Generating;
        self.persist_job(&job).await?;

        let mut strategies = Vec::with_capacity(job.total as usize);
        let produced = self.produce_strategies(job.total, &types).await;
        for strategy in produced {
            if *cancel_rx.borrow() {
                return self.finish_cancelled(job).await;
            }
            let doc = serde_json::to_value(&strategy)?;
            self.store.upsert(containers::STRATEGIES, &doc).await?;
            job.generated += 1;
            job.current_strategy = Some(strategy.name.clone());
            strategies.push(strategy);
            if job.generated.is_multiple_of(10) {
                self.broadcast_progress(&job).await;
            }
        }
        self.persist_job(&job).await?;

        // Phase 2: backtesting, sequentially to bound memory.
        job.status = JobStatus::Backtesting;
        self.persist_job(&job).await?;
        for strategy in &strategies {
            if *cancel_rx.borrow() {
                return self.finish_cancelled(job).await;
            }
            job.current_strategy = Some(strategy.name.clone());
            match self.backtester.run_backtest(strategy, job.job_id).await {
                Ok(summary) => {
                    job.backtested += 1;
                    if summary.passed_criteria {
                        job.passed += 1;
                        self.prom
                            .generation_strategies_total
                            .with_label_values(&["passed"])
                            .inc();
                    } else {
                        job.failed += 1;
                        self.prom
                            .generation_strategies_total
                            .with_label_values(&["failed"])
                            .inc();
                    }
                }
                Err(e) => {
                    warn!(
                        "GenerationManager: backtest failed for {}: {}",
                        strategy.name, e
                    );
                    job.backtested += 1;
                    job.failed += 1;
                }
            }
            if job.backtested.is_multiple_of(5) {
                self.broadcast_progress(&job).await;
            }
            // Cancellation must also unwind promptly after a long backtest.
            if *cancel_rx.borrow() {
                return self.finish_cancelled(job).await;
            }
        }

        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.current_strategy = None;
        self.persist_job(&job).await?;
        self.broadcast_progress(&job).await;
        info!(
            "GenerationManager: job {} completed ({} passed / {} failed)",
            job.job_id, job.passed, job.failed
        );
        Ok(())
    }

    async fn produce_strategies(&self, count: u32, types: &[StrategyType]) -> Vec<Strategy> {
        if let Some(generator) = &self.generator {
            match generator.generate_systematic(count, types).await {
                Ok(strategies) if !strategies.is_empty() => return strategies,
                Ok(_) => warn!("GenerationManager: generator returned nothing, using templates"),
                Err(e) => warn!(
                    "GenerationManager: generator failed ({}), using templates",
                    e
                ),
            }
        }
        generate_templates(count, types, &self.symbols)
    }

    async fn finish_cancelled(&self, mut job: GenerationJob) -> Result<()> {
        info!("GenerationManager: job {} cancelled", job.job_id);
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        job.current_strategy = None;
        self.persist_job(&job).await?;
        self.broadcast_progress(&job).await;
        Ok(())
    }

    async fn persist_job(&self, job: &GenerationJob) -> Result<()> {
        let mut doc = serde_json::to_value(job)?;
        doc["id"] = serde_json::Value::String(job.job_id.to_string());
        self.store.upsert(containers::GENERATION_JOBS, &doc).await?;
        Ok(())
    }

    async fn broadcast_progress(&self, job: &GenerationJob) {
        if let Err(e) = self
            .fabric
            .publish_json(
                topics::exchanges::STRATEGY_REQUESTS,
                &self.config.progress_topic,
                job,
            )
            .await
        {
            warn!("GenerationManager: progress broadcast failed: {}", e);
        }
    }
}
