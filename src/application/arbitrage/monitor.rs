//! Opportunity detection over price-cache snapshots: cross-venue
//! (CEX<->DEX), intra-chain DEX pairs, triangular cycles per exchange,
//! and flash-loan paths from registered handlers. Detected opportunities
//! are persisted, counted, and either auto-executed or published for
//! manual review.

use crate::application::arbitrage::executor::ArbitrageExecutor;
use crate::application::arbitrage::flash_loan::{FlashLoanHandler, evaluate_candidates};
use crate::application::arbitrage::triangular::RateGraph;
use crate::application::market_data::PriceCache;
use crate::config::ArbitrageConfig;
use crate::domain::arbitrage::{ArbitrageOpportunity, ArbitrageType};
use crate::domain::market::{PriceKind, PricePoint};
use crate::domain::store::{Store, containers};
use crate::infrastructure::messaging::{MessageFabric, topics};
use crate::infrastructure::observability::Metrics;
use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct ArbitrageMonitor {
    cache: Arc<PriceCache>,
    store: Arc<dyn Store>,
    fabric: MessageFabric,
    prom: Metrics,
    config: ArbitrageConfig,
    executor: Arc<ArbitrageExecutor>,
    flash_loan_handlers: Vec<Arc<dyn FlashLoanHandler>>,
}

impl ArbitrageMonitor {
    pub fn new(
        cache: Arc<PriceCache>,
        store: Arc<dyn Store>,
        fabric: MessageFabric,
        prom: Metrics,
        config: ArbitrageConfig,
        executor: Arc<ArbitrageExecutor>,
        flash_loan_handlers: Vec<Arc<dyn FlashLoanHandler>>,
    ) -> Self {
        Self {
            cache,
            store,
            fabric,
            prom,
            config,
            executor,
            flash_loan_handlers,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "ArbitrageMonitor: scanning every {}s (min {:.2}% / ${:.0})",
            self.config.scan_interval_secs, self.config.min_profit_percent, self.config.min_profit_usd
        );
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.scan_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_once().await {
                        warn!("ArbitrageMonitor: scan failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("ArbitrageMonitor: shutdown");
                        return;
                    }
                }
            }
        }
    }

    /// One full sweep of all detectors against a consistent snapshot.
    pub async fn scan_once(&self) -> Result<Vec<ArbitrageOpportunity>> {
        let snapshot = self.cache.snapshot_fresh();
        if snapshot.is_empty() {
            debug!("ArbitrageMonitor: cache empty or stale, skipping sweep");
            return Ok(Vec::new());
        }

        let (cross_venue, intra_chain, triangular, flash_loans) = futures::join!(
            self.detect_cross_venue(&snapshot),
            self.detect_intra_chain(&snapshot),
            self.detect_triangular(&snapshot),
            self.detect_flash_loans(),
        );
        let mut found = Vec::new();
        found.extend(cross_venue);
        found.extend(intra_chain);
        found.extend(triangular);
        found.extend(flash_loans);

        for opportunity in &found {
            self.dispatch(opportunity).await;
        }
        Ok(found)
    }

    /// Every CEX quote against every DEX quote per pair.
    async fn detect_cross_venue(&self, snapshot: &[PricePoint]) -> Vec<ArbitrageOpportunity> {
        let mut found = Vec::new();
        let mut by_pair: HashMap<&str, (Vec<&PricePoint>, Vec<&PricePoint>)> = HashMap::new();
        for point in snapshot {
            let entry = by_pair.entry(point.pair.as_str()).or_default();
            match point.kind {
                PriceKind::Cex => entry.0.push(point),
                PriceKind::Dex => entry.1.push(point),
            }
        }
        for (cex_quotes, dex_quotes) in by_pair.values() {
            for cex in cex_quotes {
                for dex in dex_quotes {
                    if let Some(opp) = self
                        .evaluate_pair(cex, dex, ArbitrageType::CexDex)
                        .await
                    {
                        found.push(opp);
                    }
                }
            }
        }
        found
    }

    /// DEX pairs on the same chain.
    async fn detect_intra_chain(&self, snapshot: &[PricePoint]) -> Vec<ArbitrageOpportunity> {
        let mut found = Vec::new();
        let mut by_chain_pair: HashMap<(String, String), Vec<&PricePoint>> = HashMap::new();
        for point in snapshot {
            if point.kind != PriceKind::Dex {
                continue;
            }
            let Some(chain) = &point.chain else { continue };
            by_chain_pair
                .entry((chain.clone(), point.pair.clone()))
                .or_default()
                .push(point);
        }
        for quotes in by_chain_pair.values() {
            for (i, a) in quotes.iter().enumerate() {
                for b in quotes.iter().skip(i + 1) {
                    if a.venue == b.venue {
                        continue;
                    }
                    if let Some(opp) = self
                        .evaluate_pair(a, b, ArbitrageType::IntraChain)
                        .await
                    {
                        found.push(opp);
                    }
                }
            }
        }
        found
    }

    async fn detect_triangular(&self, snapshot: &[PricePoint]) -> Vec<ArbitrageOpportunity> {
        let mut found = Vec::new();
        for exchange in &self.config.watchlist.triangular_exchanges {
            let mut graph = RateGraph::new(exchange, self.config.triangular_fee_percent);
            let mut quotes = 0;
            for point in snapshot.iter().filter(|p| &p.venue == exchange) {
                graph.add_pair(&point.pair, point.price);
                quotes += 1;
            }
            if quotes < 3 {
                continue;
            }
            if let Some(cycle) = graph.find_profitable_cycle() {
                if cycle.profit_percent < self.config.min_profit_percent {
                    continue;
                }
                info!(
                    "ArbitrageMonitor: triangular cycle on {} ({:.3}% over {} legs)",
                    exchange,
                    cycle.profit_percent,
                    cycle.legs.len()
                );
                if let Ok(doc) = serde_json::to_value(&cycle) {
                    let mut doc = doc;
                    doc["id"] = serde_json::Value::String(Uuid::new_v4().to_string());
                    let _ = self.store.upsert(containers::TRIANGULAR_ARBITRAGE, &doc).await;
                }

                // Normalised to the opportunity shape: a unit of starting
                // asset buys at 1 and sells at the gross cycle rate.
                let notional = Decimal::from_f64(self.config.max_trade_amount_usd)
                    .unwrap_or(Decimal::ZERO);
                let profit_usd = notional
                    * Decimal::from_f64(cycle.profit_percent / 100.0).unwrap_or(Decimal::ZERO);
                found.push(ArbitrageOpportunity {
                    id: Uuid::new_v4().to_string(),
                    pair: cycle
                        .legs
                        .first()
                        .map(|l| l.pair.clone())
                        .unwrap_or_default(),
                    buy_venue: exchange.clone(),
                    sell_venue: exchange.clone(),
                    buy_price: Decimal::ONE,
                    sell_price: Decimal::from_f64(cycle.gross_rate).unwrap_or(Decimal::ONE),
                    profit_percent: cycle.profit_percent,
                    estimated_profit_usd: profit_usd.round_dp(2),
                    trade_amount: notional,
                    gas_cost_usd: Decimal::ZERO,
                    opportunity_type: ArbitrageType::Triangular,
                    ts: Utc::now(),
                    executed: false,
                    execution_id: None,
                });
            }
        }
        found
    }

    async fn detect_flash_loans(&self) -> Vec<ArbitrageOpportunity> {
        let mut found = Vec::new();
        let tokens: Vec<String> = self
            .config
            .watchlist
            .pairs
            .iter()
            .filter_map(|p| p.split('/').next().map(str::to_string))
            .collect();
        for handler in &self.flash_loan_handlers {
            let candidates = match handler.candidates(&tokens).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(
                        "ArbitrageMonitor: flash-loan handler {} failed: {}",
                        handler.protocol(),
                        e
                    );
                    continue;
                }
            };
            for evaluated in evaluate_candidates(candidates, self.config.min_profit_usd) {
                let c = &evaluated.candidate;
                if let Ok(mut doc) = serde_json::to_value(c) {
                    doc["id"] = serde_json::Value::String(Uuid::new_v4().to_string());
                    let _ = self
                        .store
                        .upsert(containers::FLASH_LOAN_OPPORTUNITIES, &doc)
                        .await;
                }
                let profit_pct = if c.loan_amount > Decimal::ZERO {
                    (evaluated.net_profit_usd / c.loan_amount)
                        .to_f64()
                        .unwrap_or(0.0)
                        * 100.0
                } else {
                    0.0
                };
                found.push(ArbitrageOpportunity {
                    id: Uuid::new_v4().to_string(),
                    pair: format!("{}/flash", c.token),
                    buy_venue: c.protocol.clone(),
                    sell_venue: c.protocol.clone(),
                    buy_price: c.loan_amount,
                    sell_price: c.loan_amount + evaluated.net_profit_usd,
                    profit_percent: profit_pct,
                    estimated_profit_usd: evaluated.net_profit_usd,
                    trade_amount: c.loan_amount,
                    gas_cost_usd: c.gas_estimate_usd,
                    opportunity_type: ArbitrageType::FlashLoan,
                    ts: Utc::now(),
                    executed: false,
                    execution_id: None,
                });
            }
        }
        found
    }

    /// Two-quote evaluation: spread floor, depth-limited amount, gas, and
    /// the USD profit floor.
    pub async fn evaluate_pair(
        &self,
        a: &PricePoint,
        b: &PricePoint,
        opportunity_type: ArbitrageType,
    ) -> Option<ArbitrageOpportunity> {
        if a.price <= Decimal::ZERO || b.price <= Decimal::ZERO {
            return None;
        }
        let (low, high) = if a.price <= b.price { (a, b) } else { (b, a) };
        let diff = high.price - low.price;
        let diff_pct = (diff / low.price).to_f64()? * 100.0;
        if diff_pct < self.config.min_profit_percent {
            return None;
        }

        // Depth-limit by the thinner venue, then by the configured cap.
        let cap = Decimal::from_f64(self.config.max_trade_amount_usd)? / low.price;
        let depth_limit = [low.liquidity_usd, high.liquidity_usd]
            .into_iter()
            .flatten()
            .min()
            .map(|liq| liq / low.price);
        let trade_amount = match depth_limit {
            Some(depth) => cap.min(depth),
            None => cap,
        }
        .round_dp(8);

        let gas_cost = self.gas_cost_for(low, high).await;
        let net_profit = diff * trade_amount - gas_cost;
        if net_profit.to_f64()? < self.config.min_profit_usd {
            return None;
        }

        Some(ArbitrageOpportunity {
            id: Uuid::new_v4().to_string(),
            pair: low.pair.clone(),
            buy_venue: low.venue.clone(),
            sell_venue: high.venue.clone(),
            buy_price: low.price,
            sell_price: high.price,
            profit_percent: diff_pct,
            estimated_profit_usd: net_profit.round_dp(2),
            trade_amount,
            gas_cost_usd: gas_cost,
            opportunity_type,
            ts: Utc::now(),
            executed: false,
            execution_id: None,
        })
    }

    /// Gas for the on-chain legs, from the `gas_prices` container with a
    /// configured fallback. CEX-only routes cost no gas.
    async fn gas_cost_for(&self, a: &PricePoint, b: &PricePoint) -> Decimal {
        let mut total = Decimal::ZERO;
        for point in [a, b] {
            if point.kind != PriceKind::Dex {
                continue;
            }
            let chain = point.chain.as_deref().unwrap_or("ethereum");
            let per_swap = self
                .store
                .get(containers::GAS_PRICES, chain, chain)
                .await
                .ok()
                .flatten()
                .and_then(|d| d.get("swap_cost_usd").and_then(|v| v.as_f64()))
                .unwrap_or(self.config.default_gas_cost_usd);
            total += Decimal::from_f64(per_swap).unwrap_or(Decimal::ZERO);
        }
        total
    }

    async fn dispatch(&self, opportunity: &ArbitrageOpportunity) {
        if let Ok(doc) = serde_json::to_value(opportunity) {
            if let Err(e) = self
                .store
                .upsert(containers::ARBITRAGE_OPPORTUNITIES, &doc)
                .await
            {
                warn!("ArbitrageMonitor: opportunity persist failed: {}", e);
                return;
            }
        }

        let auto = opportunity.estimated_profit_usd.to_f64().unwrap_or(0.0)
            >= self.config.auto_execute_min_profit_usd
            && opportunity.profit_percent >= self.config.auto_execute_min_percent;
        let disposition = if auto { "auto_executed" } else { "published" };
        self.prom
            .arbitrage_opportunities_total
            .with_label_values(&[&opportunity.opportunity_type.to_string(), disposition])
            .inc();

        if auto {
            info!(
                "ArbitrageMonitor: auto-executing {} ({} {} -> {}, est ${})",
                opportunity.id,
                opportunity.pair,
                opportunity.buy_venue,
                opportunity.sell_venue,
                opportunity.estimated_profit_usd
            );
            if let Err(e) = self.executor.execute(opportunity).await {
                warn!("ArbitrageMonitor: auto-execute failed: {}", e);
            }
        } else {
            let _ = self
                .fabric
                .publish_json(
                    topics::exchanges::ARBITRAGE,
                    topics::keys::ARBITRAGE_OPPORTUNITY,
                    opportunity,
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::messaging::{FabricConfig, declare_core_topology};
    use crate::infrastructure::persistence::MemoryStore;
    use crate::infrastructure::venues::MockVenueClient;
    use rust_decimal_macros::dec;

    async fn monitor(config: ArbitrageConfig) -> (Arc<PriceCache>, Arc<dyn Store>, ArbitrageMonitor) {
        let cache = Arc::new(PriceCache::default());
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let fabric = MessageFabric::new(FabricConfig::default());
        declare_core_topology(&fabric).await.unwrap();

        let binance = Arc::new(MockVenueClient::new("binance", dec!(1000000)));
        binance.set_price("BTC/USDT", dec!(30000)).await;
        let uniswap = Arc::new(MockVenueClient::new("uniswap_v3", dec!(1000000)));
        uniswap.set_price("BTC/USDT", dec!(30300)).await;
        let mut venues: HashMap<String, Arc<dyn crate::domain::ports::VenueClient>> = HashMap::new();
        venues.insert("binance".to_string(), binance);
        venues.insert("uniswap_v3".to_string(), uniswap);

        let executor = Arc::new(ArbitrageExecutor::new(
            Arc::clone(&store),
            fabric.clone(),
            Metrics::new().unwrap(),
            config.clone(),
            venues,
        ));
        let monitor = ArbitrageMonitor::new(
            Arc::clone(&cache),
            Arc::clone(&store),
            fabric,
            Metrics::new().unwrap(),
            config,
            executor,
            Vec::new(),
        );
        (cache, store, monitor)
    }

    fn cex_point(venue: &str, price: Decimal) -> PricePoint {
        PricePoint::cex(venue, "BTC/USDT", price)
    }

    fn dex_point(price: Decimal) -> PricePoint {
        PricePoint::dex("uniswap_v3", "ethereum", "uniswap_v3", "BTC/USDT", price)
            .with_liquidity(dec!(15150))
    }

    #[tokio::test]
    async fn test_reference_cex_dex_opportunity() {
        // buy 30000 CEX, sell 30300 DEX, depth 0.5 BTC, gas $20 -> net 130.
        let (cache, store, monitor) = monitor(ArbitrageConfig::default()).await;
        cache.update(cex_point("binance", dec!(30000)));
        cache.update(dex_point(dec!(30300)));

        let found = monitor.scan_once().await.unwrap();
        assert_eq!(found.len(), 1);
        let opp = &found[0];
        assert_eq!(opp.buy_venue, "binance");
        assert_eq!(opp.sell_venue, "uniswap_v3");
        assert!((opp.profit_percent - 1.0).abs() < 1e-9);
        assert_eq!(opp.trade_amount, dec!(0.505));
        assert_eq!(opp.gas_cost_usd, dec!(20));
        // (300 * 0.505) - 20 = 131.5
        assert_eq!(opp.estimated_profit_usd, dec!(131.50));
        assert!(opp.sell_price >= opp.buy_price);

        // Stored and auto-executed (131.5 >= 100, 1.0% >= 1.0%).
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let stored = store
            .query(
                containers::ARBITRAGE_OPPORTUNITIES,
                &crate::domain::store::QueryFilter::new(),
            )
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0]["executed"], true);
        let executions = store
            .query(
                containers::ARBITRAGE_EXECUTIONS,
                &crate::domain::store::QueryFilter::new(),
            )
            .await
            .unwrap();
        assert_eq!(executions.len(), 1);
    }

    #[tokio::test]
    async fn test_thin_spread_skipped() {
        let (cache, _store, monitor) = monitor(ArbitrageConfig::default()).await;
        cache.update(cex_point("binance", dec!(30000)));
        // 0.2% spread < 0.5% floor.
        cache.update(dex_point(dec!(30060)));
        let found = monitor.scan_once().await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_gas_kills_marginal_profit() {
        let mut config = ArbitrageConfig::default();
        config.default_gas_cost_usd = 200.0;
        let (cache, _store, monitor) = monitor(config).await;
        cache.update(cex_point("binance", dec!(30000)));
        cache.update(dex_point(dec!(30300)));
        // (300 * 0.505) - 200 = -48.5 < 50 floor.
        let found = monitor.scan_once().await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_below_auto_execute_published_not_executed() {
        let mut config = ArbitrageConfig::default();
        config.auto_execute_min_profit_usd = 1_000.0;
        let (cache, store, monitor) = monitor(config).await;
        cache.update(cex_point("binance", dec!(30000)));
        cache.update(dex_point(dec!(30300)));

        let found = monitor.scan_once().await.unwrap();
        assert_eq!(found.len(), 1);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let stored = store
            .query(
                containers::ARBITRAGE_OPPORTUNITIES,
                &crate::domain::store::QueryFilter::new(),
            )
            .await
            .unwrap();
        assert_eq!(stored[0]["executed"], false);
    }

    #[tokio::test]
    async fn test_intra_chain_detection() {
        let (cache, _store, monitor) = monitor(ArbitrageConfig::default()).await;
        cache.update(
            PricePoint::dex("uniswap_v3", "ethereum", "uniswap_v3", "ETH/USDT", dec!(2000))
                .with_liquidity(dec!(100000)),
        );
        cache.update(
            PricePoint::dex("sushiswap", "ethereum", "sushiswap", "ETH/USDT", dec!(2030))
                .with_liquidity(dec!(100000)),
        );
        let found = monitor.scan_once().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].opportunity_type, ArbitrageType::IntraChain);
        // 1.5% spread across uniswap -> sushiswap.
        assert_eq!(found[0].buy_venue, "uniswap_v3");
        assert_eq!(found[0].sell_venue, "sushiswap");
    }
}
