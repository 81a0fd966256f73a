//! Process-wide quote cache keyed by `(kind, venue, pair)`.
//!
//! Feed tasks are the writers; arbitrage detectors and strategy consumers
//! read snapshots. Entries are swapped whole so readers never observe a
//! torn `PricePoint`. There is no eviction beyond staleness: the symbol
//! set is bounded by the watchlist.

use crate::domain::market::{PriceKind, PricePoint};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StalenessThresholds {
    pub cex: Duration,
    pub dex: Duration,
}

impl Default for StalenessThresholds {
    fn default() -> Self {
        Self {
            cex: Duration::from_secs(60),
            dex: Duration::from_secs(30),
        }
    }
}

type CacheKey = (PriceKind, String, String);

pub struct PriceCache {
    entries: RwLock<HashMap<CacheKey, PricePoint>>,
    thresholds: StalenessThresholds,
}

impl std::fmt::Debug for PriceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceCache")
            .field("entries", &"<RwLock>")
            .finish()
    }
}

impl PriceCache {
    pub fn new(thresholds: StalenessThresholds) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            thresholds,
        }
    }

    pub fn update(&self, point: PricePoint) {
        let key = (point.kind, point.venue.clone(), point.pair.clone());
        match self.entries.write() {
            Ok(mut guard) => {
                guard.insert(key, point);
            }
            Err(poisoned) => {
                tracing::error!("PriceCache: lock poisoned during write, recovering");
                poisoned.into_inner().insert(key, point);
            }
        }
    }

    pub fn get(&self, kind: PriceKind, venue: &str, pair: &str) -> Option<PricePoint> {
        let guard = match self.entries.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .get(&(kind, venue.to_string(), pair.to_string()))
            .cloned()
    }

    fn max_age(&self, kind: PriceKind) -> i64 {
        match kind {
            PriceKind::Cex => self.thresholds.cex.as_secs() as i64,
            PriceKind::Dex => self.thresholds.dex.as_secs() as i64,
        }
    }

    /// All entries still fresh enough for opportunity evaluation.
    pub fn snapshot_fresh(&self) -> Vec<PricePoint> {
        let now = Utc::now();
        let guard = match self.entries.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .values()
            .filter(|p| p.age_seconds(now) <= self.max_age(p.kind))
            .cloned()
            .collect()
    }

    /// Fresh quotes for one pair across all venues.
    pub fn fresh_quotes_for_pair(&self, pair: &str) -> Vec<PricePoint> {
        self.snapshot_fresh()
            .into_iter()
            .filter(|p| p.pair == pair)
            .collect()
    }

    /// Distinct pairs currently cached (fresh or not).
    pub fn pairs(&self) -> Vec<String> {
        let guard = match self.entries.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut pairs: Vec<String> = guard.values().map(|p| p.pair.clone()).collect();
        pairs.sort();
        pairs.dedup();
        pairs
    }

    pub fn len(&self) -> usize {
        let guard = match self.entries.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PriceCache {
    fn default() -> Self {
        Self::new(StalenessThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    #[test]
    fn test_update_and_get() {
        let cache = PriceCache::default();
        cache.update(PricePoint::cex("binance", "BTC/USDT", dec!(30000)));
        let point = cache.get(PriceKind::Cex, "binance", "BTC/USDT").unwrap();
        assert_eq!(point.price, dec!(30000));
    }

    #[test]
    fn test_latest_write_wins() {
        let cache = PriceCache::default();
        cache.update(PricePoint::cex("binance", "BTC/USDT", dec!(30000)));
        cache.update(PricePoint::cex("binance", "BTC/USDT", dec!(30100)));
        let point = cache.get(PriceKind::Cex, "binance", "BTC/USDT").unwrap();
        assert_eq!(point.price, dec!(30100));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_stale_entries_excluded_from_snapshot() {
        let cache = PriceCache::default();
        let mut stale = PricePoint::cex("kraken", "BTC/USDT", dec!(29900));
        stale.ts = Utc::now() - ChronoDuration::seconds(120);
        cache.update(stale);
        cache.update(PricePoint::cex("binance", "BTC/USDT", dec!(30000)));

        let fresh = cache.snapshot_fresh();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].venue, "binance");
        // Still retrievable directly.
        assert!(cache.get(PriceKind::Cex, "kraken", "BTC/USDT").is_some());
    }

    #[test]
    fn test_dex_staleness_tighter_than_cex() {
        let cache = PriceCache::default();
        let mut cex = PricePoint::cex("binance", "ETH/USDT", dec!(2000));
        cex.ts = Utc::now() - ChronoDuration::seconds(45);
        let mut dex = PricePoint::dex("uniswap_v3", "ethereum", "uniswap_v3", "ETH/USDT", dec!(2005));
        dex.ts = Utc::now() - ChronoDuration::seconds(45);
        cache.update(cex);
        cache.update(dex);

        // 45s: fresh for CEX (60s), stale for DEX (30s).
        let fresh = cache.snapshot_fresh();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].kind, PriceKind::Cex);
    }

    #[test]
    fn test_pairs_deduplicated() {
        let cache = PriceCache::default();
        cache.update(PricePoint::cex("binance", "BTC/USDT", dec!(30000)));
        cache.update(PricePoint::cex("kraken", "BTC/USDT", dec!(30010)));
        cache.update(PricePoint::cex("binance", "ETH/USDT", dec!(2000)));
        assert_eq!(cache.pairs(), vec!["BTC/USDT", "ETH/USDT"]);
    }
}
