//! Price feed tasks. The simulated feed drives the cache in mock mode
//! with a deterministic walk per venue so detectors have cross-venue
//! spreads to chew on; live adapters would sit behind the same writer
//! path via `VenueClient` implementations.

use crate::application::market_data::price_cache::PriceCache;
use crate::domain::market::{PriceKind, PricePoint};
use crate::infrastructure::messaging::{MessageFabric, topics};
use crate::infrastructure::ratelimit::AdaptiveRateLimiter;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct FeedVenue {
    pub venue: String,
    pub kind: PriceKind,
    pub chain: Option<String>,
    /// Per-venue price offset in basis points, so venues disagree.
    pub skew_bps: f64,
}

pub struct SimulatedFeed {
    cache: Arc<PriceCache>,
    fabric: MessageFabric,
    limiter: Arc<AdaptiveRateLimiter>,
    venues: Vec<FeedVenue>,
    pairs: Vec<String>,
    tick_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl SimulatedFeed {
    pub fn new(
        cache: Arc<PriceCache>,
        fabric: MessageFabric,
        limiter: Arc<AdaptiveRateLimiter>,
        venues: Vec<FeedVenue>,
        pairs: Vec<String>,
        tick_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cache,
            fabric,
            limiter,
            venues,
            pairs,
            tick_interval,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(
            "SimulatedFeed: streaming {} pairs across {} venues",
            self.pairs.len(),
            self.venues.len()
        );
        let mut iteration: u64 = 0;
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!("SimulatedFeed: shutdown");
                        return;
                    }
                    continue;
                }
            }
            iteration += 1;

            for (pair_idx, pair) in self.pairs.iter().enumerate() {
                // One paced "request" per pair per tick, like a poll loop
                // against a venue REST endpoint would be.
                self.limiter.wait(&format!("feed/{}", pair)).await;

                let mid = base_price(pair) * walk_factor(iteration, pair_idx as u64);
                for venue in &self.venues {
                    let venue_price = mid * (1.0 + venue.skew_bps / 10_000.0);
                    let Some(price) = Decimal::from_f64(venue_price) else {
                        continue;
                    };
                    let point = match venue.kind {
                        PriceKind::Cex => PricePoint::cex(&venue.venue, pair, price.round_dp(8)),
                        PriceKind::Dex => PricePoint::dex(
                            &venue.venue,
                            venue.chain.as_deref().unwrap_or("ethereum"),
                            &venue.venue,
                            pair,
                            price.round_dp(8),
                        )
                        .with_liquidity(Decimal::from(250_000)),
                    };
                    self.cache.update(point);
                }

                let _ = self
                    .fabric
                    .publish_json(
                        topics::exchanges::PORTFOLIO_UPDATES,
                        &topics::keys::market_price(pair),
                        &json!({"pair": pair, "mid": mid, "iteration": iteration}),
                    )
                    .await;
            }

            if iteration.is_multiple_of(50) {
                debug!("SimulatedFeed: {} ticks streamed", iteration);
            }
        }
    }
}

fn base_price(pair: &str) -> f64 {
    if pair.contains("BTC") {
        96_000.0
    } else if pair.contains("ETH") {
        3_400.0
    } else if pair.contains("SOL") {
        150.0
    } else {
        40.0
    }
}

/// Deterministic walk in a narrow band, same LCG shape as the candle
/// synthesiser.
fn walk_factor(iteration: u64, pair_idx: u64) -> f64 {
    let seed = (iteration + pair_idx)
        .wrapping_mul(1_103_515_245)
        .wrapping_add(12_345);
    let unit = ((seed / 65_536) % 1_000) as f64 / 1_000.0 - 0.5;
    1.0 + unit * 0.004
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_factor_bounded() {
        for i in 0..1_000 {
            let f = walk_factor(i, 0);
            assert!((0.997..=1.003).contains(&f), "factor {} out of band", f);
        }
    }

    #[test]
    fn test_base_prices_by_asset() {
        assert_eq!(base_price("BTC/USDT"), 96_000.0);
        assert_eq!(base_price("ETH/USDT"), 3_400.0);
        assert_eq!(base_price("AVAX/USDT"), 40.0);
    }
}
