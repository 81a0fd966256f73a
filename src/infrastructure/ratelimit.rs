//! Adaptive per-endpoint request pacing.
//!
//! Each endpoint carries its own token rate, adjusted from rate-limit
//! response headers and punished exponentially on 429s. `wait` reserves a
//! send slot so concurrent callers serialise at the configured rate; the
//! lock is never held across a sleep.

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const GLOBAL_ENDPOINT: &str = "global";

/// Fraction of the advertised headroom we allow ourselves to use.
const HEADER_RATE_SAFETY: f64 = 0.7;
/// Rate adjustments smaller than this are suppressed.
const MIN_RATE_DELTA: f64 = 0.1;
/// Multiplier applied to the rate on each 429.
const VIOLATION_RATE_FACTOR: f64 = 0.1;
/// Exponential backoff cap.
const MAX_BACKOFF_SECS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub default_rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default_rate: 10.0,
            min_rate: 0.1,
            max_rate: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointState {
    pub rate: f64,
    pub requests_made: u64,
    pub violations: u32,
    pub rate_limit_remaining: Option<i64>,
    #[serde(skip)]
    pub rate_limit_reset: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub backoff_until: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub last_request: Option<Instant>,
}

impl EndpointState {
    fn new(rate: f64) -> Self {
        Self {
            rate,
            requests_made: 0,
            violations: 0,
            rate_limit_remaining: None,
            rate_limit_reset: None,
            backoff_until: None,
            last_request: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub total_waits: u64,
    pub total_wait_seconds: f64,
    pub total_violations: u64,
    pub min_rate_seen: f64,
    pub max_rate_seen: f64,
    pub endpoints: HashMap<String, EndpointState>,
}

struct Inner {
    endpoints: HashMap<String, EndpointState>,
    stats: RateLimiterStats,
}

pub struct AdaptiveRateLimiter {
    config: RateLimiterConfig,
    inner: Mutex<Inner>,
}

impl AdaptiveRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let stats = RateLimiterStats {
            min_rate_seen: config.default_rate,
            max_rate_seen: config.default_rate,
            ..Default::default()
        };
        Self {
            config,
            inner: Mutex::new(Inner {
                endpoints: HashMap::new(),
                stats,
            }),
        }
    }

    /// Block until the next request to `endpoint` is permitted.
    ///
    /// Honours, in order: an active backoff window, an exhausted
    /// header-advertised quota, and the endpoint's pacing interval. The
    /// global endpoint is consulted first so one hot path cannot starve
    /// the connection-wide budget.
    pub async fn wait(&self, endpoint: &str) {
        self.wait_one(GLOBAL_ENDPOINT).await;
        if endpoint != GLOBAL_ENDPOINT {
            self.wait_one(endpoint).await;
        }
    }

    async fn wait_one(&self, endpoint: &str) {
        loop {
            let (sleep_for, done) = self.reserve_slot(endpoint);
            if let Some(d) = sleep_for {
                tokio::time::sleep(d).await;
            }
            if done {
                return;
            }
        }
    }

    /// Compute how long the caller must sleep. When only pacing remains,
    /// the slot is reserved before the lock is released so concurrent
    /// waiters space out at 1/rate.
    fn reserve_slot(&self, endpoint: &str) -> (Option<Duration>, bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let default_rate = self.config.default_rate;
        let now_utc = Utc::now();

        let state = inner
            .endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointState::new(default_rate));

        // 1. Backoff window from a prior 429.
        if let Some(until) = state.backoff_until {
            if now_utc < until {
                let wait = (until - now_utc).to_std().unwrap_or_default();
                debug!(
                    "RateLimiter: {} in backoff for {:.1}s",
                    endpoint,
                    wait.as_secs_f64()
                );
                inner.stats.total_waits += 1;
                inner.stats.total_wait_seconds += wait.as_secs_f64();
                return (Some(wait), false);
            }
            state.backoff_until = None;
        }

        // 2. Expired reset windows clear the advertised quota.
        if let Some(reset) = state.rate_limit_reset
            && now_utc >= reset
        {
            state.rate_limit_reset = None;
            state.rate_limit_remaining = None;
        }

        // 3. Quota exhausted: wait out the window.
        if let (Some(remaining), Some(reset)) = (state.rate_limit_remaining, state.rate_limit_reset)
            && remaining <= 0
            && reset > now_utc
        {
            let wait = (reset - now_utc).to_std().unwrap_or_default();
            warn!(
                "RateLimiter: {} quota exhausted, waiting {:.1}s for reset",
                endpoint,
                wait.as_secs_f64()
            );
            inner.stats.total_waits += 1;
            inner.stats.total_wait_seconds += wait.as_secs_f64();
            return (Some(wait), false);
        }

        // 4. Pacing: reserve the next slot.
        let min_interval = Duration::from_secs_f64(1.0 / state.rate.max(self.config.min_rate));
        let now = Instant::now();
        let scheduled = match state.last_request {
            Some(last) if now < last + min_interval => last + min_interval,
            _ => now,
        };
        state.last_request = Some(scheduled);
        state.requests_made += 1;
        if let Some(remaining) = state.rate_limit_remaining.as_mut() {
            *remaining -= 1;
        }
        inner.stats.total_requests += 1;

        if scheduled > now {
            let wait = scheduled - now;
            inner.stats.total_waits += 1;
            inner.stats.total_wait_seconds += wait.as_secs_f64();
            (Some(wait), true)
        } else {
            (None, true)
        }
    }

    /// Apply `X-RateLimit-*` / `RateLimit-*` headers from a response.
    /// When both limit and reset are known the endpoint rate is retuned to
    /// 70% of the advertised headroom.
    pub fn parse_headers(&self, endpoint: &str, headers: &HeaderMap) {
        let remaining = header_i64(headers, &["x-ratelimit-remaining", "ratelimit-remaining"]);
        let reset = header_reset(headers);

        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let default_rate = self.config.default_rate;
        let state = inner
            .endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointState::new(default_rate));

        if let Some(remaining) = remaining {
            state.rate_limit_remaining = Some(remaining);
        }
        if let Some(reset) = reset {
            state.rate_limit_reset = Some(reset);
        }

        if let (Some(remaining), Some(reset)) = (state.rate_limit_remaining, state.rate_limit_reset)
        {
            let window = (reset - Utc::now()).num_milliseconds() as f64 / 1000.0;
            if window > 0.0 && remaining > 0 {
                let optimal = remaining as f64 / window;
                let new_rate = (optimal * HEADER_RATE_SAFETY)
                    .clamp(self.config.min_rate, self.config.max_rate);
                if (new_rate - state.rate).abs() >= MIN_RATE_DELTA {
                    debug!(
                        "RateLimiter: {} retuned {:.2} -> {:.2} req/s from headers",
                        endpoint, state.rate, new_rate
                    );
                    state.rate = new_rate;
                    inner.stats.min_rate_seen = inner.stats.min_rate_seen.min(new_rate);
                    inner.stats.max_rate_seen = inner.stats.max_rate_seen.max(new_rate);
                }
            }
        }
    }

    /// Record a 429. Backoff is `Retry-After` when given, otherwise
    /// 2^violations seconds capped at one hour; the rate is slashed.
    pub fn record_429(&self, endpoint: &str, retry_after: Option<Duration>) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let default_rate = self.config.default_rate;
        let state = inner
            .endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointState::new(default_rate));

        state.violations += 1;
        let backoff = retry_after.unwrap_or_else(|| {
            let secs = 2u64
                .saturating_pow(state.violations.min(63))
                .min(MAX_BACKOFF_SECS);
            Duration::from_secs(secs)
        });
        state.backoff_until =
            Some(Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default());
        state.rate = (state.rate * VIOLATION_RATE_FACTOR).max(self.config.min_rate);

        warn!(
            "RateLimiter: 429 on {} (violation #{}) - backing off {:.0}s, rate now {:.2} req/s",
            endpoint,
            state.violations,
            backoff.as_secs_f64(),
            state.rate
        );
        inner.stats.total_violations += 1;
        let new_rate = inner.endpoints[endpoint].rate;
        inner.stats.min_rate_seen = inner.stats.min_rate_seen.min(new_rate);
    }

    /// Explicit multiplicative adjustment, clamped to the configured band.
    pub fn adjust_rate(&self, endpoint: &str, factor: f64) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let default_rate = self.config.default_rate;
        let state = inner
            .endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointState::new(default_rate));
        let new_rate = (state.rate * factor).clamp(self.config.min_rate, self.config.max_rate);
        info!(
            "RateLimiter: {} rate adjusted {:.2} -> {:.2} req/s (factor {})",
            endpoint, state.rate, new_rate, factor
        );
        state.rate = new_rate;
        inner.stats.min_rate_seen = inner.stats.min_rate_seen.min(new_rate);
        inner.stats.max_rate_seen = inner.stats.max_rate_seen.max(new_rate);
    }

    pub fn current_rate(&self, endpoint: &str) -> f64 {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner
            .endpoints
            .get(endpoint)
            .map(|s| s.rate)
            .unwrap_or(self.config.default_rate)
    }

    pub fn stats(&self) -> RateLimiterStats {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut stats = inner.stats.clone();
        stats.endpoints = inner.endpoints.clone();
        stats
    }
}

fn header_i64(headers: &HeaderMap, names: &[&str]) -> Option<i64> {
    names.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<i64>().ok())
    })
}

/// Reset may be epoch seconds, a delta in seconds, or absent. A value that
/// parses below one year of epoch seconds is treated as a delta.
fn header_reset(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let raw = header_i64(headers, &["x-ratelimit-reset", "ratelimit-reset"])?;
    if raw > 31_536_000 {
        DateTime::from_timestamp(raw, 0)
    } else {
        Some(Utc::now() + chrono::Duration::seconds(raw))
    }
}

/// `Retry-After` is either integer seconds or an HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&Utc) - Utc::now();
    delta.to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    fn limiter() -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(RateLimiterConfig::default())
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                k.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_header_retune_uses_safety_factor() {
        let rl = limiter();
        // 60 remaining over ~30s window: optimal 2.0, retuned to 1.4.
        rl.parse_headers(
            "api/klines",
            &headers(&[("x-ratelimit-remaining", "60"), ("x-ratelimit-reset", "30")]),
        );
        let rate = rl.current_rate("api/klines");
        assert!((1.3..=1.5).contains(&rate), "rate was {}", rate);
    }

    #[test]
    fn test_alternate_header_spelling() {
        let rl = limiter();
        rl.parse_headers(
            "api/depth",
            &headers(&[("ratelimit-remaining", "30"), ("ratelimit-reset", "30")]),
        );
        let rate = rl.current_rate("api/depth");
        assert!(rate < 10.0, "rate was {}", rate);
    }

    #[test]
    fn test_small_adjustments_suppressed() {
        let rl = limiter();
        rl.adjust_rate("ep", 0.2); // 10 -> 2.0
        // remaining/window ~= 2.9 optimal -> 2.03 target; delta < 0.1 suppressed
        rl.parse_headers(
            "ep",
            &headers(&[("x-ratelimit-remaining", "29"), ("x-ratelimit-reset", "10")]),
        );
        assert!((rl.current_rate("ep") - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_429_slashes_rate_and_sets_backoff() {
        let rl = limiter();
        rl.record_429("api/order", None);
        assert!((rl.current_rate("api/order") - 1.0).abs() < 1e-9);
        rl.record_429("api/order", None);
        let stats = rl.stats();
        assert_eq!(stats.total_violations, 2);
        let state = &stats.endpoints["api/order"];
        assert_eq!(state.violations, 2);
        // 1.0 * 0.1 clamped to min_rate
        assert!((state.rate - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_rate_never_below_min() {
        let rl = limiter();
        for _ in 0..10 {
            rl.record_429("ep", None);
        }
        assert!(rl.current_rate("ep") >= 0.1);
    }

    #[test]
    fn test_adjust_rate_clamped_to_max() {
        let rl = limiter();
        rl.adjust_rate("ep", 1000.0);
        assert!((rl.current_rate("ep") - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
        assert!(parse_retry_after("not-a-date").is_none());
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let future = (Utc::now() + chrono::Duration::seconds(90)).to_rfc2822();
        let parsed = parse_retry_after(&future).unwrap();
        assert!(parsed.as_secs() >= 85 && parsed.as_secs() <= 95);
    }

    #[tokio::test]
    async fn test_pacing_spaces_requests() {
        let rl = AdaptiveRateLimiter::new(RateLimiterConfig {
            default_rate: 50.0, // 20ms interval
            ..Default::default()
        });
        let start = Instant::now();
        for _ in 0..5 {
            rl.wait("fast").await;
        }
        // 4 intervals of 20ms; allow generous slack for CI schedulers.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(70), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_first_request_is_immediate() {
        let rl = limiter();
        let start = Instant::now();
        rl.wait("lazy").await;
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(rl.stats().total_requests, 2); // global + endpoint
    }
}
