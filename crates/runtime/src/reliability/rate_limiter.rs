//! Per-provider request spacing
//!
//! External providers tolerate different request rates; each gets a minimum
//! inter-request delay enforced process-wide. Limiters are keyed by
//! provider, not by agent, so two agents sharing a provider share a budget.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::types::ProviderKind;

/// Minimum delays between consecutive requests to the same provider.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub min_intervals: HashMap<ProviderKind, Duration>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        let mut min_intervals = HashMap::new();
        min_intervals.insert(ProviderKind::SemanticScholar, Duration::from_millis(200));
        min_intervals.insert(ProviderKind::Crossref, Duration::from_millis(100));
        min_intervals.insert(ProviderKind::Arxiv, Duration::from_secs(3));
        min_intervals.insert(ProviderKind::Perplexity, Duration::from_millis(500));
        min_intervals.insert(ProviderKind::Llm, Duration::ZERO);
        Self { min_intervals }
    }
}

/// Spaces requests per provider. `acquire` reserves the next slot under the
/// lock and sleeps outside it, so concurrent callers queue fairly without
/// holding the lock across an await.
pub struct ProviderRateLimiter {
    config: RateLimiterConfig,
    next_slot: Mutex<HashMap<ProviderKind, Instant>>,
}

impl ProviderRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    fn min_interval(&self, provider: ProviderKind) -> Duration {
        self.config
            .min_intervals
            .get(&provider)
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Wait until a request to `provider` is allowed.
    pub async fn acquire(&self, provider: ProviderKind) {
        let interval = self.min_interval(provider);
        if interval.is_zero() {
            return;
        }

        let slot = {
            let mut slots = self.next_slot.lock();
            let now = Instant::now();
            let slot = match slots.get(&provider) {
                Some(next) if *next > now => *next,
                _ => now,
            };
            slots.insert(provider, slot + interval);
            slot
        };

        tokio::time::sleep_until(slot).await;
    }
}

impl Default for ProviderRateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with(provider: ProviderKind, interval: Duration) -> ProviderRateLimiter {
        let mut min_intervals = HashMap::new();
        min_intervals.insert(provider, interval);
        ProviderRateLimiter::new(RateLimiterConfig { min_intervals })
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_requests_are_spaced() {
        let limiter = limiter_with(ProviderKind::SemanticScholar, Duration::from_millis(200));

        let start = Instant::now();
        limiter.acquire(ProviderKind::SemanticScholar).await;
        limiter.acquire(ProviderKind::SemanticScholar).await;
        limiter.acquire(ProviderKind::SemanticScholar).await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(400), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn providers_do_not_share_budgets() {
        let mut min_intervals = HashMap::new();
        min_intervals.insert(ProviderKind::SemanticScholar, Duration::from_secs(10));
        min_intervals.insert(ProviderKind::Crossref, Duration::from_millis(1));
        let limiter = ProviderRateLimiter::new(RateLimiterConfig { min_intervals });

        limiter.acquire(ProviderKind::SemanticScholar).await;
        let start = Instant::now();
        limiter.acquire(ProviderKind::Crossref).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn unconfigured_provider_is_unthrottled() {
        let limiter = limiter_with(ProviderKind::Arxiv, Duration::from_secs(60));
        // No entry for Llm; must return immediately.
        limiter.acquire(ProviderKind::Llm).await;
    }
}
