//! C6 — periodic health probing of the four source clients, with a cached
//! classification the rest of the system reads without blocking on a live
//! probe. A background `tokio::time::interval` refreshes a shared snapshot
//! that readers consult synchronously.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

use crate::domain::{HealthClassification, SourceHealth, SystemHealthReport};
use crate::ratelimit::RateLimiter;
use crate::sources::{ChainClient, MarketClient, RouterClient, SecurityClient};

pub struct HealthMonitor {
    market: Arc<dyn MarketClient>,
    security: Arc<dyn SecurityClient>,
    router: Arc<dyn RouterClient>,
    chain: Arc<dyn ChainClient>,
    rate_limiter: Arc<RateLimiter>,
    probe_interval: Duration,
    cache_ttl: Duration,
    report: RwLock<Option<(SystemHealthReport, Instant)>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        market: Arc<dyn MarketClient>,
        security: Arc<dyn SecurityClient>,
        router: Arc<dyn RouterClient>,
        chain: Arc<dyn ChainClient>,
        rate_limiter: Arc<RateLimiter>,
        probe_interval: Duration,
        cache_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            market,
            security,
            router,
            chain,
            rate_limiter,
            probe_interval,
            cache_ttl,
            report: RwLock::new(None),
            task: parking_lot::Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let this = self.clone();
        *task = Some(tokio::spawn(async move { this.probe_loop().await }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    async fn probe_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.probe_interval);
        loop {
            interval.tick().await;
            self.probe_now().await;
        }
    }

    /// Probes all four sources concurrently and refreshes the cached
    /// report. A source whose probe confirms it healthy has its rate
    /// limiter backoff floor reset.
    pub async fn probe_now(&self) -> SystemHealthReport {
        let (market, security, router, chain) = tokio::join!(
            self.market.health(),
            self.security.health(),
            self.router.health(),
            self.chain.health(),
        );

        for health in [&market, &security, &router, &chain] {
            if health.healthy {
                self.rate_limiter.reset(health.source);
            }
        }

        let report = SystemHealthReport::classify(vec![market, security, router, chain]);
        if report.classification != HealthClassification::Healthy {
            info!(classification = ?report.classification, "system health degraded");
        }
        *self.report.write() = Some((report.clone(), Instant::now()));
        report
    }

    /// Returns the last probed classification. Freshness is the background
    /// loop's job (`probe_interval`); `cache_ttl` only governs how long a
    /// reading is trusted before an unprobed system is reported unhealthy
    /// rather than stale-healthy.
    pub fn classification(&self) -> HealthClassification {
        self.current_or_stale().classification
    }

    pub fn sources(&self) -> Vec<SourceHealth> {
        self.current_or_stale().sources
    }

    fn current_or_stale(&self) -> SystemHealthReport {
        match self.report.read().clone() {
            Some((report, checked_at)) if checked_at.elapsed() < self.cache_ttl => report,
            Some((mut report, _)) => {
                report.classification = HealthClassification::Unhealthy;
                report
            }
            // Nothing probed yet: report unhealthy rather than assume
            // healthy, since `Aggregator::run_once` treats this as the
            // gating signal.
            None => SystemHealthReport::classify(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FilterCriteria, MarketSnapshot, TokenAddress};
    use async_trait::async_trait;

    struct AlwaysHealthy(&'static str);
    #[async_trait]
    impl MarketClient for AlwaysHealthy {
        async fn trending(&self, _limit: usize, _deadline: Instant) -> Vec<TokenAddress> {
            Vec::new()
        }
        async fn analyze(&self, a: &TokenAddress, _c: &FilterCriteria, _d: Instant) -> MarketSnapshot {
            MarketSnapshot::skipped(a, "unused")
        }
        async fn health(&self) -> SourceHealth {
            SourceHealth { source: self.0, healthy: true, latency_ms: 1, endpoint: "fake".into() }
        }
    }

    #[test]
    fn empty_report_before_first_probe_is_unhealthy() {
        // classify(vec![]) treats zero sources as 0/1 ratio -> unhealthy.
        let report = SystemHealthReport::classify(Vec::new());
        assert_eq!(report.classification, HealthClassification::Unhealthy);
    }
}
