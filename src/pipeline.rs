//! C4 — the sequential per-token state machine driving Market → Security →
//! Router → Chain, with short-circuit filtering, scored fusion, a
//! result cache, and a token-level timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::warn;

use crate::cache::TtlCache;
use crate::domain::{
    ChainReport, CombinedAnalysis, FilterCriteria, FundingPattern, MarketSnapshot, RouterReport,
    SecurityReport, TokenAddress,
};
use crate::sources::{ChainClient, MarketClient, RouterClient, SecurityClient};

const RESULT_CACHE_TTL: Duration = Duration::from_secs(600);

#[derive(Clone)]
pub struct Pipeline {
    market: Arc<dyn MarketClient>,
    security: Arc<dyn SecurityClient>,
    router: Arc<dyn RouterClient>,
    chain: Arc<dyn ChainClient>,
    result_cache: Arc<TtlCache<String, CombinedAnalysis>>,
    cache_results: bool,
    timeout: Duration,
    batch_size: usize,
    max_concurrent: usize,
}

impl Pipeline {
    pub fn new(
        market: Arc<dyn MarketClient>,
        security: Arc<dyn SecurityClient>,
        router: Arc<dyn RouterClient>,
        chain: Arc<dyn ChainClient>,
        cache_results: bool,
        timeout: Duration,
        batch_size: usize,
        max_concurrent: usize,
    ) -> Self {
        Self {
            market,
            security,
            router,
            chain,
            result_cache: TtlCache::new(10_000),
            cache_results,
            timeout,
            batch_size,
            max_concurrent,
        }
    }

    pub async fn process_one(&self, address: &TokenAddress, criteria: &FilterCriteria) -> CombinedAnalysis {
        let cache_key = format!("pipeline:{}", address.as_str());
        if self.cache_results {
            if let Some(cached) = self.result_cache.get(&cache_key) {
                return cached;
            }
        }

        let deadline = Instant::now() + self.timeout;
        let analysis = match tokio::time::timeout(self.timeout, self.run_stages(address, criteria, deadline))
            .await
        {
            Ok(analysis) => analysis,
            Err(_) => Self::timeout_analysis(address),
        };

        if self.cache_results {
            self.result_cache
                .set(cache_key, analysis.clone(), RESULT_CACHE_TTL);
        }
        analysis
    }

    /// Chunks `addresses` by `batch_size`, running each chunk with up to
    /// `max_concurrent` tokens in flight. Each token runs on its own task
    /// so a panic inside one stage can never take down the others.
    pub async fn process_batch(
        &self,
        addresses: &[TokenAddress],
        criteria: &FilterCriteria,
    ) -> Vec<CombinedAnalysis> {
        let mut results = Vec::with_capacity(addresses.len());

        for chunk in addresses.chunks(self.batch_size.max(1)) {
            let semaphore = Arc::new(Semaphore::new(self.max_concurrent.max(1)));
            let mut handles = Vec::with_capacity(chunk.len());

            for address in chunk {
                let pipeline = self.clone();
                let address = address.clone();
                let criteria = criteria.clone();
                let semaphore = semaphore.clone();
                handles.push((
                    address.clone(),
                    tokio::spawn(async move {
                        let _permit = semaphore
                            .acquire_owned()
                            .await
                            .expect("semaphore is never closed while tasks are outstanding");
                        pipeline.process_one(&address, &criteria).await
                    }),
                ));
            }

            for (address, handle) in handles {
                match handle.await {
                    Ok(analysis) => results.push(analysis),
                    Err(join_err) => {
                        warn!(address = %address, error = %join_err, "pipeline task panicked; isolating");
                        results.push(Self::panic_analysis(&address));
                    }
                }
            }
        }

        results
    }

    async fn run_stages(
        &self,
        address: &TokenAddress,
        criteria: &FilterCriteria,
        deadline: Instant,
    ) -> CombinedAnalysis {
        let market = self.market.analyze(address, criteria, deadline).await;
        if market.filtered {
            return Self::short_circuit_at_market(address, market);
        }

        let security = self.security.analyze(address, criteria, deadline).await;
        if security.filtered {
            return Self::short_circuit_at_security(address, market, security);
        }

        let router = self.router.analyze(address, criteria, deadline).await;
        if router.filtered {
            return Self::short_circuit_at_router(address, market, security, router);
        }

        let chain = self.chain.analyze(address, criteria, deadline).await;
        let passed = !chain.filtered;
        let failed_filters = if chain.filtered {
            vec![format!(
                "Chain: {}",
                chain.filter_reason.clone().unwrap_or_default()
            )]
        } else {
            Vec::new()
        };
        let overall_score = if passed {
            Self::compute_score(&market, &security, &router, &chain)
        } else {
            0.0
        };

        CombinedAnalysis {
            address: address.clone(),
            market,
            security,
            router,
            chain,
            overall_score,
            passed,
            failed_filters,
            timestamp: Utc::now(),
        }
    }

    fn short_circuit_at_market(address: &TokenAddress, market: MarketSnapshot) -> CombinedAnalysis {
        let reason = market.filter_reason.clone().unwrap_or_default();
        CombinedAnalysis {
            address: address.clone(),
            security: SecurityReport::skipped(address, "Failed before Security analysis"),
            router: RouterReport::skipped(address, "Failed before Router analysis"),
            chain: ChainReport::skipped(address, "Failed before Chain analysis"),
            market,
            overall_score: 0.0,
            passed: false,
            failed_filters: vec![format!("Market: {}", reason)],
            timestamp: Utc::now(),
        }
    }

    fn short_circuit_at_security(
        address: &TokenAddress,
        market: MarketSnapshot,
        security: SecurityReport,
    ) -> CombinedAnalysis {
        let reason = security.filter_reason.clone().unwrap_or_default();
        CombinedAnalysis {
            address: address.clone(),
            market,
            router: RouterReport::skipped(address, "Failed before Router analysis"),
            chain: ChainReport::skipped(address, "Failed before Chain analysis"),
            security,
            overall_score: 0.0,
            passed: false,
            failed_filters: vec![format!("Security: {}", reason)],
            timestamp: Utc::now(),
        }
    }

    fn short_circuit_at_router(
        address: &TokenAddress,
        market: MarketSnapshot,
        security: SecurityReport,
        router: RouterReport,
    ) -> CombinedAnalysis {
        let reason = router.filter_reason.clone().unwrap_or_default();
        CombinedAnalysis {
            address: address.clone(),
            market,
            security,
            chain: ChainReport::skipped(address, "Failed before Chain analysis"),
            router,
            overall_score: 0.0,
            passed: false,
            failed_filters: vec![format!("Router: {}", reason)],
            timestamp: Utc::now(),
        }
    }

    fn timeout_analysis(address: &TokenAddress) -> CombinedAnalysis {
        CombinedAnalysis {
            address: address.clone(),
            market: MarketSnapshot::skipped(address, "pipeline timeout"),
            security: SecurityReport::skipped(address, "pipeline timeout"),
            router: RouterReport::skipped(address, "pipeline timeout"),
            chain: ChainReport::skipped(address, "pipeline timeout"),
            overall_score: 0.0,
            passed: false,
            failed_filters: vec!["pipeline: timeout".to_string()],
            timestamp: Utc::now(),
        }
    }

    fn panic_analysis(address: &TokenAddress) -> CombinedAnalysis {
        CombinedAnalysis {
            address: address.clone(),
            market: MarketSnapshot::skipped(address, "pipeline task failed"),
            security: SecurityReport::skipped(address, "pipeline task failed"),
            router: RouterReport::skipped(address, "pipeline task failed"),
            chain: ChainReport::skipped(address, "pipeline task failed"),
            overall_score: 0.0,
            passed: false,
            failed_filters: vec!["pipeline: task failed".to_string()],
            timestamp: Utc::now(),
        }
    }

    fn compute_score(
        market: &MarketSnapshot,
        security: &SecurityReport,
        router: &RouterReport,
        chain: &ChainReport,
    ) -> f64 {
        let market_contribution = {
            let mut c = 50.0;
            if market.liquidity > 10_000.0 {
                c += 20.0;
            }
            if market.volume_24h > 5_000.0 {
                c += 15.0;
            }
            if market.age_hours > 1.0 && market.age_hours < 24.0 {
                c += 15.0;
            }
            c
        };

        let security_contribution = (security.safety_score / 10.0) * 100.0;

        let router_contribution = {
            let mut c = if router.routing_available { 60.0 } else { 0.0 };
            if router.slippage_estimate < 5.0 {
                c += 25.0;
            } else if router.slippage_estimate < 10.0 {
                c += 15.0;
            }
            if !router.blacklisted {
                c += 15.0;
            }
            c
        };

        let chain_contribution = {
            let mut c = 50.0;
            if chain.creator_info.rugged_tokens == 0 {
                c += 25.0;
            } else if chain.creator_info.rugged_tokens <= 1 {
                c += 10.0;
            }
            if chain.top_holders_percentage < 40.0 {
                c += 15.0;
            } else if chain.top_holders_percentage < 60.0 {
                c += 5.0;
            }
            if chain.funding_pattern == FundingPattern::Organic {
                c += 10.0;
            }
            c
        };

        let total = market_contribution * 0.25
            + security_contribution * 0.35
            + router_contribution * 0.20
            + chain_contribution * 0.20;

        total.clamp(0.0, 100.0)
    }
}
