//! End-to-end exercise of a single aggregator run against fake source
//! clients, wired the same way `main.rs` wires the real ones. Mirrors the
//! in-crate fake-client style already used by `pipeline::tests` and
//! `hub::tests`, just assembled across module boundaries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use tokenwatch_backend::aggregator::{Aggregator, AggregatorConfig};
use tokenwatch_backend::domain::{
    ChainReport, CombinedAnalysis, CreatorInfo, FilterCriteria, FundingPattern, MarketSnapshot,
    RouterReport, RunStatus, SecurityReport, SourceHealth, TokenAddress,
};
use tokenwatch_backend::error::CoreError;
use tokenwatch_backend::health::HealthMonitor;
use tokenwatch_backend::hub::{Hub, ServerMessage};
use tokenwatch_backend::persistence::PersistencePort;
use tokenwatch_backend::pipeline::Pipeline;
use tokenwatch_backend::ratelimit::{RateLimitConfig, RateLimiter};
use tokenwatch_backend::sources::{ChainClient, MarketClient, RouterClient, SecurityClient};

fn addr(n: u32) -> TokenAddress {
    TokenAddress::new(format!("0x{n:040x}")).unwrap()
}

struct FakeMarket {
    universe: Vec<TokenAddress>,
}

#[async_trait]
impl MarketClient for FakeMarket {
    async fn trending(&self, limit: usize, _deadline: Instant) -> Vec<TokenAddress> {
        self.universe.iter().take(limit).cloned().collect()
    }

    async fn analyze(
        &self,
        address: &TokenAddress,
        _criteria: &FilterCriteria,
        _deadline: Instant,
    ) -> MarketSnapshot {
        MarketSnapshot {
            address: address.clone(),
            symbol: "TOK".into(),
            name: "Token".into(),
            launch_timestamp: chrono::Utc::now(),
            price: 1.0,
            market_cap: 500_000.0,
            volume_24h: 8_000.0,
            liquidity: 15_000.0,
            age_hours: 5.0,
            filtered: false,
            filter_reason: None,
        }
    }

    async fn health(&self) -> SourceHealth {
        SourceHealth { source: "market", healthy: true, latency_ms: 1, endpoint: "fake".into() }
    }
}

struct FakeSecurity;
#[async_trait]
impl SecurityClient for FakeSecurity {
    async fn analyze(&self, address: &TokenAddress, _c: &FilterCriteria, _d: Instant) -> SecurityReport {
        SecurityReport {
            address: address.clone(),
            honeypot_risk: false,
            mint_authority: false,
            freeze_authority: false,
            liquidity_locked: true,
            holder_concentration: 10.0,
            safety_score: 9.0,
            risks: Vec::new(),
            warnings: Vec::new(),
            filtered: false,
            filter_reason: None,
        }
    }
    async fn health(&self) -> SourceHealth {
        SourceHealth { source: "security", healthy: true, latency_ms: 1, endpoint: "fake".into() }
    }
}

struct FakeRouter;
#[async_trait]
impl RouterClient for FakeRouter {
    async fn analyze(&self, address: &TokenAddress, _c: &FilterCriteria, _d: Instant) -> RouterReport {
        RouterReport {
            address: address.clone(),
            routing_available: true,
            slippage_estimate: 1.5,
            spread: 0.8,
            volume_24h: 8_000.0,
            blacklisted: false,
            route_count: 3,
            filtered: false,
            filter_reason: None,
        }
    }
    async fn health(&self) -> SourceHealth {
        SourceHealth { source: "router", healthy: true, latency_ms: 1, endpoint: "fake".into() }
    }
}

struct FakeChain;
#[async_trait]
impl ChainClient for FakeChain {
    async fn analyze(&self, address: &TokenAddress, _c: &FilterCriteria, _d: Instant) -> ChainReport {
        ChainReport {
            address: address.clone(),
            creator_wallet: "0xcreator".into(),
            creator_info: CreatorInfo {
                created_tokens: 2,
                rugged_tokens: 0,
                successful_tokens: 2,
                success_rate: 1.0,
                first_token_date: None,
                average_holding: 0.0,
            },
            top_holders: Vec::new(),
            top_holders_percentage: 20.0,
            funding_pattern: FundingPattern::Organic,
            filtered: false,
            filter_reason: None,
        }
    }
    async fn health(&self) -> SourceHealth {
        SourceHealth { source: "chain", healthy: true, latency_ms: 1, endpoint: "fake".into() }
    }
}

struct RecordingPersistence {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl PersistencePort for RecordingPersistence {
    async fn record_analysis(&self, _analysis: &CombinedAnalysis) -> Result<(), CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(CoreError::Persistence("forced failure".into()))
        } else {
            Ok(())
        }
    }
}

struct Harness {
    aggregator: Arc<Aggregator>,
    hub: Arc<Hub>,
    health: Arc<HealthMonitor>,
    persistence: Arc<RecordingPersistence>,
}

fn build_harness(universe: Vec<TokenAddress>, persistence_fails: bool) -> Harness {
    let market: Arc<dyn MarketClient> = Arc::new(FakeMarket { universe });
    let security: Arc<dyn SecurityClient> = Arc::new(FakeSecurity);
    let router: Arc<dyn RouterClient> = Arc::new(FakeRouter);
    let chain: Arc<dyn ChainClient> = Arc::new(FakeChain);

    let pipeline = Arc::new(Pipeline::new(
        market.clone(),
        security.clone(),
        router.clone(),
        chain.clone(),
        false,
        Duration::from_secs(5),
        10,
        4,
    ));

    let persistence = Arc::new(RecordingPersistence {
        calls: AtomicUsize::new(0),
        fail: persistence_fails,
    });

    let hub = Hub::new(16, Duration::from_secs(30), Duration::from_secs(60));

    let rate_limiter = RateLimiter::new(RateLimitConfig {
        requests_per_second: 100.0,
        burst: 100,
        min_interval: Duration::from_millis(0),
        base_delay: Duration::from_millis(1),
        retry_max: Duration::from_secs(1),
        max_retries: 1,
        backoff_floor_initial: Duration::from_millis(0),
        backoff_floor_max: Duration::from_secs(1),
    });
    let health = HealthMonitor::new(
        market.clone(),
        security.clone(),
        router.clone(),
        chain.clone(),
        rate_limiter,
        Duration::from_secs(60),
        Duration::from_secs(60),
    );

    let aggregator = Aggregator::new(
        market,
        pipeline,
        persistence.clone(),
        hub.clone(),
        health.clone(),
        AggregatorConfig {
            tick_interval: Duration::from_secs(300),
            max_tokens_per_run: 10,
            criteria: FilterCriteria::defaults(),
        },
    );

    Harness { aggregator, hub, health, persistence }
}

#[tokio::test]
async fn run_before_any_probe_is_skipped_as_unhealthy() {
    let harness = build_harness(vec![addr(1)], false);
    let run = harness.aggregator.run_once().await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.discovered, 0);
}

#[tokio::test]
async fn healthy_run_discovers_processes_and_publishes_to_subscribed_clients() {
    let harness = build_harness(vec![addr(10), addr(11)], false);
    harness.health.probe_now().await;

    let (client_id, mut rx) = harness.hub.on_connect();
    harness.hub.subscribe(&client_id, vec!["tokens".to_string()]);
    let _ = rx.try_recv(); // welcome
    let _ = rx.try_recv(); // subscription_ack

    let run = harness.aggregator.run_once().await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.discovered, 2);
    assert_eq!(run.processed, 2);
    assert_eq!(run.passed, 2);
    assert_eq!(harness.persistence.calls.load(Ordering::SeqCst), 2);

    let mut updates = 0;
    while let Ok(msg) = rx.try_recv() {
        if matches!(msg, ServerMessage::TokenUpdate { .. }) {
            updates += 1;
        }
    }
    assert_eq!(updates, 2);
}

#[tokio::test]
async fn persistence_failure_does_not_suppress_hub_publication() {
    let harness = build_harness(vec![addr(20)], true);
    harness.health.probe_now().await;

    let (client_id, mut rx) = harness.hub.on_connect();
    harness.hub.subscribe(&client_id, vec!["tokens".to_string()]);
    let _ = rx.try_recv();
    let _ = rx.try_recv();

    let run = harness.aggregator.run_once().await;
    assert_eq!(run.passed, 1);
    assert_eq!(harness.persistence.calls.load(Ordering::SeqCst), 1);

    let mut saw_update = false;
    while let Ok(msg) = rx.try_recv() {
        if matches!(msg, ServerMessage::TokenUpdate { .. }) {
            saw_update = true;
        }
    }
    assert!(saw_update, "hub must publish even when persistence fails");
}

#[tokio::test]
async fn second_run_skips_already_processed_tokens() {
    let harness = build_harness(vec![addr(30)], false);
    harness.health.probe_now().await;

    let first = harness.aggregator.run_once().await;
    assert_eq!(first.discovered, 1);
    assert_eq!(first.processed, 1);

    let second = harness.aggregator.run_once().await;
    assert_eq!(second.discovered, 1, "market still reports it as trending");
    assert_eq!(second.processed, 0, "already-processed token is excluded from the batch");
}

#[tokio::test]
async fn blacklisted_token_is_excluded_from_processing() {
    let harness = build_harness(vec![addr(40)], false);
    harness.health.probe_now().await;
    harness.aggregator.add_to_blacklist(addr(40));

    let run = harness.aggregator.run_once().await;
    assert_eq!(run.discovered, 1);
    assert_eq!(run.processed, 0);
}
