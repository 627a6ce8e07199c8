//! C5 — discovers trending tokens on a schedule, runs them through the
//! pipeline, and publishes/persists whatever passes. Grounded in the
//! teacher's `bin/route_quality_monitor.rs` tick-loop-plus-select shape,
//! generalized from a fixed prober loop into a restartable scheduler with
//! its own de-dup/exclusion state and run history.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::domain::{FilterCriteria, HealthClassification, Run, RunStatus, TokenAddress};
use crate::health::HealthMonitor;
use crate::hub::Hub;
use crate::persistence::PersistencePort;
use crate::pipeline::Pipeline;
use crate::sources::MarketClient;

/// How far back `ProcessedSet` remembers a token before it becomes
/// eligible for re-discovery.
const PROCESSED_HORIZON: Duration = Duration::from_secs(24 * 3600);
const MAX_RUNS_RETAINED: usize = 200;
const DISCOVERY_DEADLINE: Duration = Duration::from_secs(30);
const EWMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub tick_interval: Duration,
    pub max_tokens_per_run: usize,
    pub criteria: FilterCriteria,
}

#[derive(Debug, Clone, Default)]
pub struct AggregatorStats {
    pub runs_completed: u64,
    pub tokens_discovered: u64,
    pub tokens_processed: u64,
    pub tokens_passed: u64,
    pub persistence_failures: u64,
    pub avg_run_duration_ms: f64,
    pub avg_tokens_per_run: f64,
}

struct ProcessedSet {
    seen: HashSet<TokenAddress>,
    order: VecDeque<(TokenAddress, Instant)>,
}

impl ProcessedSet {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn contains(&self, address: &TokenAddress) -> bool {
        self.seen.contains(address)
    }

    fn mark(&mut self, address: TokenAddress) {
        if self.seen.insert(address.clone()) {
            self.order.push_back((address, Instant::now()));
        }
    }

    /// Drops entries older than `PROCESSED_HORIZON`, making those tokens
    /// eligible for discovery again.
    fn sweep(&mut self) {
        let cutoff = Instant::now()
            .checked_sub(PROCESSED_HORIZON)
            .unwrap_or_else(Instant::now);
        while let Some((_, ts)) = self.order.front() {
            if *ts < cutoff {
                if let Some((address, _)) = self.order.pop_front() {
                    self.seen.remove(&address);
                }
            } else {
                break;
            }
        }
    }
}

pub struct Aggregator {
    market: Arc<dyn MarketClient>,
    pipeline: Arc<Pipeline>,
    persistence: Arc<dyn PersistencePort>,
    hub: Arc<Hub>,
    health: Arc<HealthMonitor>,
    config: RwLock<AggregatorConfig>,
    processed: Mutex<ProcessedSet>,
    blacklist: RwLock<HashSet<TokenAddress>>,
    runs: Mutex<VecDeque<Run>>,
    stats: Mutex<AggregatorStats>,
    busy: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Aggregator {
    pub fn new(
        market: Arc<dyn MarketClient>,
        pipeline: Arc<Pipeline>,
        persistence: Arc<dyn PersistencePort>,
        hub: Arc<Hub>,
        health: Arc<HealthMonitor>,
        config: AggregatorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            market,
            pipeline,
            persistence,
            hub,
            health,
            config: RwLock::new(config),
            processed: Mutex::new(ProcessedSet::new()),
            blacklist: RwLock::new(HashSet::new()),
            runs: Mutex::new(VecDeque::new()),
            stats: Mutex::new(AggregatorStats::default()),
            busy: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    /// Idempotent: calling `start` while already running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let this = self.clone();
        *task = Some(tokio::spawn(async move { this.run_loop().await }));
    }

    /// Idempotent: calling `stop` while not running is a no-op.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    async fn run_loop(self: Arc<Self>) {
        let interval_dur = self.config.read().tick_interval;
        let mut interval = tokio::time::interval(interval_dur);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if self.busy.swap(true, Ordering::SeqCst) {
                warn!("aggregator tick coalesced: previous run still in progress");
                continue;
            }
            let run = self.run_once().await;
            self.busy.store(false, Ordering::SeqCst);
            info!(run_id = %run.id, discovered = run.discovered, processed = run.processed, passed = run.passed, "aggregator run finished");
        }
    }

    pub async fn run_once(&self) -> Run {
        let mut run = Run::new();
        let config = self.config.read().clone();

        if self.health.classification() == HealthClassification::Unhealthy {
            run.status = RunStatus::Failed;
            run.errors.push("system unhealthy; run skipped".to_string());
            run.end_time = Some(Utc::now());
            self.record_run(run.clone());
            return run;
        }

        let deadline = Instant::now() + DISCOVERY_DEADLINE;
        let discovered = self
            .market
            .trending(config.max_tokens_per_run.saturating_mul(4), deadline)
            .await;
        run.discovered = discovered.len();

        let blacklist = self.blacklist.read().clone();
        let mut candidates = Vec::with_capacity(config.max_tokens_per_run);
        {
            let processed = self.processed.lock();
            for address in discovered {
                if candidates.len() >= config.max_tokens_per_run {
                    break;
                }
                if processed.contains(&address) || blacklist.contains(&address) {
                    continue;
                }
                candidates.push(address);
            }
        }

        let analyses = self.pipeline.process_batch(&candidates, &config.criteria).await;
        run.processed = analyses.len();

        {
            let mut processed = self.processed.lock();
            for address in &candidates {
                processed.mark(address.clone());
            }
            processed.sweep();
        }

        let mut passed = 0usize;
        let mut persistence_failures = 0u64;
        for analysis in &analyses {
            if !analysis.passed {
                continue;
            }
            passed += 1;
            if let Err(err) = self.persistence.record_analysis(analysis).await {
                warn!(address = %analysis.address, error = %err, "persistence failed; publishing anyway");
                persistence_failures += 1;
            }
            self.hub.publish_token_update(analysis);
        }
        run.passed = passed;
        run.status = RunStatus::Completed;
        run.end_time = Some(Utc::now());

        self.update_stats(&run, persistence_failures);
        self.record_run(run.clone());
        run
    }

    pub fn add_to_blacklist(&self, address: TokenAddress) {
        self.blacklist.write().insert(address);
    }

    pub fn remove_from_blacklist(&self, address: &TokenAddress) {
        self.blacklist.write().remove(address);
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats.lock().clone()
    }

    pub fn runs(&self, limit: usize) -> Vec<Run> {
        self.runs.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn config(&self) -> AggregatorConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, apply: impl FnOnce(&mut AggregatorConfig)) {
        apply(&mut self.config.write());
    }

    pub fn reset(&self) {
        *self.processed.lock() = ProcessedSet::new();
        self.blacklist.write().clear();
        self.runs.lock().clear();
        *self.stats.lock() = AggregatorStats::default();
    }

    fn update_stats(&self, run: &Run, persistence_failures: u64) {
        let mut stats = self.stats.lock();
        stats.runs_completed += 1;
        stats.tokens_discovered += run.discovered as u64;
        stats.tokens_processed += run.processed as u64;
        stats.tokens_passed += run.passed as u64;
        stats.persistence_failures += persistence_failures;

        let duration_ms = run
            .end_time
            .map(|end| (end - run.start_time).num_milliseconds() as f64)
            .unwrap_or(0.0);

        if stats.runs_completed == 1 {
            stats.avg_run_duration_ms = duration_ms;
            stats.avg_tokens_per_run = run.processed as f64;
        } else {
            stats.avg_run_duration_ms =
                EWMA_ALPHA * duration_ms + (1.0 - EWMA_ALPHA) * stats.avg_run_duration_ms;
            stats.avg_tokens_per_run =
                EWMA_ALPHA * run.processed as f64 + (1.0 - EWMA_ALPHA) * stats.avg_tokens_per_run;
        }
    }

    fn record_run(&self, run: Run) {
        let mut runs = self.runs.lock();
        runs.push_back(run);
        while runs.len() > MAX_RUNS_RETAINED {
            runs.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u32) -> TokenAddress {
        TokenAddress::new(format!("0x{n:040x}")).unwrap()
    }

    #[test]
    fn processed_set_tracks_membership() {
        let mut set = ProcessedSet::new();
        let a = addr(1);
        assert!(!set.contains(&a));
        set.mark(a.clone());
        assert!(set.contains(&a));
    }

    #[test]
    fn processed_set_sweep_is_noop_before_horizon() {
        let mut set = ProcessedSet::new();
        let a = addr(1);
        set.mark(a.clone());
        set.sweep();
        assert!(set.contains(&a));
    }

    #[test]
    fn processed_set_mark_is_idempotent() {
        let mut set = ProcessedSet::new();
        let a = addr(1);
        set.mark(a.clone());
        set.mark(a.clone());
        assert_eq!(set.order.len(), 1);
    }
}
