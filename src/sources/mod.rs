//! C3 — typed HTTP clients for the four external data sources. Each client
//! wraps its calls through the shared `RateLimiter` under its own source
//! key, consults the shared `TtlCache`, and never propagates a transport
//! error out of `analyze` — on exhausted retries it degrades to a
//! `filtered=true` report with `filterReason="source unavailable"`.

pub mod chain;
pub mod market;
pub mod router;
pub mod security;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::domain::{
    ChainReport, FilterCriteria, MarketSnapshot, RouterReport, SecurityReport, SourceHealth,
    TokenAddress,
};
use crate::error::StageError;

#[async_trait]
pub trait MarketClient: Send + Sync {
    /// Recently-launched/trending tokens, capped at `limit`.
    async fn trending(&self, limit: usize, deadline: Instant) -> Vec<TokenAddress>;
    async fn analyze(
        &self,
        address: &TokenAddress,
        criteria: &FilterCriteria,
        deadline: Instant,
    ) -> MarketSnapshot;
    async fn health(&self) -> SourceHealth;
}

#[async_trait]
pub trait SecurityClient: Send + Sync {
    async fn analyze(
        &self,
        address: &TokenAddress,
        criteria: &FilterCriteria,
        deadline: Instant,
    ) -> SecurityReport;
    async fn health(&self) -> SourceHealth;
}

#[async_trait]
pub trait RouterClient: Send + Sync {
    async fn analyze(
        &self,
        address: &TokenAddress,
        criteria: &FilterCriteria,
        deadline: Instant,
    ) -> RouterReport;
    async fn health(&self) -> SourceHealth;
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn analyze(
        &self,
        address: &TokenAddress,
        criteria: &FilterCriteria,
        deadline: Instant,
    ) -> ChainReport;
    async fn health(&self) -> SourceHealth;
}

/// Shared reqwest client builder: one tuned `reqwest::Client` per external
/// API (connection pooling, keepalive, a fixed request timeout as a
/// backstop behind the per-call deadline).
pub fn build_http_client(request_timeout: std::time::Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(request_timeout)
        .pool_max_idle_per_host(10)
        .tcp_keepalive(std::time::Duration::from_secs(60))
        .build()
        .expect("static reqwest client configuration is always valid")
}

/// Classifies a non-2xx HTTP response into the right `StageError`: a 429
/// honors its `Retry-After` header (seconds form), a 5xx is treated as a
/// transient outage, and any other 4xx is a non-retryable rejection.
pub fn classify_failed_response(resp: &reqwest::Response) -> StageError {
    let status = resp.status();
    if status.as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(std::time::Duration::from_secs);
        StageError::RateLimited(retry_after)
    } else if status.is_server_error() {
        StageError::Unavailable
    } else {
        StageError::Rejected(status.as_u16())
    }
}

/// Reusable helper: time the health probe against an arbitrary async
/// check, matching the shape `{healthy, latencyMs, endpoint}` from spec.
pub async fn timed_health<F, Fut>(source: &'static str, endpoint: &str, check: F) -> SourceHealth
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    let healthy = check().await;
    SourceHealth {
        source,
        healthy,
        latency_ms: start.elapsed().as_millis() as u64,
        endpoint: endpoint.to_string(),
    }
}
