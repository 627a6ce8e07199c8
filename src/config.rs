//! Process configuration: CLI flags layered over environment variables
//! layered over hard defaults, built once at startup and treated as
//! immutable thereafter.

use std::time::Duration;

use clap::Parser;

use crate::domain::FilterCriteria;
use crate::ratelimit::RateLimitConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "tokenwatch")]
#[command(about = "Token discovery and evaluation engine")]
pub struct AppConfig {
    /// Scheduler tick interval, in seconds.
    #[arg(long, env = "TICK_INTERVAL_SECS", default_value_t = 300)]
    pub tick_interval_secs: u64,

    /// Maximum number of freshly discovered tokens processed per run.
    #[arg(long, env = "MAX_TOKENS_PER_RUN", default_value_t = 50)]
    pub max_tokens_per_run: usize,

    /// Chunk size for `Pipeline::process_batch`.
    #[arg(long, env = "BATCH_SIZE", default_value_t = 10)]
    pub batch_size: usize,

    /// Concurrent in-flight pipelines per chunk.
    #[arg(long, env = "MAX_CONCURRENT", default_value_t = 5)]
    pub max_concurrent: usize,

    /// Per-token deadline for `Pipeline::process_one`, in milliseconds.
    #[arg(long, env = "TIMEOUT_MS", default_value_t = 15_000)]
    pub timeout_ms: u64,

    /// Maximum retry attempts per rate-limited call.
    #[arg(long, env = "RETRY_ATTEMPTS", default_value_t = 3)]
    pub retry_attempts: u32,

    /// Whether completed analyses are cached and replayed within their TTL.
    #[arg(long, env = "CACHE_RESULTS", default_value_t = true)]
    pub cache_results: bool,

    /// Health monitor probe interval, in seconds.
    #[arg(long, env = "HEALTH_INTERVAL_SECS", default_value_t = 60)]
    pub health_interval_secs: u64,

    /// Health monitor classification cache TTL, in seconds.
    #[arg(long, env = "HEALTH_CACHE_SECS", default_value_t = 30)]
    pub health_cache_secs: u64,

    /// Hub heartbeat ping interval, in seconds.
    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// Hub connection timeout (no pong/traffic), in seconds.
    #[arg(long, env = "CONNECTION_TIMEOUT_SECS", default_value_t = 60)]
    pub connection_timeout_secs: u64,

    /// Per-client outgoing buffer capacity before a subscriber is evicted.
    #[arg(long, env = "HUB_CLIENT_BUFFER", default_value_t = 256)]
    pub hub_client_buffer: usize,

    /// Sqlite database path for the persistence port.
    #[arg(long, env = "DATABASE_PATH", default_value = "./tokenwatch.db")]
    pub database_path: String,

    /// Bind address for the WebSocket upgrade endpoint.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    /// Base URL of the Market data source.
    #[arg(long, env = "MARKET_API_URL", default_value = "https://api.market.example/v1")]
    pub market_api_url: String,

    /// Base URL of the Security data source.
    #[arg(long, env = "SECURITY_API_URL", default_value = "https://api.security.example/v1")]
    pub security_api_url: String,

    /// Base URL of the Router data source.
    #[arg(long, env = "ROUTER_API_URL", default_value = "https://api.router.example/v1")]
    pub router_api_url: String,

    /// Base URL of the Chain data source.
    #[arg(long, env = "CHAIN_API_URL", default_value = "https://api.chain.example/v1")]
    pub chain_api_url: String,
}

impl AppConfig {
    /// Loads `.env` (if present) then parses CLI/env into a config.
    pub fn load() -> Self {
        dotenv::dotenv().ok();
        AppConfig::parse()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn health_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.health_cache_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn default_filter_criteria(&self) -> FilterCriteria {
        FilterCriteria::defaults()
    }

    /// Default rate-limit parameters, identical across sources unless a
    /// deployment overrides them per-source at construction time.
    pub fn default_rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_second: 5.0,
            burst: 10,
            min_interval: Duration::from_millis(50),
            base_delay: Duration::from_millis(250),
            retry_max: Duration::from_secs(10),
            max_retries: self.retry_attempts,
            backoff_floor_initial: Duration::from_millis(0),
            backoff_floor_max: Duration::from_secs(30),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        // `Parser::parse` reads `std::env::args`; tests want a config built
        // purely from defaults, so construct it from an empty arg list.
        AppConfig::parse_from(std::iter::empty::<String>())
    }
}
