//! Core data model: token identity, filter criteria, per-stage reports, and
//! the fused analysis that the pipeline produces for a single token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque token identity. Always canonicalized to lowercase at every
/// component boundary so comparisons are case-insensitive without the
/// caller having to think about it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenAddress(String);

impl TokenAddress {
    /// Builds a canonical address. Returns `None` for an empty string —
    /// callers at the API boundary should treat that as a contract
    /// violation from the upstream source, not a valid address.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Recognized filter options. Every field is optional; a missing field
/// means "no constraint" for that dimension. Constructed once from
/// `AppConfig` defaults and treated as immutable thereafter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterCriteria {
    pub min_age_hours: Option<f64>,
    pub max_age_hours: Option<f64>,
    pub min_liquidity: Option<f64>,
    pub min_volume: Option<f64>,
    pub min_safety_score: Option<f64>,
    pub allow_honeypot: bool,
    pub require_routing: Option<bool>,
    pub max_slippage: Option<f64>,
    pub allow_blacklisted: bool,
    pub max_creator_rugs: Option<u32>,
    pub max_top_holders_percentage: Option<f64>,
}

impl FilterCriteria {
    /// The engine's baked-in defaults, used when the caller supplies none.
    pub fn defaults() -> Self {
        Self {
            min_age_hours: Some(1.0),
            max_age_hours: Some(24.0 * 7.0),
            min_liquidity: Some(5_000.0),
            min_volume: Some(1_000.0),
            min_safety_score: Some(6.0),
            allow_honeypot: false,
            require_routing: None,
            max_slippage: Some(10.0),
            allow_blacklisted: false,
            max_creator_rugs: Some(1),
            max_top_holders_percentage: Some(60.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub address: TokenAddress,
    pub symbol: String,
    pub name: String,
    pub launch_timestamp: DateTime<Utc>,
    pub price: f64,
    pub market_cap: f64,
    pub volume_24h: f64,
    pub liquidity: f64,
    pub age_hours: f64,
    pub filtered: bool,
    pub filter_reason: Option<String>,
}

impl MarketSnapshot {
    /// A well-formed sentinel for a stage skipped by short-circuit.
    pub fn skipped(address: &TokenAddress, reason: impl Into<String>) -> Self {
        Self {
            address: address.clone(),
            symbol: String::new(),
            name: String::new(),
            launch_timestamp: Utc::now(),
            price: 0.0,
            market_cap: 0.0,
            volume_24h: 0.0,
            liquidity: 0.0,
            age_hours: 0.0,
            filtered: true,
            filter_reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityReport {
    pub address: TokenAddress,
    pub honeypot_risk: bool,
    pub mint_authority: bool,
    pub freeze_authority: bool,
    pub liquidity_locked: bool,
    pub holder_concentration: f64,
    pub safety_score: f64,
    pub risks: Vec<String>,
    pub warnings: Vec<String>,
    pub filtered: bool,
    pub filter_reason: Option<String>,
}

impl SecurityReport {
    pub fn skipped(address: &TokenAddress, reason: impl Into<String>) -> Self {
        Self {
            address: address.clone(),
            honeypot_risk: false,
            mint_authority: false,
            freeze_authority: false,
            liquidity_locked: false,
            holder_concentration: 0.0,
            safety_score: 0.0,
            risks: Vec::new(),
            warnings: Vec::new(),
            filtered: true,
            filter_reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterReport {
    pub address: TokenAddress,
    pub routing_available: bool,
    pub slippage_estimate: f64,
    pub spread: f64,
    pub volume_24h: f64,
    pub blacklisted: bool,
    pub route_count: u32,
    pub filtered: bool,
    pub filter_reason: Option<String>,
}

impl RouterReport {
    pub fn skipped(address: &TokenAddress, reason: impl Into<String>) -> Self {
        Self {
            address: address.clone(),
            routing_available: false,
            slippage_estimate: 0.0,
            spread: 0.0,
            volume_24h: 0.0,
            blacklisted: false,
            route_count: 0,
            filtered: true,
            filter_reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingPattern {
    Organic,
    Suspicious,
    Coordinated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatorInfo {
    pub created_tokens: u32,
    pub rugged_tokens: u32,
    pub successful_tokens: u32,
    pub success_rate: f64,
    pub first_token_date: Option<DateTime<Utc>>,
    pub average_holding: f64,
}

impl Default for CreatorInfo {
    fn default() -> Self {
        Self {
            created_tokens: 0,
            rugged_tokens: 0,
            successful_tokens: 0,
            success_rate: 0.0,
            first_token_date: None,
            average_holding: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolderBalance {
    pub address: String,
    pub balance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainReport {
    pub address: TokenAddress,
    pub creator_wallet: String,
    pub creator_info: CreatorInfo,
    pub top_holders: Vec<HolderBalance>,
    pub top_holders_percentage: f64,
    pub funding_pattern: FundingPattern,
    pub filtered: bool,
    pub filter_reason: Option<String>,
}

impl ChainReport {
    pub fn skipped(address: &TokenAddress, reason: impl Into<String>) -> Self {
        Self {
            address: address.clone(),
            creator_wallet: String::new(),
            creator_info: CreatorInfo::default(),
            top_holders: Vec::new(),
            top_holders_percentage: 0.0,
            funding_pattern: FundingPattern::Organic,
            filtered: true,
            filter_reason: Some(reason.into()),
        }
    }
}

/// The fused result of running one token through all four stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedAnalysis {
    pub address: TokenAddress,
    pub market: MarketSnapshot,
    pub security: SecurityReport,
    pub router: RouterReport,
    pub chain: ChainReport,
    pub overall_score: f64,
    pub passed: bool,
    pub failed_filters: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl CombinedAnalysis {
    /// Invariant check used by tests and defensively by the aggregator:
    /// `passed` must exactly track "no stage filtered".
    pub fn invariant_holds(&self) -> bool {
        let none_filtered = !self.market.filtered
            && !self.security.filtered
            && !self.router.filtered
            && !self.chain.filtered;
        self.passed == none_filtered
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: uuid::Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub discovered: usize,
    pub processed: usize,
    pub passed: usize,
    pub errors: Vec<String>,
    pub status: RunStatus,
}

impl Run {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            start_time: Utc::now(),
            end_time: None,
            discovered: 0,
            processed: 0,
            passed: 0,
            errors: Vec::new(),
            status: RunStatus::Running,
        }
    }
}

impl Default for Run {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthClassification {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct SourceHealth {
    pub source: &'static str,
    pub healthy: bool,
    pub latency_ms: u64,
    pub endpoint: String,
}

#[derive(Debug, Clone)]
pub struct SystemHealthReport {
    pub sources: Vec<SourceHealth>,
    pub classification: HealthClassification,
    pub checked_at: DateTime<Utc>,
}

impl SystemHealthReport {
    pub fn classify(sources: Vec<SourceHealth>) -> Self {
        let total = sources.len().max(1) as f64;
        let up = sources.iter().filter(|s| s.healthy).count() as f64;
        let ratio = up / total;
        let classification = if ratio >= 0.8 {
            HealthClassification::Healthy
        } else if ratio >= 0.5 {
            HealthClassification::Degraded
        } else {
            HealthClassification::Unhealthy
        };
        Self {
            sources,
            classification,
            checked_at: Utc::now(),
        }
    }
}
