use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::TtlCache;
use crate::domain::{FilterCriteria, SecurityReport, SourceHealth, TokenAddress};
use crate::error::StageError;
use crate::ratelimit::RateLimiter;
use crate::sources::{build_http_client, classify_failed_response, timed_health, SecurityClient};

const SOURCE_KEY: &str = "security";
const TTL: Duration = Duration::from_secs(300);

/// Name/symbol substrings that knock a point off the safety score without
/// necessarily implying a honeypot — generic "too good to be true" marketing.
const SUSPICIOUS_PATTERNS: &[&str] = &["safemoon", "elonmusk", "1000x", "guaranteed", "airdrop"];

/// Name/symbol substrings that are themselves a honeypot tell.
const HONEYPOT_NAME_INDICATORS: &[&str] = &["honeypot", "rugpull", "scam", "ponzi"];

#[derive(Debug, Clone)]
struct RawSecurityData {
    symbol: String,
    name: String,
    mint_authority: bool,
    freeze_authority: bool,
    liquidity_locked: bool,
    holder_concentration: f64,
    holder_count: u64,
}

#[derive(Debug, Deserialize)]
struct SecurityDto {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "mintAuthority", default)]
    mint_authority: Option<bool>,
    #[serde(rename = "freezeAuthority", default)]
    freeze_authority: Option<bool>,
    #[serde(rename = "liquidityLocked", default)]
    liquidity_locked: Option<bool>,
    #[serde(rename = "holderConcentration", default)]
    holder_concentration: Option<f64>,
    #[serde(rename = "holderCount", default)]
    holder_count: Option<u64>,
}

pub struct SecurityApiClient {
    http: reqwest::Client,
    base_url: String,
    rate_limiter: Arc<RateLimiter>,
    cache: Arc<TtlCache<String, RawSecurityData>>,
}

impl SecurityApiClient {
    pub fn new(base_url: impl Into<String>, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            http: build_http_client(Duration::from_secs(10)),
            base_url: base_url.into(),
            rate_limiter,
            cache: TtlCache::new(2_000),
        }
    }

    async fn fetch_raw(
        &self,
        address: &TokenAddress,
        deadline: Instant,
    ) -> Result<RawSecurityData, StageError> {
        let url = format!("{}/tokens/{}/security", self.base_url, address.as_str());
        let http = self.http.clone();
        let dto = self
            .rate_limiter
            .execute(SOURCE_KEY, deadline, move || {
                let http = http.clone();
                let url = url.clone();
                async move {
                    let resp = http.get(&url).send().await.map_err(StageError::Transport)?;
                    if !resp.status().is_success() {
                        return Err(classify_failed_response(&resp));
                    }
                    resp.json::<SecurityDto>()
                        .await
                        .map_err(StageError::Transport)
                }
            })
            .await?;

        Ok(RawSecurityData {
            symbol: dto.symbol.unwrap_or_default(),
            name: dto.name.unwrap_or_default(),
            mint_authority: dto.mint_authority.unwrap_or(false),
            freeze_authority: dto.freeze_authority.unwrap_or(false),
            liquidity_locked: dto.liquidity_locked.unwrap_or(false),
            holder_concentration: dto.holder_concentration.unwrap_or(0.0),
            holder_count: dto.holder_count.unwrap_or(0),
        })
    }

    fn score(raw: &RawSecurityData) -> (f64, Vec<String>, Vec<String>) {
        let mut score = 10.0f64;
        let mut risks = Vec::new();
        let mut warnings = Vec::new();

        if raw.mint_authority {
            score -= 2.0;
            risks.push("mint authority retained".to_string());
        }
        if raw.freeze_authority {
            score -= 2.0;
            risks.push("freeze authority retained".to_string());
        }
        if raw.holder_concentration > 60.0 {
            score -= 3.0;
            risks.push(format!("high holder concentration: {:.1}%", raw.holder_concentration));
        } else if raw.holder_concentration > 40.0 {
            score -= 1.0;
            warnings.push(format!("elevated holder concentration: {:.1}%", raw.holder_concentration));
        }
        if !raw.liquidity_locked {
            score -= 3.0;
            risks.push("liquidity not locked".to_string());
        }

        let haystack = format!("{} {}", raw.symbol, raw.name).to_lowercase();
        if SUSPICIOUS_PATTERNS.iter().any(|p| haystack.contains(p)) {
            score -= 1.0;
            warnings.push("suspicious name/symbol pattern".to_string());
        }

        (score.max(0.0), risks, warnings)
    }

    fn honeypot_risk(raw: &RawSecurityData) -> bool {
        let haystack = format!("{} {}", raw.symbol, raw.name).to_lowercase();
        raw.holder_count < 5
            || raw.holder_concentration > 90.0
            || HONEYPOT_NAME_INDICATORS.iter().any(|p| haystack.contains(p))
    }

    fn apply_filter(
        address: &TokenAddress,
        raw: RawSecurityData,
        criteria: &FilterCriteria,
    ) -> SecurityReport {
        let (safety_score, risks, mut warnings) = Self::score(&raw);
        let honeypot_risk = Self::honeypot_risk(&raw);
        if honeypot_risk {
            warnings.push("honeypot heuristics triggered".to_string());
        }

        let mut reason = None;
        if let Some(min_score) = criteria.min_safety_score {
            if safety_score < min_score {
                reason = Some(format!(
                    "Safety score too low: {:.0} < {:.0}",
                    safety_score, min_score
                ));
            }
        }
        if reason.is_none() && honeypot_risk && !criteria.allow_honeypot {
            reason = Some("Honeypot risk detected".to_string());
        }

        SecurityReport {
            address: address.clone(),
            honeypot_risk,
            mint_authority: raw.mint_authority,
            freeze_authority: raw.freeze_authority,
            liquidity_locked: raw.liquidity_locked,
            holder_concentration: raw.holder_concentration,
            safety_score,
            risks,
            warnings,
            filtered: reason.is_some(),
            filter_reason: reason,
        }
    }
}

#[async_trait]
impl SecurityClient for SecurityApiClient {
    async fn analyze(
        &self,
        address: &TokenAddress,
        criteria: &FilterCriteria,
        deadline: Instant,
    ) -> SecurityReport {
        let cache_key = format!("{}:{}", SOURCE_KEY, address.as_str());
        let raw = if let Some(raw) = self.cache.get(&cache_key) {
            Ok(raw)
        } else {
            match self.fetch_raw(address, deadline).await {
                Ok(raw) => {
                    self.cache.set(cache_key, raw.clone(), TTL);
                    Ok(raw)
                }
                Err(err) => Err(err),
            }
        };

        match raw {
            Ok(raw) => Self::apply_filter(address, raw, criteria),
            Err(StageError::ContractMismatch(msg)) => {
                debug!(address = %address, error = %msg, "security contract mismatch");
                SecurityReport::skipped(address, "source unavailable")
            }
            Err(_) => SecurityReport::skipped(address, "source unavailable"),
        }
    }

    async fn health(&self) -> SourceHealth {
        let http = self.http.clone();
        let url = format!("{}/health", self.base_url);
        timed_health(SOURCE_KEY, &self.base_url, move || async move {
            http.get(&url)
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false)
        })
        .await
    }
}
