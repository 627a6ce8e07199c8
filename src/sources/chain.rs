use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::TtlCache;
use crate::domain::{
    ChainReport, CreatorInfo, FilterCriteria, FundingPattern, HolderBalance, SourceHealth,
    TokenAddress,
};
use crate::error::StageError;
use crate::ratelimit::RateLimiter;
use crate::sources::{build_http_client, classify_failed_response, timed_health, ChainClient};

const SOURCE_KEY: &str = "chain";
const TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
struct RawChainData {
    creator_wallet: String,
    created_tokens: u32,
    rugged_tokens: u32,
    successful_tokens: u32,
    first_token_date: Option<DateTime<Utc>>,
    average_holding: f64,
    holders: Vec<HolderBalance>,
    funding_pattern: FundingPattern,
}

#[derive(Debug, Deserialize)]
struct HolderDto {
    address: String,
    balance: f64,
}

#[derive(Debug, Deserialize)]
struct CreatorInfoDto {
    #[serde(rename = "createdTokens", default)]
    created_tokens: Option<u32>,
    #[serde(rename = "ruggedTokens", default)]
    rugged_tokens: Option<u32>,
    #[serde(rename = "successfulTokens", default)]
    successful_tokens: Option<u32>,
    #[serde(rename = "firstTokenDate", default)]
    first_token_date: Option<i64>,
    #[serde(rename = "averageHolding", default)]
    average_holding: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ChainDto {
    #[serde(rename = "creatorWallet", default)]
    creator_wallet: Option<String>,
    #[serde(rename = "creatorInfo", default)]
    creator_info: Option<CreatorInfoDto>,
    #[serde(rename = "topHolders", default)]
    top_holders: Vec<HolderDto>,
    #[serde(rename = "fundingPattern", default)]
    funding_pattern: Option<String>,
}

pub struct ChainApiClient {
    http: reqwest::Client,
    base_url: String,
    rate_limiter: Arc<RateLimiter>,
    cache: Arc<TtlCache<String, RawChainData>>,
}

impl ChainApiClient {
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
    ) -> Result<RawChainData, StageError> {
        let url = format!("{}/tokens/{}/chain", self.base_url, address.as_str());
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
                    resp.json::<ChainDto>().await.map_err(StageError::Transport)
                }
            })
            .await?;

        let creator_info = dto.creator_info.unwrap_or(CreatorInfoDto {
            created_tokens: None,
            rugged_tokens: None,
            successful_tokens: None,
            first_token_date: None,
            average_holding: None,
        });

        let funding_pattern = match dto.funding_pattern.as_deref() {
            Some("suspicious") => FundingPattern::Suspicious,
            Some("coordinated") => FundingPattern::Coordinated,
            _ => FundingPattern::Organic,
        };

        Ok(RawChainData {
            creator_wallet: dto.creator_wallet.unwrap_or_default(),
            created_tokens: creator_info.created_tokens.unwrap_or(0),
            rugged_tokens: creator_info.rugged_tokens.unwrap_or(0),
            successful_tokens: creator_info.successful_tokens.unwrap_or(0),
            first_token_date: creator_info
                .first_token_date
                .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
            average_holding: creator_info.average_holding.unwrap_or(0.0),
            holders: dto
                .top_holders
                .into_iter()
                .map(|h| HolderBalance {
                    address: h.address,
                    balance: h.balance,
                })
                .collect(),
            funding_pattern,
        })
    }

    fn top_holders_percentage(holders: &[HolderBalance]) -> f64 {
        if holders.is_empty() {
            return 100.0;
        }
        let total: f64 = holders.iter().map(|h| h.balance).sum();
        if total <= 0.0 {
            return 100.0;
        }
        let mut sorted: Vec<f64> = holders.iter().map(|h| h.balance).collect();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        let top3: f64 = sorted.iter().take(3).sum();
        (top3 / total * 100.0).clamp(0.0, 100.0)
    }

    fn apply_filter(
        address: &TokenAddress,
        raw: RawChainData,
        criteria: &FilterCriteria,
    ) -> ChainReport {
        let success_rate = if raw.created_tokens > 0 {
            raw.successful_tokens as f64 / raw.created_tokens as f64
        } else {
            0.0
        };
        let top_holders_percentage = Self::top_holders_percentage(&raw.holders);

        let mut reason = None;
        if let Some(max_rugs) = criteria.max_creator_rugs {
            if raw.rugged_tokens > max_rugs {
                reason = Some(format!(
                    "Creator has too many rugged tokens: {} > {}",
                    raw.rugged_tokens, max_rugs
                ));
            }
        }
        if reason.is_none() {
            if let Some(max_pct) = criteria.max_top_holders_percentage {
                if top_holders_percentage > max_pct {
                    reason = Some(format!(
                        "Top holders control too much supply: {:.1}% > {:.1}%",
                        top_holders_percentage, max_pct
                    ));
                }
            }
        }

        ChainReport {
            address: address.clone(),
            creator_wallet: raw.creator_wallet,
            creator_info: CreatorInfo {
                created_tokens: raw.created_tokens,
                rugged_tokens: raw.rugged_tokens,
                successful_tokens: raw.successful_tokens,
                success_rate,
                first_token_date: raw.first_token_date,
                average_holding: raw.average_holding,
            },
            top_holders: raw.holders,
            top_holders_percentage,
            funding_pattern: raw.funding_pattern,
            filtered: reason.is_some(),
            filter_reason: reason,
        }
    }
}

#[async_trait]
impl ChainClient for ChainApiClient {
    async fn analyze(
        &self,
        address: &TokenAddress,
        criteria: &FilterCriteria,
        deadline: Instant,
    ) -> ChainReport {
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
                debug!(address = %address, error = %msg, "chain contract mismatch");
                ChainReport::skipped(address, "source unavailable")
            }
            Err(_) => ChainReport::skipped(address, "source unavailable"),
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
