use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::domain::{FilterCriteria, MarketSnapshot, SourceHealth, TokenAddress};
use crate::error::StageError;
use crate::ratelimit::RateLimiter;
use crate::sources::{build_http_client, classify_failed_response, timed_health, MarketClient};

const SOURCE_KEY: &str = "market";
const RAW_TTL: Duration = Duration::from_secs(60);
const TRENDING_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct RawMarketData {
    symbol: String,
    name: String,
    launch_timestamp: DateTime<Utc>,
    price: f64,
    market_cap: f64,
    volume_24h: f64,
    liquidity: f64,
}

#[derive(Debug, Deserialize)]
struct TrendingTokenDto {
    address: String,
}

#[derive(Debug, Deserialize)]
struct TrendingResponseDto {
    #[serde(default)]
    tokens: Vec<TrendingTokenDto>,
}

#[derive(Debug, Deserialize)]
struct MarketTokenDto {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "launchTimestamp")]
    launch_timestamp: Option<i64>,
    #[serde(default)]
    price: Option<f64>,
    #[serde(rename = "marketCap", default)]
    market_cap: Option<f64>,
    #[serde(rename = "volume24h", default)]
    volume_24h: Option<f64>,
    #[serde(default)]
    liquidity: Option<f64>,
}

pub struct MarketApiClient {
    http: reqwest::Client,
    base_url: String,
    rate_limiter: Arc<RateLimiter>,
    raw_cache: Arc<TtlCache<String, RawMarketData>>,
    trending_cache: Arc<TtlCache<String, Vec<TokenAddress>>>,
}

impl MarketApiClient {
    pub fn new(base_url: impl Into<String>, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            http: build_http_client(Duration::from_secs(10)),
            base_url: base_url.into(),
            rate_limiter,
            raw_cache: TtlCache::new(2_000),
            trending_cache: TtlCache::new(8),
        }
    }

    async fn fetch_trending_raw(&self, deadline: Instant) -> Result<Vec<TokenAddress>, StageError> {
        let url = format!("{}/trending", self.base_url);
        let http = self.http.clone();
        let resp = self
            .rate_limiter
            .execute(SOURCE_KEY, deadline, move || {
                let http = http.clone();
                let url = url.clone();
                async move {
                    let resp = http.get(&url).send().await.map_err(StageError::Transport)?;
                    if !resp.status().is_success() {
                        return Err(classify_failed_response(&resp));
                    }
                    resp.json::<TrendingResponseDto>()
                        .await
                        .map_err(StageError::Transport)
                }
            })
            .await?;

        Ok(resp
            .tokens
            .into_iter()
            .filter_map(|t| TokenAddress::new(t.address))
            .collect())
    }

    async fn fetch_raw(
        &self,
        address: &TokenAddress,
        deadline: Instant,
    ) -> Result<RawMarketData, StageError> {
        let url = format!("{}/tokens/{}", self.base_url, address.as_str());
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
                    resp.json::<MarketTokenDto>()
                        .await
                        .map_err(StageError::Transport)
                }
            })
            .await?;

        let launch_timestamp = dto
            .launch_timestamp
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
            .ok_or_else(|| StageError::ContractMismatch("missing launchTimestamp".into()))?;

        Ok(RawMarketData {
            symbol: dto.symbol.unwrap_or_default(),
            name: dto.name.unwrap_or_default(),
            launch_timestamp,
            price: dto.price.unwrap_or(0.0),
            market_cap: dto.market_cap.unwrap_or(0.0),
            volume_24h: dto.volume_24h.unwrap_or(0.0),
            liquidity: dto.liquidity.unwrap_or(0.0),
        })
    }

    fn apply_filter(address: &TokenAddress, raw: RawMarketData, criteria: &FilterCriteria) -> MarketSnapshot {
        let age_hours = (Utc::now() - raw.launch_timestamp).num_seconds() as f64 / 3600.0;

        let mut reason = None;
        if let Some(min_age) = criteria.min_age_hours {
            if age_hours < min_age {
                reason = Some(format!("Token too young: {:.2}h < {:.2}h", age_hours, min_age));
            }
        }
        if reason.is_none() {
            if let Some(max_age) = criteria.max_age_hours {
                if age_hours > max_age {
                    reason = Some(format!("Token too old: {:.2}h > {:.2}h", age_hours, max_age));
                }
            }
        }
        if reason.is_none() {
            if let Some(min_liq) = criteria.min_liquidity {
                if raw.liquidity < min_liq {
                    reason = Some(format!(
                        "Insufficient liquidity: {:.2} < {:.2}",
                        raw.liquidity, min_liq
                    ));
                }
            }
        }
        if reason.is_none() {
            if let Some(min_vol) = criteria.min_volume {
                if raw.volume_24h < min_vol {
                    reason = Some(format!(
                        "Insufficient volume: {:.2} < {:.2}",
                        raw.volume_24h, min_vol
                    ));
                }
            }
        }

        MarketSnapshot {
            address: address.clone(),
            symbol: raw.symbol,
            name: raw.name,
            launch_timestamp: raw.launch_timestamp,
            price: raw.price,
            market_cap: raw.market_cap,
            volume_24h: raw.volume_24h,
            liquidity: raw.liquidity,
            age_hours,
            filtered: reason.is_some(),
            filter_reason: reason,
        }
    }
}

#[async_trait]
impl MarketClient for MarketApiClient {
    async fn trending(&self, limit: usize, deadline: Instant) -> Vec<TokenAddress> {
        let cache_key = "trending".to_string();
        if let Some(cached) = self.trending_cache.get(&cache_key) {
            return cached.into_iter().take(limit).collect();
        }

        match self.fetch_trending_raw(deadline).await {
            Ok(addresses) => {
                self.trending_cache
                    .set(cache_key, addresses.clone(), TRENDING_TTL);
                addresses.into_iter().take(limit).collect()
            }
            Err(err) => {
                warn!(error = %err, "market trending fetch failed");
                Vec::new()
            }
        }
    }

    async fn analyze(
        &self,
        address: &TokenAddress,
        criteria: &FilterCriteria,
        deadline: Instant,
    ) -> MarketSnapshot {
        let cache_key = format!("{}:{}", SOURCE_KEY, address.as_str());

        let raw = if let Some(raw) = self.raw_cache.get(&cache_key) {
            Ok(raw)
        } else {
            match self.fetch_raw(address, deadline).await {
                Ok(raw) => {
                    self.raw_cache.set(cache_key, raw.clone(), RAW_TTL);
                    Ok(raw)
                }
                Err(err) => Err(err),
            }
        };

        match raw {
            Ok(raw) => Self::apply_filter(address, raw, criteria),
            Err(StageError::ContractMismatch(msg)) => {
                debug!(address = %address, error = %msg, "market contract mismatch");
                MarketSnapshot::skipped(address, "source unavailable")
            }
            Err(_) => MarketSnapshot::skipped(address, "source unavailable"),
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

#[cfg(test)]
mod tests {
    use super::*;

    fn criteria() -> FilterCriteria {
        FilterCriteria {
            min_age_hours: Some(1.0),
            max_age_hours: Some(168.0),
            min_liquidity: Some(10_000.0),
            min_volume: Some(5_000.0),
            ..Default::default()
        }
    }

    fn addr() -> TokenAddress {
        TokenAddress::new("0xABC").unwrap()
    }

    #[test]
    fn boundary_age_exactly_min_age_accepts() {
        let raw = RawMarketData {
            symbol: "T".into(),
            name: "Test".into(),
            launch_timestamp: Utc::now() - chrono::Duration::hours(1),
            price: 1.0,
            market_cap: 100_000.0,
            volume_24h: 20_000.0,
            liquidity: 25_000.0,
        };
        let snap = MarketApiClient::apply_filter(&addr(), raw, &criteria());
        assert!(!snap.filtered, "{:?}", snap.filter_reason);
    }

    #[test]
    fn age_past_max_is_rejected() {
        let raw = RawMarketData {
            symbol: "T".into(),
            name: "Test".into(),
            launch_timestamp: Utc::now() - chrono::Duration::hours(200),
            price: 1.0,
            market_cap: 100_000.0,
            volume_24h: 20_000.0,
            liquidity: 25_000.0,
        };
        let snap = MarketApiClient::apply_filter(&addr(), raw, &criteria());
        assert!(snap.filtered);
    }

    #[test]
    fn low_liquidity_is_rejected() {
        let raw = RawMarketData {
            symbol: "T".into(),
            name: "Test".into(),
            launch_timestamp: Utc::now() - chrono::Duration::hours(6),
            price: 1.0,
            market_cap: 100_000.0,
            volume_24h: 20_000.0,
            liquidity: 100.0,
        };
        let snap = MarketApiClient::apply_filter(&addr(), raw, &criteria());
        assert!(snap.filtered);
        assert!(snap.filter_reason.unwrap().contains("liquidity"));
    }
}
