use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::TtlCache;
use crate::domain::{FilterCriteria, RouterReport, SourceHealth, TokenAddress};
use crate::error::StageError;
use crate::ratelimit::RateLimiter;
use crate::sources::{build_http_client, classify_failed_response, timed_health, RouterClient};

const SOURCE_KEY: &str = "router";
const TTL: Duration = Duration::from_secs(120);

/// Reference notional (USD) used to probe a route. Fixed so that the same
/// token always gets a comparable quote regardless of when it's probed.
const REFERENCE_NOTIONAL_USD: f64 = 500.0;

#[derive(Debug, Clone)]
struct RawRouterData {
    routing_available: bool,
    price_impact_pct: f64,
    route_count: u32,
    blacklisted: bool,
    volume_24h: f64,
}

#[derive(Debug, Deserialize)]
struct RouteQuoteDto {
    #[serde(rename = "routingAvailable", default)]
    routing_available: Option<bool>,
    #[serde(rename = "priceImpactPct", default)]
    price_impact_pct: Option<f64>,
    #[serde(rename = "routeCount", default)]
    route_count: Option<u32>,
    #[serde(default)]
    blacklisted: Option<bool>,
    #[serde(rename = "volume24h", default)]
    volume_24h: Option<f64>,
}

pub struct RouterApiClient {
    http: reqwest::Client,
    base_url: String,
    rate_limiter: Arc<RateLimiter>,
    cache: Arc<TtlCache<String, RawRouterData>>,
}

impl RouterApiClient {
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
    ) -> Result<RawRouterData, StageError> {
        let url = format!("{}/quote", self.base_url);
        let http = self.http.clone();
        let address_str = address.as_str().to_string();
        let dto = self
            .rate_limiter
            .execute(SOURCE_KEY, deadline, move || {
                let http = http.clone();
                let url = url.clone();
                let address_str = address_str.clone();
                async move {
                    let resp = http
                        .get(&url)
                        .query(&[
                            ("outputMint", address_str.as_str()),
                            ("amountUsd", &REFERENCE_NOTIONAL_USD.to_string()),
                        ])
                        .send()
                        .await
                        .map_err(StageError::Transport)?;
                    if !resp.status().is_success() {
                        return Err(classify_failed_response(&resp));
                    }
                    resp.json::<RouteQuoteDto>()
                        .await
                        .map_err(StageError::Transport)
                }
            })
            .await?;

        Ok(RawRouterData {
            routing_available: dto.routing_available.unwrap_or(false),
            price_impact_pct: dto.price_impact_pct.unwrap_or(100.0),
            route_count: dto.route_count.unwrap_or(0),
            blacklisted: dto.blacklisted.unwrap_or(false),
            volume_24h: dto.volume_24h.unwrap_or(0.0),
        })
    }

    /// Spread is not returned directly by the quote API; it is derived
    /// deterministically from the quoted price impact (half of it, as a
    /// documented estimator — not a random synthesis) rather than dropped.
    fn estimate_spread(price_impact_pct: f64) -> f64 {
        price_impact_pct * 0.5
    }

    fn apply_filter(
        address: &TokenAddress,
        raw: RawRouterData,
        criteria: &FilterCriteria,
    ) -> RouterReport {
        let spread = Self::estimate_spread(raw.price_impact_pct);

        let mut reason = None;
        if criteria.require_routing == Some(true) && !raw.routing_available {
            reason = Some("No routing available".to_string());
        }
        if reason.is_none() {
            if let Some(max_slip) = criteria.max_slippage {
                if raw.price_impact_pct > max_slip {
                    reason = Some(format!(
                        "Slippage too high: {:.2}% > {:.2}%",
                        raw.price_impact_pct, max_slip
                    ));
                }
            }
        }
        if reason.is_none() && raw.blacklisted && !criteria.allow_blacklisted {
            reason = Some("Token is blacklisted by router".to_string());
        }

        RouterReport {
            address: address.clone(),
            routing_available: raw.routing_available,
            slippage_estimate: raw.price_impact_pct,
            spread,
            volume_24h: raw.volume_24h,
            blacklisted: raw.blacklisted,
            route_count: raw.route_count,
            filtered: reason.is_some(),
            filter_reason: reason,
        }
    }
}

#[async_trait]
impl RouterClient for RouterApiClient {
    async fn analyze(
        &self,
        address: &TokenAddress,
        criteria: &FilterCriteria,
        deadline: Instant,
    ) -> RouterReport {
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
                debug!(address = %address, error = %msg, "router contract mismatch");
                RouterReport::skipped(address, "source unavailable")
            }
            Err(_) => RouterReport::skipped(address, "source unavailable"),
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

    fn addr() -> TokenAddress {
        TokenAddress::new("0xabc").unwrap()
    }

    #[test]
    fn slippage_exactly_at_max_accepts() {
        let raw = RawRouterData {
            routing_available: true,
            price_impact_pct: 5.0,
            route_count: 2,
            blacklisted: false,
            volume_24h: 10_000.0,
        };
        let criteria = FilterCriteria {
            max_slippage: Some(5.0),
            ..Default::default()
        };
        let report = RouterApiClient::apply_filter(&addr(), raw, &criteria);
        assert!(!report.filtered);
    }

    #[test]
    fn require_routing_rejects_when_unavailable() {
        let raw = RawRouterData {
            routing_available: false,
            price_impact_pct: 1.0,
            route_count: 0,
            blacklisted: false,
            volume_24h: 0.0,
        };
        let criteria = FilterCriteria {
            require_routing: Some(true),
            ..Default::default()
        };
        let report = RouterApiClient::apply_filter(&addr(), raw, &criteria);
        assert!(report.filtered);
    }

    #[test]
    fn require_routing_absent_imposes_no_constraint() {
        let raw = RawRouterData {
            routing_available: false,
            price_impact_pct: 1.0,
            route_count: 0,
            blacklisted: false,
            volume_24h: 0.0,
        };
        let criteria = FilterCriteria {
            require_routing: None,
            max_slippage: Some(50.0),
            ..Default::default()
        };
        let report = RouterApiClient::apply_filter(&addr(), raw, &criteria);
        assert!(!report.filtered);
    }

    #[test]
    fn blacklisted_rejected_unless_allowed() {
        let raw = RawRouterData {
            routing_available: true,
            price_impact_pct: 1.0,
            route_count: 3,
            blacklisted: true,
            volume_24h: 1_000.0,
        };
        let criteria = FilterCriteria::default();
        let report = RouterApiClient::apply_filter(&addr(), raw.clone(), &criteria);
        assert!(report.filtered);

        let allow = FilterCriteria {
            allow_blacklisted: true,
            max_slippage: Some(100.0),
            ..Default::default()
        };
        let report2 = RouterApiClient::apply_filter(&addr(), raw, &allow);
        assert!(!report2.filtered);
    }
}
