//! Polymarket market feed.
//!
//! Reads single-market state from the Gamma API (no auth required).
//!
//! Gamma API: https://gamma-api.polymarket.com

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::feed::{FeedError, MarketFeed};
use crate::types::MarketSnapshot;

pub const GAMMA_API_URL: &str = "https://gamma-api.polymarket.com";

// ---------------------------------------------------------------------------
// Gamma API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
#[allow(dead_code)]
pub struct GammaMarket {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default, rename = "endDate")]
    pub end_date: Option<String>,
    #[serde(default)]
    pub closed: bool,
    /// Outcome prices as JSON string: "[\"0.99\",\"0.01\"]"
    #[serde(default, rename = "outcomePrices")]
    pub outcome_prices: Option<String>,
    /// Winning outcome label once the market has settled ("Yes" / "No").
    #[serde(default)]
    pub resolution: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct PolymarketFeed {
    http: Client,
    base_url: String,
}

impl PolymarketFeed {
    pub fn new(base_url: Option<&str>, timeout: Duration) -> Result<Self, FeedError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FeedError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url
                .unwrap_or(GAMMA_API_URL)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    /// Convert a Gamma market into a feed snapshot. Fields that fail to
    /// parse are left empty rather than guessed.
    pub fn to_snapshot(external_id: &str, gm: &GammaMarket) -> MarketSnapshot {
        MarketSnapshot {
            external_id: gm.id.clone().unwrap_or_else(|| external_id.to_string()),
            question: gm.question.clone(),
            end_date: gm.end_date.as_deref().and_then(Self::parse_end_date),
            closed: gm.closed,
            outcome_label: gm
                .resolution
                .as_deref()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string),
            outcome_prices: gm
                .outcome_prices
                .as_deref()
                .and_then(Self::parse_outcome_prices),
        }
    }

    /// Parse outcome prices from Gamma's string format.
    /// Handles: "[\"0.99\",\"0.01\"]", "0.99, 0.01". Values must be finite
    /// and within [0, 1].
    pub fn parse_outcome_prices(s: &str) -> Option<(f64, f64)> {
        let cleaned = s.replace(['[', ']', '"', '\\'], "");
        let parts: Vec<&str> = cleaned.split(',').map(|p| p.trim()).collect();
        if parts.len() < 2 {
            return None;
        }
        let yes = parts[0].parse::<f64>().ok()?;
        let no = parts[1].parse::<f64>().ok()?;
        let valid = |p: f64| p.is_finite() && (0.0..=1.0).contains(&p);
        (valid(yes) && valid(no)).then_some((yes, no))
    }

    /// RFC 3339 timestamp or a bare date (taken as end of day UTC).
    pub fn parse_end_date(s: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|nd| nd.and_hms_opt(23, 59, 59))
                    .map(|ndt| ndt.and_utc())
            })
    }
}

// ---------------------------------------------------------------------------
// MarketFeed trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl MarketFeed for PolymarketFeed {
    async fn fetch_market(&self, external_id: &str) -> Result<MarketSnapshot, FeedError> {
        let url = format!("{}/markets/{external_id}", self.base_url);
        debug!(external_id, "Fetching Polymarket market from Gamma API");

        let resp = self.http.get(&url).send().await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FeedError::NotFound(external_id.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FeedError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp.text().await?;
        let gm: GammaMarket = serde_json::from_str(&body)
            .map_err(|e| FeedError::Parse(format!("Gamma market {external_id}: {e}")))?;

        Ok(Self::to_snapshot(external_id, &gm))
    }

    fn name(&self) -> &'static str {
        "polymarket"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
