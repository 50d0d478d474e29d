//! HTTP funding-payment client backed by `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fundingsync_core::{FundingError, FundingPage, FundingRecord, FundingSource, YearMonth};

use crate::classify::{classify_decode, classify_rejection, classify_request, classify_status};
use crate::pacing::{PacingConfig, TokenBucket};

/// Configuration for [`HttpFundingSource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    /// Body fragments (case-insensitive) that signal rate limiting.
    pub rate_limit_markers: Vec<String>,
    pub pacing: PacingConfig,
    /// Continuation pages followed inside one monthly request before the
    /// month is given up on.
    pub max_month_pages: usize,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            request_timeout_ms: 15_000,
            rate_limit_markers: vec![
                "rate limit".into(),
                "too many requests".into(),
                "access denied".into(),
            ],
            pacing: PacingConfig::default(),
            max_month_pages: 100,
        }
    }
}

// ─── Wire format ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    records: Vec<FundingRecord>,
    #[serde(default)]
    meta: Option<Meta>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Meta {
    #[serde(default)]
    next_page: Option<serde_json::Value>,
}

impl Envelope {
    /// Continuation token as a string. Numeric tokens are accepted.
    fn next_page(&self) -> Option<String> {
        match self.meta.as_ref()?.next_page.as_ref()? {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

// ─── HttpFundingSource ────────────────────────────────────────────────────────

/// [`FundingSource`] over the REST API.
pub struct HttpFundingSource {
    base_url: String,
    http: reqwest::Client,
    pacer: TokenBucket,
    markers: Vec<String>,
    max_month_pages: usize,
}

impl HttpFundingSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self, FundingError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| FundingError::transport(format!("building HTTP client: {e}")))?;

        info!(base_url = %config.base_url, "http funding source ready");
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
            pacer: TokenBucket::new(config.pacing),
            markers: config.rate_limit_markers,
            max_month_pages: config.max_month_pages.max(1),
        })
    }

    /// Create with default configuration against `base_url`.
    pub fn default_for(base_url: impl Into<String>) -> Result<Self, FundingError> {
        Self::new(HttpSourceConfig {
            base_url: base_url.into(),
            ..HttpSourceConfig::default()
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn listing_url(&self, wallet: &str) -> String {
        format!("{}/user/{wallet}/fundingPayments", self.base_url)
    }

    fn month_url(&self, wallet: &str, month: YearMonth) -> String {
        format!(
            "{}/user/{wallet}/fundingPayments/{}/{}",
            self.base_url,
            month.year(),
            month.month()
        )
    }

    async fn get(&self, url: &str, page: Option<&str>) -> Result<Envelope, FundingError> {
        self.pacer.acquire().await;

        let mut request = self.http.get(url);
        if let Some(token) = page {
            request = request.query(&[("page", token)]);
        }
        let resp = request.send().await.map_err(|e| classify_request(&e))?;

        let status = resp.status().as_u16();
        let ok = resp.status().is_success();
        let body = resp.text().await.map_err(|e| classify_request(&e))?;

        if !ok {
            let err = classify_status(status, &body, &self.markers);
            warn!(url, status, error = %err, "funding request failed");
            return Err(err);
        }

        let envelope: Envelope =
            serde_json::from_str(&body).map_err(|e| classify_decode(&e, &body))?;
        if !envelope.success {
            let message = envelope.message.as_deref().unwrap_or("request rejected");
            let err = classify_rejection(status, message, &self.markers);
            warn!(url, error = %err, "funding request rejected");
            return Err(err);
        }
        Ok(envelope)
    }
}

#[async_trait]
impl FundingSource for HttpFundingSource {
    async fn fetch_page(&self, wallet: &str, page: Option<&str>) -> Result<FundingPage, FundingError> {
        let envelope = self.get(&self.listing_url(wallet), page).await?;
        let next_page = envelope.next_page();
        debug!(
            wallet,
            records = envelope.records.len(),
            more = next_page.is_some(),
            "funding page received"
        );
        Ok(FundingPage {
            records: envelope.records,
            next_page,
        })
    }

    async fn fetch_month(&self, wallet: &str, month: YearMonth) -> Result<Vec<FundingRecord>, FundingError> {
        let url = self.month_url(wallet, month);
        let mut records = Vec::new();
        let mut token: Option<String> = None;

        for _ in 0..self.max_month_pages {
            let envelope = self.get(&url, token.as_deref()).await?;
            token = envelope.next_page();
            records.extend(envelope.records);
            if token.is_none() {
                debug!(wallet, %month, records = records.len(), "funding month received");
                return Ok(records);
            }
        }

        // A truncated month must not be cached as complete.
        warn!(wallet, %month, pages = self.max_month_pages, "monthly listing did not terminate");
        Err(FundingError::Upstream {
            status: 200,
            message: format!(
                "monthly listing for {month} did not terminate after {} pages",
                self.max_month_pages
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_tokens() {
        let e: Envelope = serde_json::from_str(r#"{"success":true,"records":[],"meta":{"nextPage":"abc"}}"#).unwrap();
        assert_eq!(e.next_page().as_deref(), Some("abc"));

        let e: Envelope = serde_json::from_str(r#"{"success":true,"meta":{"nextPage":3}}"#).unwrap();
        assert_eq!(e.next_page().as_deref(), Some("3"));

        let e: Envelope = serde_json::from_str(r#"{"success":true,"meta":{"nextPage":null}}"#).unwrap();
        assert_eq!(e.next_page(), None);

        let e: Envelope = serde_json::from_str(r#"{"success":true,"meta":{"nextPage":""}}"#).unwrap();
        assert_eq!(e.next_page(), None);

        let e: Envelope = serde_json::from_str(r#"{"success":false,"message":"nope"}"#).unwrap();
        assert!(!e.success);
        assert!(e.records.is_empty());
    }

    #[test]
    fn urls_are_built_from_trimmed_base() {
        let source = HttpFundingSource::default_for("https://api.example.com/").unwrap();
        assert_eq!(source.base_url(), "https://api.example.com");
        assert_eq!(
            source.listing_url("0xabc"),
            "https://api.example.com/user/0xabc/fundingPayments"
        );
        assert_eq!(
            source.month_url("0xabc", YearMonth::new(2024, 3).unwrap()),
            "https://api.example.com/user/0xabc/fundingPayments/2024/3"
        );
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let cfg: HttpSourceConfig =
            serde_json::from_str(r#"{"base_url":"http://x","pacing":{"capacity":2.0}}"#).unwrap();
        assert_eq!(cfg.base_url, "http://x");
        assert_eq!(cfg.request_timeout_ms, 15_000);
        assert_eq!(cfg.pacing.capacity, 2.0);
        assert_eq!(cfg.pacing.refill_rate, 5.0);
        assert!(!cfg.rate_limit_markers.is_empty());
    }
}
