//! Legistar Web API client
//!
//! Pull-style, read-only access to a Legistar tenant
//! (`https://webapi.legistar.com/v1/{client}`). Pages through events in
//! `(EventDate, EventId)` order using OData keyset filters, so a resumed
//! ingest never skips or re-reads a page boundary.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use spb_common::config::SourceConfig;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

use super::normalizer::EventPosition;

const USER_AGENT: &str = concat!("spb-engine/", env!("CARGO_PKG_VERSION"));

/// Error bodies are truncated to this many characters in errors and logs
const MAX_ERROR_BODY: usize = 300;

/// External source fetch failure
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Source returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl SourceError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Network(_) | SourceError::Timeout => true,
            SourceError::Http { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            SourceError::Parse(_) => false,
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SourceError::Timeout
        } else if e.is_decode() {
            SourceError::Parse(e.to_string())
        } else {
            SourceError::Network(e.to_string())
        }
    }
}

/// Paginated meeting source
///
/// Records are returned raw so that one malformed record can be skipped by
/// the caller without failing the page.
#[async_trait]
pub trait MeetingSource: Send + Sync {
    /// Stable name used to key the persisted ingest cursor
    fn source_name(&self) -> &str;

    /// Up to `limit` events on/after `window_start`, strictly after `after`
    /// when given, ordered by `(EventDate, EventId)`
    async fn fetch_events(
        &self,
        window_start: NaiveDate,
        after: Option<EventPosition>,
        limit: u32,
    ) -> Result<Vec<Value>, SourceError>;

    /// Agenda items of one event
    async fn fetch_event_items(&self, event_id: i64) -> Result<Vec<Value>, SourceError>;
}

/// OData `$filter` for one page
pub fn events_filter(window_start: NaiveDate, after: Option<EventPosition>) -> String {
    match after {
        Some(position) => {
            let date = position.date.format("%Y-%m-%d");
            format!(
                "EventDate gt datetime'{date}' or (EventDate eq datetime'{date}' and EventId gt {id})",
                date = date,
                id = position.event_id
            )
        }
        None => format!("EventDate ge datetime'{}'", window_start.format("%Y-%m-%d")),
    }
}

fn truncate(mut body: String) -> String {
    if let Some((index, _)) = body.char_indices().nth(MAX_ERROR_BODY) {
        body.truncate(index);
    }
    body
}

/// Rate-limited Legistar client
pub struct LegistarClient {
    http: reqwest::Client,
    base_url: String,
    client_name: String,
    rate_limiter: governor::RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl LegistarClient {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SourceError::Network(e.to_string()))?;

        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = governor::RateLimiter::direct(governor::Quota::per_second(per_second));

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client_name: config.client.clone(),
            rate_limiter,
        })
    }

    fn tenant_url(&self) -> String {
        format!("{}/{}", self.base_url, self.client_name)
    }

    async fn get_list(&self, url: &str, query: &[(&str, String)]) -> Result<Vec<Value>, SourceError> {
        self.rate_limiter.until_ready().await;

        tracing::debug!(url, "Querying Legistar API");

        let response = self.http.get(url).query(query).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Http {
                status: status.as_u16(),
                body: truncate(body),
            });
        }

        response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| SourceError::Parse(e.to_string()))
    }
}

#[async_trait]
impl MeetingSource for LegistarClient {
    fn source_name(&self) -> &str {
        &self.client_name
    }

    async fn fetch_events(
        &self,
        window_start: NaiveDate,
        after: Option<EventPosition>,
        limit: u32,
    ) -> Result<Vec<Value>, SourceError> {
        let url = format!("{}/events", self.tenant_url());
        let query = [
            ("$filter", events_filter(window_start, after)),
            ("$orderby", "EventDate,EventId".to_string()),
            ("$top", limit.to_string()),
        ];

        let events = self.get_list(&url, &query).await?;
        tracing::debug!(count = events.len(), "Fetched Legistar events");
        Ok(events)
    }

    async fn fetch_event_items(&self, event_id: i64) -> Result<Vec<Value>, SourceError> {
        let url = format!("{}/events/{}/eventitems", self.tenant_url(), event_id);
        let query = [("AgendaNote", "1".to_string()), ("MinutesNote", "1".to_string())];
        self.get_list(&url, &query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_window_filter_without_cursor() {
        assert_eq!(
            events_filter(date("2024-02-01"), None),
            "EventDate ge datetime'2024-02-01'"
        );
    }

    #[test]
    fn test_keyset_filter_resumes_after_position() {
        let after = EventPosition {
            date: date("2024-03-01"),
            event_id: 1234,
        };
        assert_eq!(
            events_filter(date("2024-02-01"), Some(after)),
            "EventDate gt datetime'2024-03-01' or (EventDate eq datetime'2024-03-01' and EventId gt 1234)"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(SourceError::Timeout.is_retryable());
        assert!(SourceError::Network("reset".into()).is_retryable());
        assert!(SourceError::Http { status: 503, body: String::new() }.is_retryable());
        assert!(SourceError::Http { status: 429, body: String::new() }.is_retryable());
        assert!(!SourceError::Http { status: 404, body: String::new() }.is_retryable());
        assert!(!SourceError::Parse("eof".into()).is_retryable());
    }

    #[test]
    fn test_truncate_long_body() {
        let body = "x".repeat(1000);
        assert_eq!(truncate(body).len(), MAX_ERROR_BODY);
        assert_eq!(truncate("short".to_string()), "short");
    }

    #[test]
    fn test_client_uses_configured_tenant() {
        let config = SourceConfig {
            base_url: "https://legistar.test/v1/".to_string(),
            ..SourceConfig::default()
        };
        let client = LegistarClient::new(&config).unwrap();
        assert_eq!(client.source_name(), "spokane");
        assert_eq!(client.tenant_url(), "https://legistar.test/v1/spokane");
    }
}
