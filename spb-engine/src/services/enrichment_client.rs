//! AI enrichment provider
//!
//! The provider is an untrusted, fallible remote call: every response is
//! parsed defensively and sanitized onto the topic taxonomy, and every
//! failure is classified as retryable or terminal for the Analyzer.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use spb_common::config::EnrichmentConfig;
use spb_common::models::{canonical_topic, ImpactLevel, ItemEnrichment, OTHER_TOPIC, TOPICS};
use std::collections::BTreeSet;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const USER_AGENT: &str = concat!("spb-engine/", env!("CARGO_PKG_VERSION"));
const MAX_DESCRIPTION_CHARS: usize = 8000;

/// Provider call failure
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider request timed out")]
    Timeout,

    #[error("Provider rate limit exceeded")]
    RateLimited,

    #[error("Provider unavailable (HTTP {0})")]
    Unavailable(u16),

    #[error("Provider authentication failed (HTTP {0})")]
    Unauthorized(u16),

    /// Wrong endpoint or model name; an operator fix, not a bad input
    #[error("Provider endpoint not found (HTTP {0})")]
    EndpointNotFound(u16),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),

    /// The provider refused this input; retrying the same request cannot help
    #[error("Provider rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Rejected { .. })
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            408 => ProviderError::Timeout,
            429 => ProviderError::RateLimited,
            401 | 403 => ProviderError::Unauthorized(status),
            404 => ProviderError::EndpointNotFound(status),
            500..=599 => ProviderError::Unavailable(status),
            _ => ProviderError::Rejected { status, message },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_decode() {
            ProviderError::MalformedResponse(e.to_string())
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

/// Context sent to the provider for one agenda item
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentRequest {
    pub item_id: String,
    pub title: String,
    pub description: Option<String>,
    pub body_name: String,
    pub meeting_date: NaiveDate,
}

/// Enrichment backend
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    async fn enrich(&self, request: &EnrichmentRequest) -> Result<ItemEnrichment, ProviderError>;
}

/// Response shape requested from the model
#[derive(Debug, Deserialize)]
struct RawEnrichment {
    summary: String,
    impact_level: String,
    relevance: f64,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    topic: Option<String>,
}

pub fn build_prompt(request: &EnrichmentRequest) -> String {
    let description = request
        .description
        .as_deref()
        .map(|d| d.chars().take(MAX_DESCRIPTION_CHARS).collect::<String>())
        .unwrap_or_else(|| "(none)".to_string());

    format!(
        r#"You are analyzing an agenda item from a {body} meeting on {date} for residents who want to stay informed.

Agenda item title: {title}
Agenda item details:
{description}

Respond with a single JSON object and nothing else:
{{
  "summary": "2-3 plain-language sentences on what this item does and why it matters to residents",
  "impact_level": "high" | "medium" | "low",
  "relevance": 1-5 (5 = highest public interest),
  "topic": "primary topic",
  "topics": ["all applicable topics"]
}}

Topics must be drawn from: {topics}"#,
        body = request.body_name,
        date = request.meeting_date.format("%Y-%m-%d"),
        title = request.title,
        description = description,
        topics = TOPICS.join(", "),
    )
}

/// Parse and sanitize the model's text output
///
/// Accepts a bare JSON object or one wrapped in prose (first `{` to last `}`).
pub fn parse_enrichment(text: &str) -> Result<ItemEnrichment, ProviderError> {
    let raw: RawEnrichment = match serde_json::from_str(text.trim()) {
        Ok(raw) => raw,
        Err(_) => {
            let start = text.find('{');
            let end = text.rfind('}');
            match (start, end) {
                (Some(start), Some(end)) if end > start => serde_json::from_str(&text[start..=end])
                    .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?,
                _ => {
                    return Err(ProviderError::MalformedResponse(
                        "no JSON object in response".to_string(),
                    ))
                }
            }
        }
    };

    let summary = raw.summary.trim().to_string();
    if summary.is_empty() {
        return Err(ProviderError::MalformedResponse("empty summary".to_string()));
    }

    let impact_level = raw
        .impact_level
        .parse::<ImpactLevel>()
        .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

    if !raw.relevance.is_finite() {
        return Err(ProviderError::MalformedResponse("non-numeric relevance".to_string()));
    }
    let relevance = raw.relevance.clamp(1.0, 5.0);

    let ordered: Vec<&'static str> = raw.topics.iter().map(|t| canonical_topic(t)).collect();
    let primary_topic = raw
        .topic
        .as_deref()
        .map(canonical_topic)
        .or_else(|| ordered.first().copied())
        .unwrap_or(OTHER_TOPIC)
        .to_string();

    let mut topics: BTreeSet<String> = ordered.into_iter().map(str::to_string).collect();
    topics.insert(primary_topic.clone());

    Ok(ItemEnrichment {
        summary,
        impact_level,
        relevance,
        primary_topic,
        topics,
    })
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Anthropic Messages API client
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    rate_limiter: governor::RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl AnthropicClient {
    pub fn new(config: &EnrichmentConfig, api_key: String) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            http,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            rate_limiter: governor::RateLimiter::direct(governor::Quota::per_second(per_second)),
        })
    }
}

#[async_trait]
impl EnrichmentProvider for AnthropicClient {
    async fn enrich(&self, request: &EnrichmentRequest) -> Result<ItemEnrichment, ProviderError> {
        self.rate_limiter.until_ready().await;

        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user",
                content: build_prompt(request),
            }],
        };

        tracing::debug!(item_id = %request.item_id, model = %self.model, "Requesting enrichment");

        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&text)
                .map(|b| b.error.message)
                .unwrap_or(text);
            return Err(ProviderError::from_status(status.as_u16(), message));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        let text: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        parse_enrichment(&text)
    }
}
