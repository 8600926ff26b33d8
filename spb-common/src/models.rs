//! Canonical data model shared by ingestion, analysis and search
//!
//! Enrichment attributes are plain `Option`/empty-set fields: an item that has
//! not been analyzed yet is a complete, queryable record.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Topic taxonomy used for impact classification
pub const TOPICS: &[&str] = &[
    "housing",
    "zoning",
    "taxes",
    "budget",
    "transportation",
    "parks",
    "environment",
    "public_safety",
    "infrastructure",
    "development",
    "permits",
    "other",
];

/// Fallback topic for anything outside [`TOPICS`]
pub const OTHER_TOPIC: &str = "other";

/// Meeting lifecycle as reported by the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    Scheduled,
    Final,
}

impl MeetingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeetingStatus::Scheduled => "scheduled",
            MeetingStatus::Final => "final",
        }
    }
}

impl fmt::Display for MeetingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeetingStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(MeetingStatus::Scheduled),
            "final" => Ok(MeetingStatus::Final),
            other => Err(Error::InvalidInput(format!("Unknown meeting status: {}", other))),
        }
    }
}

/// AI-assessed civic impact of an agenda item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    High,
    Medium,
    Low,
}

impl ImpactLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImpactLevel::High => "high",
            ImpactLevel::Medium => "medium",
            ImpactLevel::Low => "low",
        }
    }
}

impl fmt::Display for ImpactLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImpactLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(ImpactLevel::High),
            "medium" => Ok(ImpactLevel::Medium),
            "low" => Ok(ImpactLevel::Low),
            other => Err(Error::InvalidInput(format!("Unknown impact level: {}", other))),
        }
    }
}

/// Kind of document attached to a meeting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Agenda,
    Minutes,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Agenda => "agenda",
            DocumentType::Minutes => "minutes",
        }
    }
}

impl FromStr for DocumentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agenda" => Ok(DocumentType::Agenda),
            "minutes" => Ok(DocumentType::Minutes),
            other => Err(Error::InvalidInput(format!("Unknown document type: {}", other))),
        }
    }
}

/// A meeting of a legislative body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meeting {
    pub meeting_id: String,
    pub body_name: String,
    pub meeting_date: NaiveDate,
    pub meeting_time: Option<String>,
    pub location: Option<String>,
    pub status: MeetingStatus,
    pub agenda_url: Option<String>,
    pub source_event_id: Option<i64>,
    /// `None` for placeholder rows created ahead of the source meeting record
    pub content_hash: Option<String>,
    pub ai_summary: Option<String>,
    pub topics: BTreeSet<String>,
}

impl Meeting {
    /// Minimal row that satisfies item foreign keys until the real meeting lands
    pub fn placeholder(meeting_id: String, body_name: String, meeting_date: NaiveDate) -> Self {
        Self {
            meeting_id,
            body_name,
            meeting_date,
            meeting_time: None,
            location: None,
            status: MeetingStatus::Scheduled,
            agenda_url: None,
            source_event_id: None,
            content_hash: None,
            ai_summary: None,
            topics: BTreeSet::new(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.content_hash.is_none()
    }
}

/// A single agenda item within a meeting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgendaItem {
    pub item_id: String,
    pub meeting_id: String,
    pub ordinal: i64,
    pub title: String,
    pub description: Option<String>,
    pub content_hash: String,

    // Enrichment (absent until analyzed)
    pub topic: Option<String>,
    pub impact_level: Option<ImpactLevel>,
    pub relevance: Option<f64>,
    pub ai_analysis: Option<String>,
    pub topics: BTreeSet<String>,
    pub analysis_version: i64,
    pub last_analyzed_hash: Option<String>,
}

impl AgendaItem {
    /// Freshly ingested, not yet enriched item
    pub fn new(
        item_id: String,
        meeting_id: String,
        ordinal: i64,
        title: String,
        description: Option<String>,
        content_hash: String,
    ) -> Self {
        Self {
            item_id,
            meeting_id,
            ordinal,
            title,
            description,
            content_hash,
            topic: None,
            impact_level: None,
            relevance: None,
            ai_analysis: None,
            topics: BTreeSet::new(),
            analysis_version: 0,
            last_analyzed_hash: None,
        }
    }

    /// True when the stored enrichment was produced from the current content
    pub fn is_enrichment_current(&self) -> bool {
        self.last_analyzed_hash.as_deref() == Some(self.content_hash.as_str())
    }
}

/// A document attached to a meeting (agenda packet, minutes)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub meeting_id: String,
    pub title: String,
    pub url: String,
    pub doc_type: DocumentType,
}

/// Enrichment fields written by the Analyzer in one conditional update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemEnrichment {
    pub summary: String,
    pub impact_level: ImpactLevel,
    pub relevance: f64,
    pub primary_topic: String,
    pub topics: BTreeSet<String>,
}

/// Map a free-form topic label onto the taxonomy
pub fn canonical_topic(raw: &str) -> &'static str {
    let normalized = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");
    TOPICS
        .iter()
        .find(|t| **t == normalized)
        .copied()
        .unwrap_or(OTHER_TOPIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_topic_maps_variants() {
        assert_eq!(canonical_topic("Housing"), "housing");
        assert_eq!(canonical_topic("public safety"), "public_safety");
        assert_eq!(canonical_topic("Public-Safety"), "public_safety");
        assert_eq!(canonical_topic("fireworks"), "other");
    }

    #[test]
    fn test_status_round_trips_through_str() {
        assert_eq!("final".parse::<MeetingStatus>().unwrap(), MeetingStatus::Final);
        assert!("cancelled".parse::<MeetingStatus>().is_err());
        assert_eq!(" High ".parse::<ImpactLevel>().unwrap(), ImpactLevel::High);
    }

    #[test]
    fn test_pre_enrichment_item_is_valid() {
        let item = AgendaItem::new(
            "itm_1".to_string(),
            "mtg_1".to_string(),
            1,
            "Road Repair".to_string(),
            None,
            "h1".to_string(),
        );
        assert_eq!(item.analysis_version, 0);
        assert!(item.topics.is_empty());
        assert!(!item.is_enrichment_current());
    }
}
