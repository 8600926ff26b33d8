//! Legistar record normalization
//!
//! Turns raw Legistar JSON (events and event items) into canonical
//! [`Meeting`], [`AgendaItem`] and [`Document`] values with derived ids and
//! content hashes. Works one record at a time so a malformed record can be
//! skipped without losing the rest of the page.

use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;
use spb_common::identity::{content_hash, document_id, item_id, meeting_id};
use spb_common::models::{AgendaItem, Document, DocumentType, Meeting, MeetingStatus};
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;

/// Per-record normalization failure; the record is skipped, the batch continues
#[derive(Debug, Error)]
pub enum NormalizationError {
    #[error("Malformed record: {0}")]
    Malformed(String),

    #[error("Missing required field {0}")]
    MissingField(&'static str),

    #[error("Invalid date '{0}'")]
    InvalidDate(String),

    #[error("Duplicate agenda ordinal {0}")]
    DuplicateOrdinal(i64),
}

/// Legistar `Event` as served by `/events`
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "EventId")]
    pub event_id: Option<i64>,
    #[serde(rename = "EventBodyName")]
    pub body_name: Option<String>,
    #[serde(rename = "EventDate")]
    pub date: Option<String>,
    #[serde(rename = "EventTime")]
    pub time: Option<String>,
    #[serde(rename = "EventLocation")]
    pub location: Option<String>,
    #[serde(rename = "EventAgendaFile")]
    pub agenda_file: Option<String>,
    #[serde(rename = "EventMinutesFile")]
    pub minutes_file: Option<String>,
    #[serde(rename = "EventAgendaStatusName")]
    pub agenda_status: Option<String>,
    #[serde(rename = "EventMinutesStatusName")]
    pub minutes_status: Option<String>,
    #[serde(rename = "EventInSiteURL")]
    pub insite_url: Option<String>,
}

/// Legistar `EventItem` as served by `/events/{id}/eventitems`
#[derive(Debug, Clone, Deserialize)]
pub struct RawEventItem {
    #[serde(rename = "EventItemId")]
    pub item_id: Option<i64>,
    #[serde(rename = "EventItemTitle")]
    pub title: Option<String>,
    #[serde(rename = "EventItemAgendaSequence")]
    pub agenda_sequence: Option<i64>,
    #[serde(rename = "EventItemAgendaNote")]
    pub agenda_note: Option<String>,
    #[serde(rename = "EventItemActionName")]
    pub action_name: Option<String>,
    #[serde(rename = "EventItemMatterName")]
    pub matter_name: Option<String>,
    #[serde(rename = "EventItemMatterType")]
    pub matter_type: Option<String>,
    #[serde(rename = "EventItemMatterFile")]
    pub matter_file: Option<String>,
}

/// Position of an event in the source's `(EventDate, EventId)` ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventPosition {
    pub date: NaiveDate,
    pub event_id: i64,
}

/// One normalized source event
#[derive(Debug, Clone)]
pub struct NormalizedMeeting {
    pub meeting: Meeting,
    pub documents: Vec<Document>,
}

/// Items of one event, with the per-record skips counted
#[derive(Debug, Clone, Default)]
pub struct NormalizedItems {
    pub items: Vec<AgendaItem>,
    /// Title-less procedural rows (section headers, spacers)
    pub skipped_blank: usize,
    pub malformed: usize,
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Parse `YYYY-MM-DD` or `YYYY-MM-DDTHH:MM:SS` (Legistar's form)
pub fn parse_source_date(value: &str) -> Result<NaiveDate, NormalizationError> {
    let value = value.trim();
    let (day, rest) = match (value.get(..10), value.get(10..)) {
        (Some(day), Some(rest)) => (day, rest),
        _ => (value, ""),
    };
    if !(rest.is_empty() || rest.starts_with('T')) {
        return Err(NormalizationError::InvalidDate(value.to_string()));
    }
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|_| NormalizationError::InvalidDate(value.to_string()))
}

/// Keyset position of a raw event, if it carries a usable id and date
///
/// Read independently of full normalization so the cursor can move past a
/// record that is otherwise malformed.
pub fn event_position(raw: &Value) -> Option<EventPosition> {
    let event_id = raw.get("EventId")?.as_i64()?;
    let date = parse_source_date(raw.get("EventDate")?.as_str()?).ok()?;
    Some(EventPosition { date, event_id })
}

pub fn parse_event(raw: &Value) -> Result<RawEvent, NormalizationError> {
    RawEvent::deserialize(raw).map_err(|e| NormalizationError::Malformed(e.to_string()))
}

/// Normalize one event; `today` decides whether "Final" minutes mean a final meeting
pub fn normalize_meeting(raw: &RawEvent, today: NaiveDate) -> Result<NormalizedMeeting, NormalizationError> {
    let event_id = raw.event_id.ok_or(NormalizationError::MissingField("EventId"))?;
    let body_name =
        non_blank(raw.body_name.as_deref()).ok_or(NormalizationError::MissingField("EventBodyName"))?;
    let date_text = raw.date.as_deref().ok_or(NormalizationError::MissingField("EventDate"))?;
    let meeting_date = parse_source_date(date_text)?;

    let is_final_status = |status: Option<&str>| {
        status.map(|s| s.trim().eq_ignore_ascii_case("final")).unwrap_or(false)
    };
    let status = if meeting_date < today
        && (is_final_status(raw.minutes_status.as_deref()) || is_final_status(raw.agenda_status.as_deref()))
    {
        MeetingStatus::Final
    } else {
        MeetingStatus::Scheduled
    };

    let meeting_time = non_blank(raw.time.as_deref());
    let location = non_blank(raw.location.as_deref());
    let agenda_file = non_blank(raw.agenda_file.as_deref());
    let minutes_file = non_blank(raw.minutes_file.as_deref());
    let agenda_url = agenda_file.clone().or_else(|| non_blank(raw.insite_url.as_deref()));

    let id = meeting_id(&body_name, meeting_date, event_id);
    let date_key = meeting_date.format("%Y-%m-%d").to_string();
    let hash = content_hash(&[
        Some(body_name.as_str()),
        Some(date_key.as_str()),
        meeting_time.as_deref(),
        location.as_deref(),
        Some(status.as_str()),
        agenda_url.as_deref(),
        minutes_file.as_deref(),
    ]);

    let mut documents = Vec::new();
    if let Some(url) = agenda_file {
        documents.push(Document {
            document_id: document_id(&id, DocumentType::Agenda, &url),
            meeting_id: id.clone(),
            title: format!("{} Agenda", body_name),
            url,
            doc_type: DocumentType::Agenda,
        });
    }
    if let Some(url) = minutes_file {
        documents.push(Document {
            document_id: document_id(&id, DocumentType::Minutes, &url),
            meeting_id: id.clone(),
            title: format!("{} Minutes", body_name),
            url,
            doc_type: DocumentType::Minutes,
        });
    }

    let meeting = Meeting {
        meeting_id: id,
        body_name,
        meeting_date,
        meeting_time,
        location,
        status,
        agenda_url,
        source_event_id: Some(event_id),
        content_hash: Some(hash),
        ai_summary: None,
        topics: BTreeSet::new(),
    };

    Ok(NormalizedMeeting { meeting, documents })
}

/// Assemble an item description from matter metadata and the agenda note
fn describe(raw: &RawEventItem, title: &str) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(name) = non_blank(raw.matter_name.as_deref()) {
        if !name.eq_ignore_ascii_case(title) {
            parts.push(name);
        }
    }
    if let Some(matter_type) = non_blank(raw.matter_type.as_deref()) {
        parts.push(format!("Type: {}", matter_type));
    }
    if let Some(file) = non_blank(raw.matter_file.as_deref()) {
        parts.push(format!("File: {}", file));
    }
    if let Some(action) = non_blank(raw.action_name.as_deref()) {
        parts.push(format!("Action: {}", action));
    }
    if let Some(note) = non_blank(raw.agenda_note.as_deref()) {
        parts.push(note);
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// Normalize the raw items of one meeting, skipping bad rows
pub fn normalize_items(meeting: &Meeting, raw_items: &[Value]) -> NormalizedItems {
    let mut result = NormalizedItems::default();
    let mut seen_ordinals = HashSet::new();

    for (index, raw) in raw_items.iter().enumerate() {
        match normalize_item(meeting, raw, index, &mut seen_ordinals) {
            Ok(Some(item)) => result.items.push(item),
            Ok(None) => result.skipped_blank += 1,
            Err(e) => {
                tracing::warn!(
                    meeting_id = %meeting.meeting_id,
                    position = index + 1,
                    error = %e,
                    "Skipping malformed agenda item"
                );
                result.malformed += 1;
            }
        }
    }

    result
}

fn normalize_item(
    meeting: &Meeting,
    raw: &Value,
    index: usize,
    seen_ordinals: &mut HashSet<i64>,
) -> Result<Option<AgendaItem>, NormalizationError> {
    let raw = RawEventItem::deserialize(raw).map_err(|e| NormalizationError::Malformed(e.to_string()))?;

    let Some(title) = non_blank(raw.title.as_deref()) else {
        return Ok(None);
    };

    let position = i64::try_from(index + 1).unwrap_or(i64::MAX);
    let ordinal = raw.agenda_sequence.filter(|seq| *seq > 0).unwrap_or(position);
    if !seen_ordinals.insert(ordinal) {
        return Err(NormalizationError::DuplicateOrdinal(ordinal));
    }

    let description = describe(&raw, &title);
    let hash = content_hash(&[Some(title.as_str()), description.as_deref()]);

    Ok(Some(AgendaItem::new(
        item_id(&meeting.meeting_id, ordinal),
        meeting.meeting_id.clone(),
        ordinal,
        title,
        description,
        hash,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    fn council_event() -> Value {
        json!({
            "EventId": 1234,
            "EventBodyName": "City Council",
            "EventDate": "2024-03-01T00:00:00",
            "EventTime": "6:00 PM",
            "EventLocation": "Council Chambers",
            "EventAgendaFile": "https://example.org/agenda.pdf",
            "EventMinutesFile": null,
            "EventAgendaStatusName": "Final",
            "EventMinutesStatusName": "Draft",
            "EventInSiteURL": "https://example.org/meeting",
            "EventVideoPath": null
        })
    }

    #[test]
    fn test_normalize_meeting_fields() {
        let raw = parse_event(&council_event()).unwrap();
        let normalized = normalize_meeting(&raw, today()).unwrap();
        let meeting = normalized.meeting;

        assert_eq!(meeting.body_name, "City Council");
        assert_eq!(meeting.meeting_date, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(meeting.status, MeetingStatus::Final);
        assert_eq!(meeting.agenda_url.as_deref(), Some("https://example.org/agenda.pdf"));
        assert_eq!(meeting.source_event_id, Some(1234));
        assert!(meeting.meeting_id.starts_with("mtg_"));
        assert_eq!(normalized.documents.len(), 1);
        assert_eq!(normalized.documents[0].doc_type, DocumentType::Agenda);
    }

    #[test]
    fn test_same_record_same_identity_and_hash() {
        let raw = parse_event(&council_event()).unwrap();
        let a = normalize_meeting(&raw, today()).unwrap().meeting;
        let b = normalize_meeting(&raw, today()).unwrap().meeting;
        assert_eq!(a.meeting_id, b.meeting_id);
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn test_future_meeting_stays_scheduled() {
        let mut event = council_event();
        event["EventDate"] = json!("2024-07-01T00:00:00");
        let raw = parse_event(&event).unwrap();
        assert_eq!(normalize_meeting(&raw, today()).unwrap().meeting.status, MeetingStatus::Scheduled);
    }

    #[test]
    fn test_agenda_url_falls_back_to_insite() {
        let mut event = council_event();
        event["EventAgendaFile"] = json!("  ");
        let raw = parse_event(&event).unwrap();
        let normalized = normalize_meeting(&raw, today()).unwrap();
        assert_eq!(normalized.meeting.agenda_url.as_deref(), Some("https://example.org/meeting"));
        assert!(normalized.documents.is_empty());
    }

    #[test]
    fn test_missing_body_is_rejected() {
        let mut event = council_event();
        event["EventBodyName"] = json!("");
        let raw = parse_event(&event).unwrap();
        assert!(matches!(
            normalize_meeting(&raw, today()),
            Err(NormalizationError::MissingField("EventBodyName"))
        ));
    }

    #[test]
    fn test_wrong_type_is_malformed_but_position_readable() {
        let event = json!({"EventId": 77, "EventDate": "2024-03-02T00:00:00", "EventBodyName": 5});
        assert!(matches!(parse_event(&event), Err(NormalizationError::Malformed(_))));
        assert_eq!(
            event_position(&event),
            Some(EventPosition {
                date: NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(),
                event_id: 77
            })
        );
    }

    #[test]
    fn test_parse_source_date_forms() {
        assert!(parse_source_date("2024-03-01").is_ok());
        assert!(parse_source_date("2024-03-01T18:00:00").is_ok());
        assert!(parse_source_date("03/01/2024").is_err());
        assert!(parse_source_date("2024-03-01junk").is_err());
    }

    #[test]
    fn test_normalize_items_skips_blank_and_malformed() {
        let raw = parse_event(&council_event()).unwrap();
        let meeting = normalize_meeting(&raw, today()).unwrap().meeting;
        let items = vec![
            json!({"EventItemId": 1, "EventItemTitle": "Housing Policy", "EventItemAgendaSequence": 1,
                   "EventItemMatterName": "Middle housing ordinance", "EventItemMatterType": "Ordinance"}),
            json!({"EventItemId": 2, "EventItemTitle": "   ", "EventItemAgendaSequence": 2}),
            json!({"EventItemId": 3, "EventItemTitle": ["not", "a", "string"]}),
            json!({"EventItemId": 4, "EventItemTitle": "Road Repair", "EventItemAgendaSequence": null}),
            json!({"EventItemId": 5, "EventItemTitle": "Duplicate", "EventItemAgendaSequence": 1}),
        ];

        let normalized = normalize_items(&meeting, &items);
        assert_eq!(normalized.items.len(), 2);
        assert_eq!(normalized.skipped_blank, 1);
        assert_eq!(normalized.malformed, 2);

        let housing = &normalized.items[0];
        assert_eq!(housing.ordinal, 1);
        assert_eq!(
            housing.description.as_deref(),
            Some("Middle housing ordinance\nType: Ordinance")
        );

        // Missing sequence falls back to 1-based position
        assert_eq!(normalized.items[1].ordinal, 4);
        assert_eq!(normalized.items[1].item_id, item_id(&meeting.meeting_id, 4));
    }

    #[test]
    fn test_item_hash_tracks_content() {
        let raw = parse_event(&council_event()).unwrap();
        let meeting = normalize_meeting(&raw, today()).unwrap().meeting;
        let v1 = normalize_items(&meeting, &[json!({"EventItemTitle": "Budget", "EventItemAgendaSequence": 3})]);
        let v2 = normalize_items(
            &meeting,
            &[json!({"EventItemTitle": "Budget", "EventItemAgendaSequence": 3, "EventItemAgendaNote": "Amended"})],
        );
        assert_eq!(v1.items[0].item_id, v2.items[0].item_id);
        assert_ne!(v1.items[0].content_hash, v2.items[0].content_hash);
    }
}
