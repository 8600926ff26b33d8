//! Content-derived identities and change-detection hashes
//!
//! Identities are derived from source coordinates, never generated randomly,
//! so re-ingesting the same source record always lands on the same row.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

use crate::models::DocumentType;

/// Hex characters kept from the SHA-256 digest for entity ids (96 bits)
const ID_HEX_LEN: usize = 24;

/// Derive a meeting id from body name, date and source sequence
///
/// Body name is compared case- and whitespace-insensitively.
pub fn meeting_id(body_name: &str, meeting_date: NaiveDate, sequence: i64) -> String {
    let body = normalize_key(body_name);
    let date = meeting_date.format("%Y-%m-%d").to_string();
    let seq = sequence.to_string();
    format!("mtg_{}", short_digest(&["meeting", &body, &date, &seq]))
}

/// Derive an agenda item id from its meeting and source ordinal
pub fn item_id(meeting_id: &str, ordinal: i64) -> String {
    let ord = ordinal.to_string();
    format!("itm_{}", short_digest(&["item", meeting_id, &ord]))
}

/// Derive a document id from its meeting, kind and URL
pub fn document_id(meeting_id: &str, doc_type: DocumentType, url: &str) -> String {
    format!(
        "doc_{}",
        short_digest(&["document", meeting_id, doc_type.as_str(), url.trim()])
    )
}

/// Fingerprint of a record's meaningful fields
///
/// Each field is length-prefixed so adjacent fields cannot bleed into each
/// other; `None` encodes differently from `Some("")`.
pub fn content_hash(fields: &[Option<&str>]) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        match field {
            Some(value) => {
                hasher.update(value.len().to_string().as_bytes());
                hasher.update(b":");
                hasher.update(value.as_bytes());
            }
            None => hasher.update(b"-"),
        }
        hasher.update(b"\x1f");
    }
    format!("{:x}", hasher.finalize())
}

fn short_digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    let hex = format!("{:x}", hasher.finalize());
    hex[..ID_HEX_LEN].to_string()
}

fn normalize_key(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
