//! Store access layer
//!
//! Free functions over the shared SQLite pool, one module per entity. All
//! writes are single statements or short transactions; the only concurrency
//! control is conditional writes (`ON CONFLICT ... WHERE`, hash-guarded
//! `UPDATE`), so any number of ingest/analyzer processes may run at once.

pub mod cursors;
pub mod documents;
pub mod items;
pub mod meetings;

use chrono::NaiveDate;
use spb_common::{Error, Result};
use std::collections::BTreeSet;

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub(crate) fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|e| Error::Internal(format!("Invalid stored date '{}': {}", value, e)))
}

pub(crate) fn encode_topics(topics: &BTreeSet<String>) -> Result<String> {
    serde_json::to_string(topics)
        .map_err(|e| Error::Internal(format!("Failed to serialize topics: {}", e)))
}

pub(crate) fn decode_topics(value: &str) -> Result<BTreeSet<String>> {
    serde_json::from_str(value)
        .map_err(|e| Error::Internal(format!("Failed to deserialize topics: {}", e)))
}
