//! # SPB Engine
//!
//! Ingestion, enrichment and search for Spokane Public Brief.
//!
//! - [`services::Ingestor`] pulls meetings and agenda items from Legistar and
//!   writes what changed, enqueueing one work message per changed item
//! - [`queue::WorkQueue`] delivers those messages at least once
//! - [`services::AnalyzerPool`] enriches items through the AI provider and
//!   applies results with hash-guarded writes
//! - [`search::SearchEngine`] answers keyword queries from an in-memory
//!   snapshot of the store

pub mod db;
pub mod queue;
pub mod search;
pub mod services;
pub mod utils;
