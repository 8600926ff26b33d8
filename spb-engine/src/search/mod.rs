//! Keyword search over agenda items
//!
//! An immutable [`SearchIndex`] snapshot is built from a full store scan and
//! swapped into the [`SearchEngine`] atomically; queries never wait on a
//! rebuild.

pub mod engine;
pub mod index;
pub mod tokenizer;

pub use engine::SearchEngine;
pub use index::{Field, SearchFilters, SearchHit, SearchIndex, SearchStats};
