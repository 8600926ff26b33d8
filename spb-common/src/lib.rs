//! # SPB Common Library
//!
//! Shared code for the Spokane Public Brief engine including:
//! - Data model (meetings, agenda items, documents)
//! - Stable identity and content-hash derivation
//! - Database initialization and schema
//! - Event types (BriefEvent enum) and EventBus
//! - Configuration loading

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod identity;
pub mod models;

pub use error::{Error, Result};
