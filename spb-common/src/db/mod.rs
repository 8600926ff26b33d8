//! Database initialization and schema

pub mod init;

pub use init::{create_schema, get_setting_i64, init_database, MAX_LOCK_WAIT_SETTING};
