//! Common error types for SPB

use thiserror::Error;

/// Common result type for SPB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the SPB engine
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error).
    ///
    /// Treated as "store unavailable": fatal to the calling invocation.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Conditional write refused: the stored content hash no longer matches
    #[error("Stale write rejected for {item_id}: expected hash {expected_hash}, stored {current_hash}")]
    StaleWrite {
        item_id: String,
        expected_hash: String,
        current_hash: String,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for SQLite lock contention, which is worth retrying
    pub fn is_lock_contention(&self) -> bool {
        match self {
            Error::Database(db_err) => {
                let msg = db_err.to_string();
                msg.contains("database is locked") || msg.contains("database table is locked")
            }
            _ => false,
        }
    }
}
