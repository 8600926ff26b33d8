//! Utility modules for spb-engine

pub mod backoff;
pub mod db_retry;
pub mod pool_monitor;

pub use backoff::{retry_with_backoff, BackoffPolicy, RetryOutcome};
pub use db_retry::{max_lock_wait_ms, retry_on_lock};
pub use pool_monitor::{begin_monitored, MonitoredTransaction};
