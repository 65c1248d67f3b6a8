//! Core data models for the versioned object store.
//!
//! These entities represent buckets, the per-key version ledger and
//! in-flight multipart uploads. Raw table rows map via `sqlx::FromRow` and
//! are converted into domain types at the edge of the services.

pub mod bucket;
pub mod multipart;
pub mod object;
pub mod retention;

use chrono::{DateTime, Utc};

/// Ledger timestamps are stored as epoch milliseconds so SQL comparisons
/// are exact.
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
