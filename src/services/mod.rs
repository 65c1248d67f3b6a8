//! Metadata core and the services built on it.

pub mod backend;
pub mod bucket_store;
pub mod chunked;
pub mod clock;
pub mod conditions;
pub mod content;
pub mod ledger;
pub mod lifecycle;
pub mod multipart;
pub mod reclaim;
pub mod retention;
pub mod storage_service;
pub mod transaction;
