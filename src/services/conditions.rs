//! `If-Match` / `If-None-Match` evaluation against the current version.

use crate::errors::{StorageError, StorageResult};
use crate::models::object::ObjectVersion;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
}

impl Preconditions {
    pub fn is_empty(&self) -> bool {
        self.if_match.is_none() && self.if_none_match.is_none()
    }

    /// GET/HEAD semantics: a failed `If-Match` is 412, a matching
    /// `If-None-Match` is 304.
    pub fn evaluate_read(&self, current: &ObjectVersion) -> StorageResult<()> {
        if let Some(expected) = &self.if_match {
            if !etag_matches(expected, &current.etag) {
                return Err(StorageError::PreconditionFailed);
            }
        }
        if let Some(unexpected) = &self.if_none_match {
            if etag_matches(unexpected, &current.etag) {
                return Err(StorageError::NotModified);
            }
        }
        Ok(())
    }

    /// Write semantics, evaluated inside the write transaction. `If-Match`
    /// needs a current version with that ETag; `If-None-Match: *` needs the
    /// key to have no current version.
    pub fn evaluate_write(&self, current: Option<&ObjectVersion>) -> StorageResult<()> {
        if let Some(expected) = &self.if_match {
            match current {
                Some(v) if etag_matches(expected, &v.etag) => {}
                _ => return Err(StorageError::PreconditionFailed),
            }
        }
        if let (Some(unexpected), Some(v)) = (&self.if_none_match, current) {
            if etag_matches(unexpected, &v.etag) {
                return Err(StorageError::PreconditionFailed);
            }
        }
        Ok(())
    }
}

/// Compare a header value (possibly a quoted list, possibly `*`) with an etag.
fn etag_matches(header: &str, etag: &str) -> bool {
    header.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || strip_quotes(candidate.trim_start_matches("W/")) == etag
    })
}

pub fn strip_quotes(value: &str) -> &str {
    value.trim().trim_matches('"')
}
