//! Represents a logical bucket and the configuration the core consumes.

use crate::models::retention::{DefaultRetention, RetentionMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// A storage bucket in the S3-compatible system.
///
/// Buckets are scoped to a tenant and act as namespaces for objects. The row
/// also carries the configuration the ledger and the sweeper read: versioning
/// state, default retention and lifecycle rules.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Unique identifier for this bucket (UUID for internal DB use).
    pub id: Uuid,

    /// Tenant that owns the bucket namespace.
    pub tenant_id: String,

    /// Bucket name, unique per tenant (must conform to DNS naming rules).
    pub name: String,

    /// ID of the user or account that owns this bucket.
    pub owner_id: Uuid,

    /// Region where the bucket is hosted (e.g. "us-west-2").
    pub region: String,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,

    /// `Unset`, `Enabled` or `Suspended`.
    pub versioning: String,

    pub default_retention_mode: Option<String>,
    pub default_retention_days: Option<i64>,

    /// JSON-encoded `Vec<LifecycleRule>`.
    pub lifecycle_rules: Option<String>,
}

impl Bucket {
    pub fn versioning_state(&self) -> VersioningState {
        self.versioning.parse().unwrap_or(VersioningState::Unset)
    }

    pub fn default_retention(&self) -> Option<DefaultRetention> {
        let mode = self
            .default_retention_mode
            .as_deref()?
            .parse::<RetentionMode>()
            .ok()?;
        let days = u32::try_from(self.default_retention_days?).ok()?;
        Some(DefaultRetention { mode, days })
    }
}

/// Versioning state of a bucket.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersioningState {
    /// Versioning was never turned on; writes use the `null` slot.
    Unset,
    Enabled,
    /// Versioning was turned on once and then paused.
    Suspended,
}

impl VersioningState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersioningState::Unset => "Unset",
            VersioningState::Enabled => "Enabled",
            VersioningState::Suspended => "Suspended",
        }
    }
}

impl fmt::Display for VersioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersioningState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Unset" => Ok(VersioningState::Unset),
            "Enabled" => Ok(VersioningState::Enabled),
            "Suspended" => Ok(VersioningState::Suspended),
            other => Err(format!("unknown versioning state `{}`", other)),
        }
    }
}

/// A lifecycle rule. Only evaluation happens in this service; rule storage
/// is a plain JSON column.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct LifecycleRule {
    pub id: String,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Expire versions that have been noncurrent for this many days.
    #[serde(default)]
    pub noncurrent_days: Option<u32>,
    /// Remove delete markers with no older versions after this many days.
    #[serde(default)]
    pub expired_delete_marker_days: Option<u32>,
    /// Abort multipart uploads idle for this many days.
    #[serde(default)]
    pub abort_incomplete_multipart_days: Option<u32>,
}

fn enabled_by_default() -> bool {
    true
}

impl LifecycleRule {
    pub fn applies_to(&self, key: &str) -> bool {
        self.enabled
            && self
                .prefix
                .as_deref()
                .is_none_or(|prefix| key.starts_with(prefix))
    }
}

/// `(tenant, bucket)` pair used to enumerate buckets for background work.
#[derive(Clone, Debug, PartialEq, Eq, FromRow)]
pub struct BucketRef {
    pub tenant_id: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_prefix_and_enabled_flag() {
        let rule: LifecycleRule =
            serde_json::from_str(r#"{"id":"logs","prefix":"logs/","noncurrent_days":30}"#)
                .unwrap();
        assert!(rule.enabled);
        assert!(rule.applies_to("logs/2025/app.log"));
        assert!(!rule.applies_to("images/cat.png"));

        let disabled = LifecycleRule {
            enabled: false,
            ..rule
        };
        assert!(!disabled.applies_to("logs/2025/app.log"));
    }

    #[test]
    fn versioning_state_round_trips_through_text() {
        for state in [
            VersioningState::Unset,
            VersioningState::Enabled,
            VersioningState::Suspended,
        ] {
            assert_eq!(state.as_str().parse::<VersioningState>().unwrap(), state);
        }
    }
}
