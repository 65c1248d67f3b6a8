//! Object lock state: retention mode, retain-until date and legal hold.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// WORM retention mode attached to a version.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RetentionMode {
    /// Deletable before expiry only with the governance bypass capability.
    Governance,
    /// Not deletable by anyone before expiry.
    Compliance,
}

impl RetentionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionMode::Governance => "GOVERNANCE",
            RetentionMode::Compliance => "COMPLIANCE",
        }
    }
}

impl fmt::Display for RetentionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetentionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GOVERNANCE" => Ok(RetentionMode::Governance),
            "COMPLIANCE" => Ok(RetentionMode::Compliance),
            other => Err(format!("unknown retention mode `{}`", other)),
        }
    }
}

/// Retention stamped on a single version.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Retention {
    pub mode: RetentionMode,
    pub retain_until: DateTime<Utc>,
}

impl Retention {
    pub fn new(mode: RetentionMode, retain_until: DateTime<Utc>) -> Self {
        Self { mode, retain_until }
    }

    /// True while `now` is strictly before the retain-until date.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.retain_until
    }
}

/// Bucket-level default applied to writes that carry no explicit retention.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct DefaultRetention {
    pub mode: RetentionMode,
    pub days: u32,
}

impl DefaultRetention {
    /// Materialize the default for a version created at `created_at`.
    pub fn stamp(&self, created_at: DateTime<Utc>) -> Retention {
        Retention {
            mode: self.mode,
            retain_until: created_at + Duration::days(i64::from(self.days)),
        }
    }
}

/// Legal hold status as exchanged on the wire (`ON` / `OFF`).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LegalHold {
    On,
    Off,
}

impl LegalHold {
    pub fn is_on(&self) -> bool {
        matches!(self, LegalHold::On)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LegalHold::On => "ON",
            LegalHold::Off => "OFF",
        }
    }
}

impl From<bool> for LegalHold {
    fn from(on: bool) -> Self {
        if on { LegalHold::On } else { LegalHold::Off }
    }
}

impl FromStr for LegalHold {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" => Ok(LegalHold::On),
            "OFF" => Ok(LegalHold::Off),
            other => Err(format!("unknown legal hold status `{}`", other)),
        }
    }
}
