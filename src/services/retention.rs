//! Retention guard: WORM rules evaluated before any delete or overwrite commits.
//!
//! Everything here is pure. The caller supplies `now` and the
//! `bypass_governance` capability, which the authorization layer has already
//! decided.

use crate::models::{
    object::ObjectVersion,
    retention::{Retention, RetentionMode},
};
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Why a version may not be removed right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReason {
    /// Held until someone turns the legal hold off. No expiry.
    LegalHold,
    /// Locked for everyone until `retain_until`.
    Compliance { retain_until: DateTime<Utc> },
    /// Locked until `retain_until` unless the caller holds the bypass capability.
    Governance { retain_until: DateTime<Utc> },
}

impl fmt::Display for LockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockReason::LegalHold => write!(f, "legal hold is on"),
            LockReason::Compliance { retain_until } => {
                write!(f, "COMPLIANCE retention until {}", retain_until.to_rfc3339())
            }
            LockReason::Governance { retain_until } => write!(
                f,
                "GOVERNANCE retention until {} (bypass required)",
                retain_until.to_rfc3339()
            ),
        }
    }
}

/// A delete, overwrite or retention change denied by object lock.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("version `{version_id}` of `{key}` is locked: {reason}")]
pub struct RetentionLockError {
    pub key: String,
    pub version_id: String,
    pub reason: LockReason,
}

impl RetentionLockError {
    pub fn for_version(version: &ObjectVersion, reason: LockReason) -> Self {
        Self {
            key: version.key.key.clone(),
            version_id: version.version_id.clone(),
            reason,
        }
    }
}

/// Decide whether a version with this lock state may be removed at `now`.
///
/// Legal hold wins over everything. Active COMPLIANCE has no bypass. Active
/// GOVERNANCE yields only to `bypass_governance`.
pub fn check_deletable(
    retention: Option<&Retention>,
    legal_hold: bool,
    bypass_governance: bool,
    now: DateTime<Utc>,
) -> Result<(), LockReason> {
    if legal_hold {
        return Err(LockReason::LegalHold);
    }
    match retention {
        Some(r) if r.is_active(now) => match r.mode {
            RetentionMode::Compliance => Err(LockReason::Compliance {
                retain_until: r.retain_until,
            }),
            RetentionMode::Governance if bypass_governance => Ok(()),
            RetentionMode::Governance => Err(LockReason::Governance {
                retain_until: r.retain_until,
            }),
        },
        _ => Ok(()),
    }
}

/// [`check_deletable`] applied to a stored version.
pub fn check_version_deletable(
    version: &ObjectVersion,
    bypass_governance: bool,
    now: DateTime<Utc>,
) -> Result<(), RetentionLockError> {
    check_deletable(
        version.retention.as_ref(),
        version.legal_hold,
        bypass_governance,
        now,
    )
    .map_err(|reason| RetentionLockError::for_version(version, reason))
}

/// Decide whether the retention of a version may move from `current` to `requested`.
///
/// Tightening (later date, or GOVERNANCE to COMPLIANCE) is always allowed.
/// Loosening an active COMPLIANCE retention is never allowed. Loosening an
/// active GOVERNANCE retention requires the bypass capability.
pub fn check_retention_change(
    current: Option<&Retention>,
    requested: Option<&Retention>,
    bypass_governance: bool,
    now: DateTime<Utc>,
) -> Result<(), LockReason> {
    let Some(current) = current.filter(|r| r.is_active(now)) else {
        return Ok(());
    };

    let tightens = requested.is_some_and(|req| {
        req.retain_until >= current.retain_until
            && (req.mode == current.mode || req.mode == RetentionMode::Compliance)
    });
    if tightens {
        return Ok(());
    }

    match current.mode {
        RetentionMode::Compliance => Err(LockReason::Compliance {
            retain_until: current.retain_until,
        }),
        RetentionMode::Governance if bypass_governance => Ok(()),
        RetentionMode::Governance => Err(LockReason::Governance {
            retain_until: current.retain_until,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_750_000_000, 0).unwrap()
    }

    fn retention(mode: RetentionMode, offset_days: i64) -> Retention {
        Retention::new(mode, now() + Duration::days(offset_days))
    }

    /// Every combination of mode x hold x time x bypass.
    #[test]
    fn deletable_cross_product() {
        let modes = [
            None,
            Some(RetentionMode::Governance),
            Some(RetentionMode::Compliance),
        ];
        for mode in modes {
            for hold in [false, true] {
                for offset in [-1_i64, 1] {
                    for bypass in [false, true] {
                        let ret = mode.map(|m| retention(m, offset));
                        let result = check_deletable(ret.as_ref(), hold, bypass, now());
                        let active = offset > 0;
                        let expected_ok = !hold
                            && match mode {
                                None => true,
                                Some(_) if !active => true,
                                Some(RetentionMode::Compliance) => false,
                                Some(RetentionMode::Governance) => bypass,
                            };
                        assert_eq!(
                            result.is_ok(),
                            expected_ok,
                            "mode={:?} hold={} offset={} bypass={}",
                            mode,
                            hold,
                            offset,
                            bypass
                        );
                        if hold {
                            assert_eq!(result, Err(LockReason::LegalHold));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn retain_until_boundary_is_exclusive() {
        let at_expiry = Retention::new(RetentionMode::Compliance, now());
        assert!(check_deletable(Some(&at_expiry), false, false, now()).is_ok());
    }

    #[test]
    fn compliance_denial_reports_expiry() {
        let ret = retention(RetentionMode::Compliance, 14);
        match check_deletable(Some(&ret), false, true, now()) {
            Err(LockReason::Compliance { retain_until }) => {
                assert_eq!(retain_until, ret.retain_until)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn compliance_can_only_be_tightened() {
        let current = retention(RetentionMode::Compliance, 10);
        let longer = retention(RetentionMode::Compliance, 20);
        let shorter = retention(RetentionMode::Compliance, 5);
        let downgraded = retention(RetentionMode::Governance, 20);

        assert!(check_retention_change(Some(&current), Some(&longer), false, now()).is_ok());
        assert!(check_retention_change(Some(&current), Some(&shorter), true, now()).is_err());
        assert!(check_retention_change(Some(&current), Some(&downgraded), true, now()).is_err());
        assert!(check_retention_change(Some(&current), None, true, now()).is_err());
    }

    #[test]
    fn governance_loosening_needs_bypass() {
        let current = retention(RetentionMode::Governance, 10);
        let shorter = retention(RetentionMode::Governance, 1);
        let upgraded = retention(RetentionMode::Compliance, 10);

        assert!(check_retention_change(Some(&current), Some(&upgraded), false, now()).is_ok());
        assert!(check_retention_change(Some(&current), Some(&shorter), false, now()).is_err());
        assert!(check_retention_change(Some(&current), Some(&shorter), true, now()).is_ok());
        assert!(check_retention_change(Some(&current), None, true, now()).is_ok());
    }

    #[test]
    fn expired_retention_can_be_replaced_freely() {
        let expired = retention(RetentionMode::Compliance, -1);
        assert!(check_retention_change(Some(&expired), None, false, now()).is_ok());
    }
}
