//! Entitlement status resolution
//!
//! Pure functions over an `EntitlementFacts` snapshot. Status is recomputed on
//! every read; nothing here touches storage or the network.

use chrono::{DateTime, Utc};

use super::types::{
    AbuseMarker, EntitlementFacts, EntitlementStatus, LimitCheckResult, LimitDenialReason,
    TrialRecord, PREMIUM_MONTHLY_MESSAGE_QUOTA, TRIAL_MESSAGE_QUOTA,
};
use crate::utils::period_key;

/// Derive the single current status
///
/// First match wins:
/// 1. premium flag set: expired if past expiry, else cancelled/active by auto-renew
/// 2. trial blocked by the abuse marker: trial expired
/// 3. no local trial start: never started
/// 4. inside the trial window: in trial
/// 5. otherwise: trial expired
pub fn resolve_status(facts: &EntitlementFacts, now: DateTime<Utc>) -> EntitlementStatus {
    let premium = &facts.premium;
    if premium.active {
        if premium.is_expired(now) {
            return EntitlementStatus::PremiumExpired;
        }
        return if premium.auto_renew {
            EntitlementStatus::PremiumActive
        } else {
            EntitlementStatus::PremiumCancelled
        };
    }

    if is_trial_blocked(&facts.trial, &facts.abuse_marker, now) {
        return EntitlementStatus::TrialExpired;
    }

    if !facts.trial.is_started() {
        EntitlementStatus::NeverStarted
    } else if facts.trial.is_within_window(now) {
        EntitlementStatus::InTrial
    } else {
        EntitlementStatus::TrialExpired
    }
}

/// Whether the device's one-time trial grant is gone
///
/// A marker with no local trial start means a previous install used the trial
/// (reinstall). A marker alongside a local trial that is neither out of time
/// nor out of messages is treated as stale so an in-progress trial is not cut
/// short.
pub fn is_trial_blocked(trial: &TrialRecord, marker: &AbuseMarker, now: DateTime<Utc>) -> bool {
    marker.ever_used && (!trial.is_started() || trial.is_exhausted(now))
}

/// Check whether one more message may be sent, with the reason if not
pub fn check_message_limit(facts: &EntitlementFacts, now: DateTime<Utc>) -> LimitCheckResult {
    match resolve_status(facts, now) {
        EntitlementStatus::PremiumActive | EntitlementStatus::PremiumCancelled => {
            let used = facts.premium.messages_used_in_period(now);
            if used >= PREMIUM_MONTHLY_MESSAGE_QUOTA {
                LimitCheckResult::Denied {
                    reason: LimitDenialReason::MonthlyLimitReached {
                        limit: PREMIUM_MONTHLY_MESSAGE_QUOTA,
                        used,
                        period: period_key(now),
                    },
                }
            } else {
                LimitCheckResult::Allowed {
                    remaining: PREMIUM_MONTHLY_MESSAGE_QUOTA - used,
                }
            }
        }
        // The trial starts with the first message
        EntitlementStatus::InTrial | EntitlementStatus::NeverStarted => {
            trial_allowance(&facts.trial)
        }
        EntitlementStatus::TrialExpired => {
            let reason = if !facts.trial.is_started() {
                LimitDenialReason::TrialBlocked
            } else if facts.trial.messages_used >= TRIAL_MESSAGE_QUOTA {
                LimitDenialReason::TrialExhausted {
                    limit: TRIAL_MESSAGE_QUOTA,
                    used: facts.trial.messages_used,
                }
            } else {
                LimitDenialReason::TrialExpired
            };
            LimitCheckResult::Denied { reason }
        }
        EntitlementStatus::PremiumExpired => LimitCheckResult::Denied {
            reason: LimitDenialReason::PremiumExpired,
        },
    }
}

fn trial_allowance(trial: &TrialRecord) -> LimitCheckResult {
    if trial.messages_used >= TRIAL_MESSAGE_QUOTA {
        LimitCheckResult::Denied {
            reason: LimitDenialReason::TrialExhausted {
                limit: TRIAL_MESSAGE_QUOTA,
                used: trial.messages_used,
            },
        }
    } else {
        LimitCheckResult::Allowed {
            remaining: trial.remaining_messages(),
        }
    }
}

/// Total: never fails, whatever facts are present
pub fn can_send_message(facts: &EntitlementFacts, now: DateTime<Utc>) -> bool {
    check_message_limit(facts, now).is_allowed()
}

/// Messages left and the quota they count against, for display
pub fn message_allowance(facts: &EntitlementFacts, now: DateTime<Utc>) -> (u32, u32) {
    match resolve_status(facts, now) {
        EntitlementStatus::PremiumActive | EntitlementStatus::PremiumCancelled => (
            facts.premium.remaining_messages(now),
            PREMIUM_MONTHLY_MESSAGE_QUOTA,
        ),
        EntitlementStatus::InTrial | EntitlementStatus::NeverStarted => {
            (facts.trial.remaining_messages(), TRIAL_MESSAGE_QUOTA)
        }
        EntitlementStatus::TrialExpired => (0, TRIAL_MESSAGE_QUOTA),
        EntitlementStatus::PremiumExpired => (0, PREMIUM_MONTHLY_MESSAGE_QUOTA),
    }
}
