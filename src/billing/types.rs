//! Entitlement data types
//!
//! Only facts are persisted. The current status is always derived from them
//! (see `resolver`), never stored.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::{days_since, period_key};

/// Trial length in calendar days
pub const TRIAL_DURATION_DAYS: i64 = 3;
/// Trial allowance per day; the trial quota is one pool, not a daily allowance
pub const TRIAL_MESSAGES_PER_DAY: u32 = 5;
/// Total trial messages (duration x per-day allowance)
pub const TRIAL_MESSAGE_QUOTA: u32 = TRIAL_DURATION_DAYS as u32 * TRIAL_MESSAGES_PER_DAY;
/// Premium messages per calendar month
pub const PREMIUM_MONTHLY_MESSAGE_QUOTA: u32 = 150;
/// Length of a promo-code grant
pub const PROMO_DURATION_DAYS: i64 = 365;

/// Local trial facts (fast store)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrialRecord {
    pub start_date: Option<DateTime<Utc>>,
    pub messages_used: u32,
}

impl TrialRecord {
    pub fn is_started(&self) -> bool {
        self.start_date.is_some()
    }

    /// Still inside the trial's calendar window
    pub fn is_within_window(&self, now: DateTime<Utc>) -> bool {
        self.start_date
            .is_some_and(|start| days_since(start, now) < TRIAL_DURATION_DAYS)
    }

    /// Count or time limit reached
    pub fn is_exhausted(&self, now: DateTime<Utc>) -> bool {
        let timed_out = self
            .start_date
            .is_some_and(|start| days_since(start, now) >= TRIAL_DURATION_DAYS);
        self.messages_used >= TRIAL_MESSAGE_QUOTA || timed_out
    }

    pub fn ends_at(&self) -> Option<DateTime<Utc>> {
        self.start_date
            .map(|start| start + Duration::days(TRIAL_DURATION_DAYS))
    }

    pub fn remaining_messages(&self) -> u32 {
        TRIAL_MESSAGE_QUOTA.saturating_sub(self.messages_used)
    }
}

/// Product the premium grant came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProductTier {
    #[default]
    Monthly,
    Yearly,
    PromoYearly,
}

impl ProductTier {
    /// Lenient parse of server-supplied tier names
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "monthly" | "month" => Some(Self::Monthly),
            "yearly" | "annual" | "year" => Some(Self::Yearly),
            "promoyearly" | "promo_yearly" | "promo" => Some(Self::PromoYearly),
            _ => None,
        }
    }

    pub fn is_yearly(&self) -> bool {
        matches!(self, Self::Yearly | Self::PromoYearly)
    }

    /// Nominal billing period, used when the provider does not report one
    pub fn period(&self) -> Duration {
        if self.is_yearly() {
            Duration::days(365)
        } else {
            Duration::days(30)
        }
    }
}

impl std::fmt::Display for ProductTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monthly => write!(f, "monthly"),
            Self::Yearly => write!(f, "yearly"),
            Self::PromoYearly => write!(f, "promoYearly"),
        }
    }
}

/// Premium facts (fast store)
///
/// `active` is a cached flag; `expiry` is authoritative. An active record whose
/// expiry has passed counts as expired on every read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PremiumRecord {
    pub active: bool,
    pub expiry: Option<DateTime<Utc>>,
    pub auto_renew: bool,
    pub messages_used_this_period: u32,
    /// "YYYY-MM" of the month `messages_used_this_period` belongs to
    pub period_key: String,
    pub product_tier: ProductTier,
}

impl PremiumRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|expiry| now > expiry)
    }

    /// Active and not lazily expired
    pub fn is_entitled(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_expired(now)
    }

    /// Usage counted against the month containing `now`
    pub fn messages_used_in_period(&self, now: DateTime<Utc>) -> u32 {
        if self.period_key == period_key(now) {
            self.messages_used_this_period
        } else {
            0
        }
    }

    pub fn remaining_messages(&self, now: DateTime<Utc>) -> u32 {
        PREMIUM_MONTHLY_MESSAGE_QUOTA.saturating_sub(self.messages_used_in_period(now))
    }

    /// Start a fresh grant; usage restarts at zero for the current month
    pub fn grant(
        now: DateTime<Utc>,
        expiry: Option<DateTime<Utc>>,
        auto_renew: bool,
        product_tier: ProductTier,
    ) -> Self {
        Self {
            active: true,
            expiry,
            auto_renew,
            messages_used_this_period: 0,
            period_key: period_key(now),
            product_tier,
        }
    }

    /// Clear the active flag, keeping expiry and tier for display and resync
    pub fn deactivate(&mut self) {
        self.active = false;
        self.auto_renew = false;
    }
}

/// Link to the billing provider's customer and subscription (fast store;
/// customer id mirrored to the secure store)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StripeLinkage {
    pub customer_id: String,
    pub subscription_id: Option<String>,
    /// Epoch seconds
    pub stripe_trial_end: Option<i64>,
    pub cancel_at_period_end: bool,
}

impl StripeLinkage {
    pub fn for_customer(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            ..Default::default()
        }
    }

    pub fn has_subscription(&self) -> bool {
        self.subscription_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

/// "Trial ever used" marker (secure store only)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AbuseMarker {
    pub ever_used: bool,
    pub marked_at: Option<DateTime<Utc>>,
}

impl AbuseMarker {
    pub fn used_at(at: DateTime<Utc>) -> Self {
        Self {
            ever_used: true,
            marked_at: Some(at),
        }
    }
}

/// The one promo code this device redeemed (fast store)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoRedemption {
    pub code: String,
    pub redeemed_at: DateTime<Utc>,
}

/// Immutable snapshot of every fact the resolver reads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntitlementFacts {
    pub trial: TrialRecord,
    pub premium: PremiumRecord,
    pub abuse_marker: AbuseMarker,
}

/// Derived entitlement status; exactly one holds at any instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntitlementStatus {
    NeverStarted,
    InTrial,
    TrialExpired,
    PremiumActive,
    PremiumCancelled,
    PremiumExpired,
}

impl EntitlementStatus {
    /// Premium access, including a cancelled plan still inside its paid period
    pub fn is_premium(&self) -> bool {
        matches!(self, Self::PremiumActive | Self::PremiumCancelled)
    }
}

impl std::fmt::Display for EntitlementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NeverStarted => write!(f, "never_started"),
            Self::InTrial => write!(f, "in_trial"),
            Self::TrialExpired => write!(f, "trial_expired"),
            Self::PremiumActive => write!(f, "premium_active"),
            Self::PremiumCancelled => write!(f, "premium_cancelled"),
            Self::PremiumExpired => write!(f, "premium_expired"),
        }
    }
}

/// Subscription status as reported by the billing provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
    Unknown(String),
}

impl ProviderStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            "past_due" => Self::PastDue,
            "canceled" | "cancelled" => Self::Canceled,
            "unpaid" => Self::Unpaid,
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            "paused" => Self::Paused,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Result of a message limit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(tag = "type")]
pub enum LimitCheckResult {
    #[serde(rename = "allowed")]
    Allowed { remaining: u32 },
    #[serde(rename = "denied")]
    Denied { reason: LimitDenialReason },
}

impl LimitCheckResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    pub fn denial_reason(&self) -> Option<&LimitDenialReason> {
        match self {
            Self::Denied { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Reason a message was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(tag = "type")]
pub enum LimitDenialReason {
    /// Trial message pool used up
    #[serde(rename = "trialExhausted")]
    TrialExhausted { limit: u32, used: u32 },
    /// Trial window over (or trial blocked on this device)
    #[serde(rename = "trialExpired")]
    TrialExpired,
    /// Trial already used on this device in a previous install
    #[serde(rename = "trialBlocked")]
    TrialBlocked,
    #[serde(rename = "monthlyLimitReached")]
    MonthlyLimitReached {
        limit: u32,
        used: u32,
        period: String,
    },
    #[serde(rename = "premiumExpired")]
    PremiumExpired,
}

impl std::fmt::Display for LimitDenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TrialExhausted { limit, used } => {
                write!(f, "Trial messages used up: {}/{}", used, limit)
            }
            Self::TrialExpired => write!(f, "Your free trial has ended"),
            Self::TrialBlocked => write!(f, "The free trial was already used on this device"),
            Self::MonthlyLimitReached {
                limit,
                used,
                period,
            } => write!(
                f,
                "Monthly message limit reached for {}: {}/{}",
                period, used, limit
            ),
            Self::PremiumExpired => write!(f, "Your premium subscription has expired"),
        }
    }
}

/// Everything a host needs to render entitlement state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementSummary {
    pub status: EntitlementStatus,
    pub can_send_message: bool,
    pub trial_blocked: bool,
    pub messages_remaining: u32,
    pub message_quota: u32,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub premium_expiry: Option<DateTime<Utc>>,
    pub auto_renew: bool,
    pub product_tier: Option<ProductTier>,
    pub stripe_linked: bool,
}
