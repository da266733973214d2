//! Promo-code and activation-code redemption
//!
//! Both paths grant premium directly, without card collection. Promo codes
//! are checked against a local allow-list; activation codes are validated by
//! a remote endpoint. Attempts are throttled per device.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::client::{ActivationRequest, BillingApi};
use super::ledger::TrialLedger;
use super::records::RecordStore;
use super::types::{
    PremiumRecord, ProductTier, PromoRedemption, StripeLinkage, PROMO_DURATION_DAYS,
};
use crate::config::normalize_code;
use crate::error::{EntitlementError, EntitlementResult};
use crate::rate_limit::RateLimiter;
use crate::security::DeviceIdentityProvider;
use crate::utils::Clock;

/// Why a promo code was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PromoRejection {
    InvalidCode,
    AlreadyRedeemed,
    AlreadyPremium,
    RateLimited,
}

impl std::fmt::Display for PromoRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidCode => write!(f, "That promo code is not valid"),
            Self::AlreadyRedeemed => write!(f, "A promo code was already redeemed on this device"),
            Self::AlreadyPremium => write!(f, "Premium is already active"),
            Self::RateLimited => write!(f, "Too many attempts, try again later"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum PromoOutcome {
    Redeemed { expiry: DateTime<Utc> },
    Rejected { reason: PromoRejection },
}

impl PromoOutcome {
    pub fn is_redeemed(&self) -> bool {
        matches!(self, Self::Redeemed { .. })
    }

    fn rejected(reason: PromoRejection) -> Self {
        Self::Rejected { reason }
    }
}

/// Premium granted by an activation code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationGrant {
    pub product_tier: ProductTier,
    pub expiry: Option<DateTime<Utc>>,
    pub subscription_id: Option<String>,
}

pub struct RedemptionService {
    records: RecordStore,
    ledger: Arc<TrialLedger>,
    device: Arc<DeviceIdentityProvider>,
    api: Arc<dyn BillingApi>,
    clock: Arc<dyn Clock>,
    promo_codes: Vec<String>,
    limiter: RateLimiter,
}

impl RedemptionService {
    pub fn new(
        records: RecordStore,
        ledger: Arc<TrialLedger>,
        device: Arc<DeviceIdentityProvider>,
        api: Arc<dyn BillingApi>,
        clock: Arc<dyn Clock>,
        promo_codes: Vec<String>,
    ) -> Self {
        Self {
            records,
            ledger,
            device,
            api,
            clock,
            promo_codes: promo_codes.iter().map(|c| normalize_code(c)).collect(),
            limiter: RateLimiter::default(),
        }
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Redeem a promo code for one year of premium
    ///
    /// Expected refusals come back as `PromoOutcome::Rejected`; only a failed
    /// write is an error.
    pub fn redeem_promo_code(&self, code: &str) -> EntitlementResult<PromoOutcome> {
        let limiter_key = format!("promo:{}", self.device.device_id());
        if !self.limiter.check_and_record(&limiter_key) {
            return Ok(PromoOutcome::rejected(PromoRejection::RateLimited));
        }

        let now = self.clock.now();
        if self.records.promo_redemption().is_some() {
            return Ok(PromoOutcome::rejected(PromoRejection::AlreadyRedeemed));
        }
        if self.records.premium().is_entitled(now) {
            return Ok(PromoOutcome::rejected(PromoRejection::AlreadyPremium));
        }

        let code = normalize_code(code);
        if code.is_empty() || !self.promo_codes.contains(&code) {
            info!("Promo code rejected");
            return Ok(PromoOutcome::rejected(PromoRejection::InvalidCode));
        }

        // The one-per-device guard goes first so a later failure cannot
        // leave premium granted without it
        self.records.save_promo_redemption(&PromoRedemption {
            code: code.clone(),
            redeemed_at: now,
        })?;

        let expiry = now + Duration::days(PROMO_DURATION_DAYS);
        let premium = PremiumRecord::grant(now, Some(expiry), false, ProductTier::PromoYearly);
        if let Err(e) = self.records.save_premium(&premium) {
            if let Err(undo) = self.records.clear_promo_redemption() {
                warn!(error = %undo, "Failed to roll back promo redemption");
            }
            return Err(e.into());
        }
        self.ledger.mark_trial_used();
        self.limiter.reset(&limiter_key);

        info!(code = %code, expiry = %expiry, "Promo code redeemed");
        Ok(PromoOutcome::Redeemed { expiry })
    }

    /// Validate an activation code remotely and grant the premium it carries
    ///
    /// Nothing is written unless the server accepts the code.
    pub async fn redeem_activation_code(&self, code: &str) -> EntitlementResult<ActivationGrant> {
        let device_id = self.device.device_id().to_string();
        let limiter_key = format!("activation:{}", device_id);
        if !self.limiter.check_and_record(&limiter_key) {
            return Err(EntitlementError::RateLimited);
        }

        let code = code.trim();
        if code.is_empty() {
            return Err(EntitlementError::ActivationRejected(
                "No activation code entered".to_string(),
            ));
        }

        let response = self
            .api
            .validate_activation_code(&ActivationRequest {
                code: code.to_string(),
                device_id,
            })
            .await?;

        if !response.valid {
            let reason = response
                .error
                .unwrap_or_else(|| "Invalid activation code".to_string());
            warn!(reason = %reason, "Activation code rejected");
            return Err(EntitlementError::ActivationRejected(reason));
        }

        let expiry = match &response.expires_at {
            Some(raw) => Some(raw.to_datetime().ok_or_else(|| {
                EntitlementError::MalformedResponse(format!("unreadable expiresAt: {:?}", raw))
            })?),
            None => None,
        };
        let product_tier = response
            .tier
            .as_deref()
            .and_then(ProductTier::parse)
            .unwrap_or_default();
        let subscription_id = response.subscription_id.filter(|id| !id.is_empty());

        let now = self.clock.now();
        let previous = self.records.try_premium()?;
        let premium =
            PremiumRecord::grant(now, expiry, subscription_id.is_some(), product_tier);
        self.records.save_premium(&premium)?;

        if let Some(customer_id) = response.customer_id.filter(|id| !id.is_empty()) {
            let linked = self.records.save_linkage(&StripeLinkage {
                customer_id,
                subscription_id: subscription_id.clone(),
                ..Default::default()
            });
            if let Err(e) = linked {
                if let Err(undo) = self.records.save_premium(&previous) {
                    warn!(error = %undo, "Failed to roll back activation grant");
                }
                return Err(e.into());
            }
        }

        self.limiter.reset(&limiter_key);
        info!(tier = %product_tier, expiry = ?expiry, "Activation code redeemed");
        Ok(ActivationGrant {
            product_tier,
            expiry,
            subscription_id,
        })
    }
}
