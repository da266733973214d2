//! Typed access to the fast-tier entitlement records

use tracing::{info, warn};

use super::types::{PremiumRecord, PromoRedemption, StripeLinkage, TrialRecord};
use crate::storage::{keys, StorageError, StoreTier, Stores};

#[derive(Clone)]
pub struct RecordStore {
    stores: Stores,
}

impl RecordStore {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub fn trial(&self) -> TrialRecord {
        self.stores
            .load(StoreTier::Fast, keys::TRIAL)
            .unwrap_or_default()
    }

    /// Trial record, or the read failure; absent reads as a fresh record
    pub fn try_trial(&self) -> Result<TrialRecord, StorageError> {
        Ok(self
            .stores
            .try_load(StoreTier::Fast, keys::TRIAL)?
            .unwrap_or_default())
    }

    pub fn save_trial(&self, trial: &TrialRecord) -> Result<(), StorageError> {
        self.stores.save(StoreTier::Fast, keys::TRIAL, trial)
    }

    pub fn premium(&self) -> PremiumRecord {
        self.stores
            .load(StoreTier::Fast, keys::PREMIUM)
            .unwrap_or_default()
    }

    /// Premium record, or the read failure; absent reads as inactive
    pub fn try_premium(&self) -> Result<PremiumRecord, StorageError> {
        Ok(self
            .stores
            .try_load(StoreTier::Fast, keys::PREMIUM)?
            .unwrap_or_default())
    }

    pub fn save_premium(&self, premium: &PremiumRecord) -> Result<(), StorageError> {
        self.stores.save(StoreTier::Fast, keys::PREMIUM, premium)
    }

    /// Linkage from the fast store, or a customer-only linkage rebuilt from
    /// the secure-store mirror after a reinstall
    pub fn linkage(&self) -> Option<StripeLinkage> {
        if let Some(linkage) = self
            .stores
            .load::<StripeLinkage>(StoreTier::Fast, keys::STRIPE_LINKAGE)
        {
            return Some(linkage);
        }

        let customer_id = match self.stores.secure.get(keys::STRIPE_CUSTOMER_ID) {
            Ok(Some(id)) if !id.is_empty() => id,
            Ok(_) => return None,
            Err(e) => {
                warn!(error = %e, "Could not read mirrored customer id");
                return None;
            }
        };

        info!(customer_id = %customer_id, "Restored Stripe customer from secure store");
        let restored = StripeLinkage::for_customer(customer_id);
        if let Err(e) = self.stores.save(StoreTier::Fast, keys::STRIPE_LINKAGE, &restored) {
            warn!(error = %e, "Failed to persist restored linkage");
        }
        Some(restored)
    }

    /// Save linkage and mirror the customer id into the secure store
    ///
    /// The mirror write is best-effort: the fast store stays authoritative.
    pub fn save_linkage(&self, linkage: &StripeLinkage) -> Result<(), StorageError> {
        self.stores
            .save(StoreTier::Fast, keys::STRIPE_LINKAGE, linkage)?;
        if !linkage.customer_id.is_empty() {
            if let Err(e) = self
                .stores
                .secure
                .set(keys::STRIPE_CUSTOMER_ID, &linkage.customer_id)
            {
                warn!(error = %e, "Failed to mirror customer id to secure store");
            }
        }
        Ok(())
    }

    pub fn promo_redemption(&self) -> Option<PromoRedemption> {
        self.stores.load(StoreTier::Fast, keys::PROMO_REDEMPTION)
    }

    pub fn save_promo_redemption(&self, redemption: &PromoRedemption) -> Result<(), StorageError> {
        self.stores
            .save(StoreTier::Fast, keys::PROMO_REDEMPTION, redemption)
    }

    pub fn clear_promo_redemption(&self) -> Result<(), StorageError> {
        self.stores.fast.remove(keys::PROMO_REDEMPTION)
    }

    #[cfg(any(test, feature = "debug-reset"))]
    pub fn clear_trial(&self) -> Result<(), StorageError> {
        self.stores.fast.remove(keys::TRIAL)
    }
}
