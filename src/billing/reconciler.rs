//! Subscription reconciliation against the billing service
//!
//! Pulls provider-reported subscription facts into the local premium record
//! and drives the checkout flows. Reconciliation fails open: a failed or
//! ambiguous status fetch never deactivates a paying user. Checkout and
//! cancellation surface failures to the caller.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::client::{
    BillingApi, CancelRequest, CreateSubscriptionRequest, CreateSubscriptionResponse,
    EmbeddedCheckoutRequest, EmbeddedCheckoutResponse, EndTrialRequest, GetSubscriptionRequest,
    SetupIntentRequest, SetupIntentResponse, SubscriptionResponse, VerifyCheckoutRequest,
};
use super::ledger::TrialLedger;
use super::records::RecordStore;
use super::types::{PremiumRecord, ProductTier, ProviderStatus, StripeLinkage, TRIAL_DURATION_DAYS};
use crate::error::{EntitlementError, EntitlementResult};
use crate::security::DeviceIdentityProvider;
use crate::utils::{from_epoch_secs, Clock};

/// What a reconciliation pass did to local state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No Stripe linkage on this device
    NotLinked,
    /// Fetch failed, subscription not found, or status not actionable
    Unchanged,
    Activated {
        expiry: Option<DateTime<Utc>>,
        auto_renew: bool,
    },
    Deactivated,
    /// Payment past due: premium kept, auto-renew cleared
    GracePeriod,
}

/// Result of a completed checkout or setup flow
#[derive(Debug, Clone)]
pub struct CheckoutActivation {
    pub customer_id: String,
    pub subscription_id: Option<String>,
    pub product_tier: ProductTier,
    pub current_period_end: Option<i64>,
    /// Epoch seconds; present when the subscription started with a trial window
    pub trial_end: Option<i64>,
    pub auto_renew: bool,
}

pub struct BillingReconciler {
    api: Arc<dyn BillingApi>,
    records: RecordStore,
    ledger: Arc<TrialLedger>,
    device: Arc<DeviceIdentityProvider>,
    clock: Arc<dyn Clock>,
}

impl BillingReconciler {
    pub fn new(
        api: Arc<dyn BillingApi>,
        records: RecordStore,
        ledger: Arc<TrialLedger>,
        device: Arc<DeviceIdentityProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            api,
            records,
            ledger,
            device,
            clock,
        }
    }

    /// Pull the provider's view of the linked subscription into local state
    pub async fn sync_with_billing(&self) -> SyncOutcome {
        let Some(linkage) = self.records.linkage() else {
            debug!("No Stripe linkage, skipping sync");
            return SyncOutcome::NotLinked;
        };

        let request = GetSubscriptionRequest {
            subscription_id: linkage.subscription_id.clone(),
            customer_id: Some(linkage.customer_id.clone()).filter(|id| !id.is_empty()),
        };
        if request.subscription_id.is_none() && request.customer_id.is_none() {
            return SyncOutcome::NotLinked;
        }

        let response = match self.api.get_subscription(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Subscription sync failed, keeping local state");
                return SyncOutcome::Unchanged;
            }
        };

        if !response.found {
            info!(
                customer_id = %linkage.customer_id,
                "Billing service has no subscription, keeping local state"
            );
            return SyncOutcome::Unchanged;
        }

        let outcome = self.apply_subscription(linkage, &response);
        info!(status = %response.status, outcome = ?outcome, "Subscription sync complete");
        outcome
    }

    fn apply_subscription(
        &self,
        mut linkage: StripeLinkage,
        response: &SubscriptionResponse,
    ) -> SyncOutcome {
        let now = self.clock.now();
        let mut premium = self.records.premium();

        let outcome = match ProviderStatus::parse(&response.status) {
            status @ (ProviderStatus::Active | ProviderStatus::Trialing) => {
                let auto_renew = !response.cancel_at_period_end;
                let expiry = response
                    .current_period_end
                    .and_then(from_epoch_secs)
                    .or(premium.expiry)
                    .or_else(|| Some(now + premium.product_tier.period()));

                if premium.active {
                    premium.expiry = expiry;
                    premium.auto_renew = auto_renew;
                } else {
                    premium = PremiumRecord::grant(now, expiry, auto_renew, premium.product_tier);
                }

                if status == ProviderStatus::Trialing {
                    self.ledger.mark_trial_used();
                }
                SyncOutcome::Activated { expiry, auto_renew }
            }
            ProviderStatus::Canceled
            | ProviderStatus::Unpaid
            | ProviderStatus::IncompleteExpired => {
                premium.deactivate();
                SyncOutcome::Deactivated
            }
            ProviderStatus::PastDue => {
                premium.auto_renew = false;
                SyncOutcome::GracePeriod
            }
            ProviderStatus::Incomplete | ProviderStatus::Paused | ProviderStatus::Unknown(_) => {
                debug!(status = %response.status, "Status not actionable, keeping local state");
                return SyncOutcome::Unchanged;
            }
        };

        if let Err(e) = self.records.save_premium(&premium) {
            warn!(error = %e, "Failed to persist synced premium record");
            return SyncOutcome::Unchanged;
        }

        linkage.cancel_at_period_end = response.cancel_at_period_end;
        linkage.stripe_trial_end = response.trial_end;
        if let Err(e) = self.records.save_linkage(&linkage) {
            warn!(error = %e, "Failed to persist synced linkage");
        }
        outcome
    }

    /// Grant premium from a finished checkout or setup flow
    ///
    /// A checkout with a trial window consumes the device's one trial grant,
    /// whatever the local trial record says.
    pub fn activate_from_checkout(&self, activation: CheckoutActivation) -> EntitlementResult<()> {
        let now = self.clock.now();
        let expiry = activation
            .trial_end
            .or(activation.current_period_end)
            .and_then(from_epoch_secs)
            .unwrap_or_else(|| now + activation.product_tier.period());

        let premium = PremiumRecord::grant(
            now,
            Some(expiry),
            activation.auto_renew,
            activation.product_tier,
        );
        self.records.save_premium(&premium)?;

        self.records.save_linkage(&StripeLinkage {
            customer_id: activation.customer_id.clone(),
            subscription_id: activation.subscription_id.clone(),
            stripe_trial_end: activation.trial_end,
            cancel_at_period_end: !activation.auto_renew,
        })?;

        if activation.trial_end.is_some() {
            self.ledger.mark_trial_used();
        }

        info!(
            customer_id = %activation.customer_id,
            tier = %activation.product_tier,
            expiry = %expiry,
            "Premium activated from checkout"
        );
        Ok(())
    }

    /// Whether a Stripe-side trial may be offered to this device
    fn trial_available(&self) -> bool {
        !self.ledger.is_trial_blocked(&self.records.trial())
    }

    fn require_subscription(&self) -> EntitlementResult<(StripeLinkage, String)> {
        let linkage = self.records.linkage().ok_or(EntitlementError::NotLinked)?;
        let subscription_id = linkage
            .subscription_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or(EntitlementError::NotLinked)?;
        Ok((linkage, subscription_id))
    }

    /// Create (or reuse) the Stripe customer and a setup intent for card entry
    pub async fn start_setup_intent(
        &self,
        user_id: &str,
        email: &str,
    ) -> EntitlementResult<SetupIntentResponse> {
        let existing = self.records.linkage();
        let request = SetupIntentRequest {
            user_id: user_id.to_string(),
            email: email.to_string(),
            customer_id: existing.as_ref().map(|l| l.customer_id.clone()),
            device_id: self.device.device_id().to_string(),
        };

        let response = self.api.create_setup_intent(&request).await?;
        self.remember_customer(existing, &response.customer_id)?;
        Ok(response)
    }

    /// Subscribe the linked customer, with a trial unless the device used it
    pub async fn create_subscription(
        &self,
        is_yearly: bool,
    ) -> EntitlementResult<CreateSubscriptionResponse> {
        let linkage = self.records.linkage().ok_or(EntitlementError::NotLinked)?;
        let trial_days = if self.trial_available() {
            TRIAL_DURATION_DAYS as u32
        } else {
            0
        };

        let request = CreateSubscriptionRequest {
            device_id: self.device.device_id().to_string(),
            customer_id: linkage.customer_id.clone(),
            is_yearly,
            trial_days,
        };
        let response = self.api.create_subscription(&request).await?;

        self.activate_from_checkout(CheckoutActivation {
            customer_id: linkage.customer_id,
            subscription_id: Some(response.subscription_id.clone()),
            product_tier: tier_for(is_yearly),
            current_period_end: None,
            trial_end: response.trial_end,
            auto_renew: true,
        })?;
        Ok(response)
    }

    /// Open a hosted embedded checkout session
    pub async fn start_embedded_checkout(
        &self,
        user_id: &str,
        email: &str,
        is_yearly: bool,
        return_url: &str,
    ) -> EntitlementResult<EmbeddedCheckoutResponse> {
        let existing = self.records.linkage();
        let request = EmbeddedCheckoutRequest {
            user_id: user_id.to_string(),
            email: email.to_string(),
            customer_id: existing.as_ref().map(|l| l.customer_id.clone()),
            device_id: self.device.device_id().to_string(),
            is_yearly,
            with_trial: self.trial_available(),
            return_url: return_url.to_string(),
        };

        let response = self.api.create_embedded_checkout(&request).await?;
        self.remember_customer(existing, &response.customer_id)?;
        Ok(response)
    }

    /// Confirm an embedded checkout session and activate premium
    pub async fn complete_embedded_checkout(
        &self,
        session_id: &str,
        is_yearly: bool,
    ) -> EntitlementResult<()> {
        let response = self
            .api
            .verify_checkout(&VerifyCheckoutRequest {
                session_id: session_id.to_string(),
            })
            .await?;

        if !matches!(response.status.as_str(), "complete" | "paid") {
            return Err(EntitlementError::CheckoutIncomplete(response.status));
        }

        let customer_id = response
            .customer_id
            .filter(|id| !id.is_empty())
            .or_else(|| self.records.linkage().map(|l| l.customer_id))
            .ok_or_else(|| {
                EntitlementError::MalformedResponse("checkout has no customer id".to_string())
            })?;

        self.activate_from_checkout(CheckoutActivation {
            customer_id,
            subscription_id: response.subscription_id,
            product_tier: tier_for(is_yearly),
            current_period_end: response.current_period_end,
            trial_end: response.trial_end,
            auto_renew: true,
        })
    }

    /// Cancel now, or at the end of the paid period
    pub async fn cancel_subscription(&self, at_period_end: bool) -> EntitlementResult<()> {
        let (mut linkage, subscription_id) = self.require_subscription()?;
        self.api
            .cancel_subscription(&CancelRequest {
                subscription_id: subscription_id.clone(),
                cancel_at_period_end: at_period_end,
            })
            .await?;

        let mut premium = self.records.premium();
        if at_period_end {
            premium.auto_renew = false;
        } else {
            premium.deactivate();
        }
        self.records.save_premium(&premium)?;

        linkage.cancel_at_period_end = at_period_end;
        self.records.save_linkage(&linkage)?;

        info!(subscription_id = %subscription_id, at_period_end, "Subscription cancelled");
        Ok(())
    }

    /// End a Stripe-side trial so the first charge happens immediately
    pub async fn end_trial_now(&self) -> EntitlementResult<SyncOutcome> {
        let (mut linkage, subscription_id) = self.require_subscription()?;
        self.api
            .end_trial(&EndTrialRequest {
                subscription_id: subscription_id.clone(),
            })
            .await?;

        linkage.stripe_trial_end = None;
        self.records.save_linkage(&linkage)?;
        info!(subscription_id = %subscription_id, "Stripe trial ended early");

        Ok(self.sync_with_billing().await)
    }

    fn remember_customer(
        &self,
        existing: Option<StripeLinkage>,
        customer_id: &str,
    ) -> EntitlementResult<()> {
        let linkage = match existing {
            Some(linkage) if linkage.customer_id == customer_id => return Ok(()),
            _ => StripeLinkage::for_customer(customer_id),
        };
        self.records.save_linkage(&linkage)?;
        debug!(customer_id, "Linked Stripe customer");
        Ok(())
    }
}

fn tier_for(is_yearly: bool) -> ProductTier {
    if is_yearly {
        ProductTier::Yearly
    } else {
        ProductTier::Monthly
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::client::VerifyCheckoutResponse;
    use crate::billing::fake::{FakeBillingApi, FakeFailure};
    use crate::billing::types::TrialRecord;
    use crate::storage::Stores;
    use crate::utils::ManualClock;
    use chrono::{Duration, TimeZone};

    struct Harness {
        reconciler: BillingReconciler,
        api: Arc<FakeBillingApi>,
        records: RecordStore,
        ledger: Arc<TrialLedger>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let stores = Stores::in_memory();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap(),
        ));
        let api = Arc::new(FakeBillingApi::new());
        let records = RecordStore::new(stores.clone());
        let ledger = Arc::new(TrialLedger::new(stores.clone(), clock.clone()));
        let device = Arc::new(DeviceIdentityProvider::new(stores.fast.clone()));
        let reconciler = BillingReconciler::new(
            api.clone(),
            records.clone(),
            ledger.clone(),
            device,
            clock.clone(),
        );
        Harness {
            reconciler,
            api,
            records,
            ledger,
            clock,
        }
    }

    fn link(h: &Harness) {
        h.records
            .save_linkage(&StripeLinkage {
                customer_id: "cus_1".into(),
                subscription_id: Some("sub_1".into()),
                ..Default::default()
            })
            .unwrap();
    }

    fn active_premium(h: &Harness) -> PremiumRecord {
        let now = h.clock.now();
        let mut premium =
            PremiumRecord::grant(now, Some(now + Duration::days(20)), true, ProductTier::Monthly);
        premium.messages_used_this_period = 42;
        h.records.save_premium(&premium).unwrap();
        premium
    }

    fn subscription(status: &str, cancel: bool, period_end: Option<i64>) -> SubscriptionResponse {
        SubscriptionResponse {
            found: true,
            status: status.to_string(),
            cancel_at_period_end: cancel,
            current_period_end: period_end,
            trial_end: None,
        }
    }

    #[tokio::test]
    async fn test_sync_without_linkage_is_noop() {
        let h = harness();
        assert_eq!(h.reconciler.sync_with_billing().await, SyncOutcome::NotLinked);
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_leaves_premium_unchanged() {
        let h = harness();
        link(&h);
        let before = active_premium(&h);
        h.api.fail_with(FakeFailure::Timeout);
        h.api.set_subscription(subscription("canceled", false, None));

        assert_eq!(h.reconciler.sync_with_billing().await, SyncOutcome::Unchanged);
        assert_eq!(h.records.premium(), before);
    }

    #[tokio::test]
    async fn test_sync_applies_once_server_recovers() {
        let h = harness();
        link(&h);
        active_premium(&h);
        let period_end = h.clock.now().timestamp() + 86_400 * 30;
        h.api
            .set_subscription(subscription("active", false, Some(period_end)));
        h.api.fail_with(FakeFailure::Network);

        assert_eq!(h.reconciler.sync_with_billing().await, SyncOutcome::Unchanged);

        h.api.recover();
        let outcome = h.reconciler.sync_with_billing().await;

        assert!(matches!(
            outcome,
            SyncOutcome::Activated {
                auto_renew: true,
                ..
            }
        ));
        assert_eq!(h.records.premium().expiry, from_epoch_secs(period_end));
        assert_eq!(h.api.call_count("get-subscription"), 2);
    }

    #[tokio::test]
    async fn test_not_found_leaves_premium_unchanged() {
        let h = harness();
        link(&h);
        let before = active_premium(&h);

        assert_eq!(h.reconciler.sync_with_billing().await, SyncOutcome::Unchanged);
        assert_eq!(h.records.premium(), before);
    }

    #[tokio::test]
    async fn test_active_updates_expiry_and_keeps_usage() {
        let h = harness();
        link(&h);
        active_premium(&h);
        let period_end = h.clock.now().timestamp() + 86_400 * 30;
        h.api
            .set_subscription(subscription("active", true, Some(period_end)));

        let outcome = h.reconciler.sync_with_billing().await;
        let premium = h.records.premium();

        assert!(matches!(
            outcome,
            SyncOutcome::Activated {
                auto_renew: false,
                ..
            }
        ));
        assert!(premium.active);
        assert!(!premium.auto_renew);
        assert_eq!(premium.expiry, from_epoch_secs(period_end));
        assert_eq!(premium.messages_used_this_period, 42);
        assert!(h.records.linkage().unwrap().cancel_at_period_end);
    }

    #[tokio::test]
    async fn test_trialing_activates_and_marks_trial() {
        let h = harness();
        link(&h);
        h.api.set_subscription(subscription(
            "trialing",
            false,
            Some(h.clock.now().timestamp() + 86_400 * 3),
        ));

        h.reconciler.sync_with_billing().await;

        assert!(h.records.premium().active);
        assert!(h.ledger.marker().ever_used);
    }

    #[tokio::test]
    async fn test_canceled_deactivates_but_keeps_linkage() {
        let h = harness();
        link(&h);
        active_premium(&h);
        h.api.set_subscription(subscription("canceled", false, None));

        assert_eq!(h.reconciler.sync_with_billing().await, SyncOutcome::Deactivated);
        assert!(!h.records.premium().active);
        assert_eq!(
            h.records.linkage().unwrap().subscription_id.as_deref(),
            Some("sub_1")
        );
    }

    #[tokio::test]
    async fn test_past_due_keeps_premium_without_renewal() {
        let h = harness();
        link(&h);
        active_premium(&h);
        h.api.set_subscription(subscription("past_due", false, None));

        assert_eq!(h.reconciler.sync_with_billing().await, SyncOutcome::GracePeriod);
        let premium = h.records.premium();
        assert!(premium.active);
        assert!(!premium.auto_renew);
    }

    #[tokio::test]
    async fn test_unknown_status_is_ignored() {
        let h = harness();
        link(&h);
        let before = active_premium(&h);
        h.api.set_subscription(subscription("something_new", false, None));

        assert_eq!(h.reconciler.sync_with_billing().await, SyncOutcome::Unchanged);
        assert_eq!(h.records.premium(), before);
    }

    #[test]
    fn test_checkout_with_trial_marks_device() {
        let h = harness();
        let trial_end = h.clock.now().timestamp() + 86_400 * 3;

        h.reconciler
            .activate_from_checkout(CheckoutActivation {
                customer_id: "cus_9".into(),
                subscription_id: Some("sub_9".into()),
                product_tier: ProductTier::Yearly,
                current_period_end: None,
                trial_end: Some(trial_end),
                auto_renew: true,
            })
            .unwrap();

        let premium = h.records.premium();
        assert!(premium.active);
        assert_eq!(premium.product_tier, ProductTier::Yearly);
        assert_eq!(premium.expiry, from_epoch_secs(trial_end));
        assert!(h.ledger.marker().ever_used);
        assert_eq!(h.records.linkage().unwrap().customer_id, "cus_9");
    }

    #[tokio::test]
    async fn test_create_subscription_skips_trial_when_blocked() {
        let h = harness();
        link(&h);
        h.ledger.mark_trial_used();

        let response = h.reconciler.create_subscription(false).await.unwrap();

        assert_eq!(*h.api.last_trial_days.lock().unwrap(), Some(0));
        assert!(response.trial_end.is_none());
        assert!(h.records.premium().active);
    }

    #[tokio::test]
    async fn test_create_subscription_offers_trial_to_fresh_device() {
        let h = harness();
        link(&h);

        h.reconciler.create_subscription(true).await.unwrap();

        assert_eq!(
            *h.api.last_trial_days.lock().unwrap(),
            Some(TRIAL_DURATION_DAYS as u32)
        );
        assert!(h.ledger.marker().ever_used);
        assert_eq!(h.records.premium().product_tier, ProductTier::Yearly);
    }

    #[tokio::test]
    async fn test_create_subscription_requires_customer() {
        let h = harness();
        let err = h.reconciler.create_subscription(false).await.unwrap_err();
        assert!(matches!(err, EntitlementError::NotLinked));
    }

    #[tokio::test]
    async fn test_embedded_checkout_in_trial_window_still_offers_trial() {
        let h = harness();
        h.records
            .save_trial(&TrialRecord {
                start_date: Some(h.clock.now()),
                messages_used: 2,
            })
            .unwrap();
        h.ledger.mark_trial_used();

        h.reconciler
            .start_embedded_checkout("user", "a@b.c", false, "app://done")
            .await
            .unwrap();

        assert_eq!(*h.api.last_with_trial.lock().unwrap(), Some(true));
        assert_eq!(h.records.linkage().unwrap().customer_id, "cus_embedded");
    }

    #[tokio::test]
    async fn test_incomplete_checkout_is_reported() {
        let h = harness();
        h.api.set_checkout(VerifyCheckoutResponse {
            status: "open".into(),
            customer_id: Some("cus_1".into()),
            subscription_id: None,
            trial_end: None,
            current_period_end: None,
        });

        let err = h
            .reconciler
            .complete_embedded_checkout("cs_1", false)
            .await
            .unwrap_err();

        assert!(matches!(err, EntitlementError::CheckoutIncomplete(ref s) if s == "open"));
        assert!(!h.records.premium().active);
    }

    #[tokio::test]
    async fn test_checkout_network_failure_surfaces() {
        let h = harness();
        h.api.fail_with(FakeFailure::Network);
        let err = h
            .reconciler
            .start_setup_intent("user", "a@b.c")
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(h.records.linkage().is_none());
    }

    #[tokio::test]
    async fn test_cancel_at_period_end_keeps_access() {
        let h = harness();
        link(&h);
        active_premium(&h);

        h.reconciler.cancel_subscription(true).await.unwrap();

        let premium = h.records.premium();
        assert!(premium.active);
        assert!(!premium.auto_renew);
        assert!(h.records.linkage().unwrap().cancel_at_period_end);
        assert_eq!(*h.api.last_cancel_at_period_end.lock().unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_end_trial_resyncs() {
        let h = harness();
        link(&h);
        h.api.set_subscription(subscription(
            "active",
            false,
            Some(h.clock.now().timestamp() + 86_400 * 30),
        ));

        let outcome = h.reconciler.end_trial_now().await.unwrap();

        assert!(matches!(outcome, SyncOutcome::Activated { .. }));
        assert_eq!(h.api.calls(), vec!["end-trial", "get-subscription"]);
    }
}
