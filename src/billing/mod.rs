//! Entitlement engine for metered chat messages
//!
//! This module handles:
//! - Trial and premium status derived from persisted facts
//! - Message quota consumption with lazy monthly resets
//! - The reinstall-resistant trial ledger
//! - Stripe reconciliation and checkout flows
//! - Promo and activation code redemption

mod client;
#[cfg(test)]
mod fake;
mod ledger;
mod quota;
mod reconciler;
mod records;
mod redemption;
mod resolver;
mod types;

pub use client::{
    ActivationRequest, ActivationResponse, BillingApi, CancelRequest, CreateSubscriptionRequest,
    CreateSubscriptionResponse, EmbeddedCheckoutRequest, EmbeddedCheckoutResponse,
    EndTrialRequest, GetSubscriptionRequest, HttpBillingClient, SetupIntentRequest,
    SetupIntentResponse, SubscriptionResponse, TrialStartedRequest, VerifyCheckoutRequest,
    VerifyCheckoutResponse, WireTimestamp,
};
pub use ledger::TrialLedger;
pub use quota::QuotaTracker;
pub use reconciler::{BillingReconciler, CheckoutActivation, SyncOutcome};
pub use records::RecordStore;
pub use redemption::{ActivationGrant, PromoOutcome, PromoRejection, RedemptionService};
pub use resolver::{can_send_message, check_message_limit, is_trial_blocked, resolve_status};
pub use types::*;

use std::sync::Arc;
use tracing::info;

use crate::config::EntitlementConfig;
use crate::error::EntitlementResult;
use crate::security::DeviceIdentityProvider;
use crate::storage::{KeychainStore, SqliteStore, Stores};
use crate::utils::{Clock, SystemClock};

/// Entitlement state shared with the host
///
/// Every read recomputes status from the stores; nothing derived is cached.
pub struct EntitlementEngine {
    records: RecordStore,
    ledger: Arc<TrialLedger>,
    device: Arc<DeviceIdentityProvider>,
    quota: QuotaTracker,
    reconciler: BillingReconciler,
    redemption: RedemptionService,
    clock: Arc<dyn Clock>,
}

impl EntitlementEngine {
    /// Build an engine over injected stores, billing API and clock
    pub fn new(
        stores: Stores,
        api: Arc<dyn BillingApi>,
        clock: Arc<dyn Clock>,
        promo_codes: Vec<String>,
    ) -> Self {
        let records = RecordStore::new(stores.clone());
        let ledger = Arc::new(TrialLedger::new(stores.clone(), clock.clone()));
        let device = Arc::new(DeviceIdentityProvider::new(stores.fast.clone()));

        let quota = QuotaTracker::new(
            records.clone(),
            ledger.clone(),
            device.clone(),
            Some(api.clone()),
            clock.clone(),
        );
        let reconciler = BillingReconciler::new(
            api.clone(),
            records.clone(),
            ledger.clone(),
            device.clone(),
            clock.clone(),
        );
        let redemption = RedemptionService::new(
            records.clone(),
            ledger.clone(),
            device.clone(),
            api,
            clock.clone(),
            promo_codes,
        );

        Self {
            records,
            ledger,
            device,
            quota,
            reconciler,
            redemption,
            clock,
        }
    }

    /// SQLite fast store, OS keychain secure store, HTTP billing client
    pub fn from_config(config: &EntitlementConfig) -> EntitlementResult<Self> {
        let fast = SqliteStore::open(&config.data_dir)?;
        let secure = KeychainStore::new(config.keychain_service.clone());
        let api = HttpBillingClient::new(config)?;

        let engine = Self::new(
            Stores::new(Arc::new(fast), Arc::new(secure)),
            Arc::new(api),
            Arc::new(SystemClock),
            config.promo_codes.clone(),
        );
        info!(
            device_id = %engine.device_id(),
            status = %engine.status(),
            "Entitlement engine ready"
        );
        Ok(engine)
    }

    pub fn device_id(&self) -> &str {
        self.device.device_id()
    }

    /// Snapshot of the persisted facts
    pub fn facts(&self) -> EntitlementFacts {
        self.quota.snapshot()
    }

    pub fn status(&self) -> EntitlementStatus {
        resolver::resolve_status(&self.facts(), self.clock.now())
    }

    pub fn is_trial_blocked(&self) -> bool {
        self.ledger.is_trial_blocked(&self.records.trial())
    }

    pub fn can_send_message(&self) -> bool {
        resolver::can_send_message(&self.facts(), self.clock.now())
    }

    pub fn check_message_limit(&self) -> LimitCheckResult {
        resolver::check_message_limit(&self.facts(), self.clock.now())
    }

    /// Consume one message; false when not entitled
    pub async fn consume_message(&self) -> bool {
        self.quota.consume_message().await
    }

    pub fn summary(&self) -> EntitlementSummary {
        let now = self.clock.now();
        let facts = self.facts();
        let status = resolver::resolve_status(&facts, now);
        let (messages_remaining, message_quota) = resolver::message_allowance(&facts, now);

        EntitlementSummary {
            status,
            can_send_message: resolver::can_send_message(&facts, now),
            trial_blocked: resolver::is_trial_blocked(&facts.trial, &facts.abuse_marker, now),
            messages_remaining,
            message_quota,
            trial_ends_at: facts.trial.ends_at(),
            premium_expiry: facts.premium.expiry,
            auto_renew: facts.premium.active && facts.premium.auto_renew,
            product_tier: facts.premium.active.then_some(facts.premium.product_tier),
            stripe_linked: self.records.linkage().is_some(),
        }
    }

    pub fn redeem_promo_code(&self, code: &str) -> EntitlementResult<PromoOutcome> {
        self.redemption.redeem_promo_code(code)
    }

    pub async fn redeem_activation_code(&self, code: &str) -> EntitlementResult<ActivationGrant> {
        self.redemption.redeem_activation_code(code).await
    }

    pub async fn sync_with_billing(&self) -> SyncOutcome {
        self.reconciler.sync_with_billing().await
    }

    /// Reconcile in the background; the caller never waits on the network
    pub fn spawn_sync(self: &Arc<Self>) -> tokio::task::JoinHandle<SyncOutcome> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.sync_with_billing().await })
    }

    pub fn activate_from_checkout(&self, activation: CheckoutActivation) -> EntitlementResult<()> {
        self.reconciler.activate_from_checkout(activation)
    }

    pub async fn start_setup_intent(
        &self,
        user_id: &str,
        email: &str,
    ) -> EntitlementResult<SetupIntentResponse> {
        self.reconciler.start_setup_intent(user_id, email).await
    }

    pub async fn create_subscription(
        &self,
        is_yearly: bool,
    ) -> EntitlementResult<CreateSubscriptionResponse> {
        self.reconciler.create_subscription(is_yearly).await
    }

    pub async fn start_embedded_checkout(
        &self,
        user_id: &str,
        email: &str,
        is_yearly: bool,
        return_url: &str,
    ) -> EntitlementResult<EmbeddedCheckoutResponse> {
        self.reconciler
            .start_embedded_checkout(user_id, email, is_yearly, return_url)
            .await
    }

    pub async fn complete_embedded_checkout(
        &self,
        session_id: &str,
        is_yearly: bool,
    ) -> EntitlementResult<()> {
        self.reconciler
            .complete_embedded_checkout(session_id, is_yearly)
            .await
    }

    pub async fn cancel_subscription(&self, at_period_end: bool) -> EntitlementResult<()> {
        self.reconciler.cancel_subscription(at_period_end).await
    }

    pub async fn end_trial_now(&self) -> EntitlementResult<SyncOutcome> {
        self.reconciler.end_trial_now().await
    }

    /// Forget the local trial and the abuse marker
    #[cfg(any(test, feature = "debug-reset"))]
    pub fn reset_trial_for_testing(&self) -> EntitlementResult<()> {
        self.records.clear_trial()?;
        self.ledger.reset_for_testing();
        tracing::warn!("Trial state reset");
        Ok(())
    }
}
