//! Scripted `BillingApi` for tests

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

use super::client::*;
use crate::error::{EntitlementError, EntitlementResult};

#[derive(Debug, Clone, Copy)]
pub enum FakeFailure {
    Timeout,
    Network,
}

impl FakeFailure {
    fn to_error(self) -> EntitlementError {
        match self {
            Self::Timeout => EntitlementError::Timeout(Duration::from_secs(15)),
            Self::Network => EntitlementError::Network("connection refused".to_string()),
        }
    }
}

#[derive(Default)]
pub struct FakeBillingApi {
    failure: Mutex<Option<FakeFailure>>,
    subscription: Mutex<Option<SubscriptionResponse>>,
    checkout: Mutex<Option<VerifyCheckoutResponse>>,
    activation: Mutex<Option<ActivationResponse>>,
    calls: Mutex<Vec<&'static str>>,
    pub last_trial_days: Mutex<Option<u32>>,
    pub last_with_trial: Mutex<Option<bool>>,
    pub last_cancel_at_period_end: Mutex<Option<bool>>,
}

impl FakeBillingApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, failure: FakeFailure) {
        *self.failure.lock().unwrap() = Some(failure);
    }

    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    pub fn set_subscription(&self, response: SubscriptionResponse) {
        *self.subscription.lock().unwrap() = Some(response);
    }

    pub fn set_checkout(&self, response: VerifyCheckoutResponse) {
        *self.checkout.lock().unwrap() = Some(response);
    }

    pub fn set_activation(&self, response: ActivationResponse) {
        *self.activation.lock().unwrap() = Some(response);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == name).count()
    }

    fn record(&self, name: &'static str) -> EntitlementResult<()> {
        self.calls.lock().unwrap().push(name);
        match *self.failure.lock().unwrap() {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BillingApi for FakeBillingApi {
    async fn create_setup_intent(
        &self,
        request: &SetupIntentRequest,
    ) -> EntitlementResult<SetupIntentResponse> {
        self.record("create-setup-intent")?;
        Ok(SetupIntentResponse {
            client_secret: "seti_secret".to_string(),
            customer_id: request
                .customer_id
                .clone()
                .unwrap_or_else(|| "cus_new".to_string()),
        })
    }

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> EntitlementResult<CreateSubscriptionResponse> {
        self.record("create-subscription")?;
        *self.last_trial_days.lock().unwrap() = Some(request.trial_days);
        Ok(CreateSubscriptionResponse {
            subscription_id: "sub_new".to_string(),
            trial_end: (request.trial_days > 0).then_some(1_900_000_000),
        })
    }

    async fn create_embedded_checkout(
        &self,
        request: &EmbeddedCheckoutRequest,
    ) -> EntitlementResult<EmbeddedCheckoutResponse> {
        self.record("create-embedded-checkout")?;
        *self.last_with_trial.lock().unwrap() = Some(request.with_trial);
        Ok(EmbeddedCheckoutResponse {
            client_secret: "cs_secret".to_string(),
            session_id: "cs_test_1".to_string(),
            customer_id: request
                .customer_id
                .clone()
                .unwrap_or_else(|| "cus_embedded".to_string()),
        })
    }

    async fn verify_checkout(
        &self,
        _request: &VerifyCheckoutRequest,
    ) -> EntitlementResult<VerifyCheckoutResponse> {
        self.record("verify-checkout")?;
        self.checkout
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| EntitlementError::MalformedResponse("no checkout scripted".into()))
    }

    async fn get_subscription(
        &self,
        _request: &GetSubscriptionRequest,
    ) -> EntitlementResult<SubscriptionResponse> {
        self.record("get-subscription")?;
        Ok(self
            .subscription
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(SubscriptionResponse {
                found: false,
                status: String::new(),
                cancel_at_period_end: false,
                current_period_end: None,
                trial_end: None,
            }))
    }

    async fn cancel_subscription(&self, request: &CancelRequest) -> EntitlementResult<()> {
        self.record("cancel")?;
        *self.last_cancel_at_period_end.lock().unwrap() = Some(request.cancel_at_period_end);
        Ok(())
    }

    async fn end_trial(&self, _request: &EndTrialRequest) -> EntitlementResult<()> {
        self.record("end-trial")
    }

    async fn validate_activation_code(
        &self,
        _request: &ActivationRequest,
    ) -> EntitlementResult<ActivationResponse> {
        self.record("activate")?;
        Ok(self.activation.lock().unwrap().clone().unwrap_or_default())
    }

    async fn report_trial_started(&self, _request: &TrialStartedRequest) -> EntitlementResult<()> {
        self.record("trial-started")
    }
}
