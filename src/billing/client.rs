//! Billing service client
//!
//! JSON-over-HTTP calls to the billing backend that fronts Stripe. The
//! `BillingApi` trait is the seam the reconciler and redemption flows use, so
//! tests can script responses and failures without a network.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::EntitlementConfig;
use crate::error::{EntitlementError, EntitlementResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupIntentRequest {
    pub user_id: String,
    pub email: String,
    pub customer_id: Option<String>,
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupIntentResponse {
    pub client_secret: String,
    pub customer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionRequest {
    pub device_id: String,
    pub customer_id: String,
    pub is_yearly: bool,
    pub trial_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionResponse {
    pub subscription_id: String,
    #[serde(default)]
    pub trial_end: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedCheckoutRequest {
    pub user_id: String,
    pub email: String,
    pub customer_id: Option<String>,
    pub device_id: String,
    pub is_yearly: bool,
    pub with_trial: bool,
    pub return_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedCheckoutResponse {
    pub client_secret: String,
    pub session_id: String,
    pub customer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyCheckoutRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyCheckoutResponse {
    pub status: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetSubscriptionRequest {
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResponse {
    pub found: bool,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    /// Epoch seconds
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub subscription_id: String,
    pub cancel_at_period_end: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndTrialRequest {
    pub subscription_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationRequest {
    pub code: String,
    pub device_id: String,
}

/// Timestamp as the activation server sends it: epoch seconds, epoch
/// milliseconds or RFC 3339 text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Epoch(i64),
    Text(String),
}

impl WireTimestamp {
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            // Anything past year 33658 in seconds is really milliseconds
            Self::Epoch(value) if *value > 1_000_000_000_000 => {
                Utc.timestamp_millis_opt(*value).single()
            }
            Self::Epoch(value) => Utc.timestamp_opt(*value, 0).single(),
            Self::Text(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActivationResponse {
    pub valid: bool,
    pub tier: Option<String>,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    pub expires_at: Option<WireTimestamp>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialStartedRequest {
    pub device_id: String,
    pub started_at: DateTime<Utc>,
}

/// Remote billing operations
#[async_trait]
pub trait BillingApi: Send + Sync {
    async fn create_setup_intent(
        &self,
        request: &SetupIntentRequest,
    ) -> EntitlementResult<SetupIntentResponse>;

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> EntitlementResult<CreateSubscriptionResponse>;

    async fn create_embedded_checkout(
        &self,
        request: &EmbeddedCheckoutRequest,
    ) -> EntitlementResult<EmbeddedCheckoutResponse>;

    async fn verify_checkout(
        &self,
        request: &VerifyCheckoutRequest,
    ) -> EntitlementResult<VerifyCheckoutResponse>;

    async fn get_subscription(
        &self,
        request: &GetSubscriptionRequest,
    ) -> EntitlementResult<SubscriptionResponse>;

    async fn cancel_subscription(&self, request: &CancelRequest) -> EntitlementResult<()>;

    async fn end_trial(&self, request: &EndTrialRequest) -> EntitlementResult<()>;

    async fn validate_activation_code(
        &self,
        request: &ActivationRequest,
    ) -> EntitlementResult<ActivationResponse>;

    async fn report_trial_started(&self, request: &TrialStartedRequest) -> EntitlementResult<()>;
}

/// reqwest-backed `BillingApi`
pub struct HttpBillingClient {
    http: Client,
    base_url: String,
    activation_url: Option<String>,
    request_timeout: Duration,
    checkout_timeout: Duration,
}

impl HttpBillingClient {
    pub fn new(config: &EntitlementConfig) -> EntitlementResult<Self> {
        let http = Client::builder()
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                EntitlementError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            http,
            base_url: config.billing_base_url.trim_end_matches('/').to_string(),
            activation_url: config.activation_url.clone(),
            request_timeout: config.request_timeout,
            checkout_timeout: config.checkout_timeout,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_activation_url(mut self, url: impl Into<String>) -> Self {
        self.activation_url = Some(url.into());
        self
    }

    /// Override timeouts without the 10-30s clamp applied to configuration
    pub fn with_timeouts(mut self, request: Duration, checkout: Duration) -> Self {
        self.request_timeout = request;
        self.checkout_timeout = checkout;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send<Req: Serialize + ?Sized + Sync>(
        &self,
        url: &str,
        body: &Req,
        timeout: Duration,
    ) -> EntitlementResult<reqwest::Response> {
        debug!(url, "Calling billing service");
        self.http
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EntitlementError::Timeout(timeout)
                } else {
                    EntitlementError::Network(e.to_string())
                }
            })
    }

    async fn post_json<Req, Resp>(
        &self,
        path: &str,
        body: &Req,
        timeout: Duration,
    ) -> EntitlementResult<Resp>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned,
    {
        let response = self.send(&self.endpoint(path), body, timeout).await?;
        let status = response.status();
        let text = response.text().await.map_err(|e| body_error(e, timeout))?;

        if !status.is_success() {
            return Err(EntitlementError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text)
            .map_err(|e| EntitlementError::MalformedResponse(format!("{}: {}", path, e)))
    }

    async fn post_ok<Req>(&self, path: &str, body: &Req, timeout: Duration) -> EntitlementResult<()>
    where
        Req: Serialize + ?Sized + Sync,
    {
        let response = self.send(&self.endpoint(path), body, timeout).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(EntitlementError::Http {
            status: status.as_u16(),
            body: text,
        })
    }
}

fn body_error(e: reqwest::Error, timeout: Duration) -> EntitlementError {
    if e.is_timeout() {
        EntitlementError::Timeout(timeout)
    } else {
        EntitlementError::Network(e.to_string())
    }
}

#[async_trait]
impl BillingApi for HttpBillingClient {
    async fn create_setup_intent(
        &self,
        request: &SetupIntentRequest,
    ) -> EntitlementResult<SetupIntentResponse> {
        self.post_json("create-setup-intent", request, self.checkout_timeout)
            .await
    }

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> EntitlementResult<CreateSubscriptionResponse> {
        self.post_json("create-subscription", request, self.checkout_timeout)
            .await
    }

    async fn create_embedded_checkout(
        &self,
        request: &EmbeddedCheckoutRequest,
    ) -> EntitlementResult<EmbeddedCheckoutResponse> {
        self.post_json("create-embedded-checkout", request, self.checkout_timeout)
            .await
    }

    async fn verify_checkout(
        &self,
        request: &VerifyCheckoutRequest,
    ) -> EntitlementResult<VerifyCheckoutResponse> {
        self.post_json("verify-checkout", request, self.checkout_timeout)
            .await
    }

    async fn get_subscription(
        &self,
        request: &GetSubscriptionRequest,
    ) -> EntitlementResult<SubscriptionResponse> {
        self.post_json("get-subscription", request, self.request_timeout)
            .await
    }

    async fn cancel_subscription(&self, request: &CancelRequest) -> EntitlementResult<()> {
        self.post_ok("cancel", request, self.checkout_timeout).await
    }

    async fn end_trial(&self, request: &EndTrialRequest) -> EntitlementResult<()> {
        self.post_ok("end-trial", request, self.checkout_timeout).await
    }

    async fn validate_activation_code(
        &self,
        request: &ActivationRequest,
    ) -> EntitlementResult<ActivationResponse> {
        let url = self.activation_url.as_deref().ok_or_else(|| {
            EntitlementError::Configuration("Activation codes are not configured".to_string())
        })?;

        let response = self.send(url, request, self.checkout_timeout).await?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| body_error(e, self.checkout_timeout))?;

        let parsed = serde_json::from_str::<ActivationResponse>(&text);

        // Rejections may arrive as 4xx with a `{valid:false, error}` body
        if !status.is_success() {
            return match parsed {
                Ok(rejection) if !rejection.valid => Ok(rejection),
                _ => Err(EntitlementError::Http {
                    status: status.as_u16(),
                    body: text,
                }),
            };
        }

        parsed.map_err(|e| EntitlementError::MalformedResponse(format!("activation: {}", e)))
    }

    async fn report_trial_started(&self, request: &TrialStartedRequest) -> EntitlementResult<()> {
        self.post_ok("trial-started", request, self.request_timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(base_url: &str) -> HttpBillingClient {
        HttpBillingClient::new(&EntitlementConfig::default())
            .unwrap()
            .with_base_url(base_url)
            .with_timeouts(Duration::from_millis(300), Duration::from_millis(300))
    }

    fn subscription_request() -> GetSubscriptionRequest {
        GetSubscriptionRequest {
            subscription_id: Some("sub_123".into()),
            customer_id: Some("cus_123".into()),
        }
    }

    #[tokio::test]
    async fn get_subscription_success() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/get-subscription"))
            .and(body_partial_json(serde_json::json!({
                "subscriptionId": "sub_123",
                "customerId": "cus_123"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "found": true,
                "status": "active",
                "cancelAtPeriodEnd": false,
                "currentPeriodEnd": 1_767_225_600
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let result = client.get_subscription(&subscription_request()).await.unwrap();

        assert!(result.found);
        assert_eq!(result.status, "active");
        assert_eq!(result.current_period_end, Some(1_767_225_600));
        assert!(result.trial_end.is_none());
    }

    #[tokio::test]
    async fn server_error_maps_to_http_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/get-subscription"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client
            .get_subscription(&subscription_request())
            .await
            .unwrap_err();

        assert!(matches!(err, EntitlementError::Http { status: 502, .. }));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/get-subscription"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"found": false}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client
            .get_subscription(&subscription_request())
            .await
            .unwrap_err();

        assert!(matches!(err, EntitlementError::Timeout(_)));
    }

    #[tokio::test]
    async fn malformed_json_is_reported() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/verify-checkout"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client
            .verify_checkout(&VerifyCheckoutRequest {
                session_id: "cs_1".into(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, EntitlementError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn cancel_accepts_empty_ok() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/cancel"))
            .and(body_partial_json(serde_json::json!({
                "subscriptionId": "sub_1",
                "cancelAtPeriodEnd": true
            })))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        client
            .cancel_subscription(&CancelRequest {
                subscription_id: "sub_1".into(),
                cancel_at_period_end: true,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn activation_rejection_with_400_body() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/activate"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "valid": false,
                "error": "Code already used"
            })))
            .mount(&server)
            .await;

        let client =
            test_client(&server.uri()).with_activation_url(format!("{}/activate", server.uri()));
        let response = client
            .validate_activation_code(&ActivationRequest {
                code: "ABC-123".into(),
                device_id: "device-1".into(),
            })
            .await
            .unwrap();

        assert!(!response.valid);
        assert_eq!(response.error.as_deref(), Some("Code already used"));
    }

    #[tokio::test]
    async fn activation_without_url_is_configuration_error() {
        let client = test_client("http://127.0.0.1:9");
        let err = client
            .validate_activation_code(&ActivationRequest {
                code: "ABC".into(),
                device_id: "device-1".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::Configuration(_)));
    }

    #[test]
    fn wire_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            WireTimestamp::Epoch(1_767_225_600).to_datetime(),
            Some(expected)
        );
        assert_eq!(
            WireTimestamp::Epoch(1_767_225_600_000).to_datetime(),
            Some(expected)
        );
        assert_eq!(
            WireTimestamp::Text("2026-01-01T00:00:00Z".into()).to_datetime(),
            Some(expected)
        );
        assert!(WireTimestamp::Text("next year".into()).to_datetime().is_none());
    }
}
