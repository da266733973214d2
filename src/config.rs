//! Engine configuration loaded from the environment
//!
//! Values come from process env (after `.env` is loaded via dotenvy) with
//! defaults for everything except the webhook secret.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::EntitlementError;

const DEFAULT_BILLING_URL: &str = "https://billing.versechat.app/api/stripe";
const DEFAULT_KEYCHAIN_SERVICE: &str = "com.versechat.entitlements";
const DEFAULT_PROMO_CODES: &str = "FREEYEAR2025";

/// Network timeouts must stay inside this window
const MIN_TIMEOUT_SECS: u64 = 10;
const MAX_TIMEOUT_SECS: u64 = 30;

/// Default replay window for webhook timestamps
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct EntitlementConfig {
    /// Base URL of the billing service (endpoints are appended)
    pub billing_base_url: String,
    /// Activation-code validation endpoint; `None` disables activation codes
    pub activation_url: Option<String>,
    /// Timeout for reconciliation calls
    pub request_timeout: Duration,
    /// Timeout for checkout and redemption calls
    pub checkout_timeout: Duration,
    /// Accepted promo codes, already normalized
    pub promo_codes: Vec<String>,
    /// Directory holding the fast store database
    pub data_dir: PathBuf,
    /// Keychain service name for the tamper-resistant store
    pub keychain_service: String,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub secret: Option<String>,
    pub tolerance_secs: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            tolerance_secs: DEFAULT_WEBHOOK_TOLERANCE_SECS,
        }
    }
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            billing_base_url: DEFAULT_BILLING_URL.to_string(),
            activation_url: None,
            request_timeout: Duration::from_secs(15),
            checkout_timeout: Duration::from_secs(MAX_TIMEOUT_SECS),
            promo_codes: parse_promo_codes(DEFAULT_PROMO_CODES),
            data_dir: default_data_dir(),
            keychain_service: DEFAULT_KEYCHAIN_SERVICE.to_string(),
            webhook: WebhookConfig::default(),
        }
    }
}

impl EntitlementConfig {
    /// Load configuration from `.env` and the process environment
    pub fn from_env() -> Result<Self, EntitlementError> {
        if dotenvy::dotenv().is_err() {
            tracing::debug!("No .env file found, using process environment only");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, EntitlementError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let billing_base_url = lookup("ENTITLEMENTS_BILLING_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.billing_base_url);
        let activation_url = lookup("ENTITLEMENTS_ACTIVATION_URL").filter(|url| !url.is_empty());

        let request_timeout = match lookup("ENTITLEMENTS_REQUEST_TIMEOUT_SECS") {
            Some(raw) => clamp_timeout(parse_secs("ENTITLEMENTS_REQUEST_TIMEOUT_SECS", &raw)?),
            None => defaults.request_timeout,
        };
        let checkout_timeout = match lookup("ENTITLEMENTS_CHECKOUT_TIMEOUT_SECS") {
            Some(raw) => clamp_timeout(parse_secs("ENTITLEMENTS_CHECKOUT_TIMEOUT_SECS", &raw)?),
            None => defaults.checkout_timeout,
        };

        let promo_codes = lookup("ENTITLEMENTS_PROMO_CODES")
            .map(|raw| parse_promo_codes(&raw))
            .unwrap_or(defaults.promo_codes);
        let data_dir = lookup("ENTITLEMENTS_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let keychain_service =
            lookup("ENTITLEMENTS_KEYCHAIN_SERVICE").unwrap_or(defaults.keychain_service);

        let tolerance_secs = match lookup("STRIPE_WEBHOOK_TOLERANCE_SECS") {
            Some(raw) => raw.trim().parse::<i64>().map_err(|_| {
                EntitlementError::Configuration(
                    "Invalid integer for STRIPE_WEBHOOK_TOLERANCE_SECS".to_string(),
                )
            })?,
            None => DEFAULT_WEBHOOK_TOLERANCE_SECS,
        };

        Ok(Self {
            billing_base_url,
            activation_url,
            request_timeout,
            checkout_timeout,
            promo_codes,
            data_dir,
            keychain_service,
            webhook: WebhookConfig {
                secret: lookup("STRIPE_WEBHOOK_SECRET"),
                tolerance_secs,
            },
        })
    }
}

/// Uppercase and strip all whitespace so "free year 2025 " matches "FREEYEAR2025"
pub fn normalize_code(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

fn parse_promo_codes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(normalize_code)
        .filter(|code| !code.is_empty())
        .collect()
}

fn parse_secs(key: &str, raw: &str) -> Result<u64, EntitlementError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| EntitlementError::Configuration(format!("Invalid integer for {key}")))
}

fn clamp_timeout(secs: u64) -> Duration {
    Duration::from_secs(secs.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS))
}

fn default_data_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("chat-entitlements")
}
