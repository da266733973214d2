//! Billing-provider webhook signature verification
//!
//! Header format: `t=<unix-seconds>,v1=<hex>[,v1=<hex>...]`. The signed payload
//! is `"{t}.{body}"`, HMAC-SHA256 keyed with the full endpoint secret. Several
//! `v1` entries may be present while a secret is being rotated; any match is
//! accepted.
//!
//! Every failure is an error. Callers must reject (not retry) an event that
//! fails verification.

use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{WebhookConfig, DEFAULT_WEBHOOK_TOLERANCE_SECS};

type HmacSha256 = Hmac<Sha256>;

/// Provider convention for endpoint secrets
pub const SECRET_PREFIX: &str = "whsec_";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Webhook secret is not configured")]
    MissingSecret,
    #[error("Webhook secret does not look like a provider endpoint secret")]
    InvalidSecret,
    #[error("Malformed signature header: {0}")]
    MalformedHeader(String),
    #[error("Signature header has no timestamp")]
    MissingTimestamp,
    #[error("Signature header has no v1 signature")]
    MissingSignature,
    #[error("Timestamp {timestamp} is outside the {tolerance_secs}s tolerance (now {now})")]
    StaleTimestamp {
        timestamp: i64,
        now: i64,
        tolerance_secs: i64,
    },
    #[error("No signature matches the expected signature")]
    SignatureMismatch,
    #[error("Verified payload is not valid JSON: {0}")]
    InvalidPayload(#[source] serde_json::Error),
}

impl WebhookError {
    /// Secret problems: fatal misconfiguration, never an attacker's fault
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Self::MissingSecret | Self::InvalidSecret)
    }

    /// Header, replay and signature problems: the event must be rejected
    pub fn is_verification_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedHeader(_)
                | Self::MissingTimestamp
                | Self::MissingSignature
                | Self::StaleTimestamp { .. }
                | Self::SignatureMismatch
        )
    }
}

/// Minimal provider event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub livemode: bool,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventData {
    pub object: Value,
}

impl WebhookEvent {
    /// String field from the event's data object
    pub fn object_str(&self, key: &str) -> Option<&str> {
        self.data.object.get(key).and_then(Value::as_str)
    }
}

struct SignatureHeader<'a> {
    timestamp: i64,
    signatures: Vec<&'a str>,
}

fn parse_header(header: &str) -> Result<SignatureHeader<'_>, WebhookError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| WebhookError::MalformedHeader(format!("'{}' is not key=value", part)))?;
        match key {
            "t" => {
                let parsed = value.parse::<i64>().map_err(|_| {
                    WebhookError::MalformedHeader(format!("invalid timestamp '{}'", value))
                })?;
                timestamp = Some(parsed);
            }
            "v1" if !value.is_empty() => signatures.push(value),
            // v0 and future schemes are ignored
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(WebhookError::MissingTimestamp)?;
    if signatures.is_empty() {
        return Err(WebhookError::MissingSignature);
    }
    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

fn compute_signature(secret: &str, timestamp: i64, body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Compare without short-circuiting on the first differing byte
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Build a signature header for `body`, as the provider would
pub fn sign_payload(body: &str, secret: &str, timestamp: i64) -> String {
    format!("t={},v1={}", timestamp, compute_signature(secret, timestamp, body))
}

#[derive(Debug, Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    /// Validate the secret up front so misconfiguration surfaces immediately
    pub fn new(secret: Option<&str>, tolerance_secs: i64) -> Result<Self, WebhookError> {
        let secret = secret
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(WebhookError::MissingSecret)?;
        match secret.strip_prefix(SECRET_PREFIX) {
            Some(rest) if !rest.is_empty() => {}
            _ => return Err(WebhookError::InvalidSecret),
        }
        Ok(Self {
            secret: secret.to_string(),
            tolerance_secs: tolerance_secs.max(0),
        })
    }

    pub fn from_config(config: &WebhookConfig) -> Result<Self, WebhookError> {
        Self::new(config.secret.as_deref(), config.tolerance_secs)
    }

    pub fn with_default_tolerance(secret: &str) -> Result<Self, WebhookError> {
        Self::new(Some(secret), DEFAULT_WEBHOOK_TOLERANCE_SECS)
    }

    /// Verify `header` against the raw `body` at unix time `now`
    pub fn verify(&self, body: &str, header: &str, now: i64) -> Result<(), WebhookError> {
        let parsed = parse_header(header).inspect_err(|e| {
            warn!(error = %e, "Rejected webhook with bad signature header");
        })?;

        // Hostile timestamps can overflow the difference; treat that as stale
        let within_window = now
            .checked_sub(parsed.timestamp)
            .map(i64::unsigned_abs)
            .is_some_and(|age| age <= self.tolerance_secs.unsigned_abs());
        if !within_window {
            warn!(
                timestamp = parsed.timestamp,
                now,
                tolerance = self.tolerance_secs,
                "Rejected webhook outside replay window"
            );
            return Err(WebhookError::StaleTimestamp {
                timestamp: parsed.timestamp,
                now,
                tolerance_secs: self.tolerance_secs,
            });
        }

        let expected = compute_signature(&self.secret, parsed.timestamp, body);
        let mut matched = false;
        for candidate in &parsed.signatures {
            let candidate = candidate.to_ascii_lowercase();
            matched |= constant_time_eq(expected.as_bytes(), candidate.as_bytes());
        }

        if !matched {
            warn!(
                signatures = parsed.signatures.len(),
                "Rejected webhook with signature mismatch"
            );
            return Err(WebhookError::SignatureMismatch);
        }

        debug!(timestamp = parsed.timestamp, "Webhook signature verified");
        Ok(())
    }

    /// Verify, then decode the body
    pub fn verify_and_parse<T: DeserializeOwned>(
        &self,
        body: &str,
        header: &str,
        now: i64,
    ) -> Result<T, WebhookError> {
        self.verify(body, header, now)?;
        serde_json::from_str(body).map_err(WebhookError::InvalidPayload)
    }

    /// Verify and decode into the provider event envelope
    pub fn verify_event(
        &self,
        body: &str,
        header: &str,
        now: i64,
    ) -> Result<WebhookEvent, WebhookError> {
        self.verify_and_parse(body, header, now)
    }
}

/// One-shot verification with an optional secret
pub fn verify_signature(
    body: &str,
    header: &str,
    secret: Option<&str>,
    tolerance_secs: i64,
    now: i64,
) -> Result<(), WebhookError> {
    WebhookVerifier::new(secret, tolerance_secs)?.verify(body, header, now)
}
