//! Device-scoped entitlements for metered chat messages
//!
//! A trial (3 days or 15 messages, once per device) or a premium plan
//! (150 messages per calendar month) decides whether the next message may be
//! sent. Premium comes from Stripe checkout, promo codes or activation codes.

pub mod billing;
pub mod config;
pub mod error;
pub mod rate_limit;
pub mod security;
pub mod storage;
pub mod utils;

pub use billing::{
    BillingApi, CheckoutActivation, EntitlementEngine, EntitlementStatus, EntitlementSummary,
    HttpBillingClient, LimitCheckResult, LimitDenialReason, PromoOutcome, PromoRejection,
    SyncOutcome,
};
pub use config::EntitlementConfig;
pub use error::{EntitlementError, EntitlementResult};
pub use security::{sign_payload, WebhookError, WebhookEvent, WebhookVerifier};
pub use storage::{KeyValueStore, Stores};

use tracing_subscriber::EnvFilter;

/// Install a `RUST_LOG`-driven subscriber for hosts that have none
///
/// Default: warn for dependencies, info for the engine. A subscriber that is
/// already installed is left in place.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,chat_entitlements=info")),
        )
        .try_init();
}
