//! Error types for user-initiated entitlement actions
//!
//! Read paths (status, quota checks) never return these: they degrade to
//! defaults. Only redemption, checkout and explicit billing calls surface them.

use std::time::Duration;
use thiserror::Error;

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum EntitlementError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Billing service returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Malformed response from billing service: {0}")]
    MalformedResponse(String),

    #[error("Activation code rejected: {0}")]
    ActivationRejected(String),

    #[error("Checkout not complete (status: {0})")]
    CheckoutIncomplete(String),

    #[error("No Stripe subscription is linked to this device")]
    NotLinked,

    #[error("Too many attempts, try again later")]
    RateLimited,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EntitlementError {
    /// Transport-level failures, the class reconciliation treats as fail-open
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::Http { .. } | Self::MalformedResponse(_)
        )
    }
}

pub type EntitlementResult<T> = Result<T, EntitlementError>;
