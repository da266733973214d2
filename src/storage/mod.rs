//! Key/value persistence with two survivability tiers
//!
//! - fast tier: ordinary app storage, wiped on uninstall (SQLite)
//! - secure tier: OS keychain, survives uninstall/reinstall
//!
//! Records are stored as JSON strings. A record that fails to decode reads as
//! absent; callers fall back to the record's default.

mod keychain;
mod memory;
mod sqlite;

pub use keychain::KeychainStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Fast-tier record keys
pub mod keys {
    pub const DEVICE_ID: &str = "device_id";
    pub const TRIAL: &str = "trial";
    pub const PREMIUM: &str = "premium";
    pub const STRIPE_LINKAGE: &str = "stripe_linkage";
    pub const PROMO_REDEMPTION: &str = "promo_redemption";

    /// Secure-tier keys
    pub const TRIAL_ABUSE_MARKER: &str = "trial_abuse_marker";
    pub const STRIPE_CUSTOMER_ID: &str = "stripe_customer_id";
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to read '{key}': {reason}")]
    Read { key: String, reason: String },
    #[error("Failed to write '{key}': {reason}")]
    Write { key: String, reason: String },
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Minimal string key/value store
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Which tier a store belongs to, for log fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreTier {
    Fast,
    Secure,
}

impl std::fmt::Display for StoreTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Secure => write!(f, "secure"),
        }
    }
}

/// The two stores injected into the engine
#[derive(Clone)]
pub struct Stores {
    pub fast: Arc<dyn KeyValueStore>,
    pub secure: Arc<dyn KeyValueStore>,
}

impl Stores {
    pub fn new(fast: Arc<dyn KeyValueStore>, secure: Arc<dyn KeyValueStore>) -> Self {
        Self { fast, secure }
    }

    /// Both tiers in memory
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }

    pub fn tier(&self, tier: StoreTier) -> &dyn KeyValueStore {
        match tier {
            StoreTier::Fast => self.fast.as_ref(),
            StoreTier::Secure => self.secure.as_ref(),
        }
    }

    /// Read and decode a record; read and decode failures are errors
    ///
    /// Use before a read-modify-write so a failed read never overwrites the
    /// stored record with a default.
    pub fn try_load<T: DeserializeOwned>(
        &self,
        tier: StoreTier,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        let Some(raw) = self.tier(tier).get(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StorageError::Read {
                key: key.to_string(),
                reason: format!("malformed record: {}", e),
            })
    }

    /// Read and decode a record, treating read and decode failures as absent
    pub fn load<T: DeserializeOwned>(&self, tier: StoreTier, key: &str) -> Option<T> {
        self.try_load(tier, key).unwrap_or_else(|e| {
            warn!(key, %tier, error = %e, "Store read failed, treating record as absent");
            None
        })
    }

    /// Encode and write a record
    pub fn save<T: Serialize>(
        &self,
        tier: StoreTier,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value).map_err(|e| StorageError::Write {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.tier(tier).set(key, &raw)
    }
}
