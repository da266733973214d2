//! Stable per-install device identifier
//!
//! Generated once, kept in the fast store, and sent to the billing service as
//! the correlation key. A reinstall produces a new id; the trial ledger, not
//! the device id, is what survives reinstallation.

use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::storage::{keys, KeyValueStore};

pub struct DeviceIdentityProvider {
    store: Arc<dyn KeyValueStore>,
    cached: OnceCell<String>,
}

impl DeviceIdentityProvider {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            cached: OnceCell::new(),
        }
    }

    /// Return the device id, creating and persisting one on first use
    pub fn device_id(&self) -> &str {
        self.cached.get_or_init(|| self.load_or_create())
    }

    fn load_or_create(&self) -> String {
        match self.store.get(keys::DEVICE_ID) {
            Ok(Some(id)) if !id.trim().is_empty() => return id,
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not read device id, generating a new one"),
        }

        let id = Uuid::new_v4().to_string();
        if let Err(e) = self.store.set(keys::DEVICE_ID, &id) {
            // Still usable for this process; a later launch will mint another
            warn!(error = %e, "Failed to persist device id");
        }
        info!(device_id = %id, "Generated new device id");
        id
    }
}
