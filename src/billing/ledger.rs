//! Reinstall-resistant record of trial consumption
//!
//! The marker lives only in the secure store, which survives uninstall. It is
//! a deterrent, not a security boundary: unreadable storage counts as "never
//! used" and failed writes are logged and ignored.

use std::sync::Arc;
use tracing::{error, info, warn};

use super::resolver;
use super::types::{AbuseMarker, TrialRecord};
use crate::storage::{keys, StoreTier, Stores};
use crate::utils::Clock;

pub struct TrialLedger {
    stores: Stores,
    clock: Arc<dyn Clock>,
}

impl TrialLedger {
    pub fn new(stores: Stores, clock: Arc<dyn Clock>) -> Self {
        Self { stores, clock }
    }

    /// Current marker; read failures fail open to "not used"
    pub fn marker(&self) -> AbuseMarker {
        match self.stores.secure.get(keys::TRIAL_ABUSE_MARKER) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "Trial marker is corrupted, assuming trial never used");
                AbuseMarker::default()
            }),
            Ok(None) => AbuseMarker::default(),
            Err(e) => {
                warn!(error = %e, "Secure store unreadable, assuming trial never used");
                AbuseMarker::default()
            }
        }
    }

    /// Record that this device's trial grant has been consumed
    ///
    /// Returns whether the marker is now persisted. An existing marker keeps
    /// its original timestamp.
    pub fn mark_trial_used(&self) -> bool {
        if self.marker().ever_used {
            return true;
        }

        let marker = AbuseMarker::used_at(self.clock.now());
        match self
            .stores
            .save(StoreTier::Secure, keys::TRIAL_ABUSE_MARKER, &marker)
        {
            Ok(()) => {
                info!(marked_at = ?marker.marked_at, "Marked trial as used");
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to write trial marker");
                false
            }
        }
    }

    /// Marker combined with the local trial record
    pub fn is_trial_blocked(&self, trial: &TrialRecord) -> bool {
        resolver::is_trial_blocked(trial, &self.marker(), self.clock.now())
    }

    /// Remove the marker; debug builds and tests only
    #[cfg(any(test, feature = "debug-reset"))]
    pub fn reset_for_testing(&self) {
        if let Err(e) = self.stores.secure.remove(keys::TRIAL_ABUSE_MARKER) {
            warn!(error = %e, "Failed to clear trial marker");
        }
    }
}
