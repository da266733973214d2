//! Message quota consumption
//!
//! Trial messages count against one 15-message pool; premium messages count
//! against a calendar-month allowance that resets lazily on the first write
//! of a new month. Consumption is serialized per tracker so the
//! check-then-increment cannot overshoot a quota.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::client::{BillingApi, TrialStartedRequest};
use super::ledger::TrialLedger;
use super::records::RecordStore;
use super::resolver;
use super::types::{EntitlementFacts, PremiumRecord, TrialRecord};
use crate::security::DeviceIdentityProvider;
use crate::storage::StorageError;
use crate::utils::{period_key, Clock};

pub struct QuotaTracker {
    records: RecordStore,
    ledger: Arc<TrialLedger>,
    device: Arc<DeviceIdentityProvider>,
    api: Option<Arc<dyn BillingApi>>,
    clock: Arc<dyn Clock>,
    consume_lock: Mutex<()>,
}

impl QuotaTracker {
    pub fn new(
        records: RecordStore,
        ledger: Arc<TrialLedger>,
        device: Arc<DeviceIdentityProvider>,
        api: Option<Arc<dyn BillingApi>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            records,
            ledger,
            device,
            api,
            clock,
            consume_lock: Mutex::new(()),
        }
    }

    /// Current facts from both stores
    pub fn snapshot(&self) -> EntitlementFacts {
        EntitlementFacts {
            trial: self.records.trial(),
            premium: self.records.premium(),
            abuse_marker: self.ledger.marker(),
        }
    }

    /// Facts for a read-modify-write: fast-store failures are errors
    ///
    /// The abuse marker still fails open.
    fn try_snapshot(&self) -> Result<EntitlementFacts, StorageError> {
        Ok(EntitlementFacts {
            trial: self.records.try_trial()?,
            premium: self.records.try_premium()?,
            abuse_marker: self.ledger.marker(),
        })
    }

    /// Consume one message if the device is entitled to it
    ///
    /// Returns false without touching any record when not entitled, when the
    /// current records cannot be read, or when the updated record could not
    /// be written.
    pub async fn consume_message(&self) -> bool {
        let _guard = self.consume_lock.lock().await;

        let now = self.clock.now();
        let facts = match self.try_snapshot() {
            Ok(facts) => facts,
            Err(e) => {
                error!(error = %e, "Could not read usage records, refusing message");
                return false;
            }
        };
        let status = resolver::resolve_status(&facts, now);

        if !resolver::can_send_message(&facts, now) {
            debug!(%status, "Message refused");
            return false;
        }

        if status.is_premium() {
            self.consume_premium(facts.premium, now)
        } else {
            self.consume_trial(facts.trial, now)
        }
    }

    fn consume_premium(&self, mut premium: PremiumRecord, now: DateTime<Utc>) -> bool {
        let current_period = period_key(now);
        if premium.period_key != current_period {
            info!(
                previous = %premium.period_key,
                current = %current_period,
                "New billing month, resetting premium usage"
            );
            premium.period_key = current_period;
            premium.messages_used_this_period = 0;
        }
        premium.messages_used_this_period += 1;

        if let Err(e) = self.records.save_premium(&premium) {
            error!(error = %e, "Failed to record premium message");
            return false;
        }
        debug!(used = premium.messages_used_this_period, "Premium message consumed");
        true
    }

    fn consume_trial(&self, mut trial: TrialRecord, now: DateTime<Utc>) -> bool {
        let starting = !trial.is_started();
        if starting {
            trial.start_date = Some(now);
        }
        trial.messages_used += 1;

        if let Err(e) = self.records.save_trial(&trial) {
            error!(error = %e, "Failed to record trial message");
            return false;
        }

        if starting {
            info!(device_id = %self.device.device_id(), "Trial started");
            self.report_trial_started(now);
        }

        // Marked with the message that crosses the limit, not on a later read
        if trial.is_exhausted(now) {
            info!(used = trial.messages_used, "Trial exhausted");
            self.ledger.mark_trial_used();
        }
        true
    }

    /// Tell the billing service a trial began, without waiting on it
    fn report_trial_started(&self, started_at: DateTime<Utc>) {
        let Some(api) = self.api.clone() else {
            return;
        };
        let request = TrialStartedRequest {
            device_id: self.device.device_id().to_string(),
            started_at,
        };

        tokio::spawn(async move {
            if let Err(e) = api.report_trial_started(&request).await {
                warn!(error = %e, "Failed to report trial start");
            }
        });
    }
}
