use std::sync::Arc;

use tracing::{info, warn};

use crate::error::CoreError;
use crate::model::*;
use crate::store::Store;

/// Typed access to the expiration policy row.
#[derive(Clone)]
pub struct SettingsStore {
    store: Arc<Store>,
}

impl SettingsStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Never fails: with no stored row this is the safe default
    /// (enabled, two hours).
    pub async fn get_policy(&self) -> ExpirationPolicy {
        self.store.settings.read().await.effective_policy()
    }

    /// Validate and persist a new policy. On error the stored policy is untouched.
    pub async fn set_policy(&self, update: PolicyUpdate) -> Result<ExpirationPolicy, CoreError> {
        let hours = ExpirationHours::try_from(update.expiration_hours).map_err(|h| {
            CoreError::Validation(format!(
                "expiration hours must be one of {:?}, got {h}",
                ExpirationHours::ALLOWED
            ))
        })?;

        let _gate = self.store.gate.read().await;
        let mut settings = self.store.settings.write().await;
        let event = Event::PolicyUpdated {
            enabled: update.enabled,
            expiration_hours: hours,
        };
        self.store.wal_append(&event).await?;
        settings.apply(&event);
        info!(
            "expiration policy set: enabled={} hours={}",
            update.enabled,
            hours.hours()
        );
        Ok(settings.effective_policy())
    }

    /// Best effort: a lost timestamp never fails the run that produced it.
    pub async fn record_run(&self, at: Ms) {
        let _gate = self.store.gate.read().await;
        let mut settings = self.store.settings.write().await;
        let event = Event::RunRecorded { at };
        match self.store.wal_append(&event).await {
            Ok(()) => settings.apply(&event),
            Err(e) => warn!("could not record expiration run at {at}: {e}"),
        }
    }

    pub async fn last_run_at(&self) -> Option<Ms> {
        self.store.settings.read().await.last_run_at
    }
}
