use std::sync::Arc;

use thiserror::Error;
use vigil_config::ValidatorConfig;
use vigil_core::{SignalName, now_unix_seconds};
use vigil_store::{DisablePolicy, SignalStat, SignalStatStore, StoreError};

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("validator store error: {0}")]
    Store(#[from] StoreError),
}

/// Tracks per-signal feedback and switches off signals that are too noisy.
#[derive(Clone)]
pub struct SignalValidator {
    store: Arc<dyn SignalStatStore>,
    policy: DisablePolicy,
}

impl SignalValidator {
    pub fn new(store: Arc<dyn SignalStatStore>, policy: DisablePolicy) -> Self {
        Self { store, policy }
    }

    pub fn from_config(store: Arc<dyn SignalStatStore>, config: &ValidatorConfig) -> Self {
        Self::new(
            store,
            DisablePolicy {
                min_uses: config.min_uses,
                max_fp_rate: config.max_fp_rate,
            },
        )
    }

    pub fn policy(&self) -> DisablePolicy {
        self.policy
    }

    pub fn record_feedback(
        &self,
        name: SignalName,
        was_false_positive: bool,
        reason: Option<&str>,
    ) -> Result<SignalStat, ValidatorError> {
        let reason = reason.map(str::trim).filter(|value| !value.is_empty());
        let before = self.store.signal_stat(name)?.map(|stat| stat.enabled);
        let stat = self.store.record_outcome(
            name,
            was_false_positive,
            reason,
            self.policy,
            now_unix_seconds(),
        )?;

        if before != Some(false) && !stat.enabled {
            tracing::warn!(
                signal = %name,
                total_uses = stat.total_uses,
                fp_rate = stat.fp_rate,
                "signal disabled after exceeding false-positive threshold"
            );
        } else {
            tracing::debug!(
                signal = %name,
                total_uses = stat.total_uses,
                fp_rate = stat.fp_rate,
                "recorded signal feedback"
            );
        }
        Ok(stat)
    }

    /// Hot-path check. Storage failures leave the signal enabled.
    pub fn is_enabled(&self, name: SignalName) -> bool {
        match self.store.signal_stat(name) {
            Ok(stat) => stat.is_none_or(|stat| stat.enabled),
            Err(err) => {
                tracing::warn!(signal = %name, error = %err, "signal stat lookup failed, assuming enabled");
                true
            }
        }
    }

    pub fn false_positive_rate(&self, name: SignalName) -> f64 {
        match self.store.signal_stat(name) {
            Ok(stat) => stat.map(|stat| stat.fp_rate).unwrap_or(0.0),
            Err(err) => {
                tracing::debug!(signal = %name, error = %err, "signal stat lookup failed");
                0.0
            }
        }
    }

    pub fn set_enabled(&self, name: SignalName, enabled: bool) -> Result<SignalStat, ValidatorError> {
        let stat = self
            .store
            .set_signal_enabled(name, enabled, now_unix_seconds())?;
        tracing::info!(signal = %name, enabled, "signal enablement changed manually");
        Ok(stat)
    }

    pub fn signal_stat(&self, name: SignalName) -> Result<Option<SignalStat>, ValidatorError> {
        Ok(self.store.signal_stat(name)?)
    }

    pub fn list_signal_stats(&self) -> Result<Vec<SignalStat>, ValidatorError> {
        Ok(self.store.list_signal_stats()?)
    }
}
