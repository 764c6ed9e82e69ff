use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use vigil_config::BaselineConfig;
use vigil_core::{RiskLevel, SignalName, normalize_path};

use crate::AnalysisError;
use crate::signals::{SignalComputer, SignalOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaselineThresholds {
    pub coupling: u32,
    pub co_change: f64,
    pub test_ratio: f64,
}

impl Default for BaselineThresholds {
    fn default() -> Self {
        Self::from(&BaselineConfig::default())
    }
}

impl From<&BaselineConfig> for BaselineThresholds {
    fn from(config: &BaselineConfig) -> Self {
        Self {
            coupling: config.coupling_threshold,
            co_change: config.co_change_threshold,
            test_ratio: config.test_ratio_threshold,
        }
    }
}

/// OR of the three threshold checks over known values only.
pub fn should_escalate(thresholds: &BaselineThresholds, outcomes: &[SignalOutcome]) -> bool {
    outcomes.iter().any(|outcome| {
        let Some(value) = outcome.value() else {
            return false;
        };
        match outcome.name() {
            SignalName::Coupling => value > f64::from(thresholds.coupling),
            SignalName::CoChange => value > thresholds.co_change,
            SignalName::TestRatio => value < thresholds.test_ratio,
            SignalName::OwnershipChurn | SignalName::IncidentSimilarity => false,
        }
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineReport {
    pub file_path: String,
    pub risk_level: RiskLevel,
    pub escalate: bool,
    pub signals: Vec<SignalOutcome>,
}

impl BaselineReport {
    pub fn known_fraction(&self) -> f64 {
        if self.signals.is_empty() {
            return 0.0;
        }
        let known = self.signals.iter().filter(|outcome| outcome.is_known()).count();
        known as f64 / self.signals.len() as f64
    }

    pub fn high_count(&self) -> usize {
        self.signals
            .iter()
            .filter(|outcome| outcome.level() == Some(RiskLevel::High))
            .count()
    }
}

/// Escalates against the same thresholds the computer classifies with, so a
/// HIGH baseline signal always escalates.
pub struct BaselineEvaluator {
    computer: Arc<SignalComputer>,
    signal_timeout: Duration,
}

impl BaselineEvaluator {
    pub fn new(computer: Arc<SignalComputer>, signal_timeout: Duration) -> Self {
        Self {
            computer,
            signal_timeout,
        }
    }

    pub fn thresholds(&self) -> &BaselineThresholds {
        self.computer.thresholds()
    }

    /// Runs the baseline signals concurrently. A signal that misses the join
    /// deadline becomes unknown; cancellation aborts whatever is still pending.
    pub async fn evaluate(
        &self,
        file_path: &str,
        cancel: &CancellationToken,
    ) -> Result<BaselineReport, AnalysisError> {
        let file_path = normalize_path(file_path);
        if file_path.is_empty() {
            return Err(AnalysisError::Message("empty file path".to_owned()));
        }

        let mut handles: Vec<(SignalName, JoinHandle<SignalOutcome>)> = SignalName::BASELINE
            .into_iter()
            .map(|name| {
                let computer = Arc::clone(&self.computer);
                let file = file_path.clone();
                let handle = tokio::task::spawn_blocking(move || {
                    computer.evaluate_baseline(name, &file)
                });
                (name, handle)
            })
            .collect();

        let deadline = Instant::now() + self.signal_timeout;
        let joined = async {
            let mut outcomes = Vec::with_capacity(handles.len());
            for (name, handle) in handles.iter_mut() {
                let outcome = match timeout_at(deadline, &mut *handle).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(err)) => SignalOutcome::Unknown {
                        name: *name,
                        reason: format!("signal task failed: {err}"),
                    },
                    Err(_) => {
                        handle.abort();
                        tracing::warn!(
                            signal = %name,
                            timeout_ms = self.signal_timeout.as_millis() as u64,
                            "baseline signal timed out"
                        );
                        SignalOutcome::Unknown {
                            name: *name,
                            reason: format!(
                                "timed out after {}ms",
                                self.signal_timeout.as_millis()
                            ),
                        }
                    }
                };
                outcomes.push(outcome);
            }
            outcomes
        };

        let outcomes = tokio::select! {
            _ = cancel.cancelled() => None,
            outcomes = joined => Some(outcomes),
        };
        let Some(signals) = outcomes else {
            for (_, handle) in &handles {
                handle.abort();
            }
            return Err(AnalysisError::Cancelled);
        };

        let escalate = should_escalate(self.thresholds(), &signals);
        let risk_level = if escalate { RiskLevel::High } else { RiskLevel::Low };
        tracing::debug!(file = %file_path, escalate, "baseline evaluated");

        Ok(BaselineReport {
            file_path,
            risk_level,
            escalate,
            signals,
        })
    }
}
