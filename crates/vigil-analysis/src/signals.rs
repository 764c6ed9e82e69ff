use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil_cache::{SignalCache, get_json, set_json, signal_key};
use vigil_core::{SignalLevel, SignalName, normalize_path, now_unix_seconds};
use vigil_store::{GraphStore, StoreError};

use crate::baseline::BaselineThresholds;
use crate::validator::SignalValidator;

pub const CO_CHANGE_PARTNER_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalResult {
    pub name: SignalName,
    pub file_path: String,
    pub value: f64,
    pub evidence_text: String,
    pub false_positive_rate: f64,
    pub signal_level: SignalLevel,
    pub computed_at: i64,
}

impl SignalResult {
    pub fn new(
        name: SignalName,
        file_path: &str,
        value: f64,
        signal_level: SignalLevel,
        evidence_text: String,
    ) -> Self {
        Self {
            name,
            file_path: file_path.to_owned(),
            value,
            evidence_text,
            false_positive_rate: 0.0,
            signal_level,
            computed_at: now_unix_seconds(),
        }
    }
}

/// What a signal evaluation produced. Unknown and disabled signals are absent
/// evidence, never an implicit LOW.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SignalOutcome {
    Known(SignalResult),
    Unknown { name: SignalName, reason: String },
    Disabled { name: SignalName },
}

impl SignalOutcome {
    pub fn name(&self) -> SignalName {
        match self {
            Self::Known(result) => result.name,
            Self::Unknown { name, .. } | Self::Disabled { name } => *name,
        }
    }

    pub fn result(&self) -> Option<&SignalResult> {
        match self {
            Self::Known(result) => Some(result),
            _ => None,
        }
    }

    pub fn level(&self) -> Option<SignalLevel> {
        self.result().map(|result| result.signal_level)
    }

    pub fn value(&self) -> Option<f64> {
        self.result().map(|result| result.value)
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Known(result) => result.evidence_text.clone(),
            Self::Unknown { reason, .. } => format!("unknown ({reason})"),
            Self::Disabled { .. } => "disabled after excessive false positives".to_owned(),
        }
    }
}

const CO_CHANGE_MEDIUM_FLOOR: f64 = 0.3;
const TEST_RATIO_LOW_FLOOR: f64 = 0.8;

/// HIGH exactly when the count crosses the escalation threshold; MEDIUM above half of it.
pub fn classify_coupling(count: u32, threshold: u32) -> SignalLevel {
    if count > threshold {
        SignalLevel::High
    } else if count > threshold / 2 {
        SignalLevel::Medium
    } else {
        SignalLevel::Low
    }
}

pub fn classify_co_change(max_frequency: f64, threshold: f64) -> SignalLevel {
    if max_frequency > threshold {
        SignalLevel::High
    } else if max_frequency > CO_CHANGE_MEDIUM_FLOOR.min(threshold) {
        SignalLevel::Medium
    } else {
        SignalLevel::Low
    }
}

/// Lower ratios are riskier: HIGH below the threshold, LOW from 0.8 (or the threshold if higher).
pub fn classify_test_ratio(ratio: f64, threshold: f64) -> SignalLevel {
    if ratio < threshold {
        SignalLevel::High
    } else if ratio < TEST_RATIO_LOW_FLOOR.max(threshold) {
        SignalLevel::Medium
    } else {
        SignalLevel::Low
    }
}

pub fn classify_ownership(days_since_transition: Option<i64>) -> SignalLevel {
    match days_since_transition {
        Some(days) if days < 30 => SignalLevel::High,
        Some(days) if days <= 90 => SignalLevel::Medium,
        _ => SignalLevel::Low,
    }
}

pub fn classify_incident_score(top_score: f64) -> SignalLevel {
    if top_score >= 10.0 {
        SignalLevel::High
    } else if top_score >= 5.0 {
        SignalLevel::Medium
    } else {
        SignalLevel::Low
    }
}

pub fn compute_coupling(
    graph: &dyn GraphStore,
    file_path: &str,
    thresholds: &BaselineThresholds,
) -> Result<SignalResult, StoreError> {
    let count = graph.coupling(file_path)?;
    Ok(SignalResult::new(
        SignalName::Coupling,
        file_path,
        f64::from(count),
        classify_coupling(count, thresholds.coupling),
        format!("{count} structurally dependent files"),
    ))
}

pub fn compute_co_change(
    graph: &dyn GraphStore,
    file_path: &str,
    thresholds: &BaselineThresholds,
) -> Result<SignalResult, StoreError> {
    let partners = graph.co_changed(file_path)?;
    let max_frequency = partners
        .iter()
        .map(|partner| partner.frequency)
        .fold(0.0f64, f64::max);

    let evidence_text = if partners.is_empty() {
        "no files frequently change alongside this one".to_owned()
    } else {
        let top = partners
            .iter()
            .take(CO_CHANGE_PARTNER_LIMIT)
            .map(|partner| {
                format!(
                    "{} ({:.0}%, {} commits)",
                    partner.path,
                    partner.frequency * 100.0,
                    partner.co_change_count
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("changes together with {top}")
    };

    Ok(SignalResult::new(
        SignalName::CoChange,
        file_path,
        max_frequency,
        classify_co_change(max_frequency, thresholds.co_change),
        evidence_text,
    ))
}

pub fn compute_test_ratio(
    graph: &dyn GraphStore,
    file_path: &str,
    thresholds: &BaselineThresholds,
) -> Result<SignalResult, StoreError> {
    let record = graph.test_ratio(file_path)?;
    let evidence_text = if record.test_files.is_empty() {
        format!("no linked test files ({:.2} test ratio)", record.ratio)
    } else {
        format!(
            "test ratio {:.2} ({} test LOC / {} source LOC across {} test files)",
            record.ratio,
            record.test_loc,
            record.source_loc,
            record.test_files.len()
        )
    };
    Ok(SignalResult::new(
        SignalName::TestRatio,
        file_path,
        record.ratio,
        classify_test_ratio(record.ratio, thresholds.test_ratio),
        evidence_text,
    ))
}

/// Shared cache-or-compute path for every signal.
pub struct SignalComputer {
    graph: Arc<dyn GraphStore>,
    cache: Arc<dyn SignalCache>,
    validator: SignalValidator,
    thresholds: BaselineThresholds,
    ttl: Duration,
}

impl SignalComputer {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        cache: Arc<dyn SignalCache>,
        validator: SignalValidator,
        ttl: Duration,
    ) -> Self {
        Self {
            graph,
            cache,
            validator,
            thresholds: BaselineThresholds::default(),
            ttl,
        }
    }

    /// Classifies baseline signals against these thresholds instead of the defaults.
    pub fn with_thresholds(mut self, thresholds: BaselineThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn thresholds(&self) -> &BaselineThresholds {
        &self.thresholds
    }

    pub fn graph(&self) -> &dyn GraphStore {
        self.graph.as_ref()
    }

    pub fn validator(&self) -> &SignalValidator {
        &self.validator
    }

    pub fn evaluate_baseline(&self, name: SignalName, file_path: &str) -> SignalOutcome {
        let graph = self.graph.as_ref();
        let thresholds = &self.thresholds;
        match name {
            SignalName::Coupling => {
                self.evaluate(name, file_path, || compute_coupling(graph, file_path, thresholds))
            }
            SignalName::CoChange => {
                self.evaluate(name, file_path, || compute_co_change(graph, file_path, thresholds))
            }
            SignalName::TestRatio => {
                self.evaluate(name, file_path, || compute_test_ratio(graph, file_path, thresholds))
            }
            other => SignalOutcome::Unknown {
                name: other,
                reason: "not a baseline signal".to_owned(),
            },
        }
    }

    /// Skips disabled signals, serves cache hits, and retries a transient
    /// store failure once before reporting the signal as unknown. The
    /// false-positive rate is always read fresh from the validator.
    pub fn evaluate<F>(&self, name: SignalName, file_path: &str, compute: F) -> SignalOutcome
    where
        F: Fn() -> Result<SignalResult, StoreError>,
    {
        if !self.validator.is_enabled(name) {
            return SignalOutcome::Disabled { name };
        }

        let file_path = normalize_path(file_path);
        let key = signal_key(name, &file_path);
        match get_json::<SignalResult>(self.cache.as_ref(), &key) {
            Ok(Some(mut cached)) => {
                cached.false_positive_rate = self.validator.false_positive_rate(name);
                return SignalOutcome::Known(cached);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(signal = %name, file = %file_path, error = %err, "signal cache read failed");
            }
        }

        let computed = match compute() {
            Err(err) if err.is_transient() => {
                tracing::debug!(signal = %name, file = %file_path, error = %err, "retrying transient graph failure");
                compute()
            }
            other => other,
        };

        match computed {
            Ok(mut result) => {
                result.false_positive_rate = self.validator.false_positive_rate(name);
                if let Err(err) = set_json(self.cache.as_ref(), &key, &result, self.ttl) {
                    tracing::warn!(signal = %name, file = %file_path, error = %err, "signal cache write failed");
                }
                SignalOutcome::Known(result)
            }
            Err(err) => {
                tracing::warn!(signal = %name, file = %file_path, error = %err, "signal unavailable");
                SignalOutcome::Unknown {
                    name,
                    reason: err.to_string(),
                }
            }
        }
    }
}
