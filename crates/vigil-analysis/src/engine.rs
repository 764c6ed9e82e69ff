use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vigil_cache::{
    CacheInvalidator, MemoryCache, NoopCache, SignalCache, get_json, set_json, trace_key,
};
use vigil_config::{VigilConfig, load_workspace_config};
use vigil_core::{RiskLevel, SignalName, normalize_path, now_millis, stable_id};
use vigil_infer::{ProviderOverrides, ReasoningClient, ReasoningService, load_reasoner};
use vigil_store::{
    GraphStore, IncidentSearch, SignalStat, SignalStatStore, SqliteGraphStore,
    SqliteIncidentSearch, SqliteSignalStatStore,
};

use crate::AnalysisError;
use crate::baseline::{BaselineEvaluator, BaselineReport, BaselineThresholds};
use crate::coupling::{CouplingBuildOutcome, CouplingBuilder};
use crate::evidence::{EvidenceItem, EvidenceKind};
use crate::investigation::{
    FinalizeReason, HopTrace, InvestigationAgent, InvestigationOutcome, SynthesisSource,
};
use crate::ondemand::OnDemandCalculator;
use crate::signals::{SignalComputer, SignalOutcome};
use crate::synthesis::{DegradedCause, degraded_synthesis};
use crate::validator::SignalValidator;

/// Collaborators the engine is assembled from.
pub struct EngineParts {
    pub graph: Arc<dyn GraphStore>,
    pub cache: Arc<dyn SignalCache>,
    pub stats: Arc<dyn SignalStatStore>,
    pub search: Arc<dyn IncidentSearch>,
    /// `None` runs the engine in degraded mode.
    pub reasoner: Option<Arc<dyn ReasoningService>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAssessment {
    pub file_path: String,
    /// Baseline tier verdict, LOW or HIGH.
    pub risk_level: RiskLevel,
    pub escalate: bool,
    pub signals: Vec<SignalOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationSummary {
    pub finalize_reason: FinalizeReason,
    pub source: SynthesisSource,
    pub hops: Vec<HopTrace>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub request_id: String,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub files: Vec<FileAssessment>,
    pub evidence_chain: Vec<EvidenceItem>,
    pub key_evidence: Vec<String>,
    pub recommendations: Vec<String>,
    pub reasoning_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub investigation: Option<InvestigationSummary>,
    pub degraded: bool,
}

/// What is kept after a request for later inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentTrace {
    pub request_id: String,
    pub files: Vec<String>,
    pub risk_level: RiskLevel,
    pub evidence_chain: Vec<EvidenceItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub investigation: Option<InvestigationSummary>,
}

pub struct RiskEngine {
    config: VigilConfig,
    baseline: BaselineEvaluator,
    agent: Option<InvestigationAgent>,
    validator: SignalValidator,
    cache: Arc<dyn SignalCache>,
    invalidator: CacheInvalidator,
    trace_ttl: Duration,
    request_counter: AtomicU64,
}

impl RiskEngine {
    pub fn new(config: &VigilConfig, parts: EngineParts) -> Self {
        let trace_ttl = Duration::from_secs(config.cache.signal_ttl_secs);
        let validator = SignalValidator::from_config(parts.stats, &config.validator);
        let computer = Arc::new(
            SignalComputer::new(
                Arc::clone(&parts.graph),
                Arc::clone(&parts.cache),
                validator.clone(),
                trace_ttl,
            )
            .with_thresholds(BaselineThresholds::from(&config.baseline)),
        );
        let baseline = BaselineEvaluator::new(
            Arc::clone(&computer),
            Duration::from_millis(config.baseline.signal_timeout_ms),
        );

        let agent = match (config.investigation.enabled, parts.reasoner) {
            (true, Some(service)) => {
                let calculator = Arc::new(OnDemandCalculator::from_config(
                    Arc::clone(&computer),
                    parts.search,
                    config,
                ));
                Some(InvestigationAgent::new(
                    ReasoningClient::new(
                        service,
                        Duration::from_millis(config.investigation.call_timeout_ms),
                    ),
                    calculator,
                    Arc::clone(&parts.graph),
                    config.investigation.max_hops,
                    Duration::from_millis(config.investigation.budget_ms),
                ))
            }
            _ => None,
        };

        Self {
            config: config.clone(),
            baseline,
            agent,
            validator,
            invalidator: CacheInvalidator::new(Arc::clone(&parts.cache)),
            cache: parts.cache,
            trace_ttl,
            request_counter: AtomicU64::new(0),
        }
    }

    /// Wires the SQLite-backed stores under `.vigil/` and the configured
    /// reasoning provider. A provider that fails to load leaves the engine in
    /// degraded mode.
    pub fn open(workspace_root: impl AsRef<Path>) -> Result<Self, AnalysisError> {
        let workspace_root = workspace_root.as_ref();
        let config = load_workspace_config(workspace_root)?;

        let graph = SqliteGraphStore::open(workspace_root)?;
        let search = SqliteIncidentSearch::new(graph.clone());
        let stats = SqliteSignalStatStore::open(workspace_root)?;
        let cache: Arc<dyn SignalCache> = if config.cache.enabled {
            Arc::new(MemoryCache::new())
        } else {
            Arc::new(NoopCache)
        };
        let reasoner = match load_reasoner(&config.inference, ProviderOverrides::default()) {
            Ok(loaded) => loaded.map(|loaded| loaded.service),
            Err(err) => {
                tracing::warn!(error = %err, "reasoning service unavailable, running degraded");
                None
            }
        };

        Ok(Self::new(
            &config,
            EngineParts {
                graph: Arc::new(graph),
                cache,
                stats: Arc::new(stats),
                search: Arc::new(search),
                reasoner,
            },
        ))
    }

    pub fn config(&self) -> &VigilConfig {
        &self.config
    }

    pub fn validator(&self) -> &SignalValidator {
        &self.validator
    }

    pub fn invalidator(&self) -> &CacheInvalidator {
        &self.invalidator
    }

    pub fn is_degraded(&self) -> bool {
        self.agent.is_none()
    }

    pub async fn assess(
        &self,
        files: &[String],
        cancel: &CancellationToken,
    ) -> Result<RiskAssessment, AnalysisError> {
        let files = files
            .iter()
            .map(|file| normalize_path(file))
            .filter(|file| !file.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        if files.is_empty() {
            return Err(AnalysisError::Message("no changed files to assess".to_owned()));
        }

        let request_id = self.next_request_id(&files);
        let started = Instant::now();
        let mut file_assessments = Vec::with_capacity(files.len());
        let mut reports = Vec::with_capacity(files.len());

        for file in &files {
            if cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }
            match self.baseline.evaluate(file, cancel).await {
                Ok(report) => {
                    file_assessments.push(FileAssessment {
                        file_path: report.file_path.clone(),
                        risk_level: report.risk_level,
                        escalate: report.escalate,
                        signals: report.signals.clone(),
                        error: None,
                    });
                    reports.push(report);
                }
                Err(AnalysisError::Cancelled) => return Err(AnalysisError::Cancelled),
                Err(err) => {
                    tracing::warn!(file = %file, error = %err, "baseline evaluation failed");
                    file_assessments.push(FileAssessment {
                        file_path: file.clone(),
                        risk_level: RiskLevel::Low,
                        escalate: false,
                        signals: Vec::new(),
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        let escalated = reports.iter().any(|report| report.escalate);
        tracing::info!(
            request_id = %request_id,
            files = files.len(),
            escalated,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "baseline evaluation complete"
        );

        // Without a reasoning service every answer is the zero-confidence heuristic.
        let mut assessment = match &self.agent {
            None => {
                let cause = if self.config.investigation.enabled {
                    DegradedCause::ServiceUnavailable
                } else {
                    DegradedCause::InvestigationDisabled
                };
                degraded_assessment(&request_id, &reports, cause)
            }
            Some(_) if !escalated => self.quiet_assessment(&request_id, &reports),
            Some(agent) => {
                let investigated = reports
                    .iter()
                    .filter(|report| report.escalate)
                    .cloned()
                    .collect::<Vec<_>>();
                let outcome = agent.run(investigated, cancel).await?;
                investigated_assessment(&request_id, outcome)
            }
        };
        assessment.files = file_assessments;

        self.store_trace(&assessment);
        tracing::info!(
            request_id = %request_id,
            risk = %assessment.risk_level,
            confidence = assessment.confidence,
            degraded = assessment.degraded,
            "risk assessment complete"
        );
        Ok(assessment)
    }

    /// Feedback never fails the caller; a lost write is only logged.
    pub fn record_feedback(
        &self,
        name: SignalName,
        was_false_positive: bool,
        reason: Option<&str>,
    ) -> Option<SignalStat> {
        match self.validator.record_feedback(name, was_false_positive, reason) {
            Ok(stat) => Some(stat),
            Err(err) => {
                tracing::warn!(signal = %name, error = %err, "failed to record signal feedback");
                None
            }
        }
    }

    pub fn set_signal_enabled(&self, name: SignalName, enabled: bool) -> Result<SignalStat, AnalysisError> {
        Ok(self.validator.set_enabled(name, enabled)?)
    }

    pub fn signal_stats(&self) -> Result<Vec<SignalStat>, AnalysisError> {
        Ok(self.validator.list_signal_stats()?)
    }

    /// Runs an incremental coupling update and drops the co-change keys it staled.
    pub fn refresh_coupling(
        &self,
        builder: &CouplingBuilder,
        now_unix: i64,
    ) -> Result<CouplingBuildOutcome, AnalysisError> {
        let outcome = builder.update_incremental(now_unix)?;
        self.invalidator.on_coupling_rebuilt(&outcome.affected_files);
        Ok(outcome)
    }

    pub fn cached_trace(&self, request_id: &str) -> Option<AssessmentTrace> {
        match get_json::<AssessmentTrace>(self.cache.as_ref(), &trace_key(request_id)) {
            Ok(trace) => trace,
            Err(err) => {
                tracing::warn!(request_id, error = %err, "failed to read cached trace");
                None
            }
        }
    }

    fn quiet_assessment(&self, request_id: &str, reports: &[BaselineReport]) -> RiskAssessment {
        let confidence = if reports.is_empty() {
            0.0
        } else {
            reports.iter().map(BaselineReport::known_fraction).sum::<f64>() / reports.len() as f64
        };
        RiskAssessment {
            request_id: request_id.to_owned(),
            risk_level: RiskLevel::Low,
            confidence,
            files: Vec::new(),
            evidence_chain: baseline_evidence(reports),
            key_evidence: Vec::new(),
            recommendations: Vec::new(),
            reasoning_text: "No baseline signal crossed an escalation threshold.".to_owned(),
            investigation: None,
            degraded: false,
        }
    }

    fn store_trace(&self, assessment: &RiskAssessment) {
        let trace = AssessmentTrace {
            request_id: assessment.request_id.clone(),
            files: assessment
                .files
                .iter()
                .map(|file| file.file_path.clone())
                .collect(),
            risk_level: assessment.risk_level,
            evidence_chain: assessment.evidence_chain.clone(),
            investigation: assessment.investigation.clone(),
        };
        if let Err(err) = set_json(
            self.cache.as_ref(),
            &trace_key(&assessment.request_id),
            &trace,
            self.trace_ttl,
        ) {
            tracing::warn!(request_id = %assessment.request_id, error = %err, "failed to cache trace");
        }
    }

    fn next_request_id(&self, files: &[String]) -> String {
        let counter = self.request_counter.fetch_add(1, Ordering::SeqCst).to_string();
        let millis = now_millis().to_string();
        let joined = files.join("\n");
        stable_id(&[joined.as_str(), millis.as_str(), counter.as_str()])
    }
}

fn baseline_evidence(reports: &[BaselineReport]) -> Vec<EvidenceItem> {
    reports
        .iter()
        .flat_map(|report| {
            report.signals.iter().map(move |outcome| {
                EvidenceItem::from_outcome(0, EvidenceKind::Baseline, &report.file_path, outcome)
            })
        })
        .collect()
}

fn degraded_assessment(
    request_id: &str,
    reports: &[BaselineReport],
    cause: DegradedCause,
) -> RiskAssessment {
    let synthesis = degraded_synthesis(reports, cause);
    RiskAssessment {
        request_id: request_id.to_owned(),
        risk_level: synthesis.risk_level,
        confidence: synthesis.confidence,
        files: Vec::new(),
        evidence_chain: baseline_evidence(reports),
        key_evidence: synthesis.key_evidence,
        recommendations: synthesis.recommendations,
        reasoning_text: synthesis.reasoning_text,
        investigation: None,
        degraded: true,
    }
}

fn investigated_assessment(request_id: &str, outcome: InvestigationOutcome) -> RiskAssessment {
    let degraded = matches!(outcome.source, SynthesisSource::Degraded { .. });
    RiskAssessment {
        request_id: request_id.to_owned(),
        risk_level: outcome.synthesis.risk_level,
        confidence: outcome.synthesis.confidence,
        files: Vec::new(),
        evidence_chain: outcome.evidence,
        key_evidence: outcome.synthesis.key_evidence,
        recommendations: outcome.synthesis.recommendations,
        reasoning_text: outcome.synthesis.reasoning_text,
        investigation: Some(InvestigationSummary {
            finalize_reason: outcome.finalize_reason,
            source: outcome.source,
            hops: outcome.hops,
            elapsed_ms: outcome.elapsed_ms,
        }),
        degraded,
    }
}
