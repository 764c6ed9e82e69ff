use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use vigil_analysis::{
    AnalysisError, EngineParts, FinalizeReason, RiskAssessment, RiskEngine, SignalOutcome,
    SynthesisSource,
};
use vigil_cache::{MemoryCache, NoopCache, SignalCache};
use vigil_config::VigilConfig;
use vigil_core::{RiskLevel, SignalName};
use vigil_infer::{
    DecisionAction, InferError, MockReasoner, ReasoningCall, ReasoningPrompt, ReasoningService,
};
use vigil_store::{
    IncidentMatch, IncidentSearch, MemoryGraphStore, MemoryStatStore, OwnershipHistory,
    StoreError,
};

const QUIET: &str = "src/quiet.rs";
const RISKY: &str = "src/auth.rs";

struct NoIncidents;

impl IncidentSearch for NoIncidents {
    fn rank(&self, _query: &str, _limit: usize) -> Result<Vec<IncidentMatch>, StoreError> {
        Ok(Vec::new())
    }
}

struct AlwaysCalculate {
    decisions: AtomicUsize,
}

#[async_trait]
impl ReasoningService for AlwaysCalculate {
    async fn complete(&self, prompt: &ReasoningPrompt) -> Result<String, InferError> {
        match &prompt.call {
            ReasoningCall::Decision(_) => {
                self.decisions.fetch_add(1, Ordering::SeqCst);
                Ok(json!({
                    "action": "CALCULATE_SIGNAL",
                    "reasoning": "keep digging",
                    "target": "incident_similarity",
                })
                .to_string())
            }
            ReasoningCall::Synthesis(_) => Ok(json!({
                "risk_level": "MEDIUM",
                "confidence": 0.6,
                "key_evidence": [],
                "recommendations": [],
                "reasoning_text": "moderate risk",
            })
            .to_string()),
        }
    }
}

struct NeverAnswers;

#[async_trait]
impl ReasoningService for NeverAnswers {
    async fn complete(&self, _prompt: &ReasoningPrompt) -> Result<String, InferError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(InferError::Unavailable("unreachable".to_owned()))
    }
}

fn config() -> VigilConfig {
    let mut config = VigilConfig::default();
    config.baseline.signal_timeout_ms = 2_000;
    config.investigation.call_timeout_ms = 2_000;
    config
}

fn graph() -> Arc<MemoryGraphStore> {
    let graph = MemoryGraphStore::new();

    graph.set_coupling(QUIET, 3);
    graph.add_co_change(QUIET, "src/quiet_helper.rs", 0.1, 1);
    graph.set_test_ratio(QUIET, 0.9);

    graph.set_coupling(RISKY, 15);
    graph.add_co_change(RISKY, "src/session.rs", 0.8, 8);
    graph.set_test_ratio(RISKY, 0.2);
    graph.add_edge(RISKY, "src/session.rs", "IMPORTS");
    graph.set_ownership(
        RISKY,
        OwnershipHistory {
            current_owner: Some("bob@example.com".to_owned()),
            previous_owner: Some("alice@example.com".to_owned()),
            days_since_transition: Some(14),
            commit_count: 6,
            window_days: 90,
        },
    );
    Arc::new(graph)
}

fn engine_with(
    config: &VigilConfig,
    graph: Arc<MemoryGraphStore>,
    cache: Arc<dyn SignalCache>,
    stats: Arc<MemoryStatStore>,
    reasoner: Option<Arc<dyn ReasoningService>>,
) -> RiskEngine {
    RiskEngine::new(
        config,
        EngineParts {
            graph,
            cache,
            stats,
            search: Arc::new(NoIncidents),
            reasoner,
        },
    )
}

fn engine(reasoner: Option<Arc<dyn ReasoningService>>) -> RiskEngine {
    engine_with(
        &config(),
        graph(),
        Arc::new(MemoryCache::new()),
        Arc::new(MemoryStatStore::new()),
        reasoner,
    )
}

async fn assess(engine: &RiskEngine, file: &str) -> RiskAssessment {
    engine
        .assess(&[file.to_owned()], &CancellationToken::new())
        .await
        .expect("assessment")
}

#[tokio::test]
async fn quiet_file_stays_low_without_investigation() {
    let engine = engine(Some(Arc::new(MockReasoner)));
    let assessment = assess(&engine, QUIET).await;

    assert_eq!(assessment.risk_level, RiskLevel::Low);
    assert!(!assessment.files[0].escalate);
    assert_eq!(assessment.files[0].risk_level, RiskLevel::Low);
    assert!(assessment.investigation.is_none());
    assert_eq!(assessment.confidence, 1.0);
    assert!(
        assessment.files[0]
            .signals
            .iter()
            .all(|outcome| outcome.level() != Some(RiskLevel::Medium))
    );
}

#[tokio::test]
async fn risky_file_escalates_into_bounded_investigation() {
    let engine = engine(Some(Arc::new(MockReasoner)));
    let assessment = assess(&engine, RISKY).await;

    assert!(assessment.files[0].escalate);
    assert_eq!(assessment.files[0].risk_level, RiskLevel::High);
    assert!(matches!(
        assessment.risk_level,
        RiskLevel::Medium | RiskLevel::High
    ));
    assert!(assessment.confidence > 0.0);
    assert!(!assessment.degraded);

    let investigation = assessment.investigation.as_ref().expect("investigation");
    assert!(investigation.hops.len() <= 3);
    assert_eq!(investigation.source, SynthesisSource::Reasoned);
    assert!(
        assessment
            .evidence_chain
            .iter()
            .any(|item| item.signal == Some(SignalName::OwnershipChurn))
    );

    let trace = engine
        .cached_trace(&assessment.request_id)
        .expect("trace cached");
    assert_eq!(trace.evidence_chain, assessment.evidence_chain);
    assert_eq!(trace.files, vec![RISKY.to_owned()]);
}

#[tokio::test]
async fn decision_loop_never_exceeds_three_hops() {
    let reasoner = Arc::new(AlwaysCalculate {
        decisions: AtomicUsize::new(0),
    });
    let engine = engine(Some(reasoner.clone()));
    let assessment = assess(&engine, RISKY).await;

    let investigation = assessment.investigation.expect("investigation");
    assert_eq!(reasoner.decisions.load(Ordering::SeqCst), 3);
    assert_eq!(investigation.hops.len(), 3);
    assert_eq!(investigation.hops[2].applied, DecisionAction::Finalize);
    assert_eq!(investigation.finalize_reason, FinalizeReason::HopCap);
    assert_eq!(assessment.risk_level, RiskLevel::Medium);
}

#[tokio::test]
async fn unresponsive_reasoner_yields_complete_zero_confidence_assessment() {
    let mut config = config();
    config.investigation.call_timeout_ms = 30;
    let engine = engine_with(
        &config,
        graph(),
        Arc::new(MemoryCache::new()),
        Arc::new(MemoryStatStore::new()),
        Some(Arc::new(NeverAnswers)),
    );

    let assessment = assess(&engine, RISKY).await;
    assert_eq!(assessment.confidence, 0.0);
    assert!(assessment.reasoning_text.contains("timed out"));
    assert!(assessment.degraded);
    assert_eq!(assessment.risk_level, RiskLevel::High);
    assert_eq!(assessment.files.len(), 1);
    assert_eq!(
        assessment.investigation.expect("investigation").finalize_reason,
        FinalizeReason::Timeout
    );
}

#[tokio::test]
async fn missing_reasoner_falls_back_to_signal_counts() {
    let engine = engine(None);
    assert!(engine.is_degraded());

    let assessment = assess(&engine, RISKY).await;
    assert!(assessment.degraded);
    assert_eq!(assessment.confidence, 0.0);
    assert_eq!(assessment.risk_level, RiskLevel::High);
    assert!(assessment.investigation.is_none());
    assert!(assessment.reasoning_text.contains("unavailable"));
}

#[tokio::test]
async fn missing_reasoner_reports_quiet_files_with_zero_confidence() {
    let engine = engine(None);
    let assessment = assess(&engine, QUIET).await;

    assert!(!assessment.files[0].escalate);
    assert_eq!(assessment.risk_level, RiskLevel::Low);
    assert!(assessment.degraded);
    assert_eq!(assessment.confidence, 0.0);
    assert!(assessment.investigation.is_none());
    assert!(assessment.reasoning_text.contains("unavailable"));
}

#[tokio::test]
async fn disabled_investigation_is_degraded_even_with_a_reasoner() {
    let mut config = config();
    config.investigation.enabled = false;
    let engine = engine_with(
        &config,
        graph(),
        Arc::new(MemoryCache::new()),
        Arc::new(MemoryStatStore::new()),
        Some(Arc::new(MockReasoner)),
    );
    assert!(engine.is_degraded());

    let assessment = assess(&engine, QUIET).await;
    assert!(assessment.degraded);
    assert_eq!(assessment.confidence, 0.0);
    assert!(assessment.reasoning_text.contains("disabled"));
}

#[tokio::test]
async fn disabling_the_cache_does_not_change_the_result() {
    let graph = graph();
    let cached = engine_with(
        &config(),
        graph.clone(),
        Arc::new(MemoryCache::new()),
        Arc::new(MemoryStatStore::new()),
        Some(Arc::new(MockReasoner)),
    );
    let uncached = engine_with(
        &config(),
        graph,
        Arc::new(NoopCache),
        Arc::new(MemoryStatStore::new()),
        Some(Arc::new(MockReasoner)),
    );

    for file in [QUIET, RISKY] {
        let warm = assess(&cached, file).await;
        let hit = assess(&cached, file).await;
        let miss = assess(&uncached, file).await;

        for other in [&hit, &miss] {
            assert_eq!(warm.risk_level, other.risk_level, "{file}");
            assert_eq!(warm.confidence, other.confidence, "{file}");
            let levels = |assessment: &RiskAssessment| {
                assessment.files[0]
                    .signals
                    .iter()
                    .map(|outcome| (outcome.name(), outcome.level(), outcome.value()))
                    .collect::<Vec<_>>()
            };
            assert_eq!(levels(&warm), levels(other), "{file}");
        }
    }
}

#[tokio::test]
async fn noisy_signal_is_disabled_and_treated_as_absent() {
    let stats = Arc::new(MemoryStatStore::new());
    let engine = engine_with(
        &config(),
        graph(),
        Arc::new(NoopCache),
        stats,
        None,
    );

    for _ in 0..24 {
        let stat = engine
            .record_feedback(SignalName::Coupling, false, None)
            .expect("stat");
        assert!(stat.enabled);
    }
    let stat = engine
        .record_feedback(SignalName::Coupling, true, Some("not actually risky"))
        .expect("stat");
    assert_eq!(stat.total_uses, 25);
    assert!((stat.fp_rate - 0.04).abs() < 1e-9);
    assert!(!stat.enabled);

    let stat = engine
        .record_feedback(SignalName::Coupling, false, None)
        .expect("stat");
    assert!(!stat.enabled);

    let assessment = assess(&engine, RISKY).await;
    let coupling = assessment.files[0]
        .signals
        .iter()
        .find(|outcome| outcome.name() == SignalName::Coupling)
        .expect("coupling outcome");
    assert!(matches!(coupling, SignalOutcome::Disabled { .. }));
    assert!(assessment.files[0].escalate);

    let reenabled = engine
        .set_signal_enabled(SignalName::Coupling, true)
        .expect("re-enable");
    assert!(reenabled.enabled);
}

#[tokio::test]
async fn graph_outage_leaves_signals_unknown() {
    let graph = graph();
    graph.set_unavailable(true);
    let engine = engine_with(
        &config(),
        graph,
        Arc::new(MemoryCache::new()),
        Arc::new(MemoryStatStore::new()),
        Some(Arc::new(MockReasoner)),
    );

    let assessment = assess(&engine, RISKY).await;
    assert_eq!(assessment.risk_level, RiskLevel::Low);
    assert_eq!(assessment.confidence, 0.0);
    assert!(
        assessment.files[0]
            .signals
            .iter()
            .all(|outcome| matches!(outcome, SignalOutcome::Unknown { .. }))
    );
}

#[tokio::test]
async fn files_are_assessed_independently() {
    let engine = engine(None);
    let assessment = engine
        .assess(
            &[QUIET.to_owned(), RISKY.to_owned(), "./src/auth.rs".to_owned()],
            &CancellationToken::new(),
        )
        .await
        .expect("assessment");

    assert_eq!(assessment.files.len(), 2);
    let quiet = assessment
        .files
        .iter()
        .find(|file| file.file_path == QUIET)
        .expect("quiet file");
    assert!(!quiet.escalate);
    assert_eq!(assessment.risk_level, RiskLevel::High);
}

#[tokio::test]
async fn cancelled_request_returns_cancelled() {
    let engine = engine(Some(Arc::new(MockReasoner)));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = engine.assess(&[RISKY.to_owned()], &cancel).await;
    assert!(matches!(result, Err(AnalysisError::Cancelled)));
}

#[tokio::test]
async fn empty_request_is_rejected() {
    let engine = engine(None);
    let result = engine
        .assess(&["  ".to_owned()], &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(AnalysisError::Message(_))));
}
