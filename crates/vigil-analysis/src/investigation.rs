use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use vigil_core::SignalName;
use vigil_infer::{DecisionAction, InferError, ReasoningClient, Synthesis};
use vigil_store::{GraphStore, StoreError};

use crate::AnalysisError;
use crate::baseline::BaselineReport;
use crate::evidence::{EvidenceItem, EvidenceKind, InvestigationContext};
use crate::ondemand::OnDemandCalculator;
use crate::signals::SignalOutcome;
use crate::synthesis::{DegradedCause, TIMEOUT_CONFIDENCE_CAP, cap_confidence, degraded_synthesis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeReason {
    Requested,
    HopCap,
    Timeout,
    Malformed,
    BudgetExceeded,
    Unavailable,
}

impl FinalizeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::HopCap => "hop_cap",
            Self::Timeout => "timeout",
            Self::Malformed => "malformed",
            Self::BudgetExceeded => "budget_exceeded",
            Self::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvestigationState {
    Init,
    Decide,
    CalculateSignal(SignalName),
    ExpandContext,
    Finalize(FinalizeReason),
    Synthesize(FinalizeReason),
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopTrace {
    pub hop: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested: Option<DecisionAction>,
    pub applied: DecisionAction,
    pub overridden: bool,
    pub reasoning: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SynthesisSource {
    Reasoned,
    Degraded { cause: DegradedCause },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationOutcome {
    pub synthesis: Synthesis,
    pub source: SynthesisSource,
    pub finalize_reason: FinalizeReason,
    pub hops: Vec<HopTrace>,
    pub evidence: Vec<EvidenceItem>,
    pub elapsed_ms: u64,
}

/// Bounded decide/act loop over one escalated change set. Hops run strictly
/// in sequence; the final hop can only finalize.
pub struct InvestigationAgent {
    client: ReasoningClient,
    calculator: Arc<OnDemandCalculator>,
    graph: Arc<dyn GraphStore>,
    max_hops: u32,
    budget: Duration,
}

impl InvestigationAgent {
    pub fn new(
        client: ReasoningClient,
        calculator: Arc<OnDemandCalculator>,
        graph: Arc<dyn GraphStore>,
        max_hops: u32,
        budget: Duration,
    ) -> Self {
        Self {
            client,
            calculator,
            graph,
            max_hops,
            budget,
        }
    }

    pub fn max_hops(&self) -> u32 {
        self.max_hops
    }

    /// Cancellation is observed between hops, so an in-flight hop always
    /// completes before `AnalysisError::Cancelled` is returned.
    pub async fn run(
        &self,
        baseline: Vec<BaselineReport>,
        cancel: &CancellationToken,
    ) -> Result<InvestigationOutcome, AnalysisError> {
        let started = Instant::now();
        let deadline = started + self.budget;
        let mut context = InvestigationContext::new(baseline, self.max_hops);
        let mut hops = Vec::<HopTrace>::new();
        let mut reasoning_timed_out = false;
        let mut finished: Option<(Synthesis, SynthesisSource, FinalizeReason)> = None;

        let mut state = InvestigationState::Init;
        while state != InvestigationState::Done {
            tracing::debug!(hop = context.hop(), state = ?state, "investigation step");
            state = match state {
                InvestigationState::Init => {
                    self.load_context(&mut context);
                    InvestigationState::Decide
                }
                InvestigationState::Decide => {
                    if cancel.is_cancelled() {
                        tracing::info!(hop = context.hop(), "investigation cancelled");
                        return Err(AnalysisError::Cancelled);
                    }
                    if Instant::now() >= deadline {
                        InvestigationState::Finalize(FinalizeReason::BudgetExceeded)
                    } else if !context.begin_hop() {
                        InvestigationState::Finalize(FinalizeReason::HopCap)
                    } else {
                        let (next, trace) = self.decide(&mut context, deadline).await;
                        if trace.error.is_some()
                            && matches!(
                                next,
                                InvestigationState::Finalize(
                                    FinalizeReason::Timeout | FinalizeReason::BudgetExceeded
                                )
                            )
                        {
                            reasoning_timed_out = true;
                        }
                        hops.push(trace);
                        next
                    }
                }
                InvestigationState::CalculateSignal(name) => {
                    let hop_started = Instant::now();
                    self.calculate(&mut context, name, deadline).await;
                    add_elapsed(&mut hops, hop_started);
                    InvestigationState::Decide
                }
                InvestigationState::ExpandContext => {
                    let hop_started = Instant::now();
                    if context.can_expand_context() {
                        let expanded = context.expand_context(self.graph.as_ref());
                        note_context_failure(&mut context, expanded);
                    } else {
                        context.push(EvidenceItem::note(
                            context.hop(),
                            EvidenceKind::Note,
                            "context already expanded; request ignored",
                        ));
                    }
                    add_elapsed(&mut hops, hop_started);
                    InvestigationState::Decide
                }
                InvestigationState::Finalize(reason) => {
                    tracing::info!(hop = context.hop(), reason = reason.as_str(), "investigation finalizing");
                    InvestigationState::Synthesize(reason)
                }
                InvestigationState::Synthesize(reason) => {
                    let (synthesis, source) =
                        self.synthesize(&context, reason, reasoning_timed_out).await;
                    finished = Some((synthesis, source, reason));
                    InvestigationState::Done
                }
                InvestigationState::Done => InvestigationState::Done,
            };
        }

        let (synthesis, source, finalize_reason) = finished
            .ok_or_else(|| AnalysisError::Message("investigation ended without synthesis".to_owned()))?;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            hops = hops.len(),
            risk = %synthesis.risk_level,
            confidence = synthesis.confidence,
            reason = finalize_reason.as_str(),
            elapsed_ms,
            "investigation complete"
        );

        Ok(InvestigationOutcome {
            synthesis,
            source,
            finalize_reason,
            hops,
            evidence: context.into_evidence(),
            elapsed_ms,
        })
    }

    async fn decide(
        &self,
        context: &mut InvestigationContext,
        deadline: Instant,
    ) -> (InvestigationState, HopTrace) {
        let hop = context.hop();
        let hop_started = Instant::now();
        let request = context.decision_request();

        match self.client.decide(&request, deadline).await {
            Ok(decision) => {
                let requested = decision.action;
                let overridden = context.is_final_hop() && requested != DecisionAction::Finalize;
                let applied = if overridden {
                    DecisionAction::Finalize
                } else {
                    requested
                };
                tracing::info!(
                    hop,
                    requested = requested.as_str(),
                    applied = applied.as_str(),
                    overridden,
                    "investigation decision"
                );
                context.push(EvidenceItem {
                    hop,
                    kind: EvidenceKind::Decision,
                    file_path: None,
                    signal: match applied {
                        DecisionAction::CalculateSignal(name) => Some(name),
                        _ => None,
                    },
                    level: None,
                    summary: format!("{}: {}", applied.as_str(), decision.reasoning),
                });

                let next = match applied {
                    DecisionAction::CalculateSignal(name) => InvestigationState::CalculateSignal(name),
                    DecisionAction::ExpandContext => InvestigationState::ExpandContext,
                    DecisionAction::Finalize if overridden => {
                        InvestigationState::Finalize(FinalizeReason::HopCap)
                    }
                    DecisionAction::Finalize => InvestigationState::Finalize(FinalizeReason::Requested),
                };
                let trace = HopTrace {
                    hop,
                    requested: Some(requested),
                    applied,
                    overridden,
                    reasoning: decision.reasoning,
                    error: None,
                    elapsed_ms: hop_started.elapsed().as_millis() as u64,
                };
                (next, trace)
            }
            Err(err) => {
                let reason = finalize_reason_for(&err, deadline);
                tracing::warn!(hop, error = %err, reason = reason.as_str(), "decision call failed, finalizing");
                context.push(EvidenceItem::note(
                    hop,
                    EvidenceKind::Note,
                    format!("decision call failed ({err}); finalizing with gathered evidence"),
                ));
                let trace = HopTrace {
                    hop,
                    requested: None,
                    applied: DecisionAction::Finalize,
                    overridden: false,
                    reasoning: String::new(),
                    error: Some(err.to_string()),
                    elapsed_ms: hop_started.elapsed().as_millis() as u64,
                };
                (InvestigationState::Finalize(reason), trace)
            }
        }
    }

    async fn calculate(&self, context: &mut InvestigationContext, name: SignalName, deadline: Instant) {
        if context.has_signal(name) {
            context.push(EvidenceItem::note(
                context.hop(),
                EvidenceKind::Note,
                format!("{name} already gathered; request ignored"),
            ));
            return;
        }

        let handles = context
            .files()
            .iter()
            .map(|file| {
                let calculator = Arc::clone(&self.calculator);
                let path = file.clone();
                let handle = tokio::task::spawn_blocking(move || calculator.calculate(name, &path));
                (file.clone(), handle)
            })
            .collect::<Vec<_>>();

        for (file, handle) in handles {
            let outcome = match timeout_at(deadline, handle).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => SignalOutcome::Unknown {
                    name,
                    reason: format!("signal task failed: {err}"),
                },
                Err(_) => SignalOutcome::Unknown {
                    name,
                    reason: "investigation budget exhausted".to_owned(),
                },
            };
            tracing::debug!(signal = %name, file = %file, level = ?outcome.level(), "on-demand signal computed");
            context.record_signal(&file, &outcome);
        }
    }

    fn load_context(&self, context: &mut InvestigationContext) {
        let loaded = context.load_context(self.graph.as_ref());
        note_context_failure(context, loaded);
    }

    async fn synthesize(
        &self,
        context: &InvestigationContext,
        reason: FinalizeReason,
        reasoning_timed_out: bool,
    ) -> (Synthesis, SynthesisSource) {
        let request = context.synthesis_request(reason.as_str());
        let deadline = Instant::now() + self.client.call_timeout();
        match self.client.synthesize(&request, deadline).await {
            Ok(mut synthesis) => {
                if reasoning_timed_out {
                    cap_confidence(&mut synthesis, TIMEOUT_CONFIDENCE_CAP);
                }
                (synthesis, SynthesisSource::Reasoned)
            }
            Err(err) => {
                let cause = if err.is_timeout() || reasoning_timed_out {
                    DegradedCause::Timeout
                } else if err.is_malformed() {
                    DegradedCause::Malformed
                } else {
                    DegradedCause::ServiceUnavailable
                };
                tracing::warn!(error = %err, cause = cause.describe(), "synthesis failed, using degraded heuristic");
                (
                    degraded_synthesis(context.baseline(), cause),
                    SynthesisSource::Degraded { cause },
                )
            }
        }
    }
}

fn finalize_reason_for(err: &InferError, deadline: Instant) -> FinalizeReason {
    if Instant::now() >= deadline {
        FinalizeReason::BudgetExceeded
    } else if err.is_timeout() {
        FinalizeReason::Timeout
    } else if err.is_malformed() {
        FinalizeReason::Malformed
    } else {
        FinalizeReason::Unavailable
    }
}

fn note_context_failure(context: &mut InvestigationContext, loaded: Result<usize, StoreError>) {
    if let Err(err) = loaded {
        tracing::warn!(error = %err, "context load failed");
        context.push(EvidenceItem::note(
            context.hop(),
            EvidenceKind::Note,
            format!("graph context unavailable: {err}"),
        ));
    }
}

fn add_elapsed(hops: &mut [HopTrace], since: Instant) {
    if let Some(last) = hops.last_mut() {
        last.elapsed_ms += since.elapsed().as_millis() as u64;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use vigil_cache::MemoryCache;
    use vigil_core::RiskLevel;
    use vigil_infer::{MockReasoner, ReasoningCall, ReasoningPrompt, ReasoningService};
    use vigil_store::{
        DisablePolicy, IncidentMatch, IncidentSearch, MemoryGraphStore, MemoryStatStore,
        OwnershipHistory, OwnershipWindow, StoreError,
    };

    use super::*;
    use crate::signals::{SignalComputer, SignalResult};
    use crate::validator::SignalValidator;

    struct NoIncidents;

    impl IncidentSearch for NoIncidents {
        fn rank(&self, _query: &str, _limit: usize) -> Result<Vec<IncidentMatch>, StoreError> {
            Ok(Vec::new())
        }
    }

    type Reply = Box<dyn Fn(&ReasoningPrompt) -> Result<String, InferError> + Send + Sync>;

    struct ScriptedReasoner {
        reply: Reply,
        delay: Duration,
        calls: AtomicUsize,
        kinds: Mutex<Vec<&'static str>>,
        cancel_on_first_call: Option<CancellationToken>,
    }

    impl ScriptedReasoner {
        fn new(
            reply: impl Fn(&ReasoningPrompt) -> Result<String, InferError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                reply: Box::new(reply),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                kinds: Mutex::new(Vec::new()),
                cancel_on_first_call: None,
            }
        }

        fn decision_calls(&self) -> usize {
            self.kinds
                .lock()
                .expect("kinds lock")
                .iter()
                .filter(|kind| **kind == "decision")
                .count()
        }
    }

    #[async_trait]
    impl ReasoningService for ScriptedReasoner {
        async fn complete(&self, prompt: &ReasoningPrompt) -> Result<String, InferError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.kinds.lock().expect("kinds lock").push(prompt.call.kind());
            if let Some(cancel) = &self.cancel_on_first_call {
                cancel.cancel();
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.reply)(prompt)
        }
    }

    fn synthesis_reply() -> String {
        json!({
            "risk_level": "HIGH",
            "confidence": 0.8,
            "key_evidence": ["coupling is high"],
            "recommendations": ["add tests"],
            "reasoning_text": "several strong signals",
        })
        .to_string()
    }

    fn risky_report(file: &str) -> BaselineReport {
        let signals = vec![
            SignalOutcome::Known(SignalResult::new(
                SignalName::Coupling,
                file,
                15.0,
                RiskLevel::High,
                "15 dependents".to_owned(),
            )),
            SignalOutcome::Known(SignalResult::new(
                SignalName::CoChange,
                file,
                0.8,
                RiskLevel::High,
                "changes with b.rs 80% of the time".to_owned(),
            )),
            SignalOutcome::Known(SignalResult::new(
                SignalName::TestRatio,
                file,
                0.2,
                RiskLevel::High,
                "test ratio 0.20".to_owned(),
            )),
        ];
        BaselineReport {
            file_path: file.to_owned(),
            risk_level: RiskLevel::High,
            escalate: true,
            signals,
        }
    }

    fn agent(service: Arc<dyn ReasoningService>, call_timeout: Duration, budget: Duration) -> InvestigationAgent {
        let graph = Arc::new(MemoryGraphStore::new());
        graph.add_edge("src/auth.rs", "src/session.rs", "IMPORTS");
        graph.add_edge("src/session.rs", "src/db.rs", "CALLS");
        graph.set_ownership(
            "src/auth.rs",
            OwnershipHistory {
                current_owner: Some("bob@example.com".to_owned()),
                previous_owner: Some("alice@example.com".to_owned()),
                days_since_transition: Some(10),
                commit_count: 4,
                window_days: 90,
            },
        );
        let computer = Arc::new(SignalComputer::new(
            graph.clone(),
            Arc::new(MemoryCache::new()),
            SignalValidator::new(Arc::new(MemoryStatStore::new()), DisablePolicy::default()),
            Duration::from_secs(900),
        ));
        let calculator = Arc::new(OnDemandCalculator::new(
            computer,
            Arc::new(NoIncidents),
            OwnershipWindow::default(),
            20,
        ));
        InvestigationAgent::new(
            ReasoningClient::new(service, call_timeout),
            calculator,
            graph,
            3,
            budget,
        )
    }

    #[tokio::test]
    async fn mock_reasoner_gathers_on_demand_signals_then_finalizes() {
        let agent = agent(Arc::new(MockReasoner), Duration::from_secs(2), Duration::from_secs(8));
        let outcome = agent
            .run(vec![risky_report("src/auth.rs")], &CancellationToken::new())
            .await
            .expect("investigation");

        assert_eq!(outcome.source, SynthesisSource::Reasoned);
        assert!(outcome.hops.len() <= 3);
        assert!(outcome.synthesis.risk_level >= RiskLevel::Medium);
        assert!(outcome.synthesis.confidence > 0.0);
        assert!(outcome.evidence.iter().any(|item| {
            item.kind == EvidenceKind::Signal && item.signal == Some(SignalName::OwnershipChurn)
        }));
        assert!(outcome.evidence.iter().any(|item| item.kind == EvidenceKind::Context));
    }

    #[tokio::test]
    async fn third_hop_is_forced_to_finalize() {
        let reasoner = Arc::new(ScriptedReasoner::new(|prompt| match &prompt.call {
            ReasoningCall::Decision(_) => Ok(json!({
                "action": "CALCULATE_SIGNAL",
                "reasoning": "need more",
                "target": "ownership_churn",
            })
            .to_string()),
            ReasoningCall::Synthesis(_) => Ok(synthesis_reply()),
        }));
        let agent = agent(reasoner.clone(), Duration::from_secs(2), Duration::from_secs(8));
        let outcome = agent
            .run(vec![risky_report("src/auth.rs")], &CancellationToken::new())
            .await
            .expect("investigation");

        assert_eq!(reasoner.decision_calls(), 3);
        assert_eq!(outcome.hops.len(), 3);
        let last = outcome.hops.last().expect("last hop");
        assert_eq!(last.hop, 3);
        assert_eq!(last.applied, DecisionAction::Finalize);
        assert!(last.overridden);
        assert_eq!(outcome.finalize_reason, FinalizeReason::HopCap);
        assert!(
            outcome
                .evidence
                .iter()
                .any(|item| item.summary.contains("already gathered"))
        );
    }

    #[tokio::test]
    async fn context_expands_at_most_once() {
        let reasoner = Arc::new(ScriptedReasoner::new(|prompt| match &prompt.call {
            ReasoningCall::Decision(_) => Ok(json!({
                "action": "EXPAND_CONTEXT",
                "reasoning": "look further",
            })
            .to_string()),
            ReasoningCall::Synthesis(_) => Ok(synthesis_reply()),
        }));
        let agent = agent(reasoner, Duration::from_secs(2), Duration::from_secs(8));
        let outcome = agent
            .run(vec![risky_report("src/auth.rs")], &CancellationToken::new())
            .await
            .expect("investigation");

        let context_loads = outcome
            .evidence
            .iter()
            .filter(|item| item.kind == EvidenceKind::Context)
            .count();
        assert_eq!(context_loads, 2);
        assert!(
            outcome
                .evidence
                .iter()
                .any(|item| item.summary.contains("context already expanded"))
        );
    }

    #[tokio::test]
    async fn timeouts_on_every_call_degrade_with_zero_confidence() {
        let mut reasoner = ScriptedReasoner::new(|_| Ok(synthesis_reply()));
        reasoner.delay = Duration::from_millis(200);
        let agent = agent(Arc::new(reasoner), Duration::from_millis(20), Duration::from_secs(8));

        let outcome = agent
            .run(vec![risky_report("src/auth.rs")], &CancellationToken::new())
            .await
            .expect("investigation");

        assert_eq!(outcome.finalize_reason, FinalizeReason::Timeout);
        assert_eq!(
            outcome.source,
            SynthesisSource::Degraded {
                cause: DegradedCause::Timeout
            }
        );
        assert_eq!(outcome.synthesis.confidence, 0.0);
        assert!(outcome.synthesis.reasoning_text.contains("timed out"));
        assert_eq!(outcome.synthesis.risk_level, RiskLevel::High);
    }

    #[tokio::test]
    async fn decision_timeout_caps_reasoned_confidence() {
        let reasoner = Arc::new(ScriptedReasoner::new(|prompt| match &prompt.call {
            ReasoningCall::Decision(_) => Err(InferError::Timeout { millis: 20 }),
            ReasoningCall::Synthesis(_) => Ok(synthesis_reply()),
        }));
        let agent = agent(reasoner, Duration::from_secs(2), Duration::from_secs(8));
        let outcome = agent
            .run(vec![risky_report("src/auth.rs")], &CancellationToken::new())
            .await
            .expect("investigation");

        assert_eq!(outcome.source, SynthesisSource::Reasoned);
        assert_eq!(outcome.finalize_reason, FinalizeReason::Timeout);
        assert_eq!(outcome.synthesis.confidence, TIMEOUT_CONFIDENCE_CAP);
    }

    #[tokio::test]
    async fn malformed_replies_are_retried_once_then_degraded() {
        let reasoner = Arc::new(ScriptedReasoner::new(|_| Ok("not json at all".to_owned())));
        let agent = agent(reasoner.clone(), Duration::from_secs(2), Duration::from_secs(8));
        let outcome = agent
            .run(vec![risky_report("src/auth.rs")], &CancellationToken::new())
            .await
            .expect("investigation");

        assert_eq!(reasoner.calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.finalize_reason, FinalizeReason::Malformed);
        assert_eq!(
            outcome.source,
            SynthesisSource::Degraded {
                cause: DegradedCause::Malformed
            }
        );
        assert_eq!(outcome.synthesis.confidence, 0.0);
    }

    #[tokio::test]
    async fn cancellation_stops_after_current_hop() {
        let cancel = CancellationToken::new();
        let mut reasoner = ScriptedReasoner::new(|prompt| match &prompt.call {
            ReasoningCall::Decision(_) => Ok(json!({
                "action": "CALCULATE_SIGNAL",
                "reasoning": "need more",
                "target": "ownership_churn",
            })
            .to_string()),
            ReasoningCall::Synthesis(_) => Ok(synthesis_reply()),
        });
        reasoner.cancel_on_first_call = Some(cancel.clone());
        let reasoner = Arc::new(reasoner);
        let agent = agent(reasoner.clone(), Duration::from_secs(2), Duration::from_secs(8));

        let result = agent.run(vec![risky_report("src/auth.rs")], &cancel).await;
        assert!(matches!(result, Err(AnalysisError::Cancelled)));
        assert_eq!(reasoner.decision_calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_finalizes_without_deciding() {
        let reasoner = Arc::new(ScriptedReasoner::new(|_| Ok(synthesis_reply())));
        let agent = agent(reasoner.clone(), Duration::from_secs(2), Duration::ZERO);
        let outcome = agent
            .run(vec![risky_report("src/auth.rs")], &CancellationToken::new())
            .await
            .expect("investigation");

        assert_eq!(outcome.finalize_reason, FinalizeReason::BudgetExceeded);
        assert!(outcome.hops.is_empty());
        assert_eq!(reasoner.decision_calls(), 0);
        assert_eq!(outcome.source, SynthesisSource::Reasoned);
    }
}
