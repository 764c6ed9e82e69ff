use async_trait::async_trait;
use serde_json::json;
use vigil_core::{RiskLevel, SignalName};

use crate::prompt::{DecisionRequest, ReasoningCall, ReasoningPrompt, SynthesisRequest};
use crate::{InferError, ReasoningService};

/// Deterministic reasoner: requests each missing on-demand signal once, then
/// finalizes and grades the evidence by counting elevated levels.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockReasoner;

#[async_trait]
impl ReasoningService for MockReasoner {
    async fn complete(&self, prompt: &ReasoningPrompt) -> Result<String, InferError> {
        let reply = match &prompt.call {
            ReasoningCall::Decision(request) => mock_decision(request),
            ReasoningCall::Synthesis(request) => mock_synthesis(request),
        };
        Ok(reply.to_string())
    }
}

fn mock_decision(request: &DecisionRequest) -> serde_json::Value {
    let gathered = request
        .evidence
        .iter()
        .filter_map(|note| note.signal)
        .collect::<Vec<_>>();
    let next = SignalName::ON_DEMAND
        .into_iter()
        .filter(|signal| request.available_signals.contains(signal))
        .find(|signal| !gathered.contains(signal));

    match next {
        Some(signal) if request.hop < request.max_hops => json!({
            "action": "CALCULATE_SIGNAL",
            "reasoning": format!("{} has not been measured yet", signal.as_str()),
            "target": signal.as_str(),
        }),
        _ => json!({
            "action": "FINALIZE",
            "reasoning": "all available signals have been gathered",
        }),
    }
}

fn mock_synthesis(request: &SynthesisRequest) -> serde_json::Value {
    let levels = request
        .baseline
        .iter()
        .filter_map(|observation| observation.level)
        .chain(request.evidence.iter().filter_map(|note| note.level))
        .collect::<Vec<_>>();
    let high = levels.iter().filter(|level| **level == RiskLevel::High).count();
    let medium = levels
        .iter()
        .filter(|level| **level == RiskLevel::Medium)
        .count();

    let risk_level = if high >= 2 {
        RiskLevel::High
    } else if high == 1 || medium >= 2 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };
    let confidence = (0.4 + 0.1 * levels.len() as f64).min(0.9);

    let key_evidence = request
        .baseline
        .iter()
        .filter(|observation| observation.level == Some(RiskLevel::High))
        .map(|observation| format!("{}: {}", observation.file_path, observation.evidence))
        .chain(
            request
                .evidence
                .iter()
                .filter(|note| note.level == Some(RiskLevel::High))
                .map(|note| note.summary.clone()),
        )
        .collect::<Vec<_>>();

    let mut recommendations = Vec::new();
    if request.baseline.iter().any(|observation| {
        observation.signal == SignalName::TestRatio && observation.level == Some(RiskLevel::High)
    }) {
        recommendations.push("Add tests covering the changed behavior".to_owned());
    }
    if risk_level != RiskLevel::Low {
        recommendations.push("Request review from the file's current owner".to_owned());
    }

    json!({
        "risk_level": risk_level.as_str(),
        "confidence": confidence,
        "key_evidence": key_evidence,
        "recommendations": recommendations,
        "reasoning_text": format!(
            "{high} high and {medium} medium signals across {} files ({}).",
            request.files.len(),
            request.finalize_reason
        ),
    })
}
