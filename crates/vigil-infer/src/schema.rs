use serde::{Deserialize, Serialize};
use vigil_core::{RiskLevel, SignalName, SignalTier};

use crate::InferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "target", rename_all = "snake_case")]
pub enum DecisionAction {
    CalculateSignal(SignalName),
    ExpandContext,
    Finalize,
}

impl DecisionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CalculateSignal(_) => "CALCULATE_SIGNAL",
            Self::ExpandContext => "EXPAND_CONTEXT",
            Self::Finalize => "FINALIZE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub key_evidence: Vec<String>,
    pub recommendations: Vec<String>,
    pub reasoning_text: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDecision {
    action: String,
    reasoning: String,
    #[serde(default)]
    target: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSynthesis {
    risk_level: String,
    confidence: f64,
    key_evidence: Vec<String>,
    recommendations: Vec<String>,
    reasoning_text: String,
}

pub fn parse_decision(candidate: &str) -> Result<Decision, InferError> {
    let normalized = normalize_candidate_json(candidate);
    let raw: RawDecision = serde_json::from_str(&normalized)
        .map_err(|err| InferError::Malformed(format!("decision json: {err}")))?;

    let target = raw
        .target
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty());

    let action = match raw.action.trim().to_ascii_uppercase().as_str() {
        "CALCULATE_SIGNAL" => {
            let target = target.ok_or_else(|| {
                InferError::Malformed("CALCULATE_SIGNAL requires a target signal".to_owned())
            })?;
            let signal = target
                .parse::<SignalName>()
                .map_err(InferError::Malformed)?;
            if signal.tier() != SignalTier::OnDemand {
                return Err(InferError::Malformed(format!(
                    "signal '{signal}' is not computed on demand"
                )));
            }
            DecisionAction::CalculateSignal(signal)
        }
        "EXPAND_CONTEXT" => DecisionAction::ExpandContext,
        "FINALIZE" => DecisionAction::Finalize,
        other => {
            return Err(InferError::Malformed(format!(
                "unknown action '{other}', expected CALCULATE_SIGNAL, EXPAND_CONTEXT or FINALIZE"
            )));
        }
    };

    Ok(Decision {
        action,
        reasoning: raw.reasoning.trim().to_owned(),
    })
}

pub fn parse_synthesis(candidate: &str) -> Result<Synthesis, InferError> {
    let normalized = normalize_candidate_json(candidate);
    let raw: RawSynthesis = serde_json::from_str(&normalized)
        .map_err(|err| InferError::Malformed(format!("synthesis json: {err}")))?;

    let risk_level = raw
        .risk_level
        .parse::<RiskLevel>()
        .map_err(InferError::Malformed)?;
    if !raw.confidence.is_finite() || !(0.0..=1.0).contains(&raw.confidence) {
        return Err(InferError::Malformed(format!(
            "confidence must be within [0, 1], got {}",
            raw.confidence
        )));
    }

    Ok(Synthesis {
        risk_level,
        confidence: raw.confidence,
        key_evidence: clean_list(raw.key_evidence),
        recommendations: clean_list(raw.recommendations),
        reasoning_text: raw.reasoning_text.trim().to_owned(),
    })
}

fn clean_list(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|item| item.trim().to_owned())
        .filter(|item| !item.is_empty())
        .collect()
}

pub(crate) fn normalize_candidate_json(candidate_json: &str) -> String {
    let trimmed = candidate_json.trim();

    if !trimmed.starts_with("```") {
        return trimmed.to_owned();
    }

    let mut lines = trimmed.lines();
    let _fence_line = lines.next();

    let mut body: Vec<&str> = lines.collect();
    if body.last().is_some_and(|line| line.trim() == "```") {
        body.pop();
    }

    body.join("\n").trim().to_owned()
}
