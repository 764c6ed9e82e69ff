use serde::{Deserialize, Serialize};
use vigil_core::{RiskLevel, SignalName};

/// One signal reading as presented to the reasoning service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalObservation {
    pub file_path: String,
    pub signal: SignalName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<RiskLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub evidence: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceNote {
    pub hop: u32,
    pub kind: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<SignalName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<RiskLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub hop: u32,
    pub max_hops: u32,
    pub files: Vec<String>,
    pub baseline: Vec<SignalObservation>,
    pub evidence: Vec<EvidenceNote>,
    pub available_signals: Vec<SignalName>,
    pub context_files: usize,
    pub can_expand_context: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub files: Vec<String>,
    pub baseline: Vec<SignalObservation>,
    pub evidence: Vec<EvidenceNote>,
    pub finalize_reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReasoningCall {
    Decision(DecisionRequest),
    Synthesis(SynthesisRequest),
}

impl ReasoningCall {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decision(_) => "decision",
            Self::Synthesis(_) => "synthesis",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReasoningPrompt {
    pub call: ReasoningCall,
    /// Set on the retry after a malformed reply.
    pub strict: bool,
}

impl ReasoningPrompt {
    pub fn render(&self) -> String {
        let mut prompt = match &self.call {
            ReasoningCall::Decision(request) => build_decision_prompt(request),
            ReasoningCall::Synthesis(request) => build_synthesis_prompt(request),
        };
        if self.strict {
            prompt.push_str(STRICT_SUFFIX);
        }
        prompt
    }
}

const STRICT_SUFFIX: &str = "\n\nYour previous reply could not be parsed. \
Reply with a single JSON object and nothing else: no markdown fences, no commentary, \
no keys other than the ones listed above.";

fn build_decision_prompt(request: &DecisionRequest) -> String {
    let payload = serde_json::to_string_pretty(request).unwrap_or_else(|_| "{}".to_owned());
    let signals = request
        .available_signals
        .iter()
        .map(|signal| signal.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "You are investigating the risk of a code change. This is hop {} of at most {}. \
Choose the single next step. Respond with STRICT JSON only and exactly these fields: \
action (one of CALCULATE_SIGNAL, EXPAND_CONTEXT, FINALIZE), reasoning (string), \
target (string, required only for CALCULATE_SIGNAL, one of: {}). \
EXPAND_CONTEXT is allowed only when can_expand_context is true. \
Choose FINALIZE once the evidence is sufficient.\n\nInvestigation state:\n{}",
        request.hop,
        request.max_hops,
        if signals.is_empty() { "none" } else { signals.as_str() },
        payload
    )
}

fn build_synthesis_prompt(request: &SynthesisRequest) -> String {
    let payload = serde_json::to_string_pretty(request).unwrap_or_else(|_| "{}".to_owned());
    format!(
        "You are concluding a code change risk investigation. \
Respond with STRICT JSON only and exactly these fields: \
risk_level (one of LOW, MEDIUM, HIGH), confidence (number in [0.0,1.0]), \
key_evidence (array of string), recommendations (array of string), reasoning_text (string). \
Base the confidence on how strong and consistent the evidence is.\n\nEvidence:\n{}",
        payload
    )
}
