use thiserror::Error;

pub mod baseline;
pub mod context;
pub mod coupling;
pub mod engine;
pub mod evidence;
pub mod investigation;
pub mod ondemand;
pub mod signals;
pub mod synthesis;
pub mod validator;

pub use baseline::{BaselineEvaluator, BaselineReport, BaselineThresholds, should_escalate};
pub use context::{ContextArena, ContextNode, MAX_CONTEXT_HOPS};
pub use coupling::{CouplingBuildMode, CouplingBuildOutcome, CouplingBuilder, open_coupling_builder};
pub use engine::{
    AssessmentTrace, EngineParts, FileAssessment, InvestigationSummary, RiskAssessment, RiskEngine,
};
pub use evidence::{EvidenceItem, EvidenceKind, InvestigationContext};
pub use investigation::{
    FinalizeReason, HopTrace, InvestigationAgent, InvestigationOutcome, InvestigationState,
    SynthesisSource,
};
pub use ondemand::OnDemandCalculator;
pub use signals::{SignalComputer, SignalOutcome, SignalResult};
pub use synthesis::{DegradedCause, cap_confidence, degraded_synthesis};
pub use validator::{SignalValidator, ValidatorError};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("config error: {0}")]
    Config(#[from] vigil_config::ConfigError),
    #[error("store error: {0}")]
    Store(#[from] vigil_store::StoreError),
    #[error("reasoning error: {0}")]
    Infer(#[from] vigil_infer::InferError),
    #[error("cache error: {0}")]
    Cache(#[from] vigil_cache::CacheError),
    #[error("validator error: {0}")]
    Validator(#[from] ValidatorError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("assessment cancelled")]
    Cancelled,
    #[error("{0}")]
    Message(String),
}
