use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use vigil_core::{RiskLevel, SignalName};
use vigil_infer::{DecisionRequest, EvidenceNote, SignalObservation, SynthesisRequest};
use vigil_store::{GraphStore, StoreError};

use crate::baseline::BaselineReport;
use crate::context::ContextArena;
use crate::signals::SignalOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Baseline,
    Signal,
    Context,
    Decision,
    Note,
}

impl EvidenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Signal => "signal",
            Self::Context => "context",
            Self::Decision => "decision",
            Self::Note => "note",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub hop: u32,
    pub kind: EvidenceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<SignalName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<RiskLevel>,
    pub summary: String,
}

impl EvidenceItem {
    pub fn note(hop: u32, kind: EvidenceKind, summary: impl Into<String>) -> Self {
        Self {
            hop,
            kind,
            file_path: None,
            signal: None,
            level: None,
            summary: summary.into(),
        }
    }

    pub fn from_outcome(hop: u32, kind: EvidenceKind, file_path: &str, outcome: &SignalOutcome) -> Self {
        Self {
            hop,
            kind,
            file_path: Some(file_path.to_owned()),
            signal: Some(outcome.name()),
            level: outcome.level(),
            summary: format!("{} {}: {}", file_path, outcome.name(), outcome.describe()),
        }
    }

    fn to_note(&self) -> EvidenceNote {
        EvidenceNote {
            hop: self.hop,
            kind: self.kind.as_str().to_owned(),
            summary: self.summary.clone(),
            signal: self.signal,
            level: self.level,
        }
    }
}

/// Per-request investigation state. Lives only until synthesis.
#[derive(Debug, Clone)]
pub struct InvestigationContext {
    files: Vec<String>,
    baseline: Vec<BaselineReport>,
    evidence: Vec<EvidenceItem>,
    computed: BTreeSet<(String, SignalName)>,
    context: ContextArena,
    hop: u32,
    max_hops: u32,
    expanded: bool,
}

impl InvestigationContext {
    pub fn new(baseline: Vec<BaselineReport>, max_hops: u32) -> Self {
        let files = baseline
            .iter()
            .map(|report| report.file_path.clone())
            .collect::<Vec<_>>();
        let evidence = baseline
            .iter()
            .flat_map(|report| {
                report.signals.iter().map(move |outcome| {
                    EvidenceItem::from_outcome(0, EvidenceKind::Baseline, &report.file_path, outcome)
                })
            })
            .collect();
        let context = ContextArena::new(&files);

        Self {
            files,
            baseline,
            evidence,
            computed: BTreeSet::new(),
            context,
            hop: 0,
            max_hops,
            expanded: false,
        }
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn baseline(&self) -> &[BaselineReport] {
        &self.baseline
    }

    pub fn evidence(&self) -> &[EvidenceItem] {
        &self.evidence
    }

    pub fn into_evidence(self) -> Vec<EvidenceItem> {
        self.evidence
    }

    pub fn hop(&self) -> u32 {
        self.hop
    }

    pub fn max_hops(&self) -> u32 {
        self.max_hops
    }

    pub fn is_final_hop(&self) -> bool {
        self.hop >= self.max_hops
    }

    /// Starts the next decision iteration. Returns false once the cap is spent.
    pub fn begin_hop(&mut self) -> bool {
        if self.hop >= self.max_hops {
            return false;
        }
        self.hop += 1;
        true
    }

    pub fn push(&mut self, item: EvidenceItem) {
        self.evidence.push(item);
    }

    pub fn record_signal(&mut self, file_path: &str, outcome: &SignalOutcome) {
        self.computed.insert((file_path.to_owned(), outcome.name()));
        let item = EvidenceItem::from_outcome(self.hop, EvidenceKind::Signal, file_path, outcome);
        self.evidence.push(item);
    }

    pub fn has_signal(&self, name: SignalName) -> bool {
        self.files
            .iter()
            .all(|file| self.computed.contains(&(file.clone(), name)))
    }

    pub fn context(&self) -> &ContextArena {
        &self.context
    }

    pub fn can_expand_context(&self) -> bool {
        !self.expanded && self.context.can_expand()
    }

    /// Loads the next context layer and records what was found.
    pub fn load_context(&mut self, graph: &dyn GraphStore) -> Result<usize, StoreError> {
        let added = self.context.expand(graph)?;
        let hop = self.context.loaded_hops();
        let mut sample = self
            .context
            .paths_at(hop)
            .into_iter()
            .take(10)
            .map(str::to_owned)
            .collect::<Vec<_>>();
        sample.sort();
        let summary = if added == 0 {
            format!("no new neighbors at {hop} hops")
        } else {
            format!("{added} neighbors at {hop} hops: {}", sample.join(", "))
        };
        self.evidence
            .push(EvidenceItem::note(self.hop, EvidenceKind::Context, summary));
        Ok(added)
    }

    /// Spends the single allowed EXPAND_CONTEXT. Loads every layer still missing
    /// up to the hop cap, so a failed initial load does not cost the second hop.
    pub fn expand_context(&mut self, graph: &dyn GraphStore) -> Result<usize, StoreError> {
        self.expanded = true;
        let mut added = 0;
        while self.context.can_expand() {
            added += self.load_context(graph)?;
        }
        Ok(added)
    }

    pub fn decision_request(&self) -> DecisionRequest {
        let available_signals = SignalName::ON_DEMAND
            .into_iter()
            .filter(|name| !self.has_signal(*name))
            .collect();
        DecisionRequest {
            hop: self.hop,
            max_hops: self.max_hops,
            files: self.files.clone(),
            baseline: self.observations(),
            evidence: self.notes(),
            available_signals,
            context_files: self.context.len(),
            can_expand_context: self.can_expand_context(),
        }
    }

    pub fn synthesis_request(&self, finalize_reason: &str) -> SynthesisRequest {
        SynthesisRequest {
            files: self.files.clone(),
            baseline: self.observations(),
            evidence: self.notes(),
            finalize_reason: finalize_reason.to_owned(),
        }
    }

    fn observations(&self) -> Vec<SignalObservation> {
        self.baseline
            .iter()
            .flat_map(|report| {
                report.signals.iter().map(move |outcome| SignalObservation {
                    file_path: report.file_path.clone(),
                    signal: outcome.name(),
                    level: outcome.level(),
                    value: outcome.value(),
                    evidence: outcome.describe(),
                })
            })
            .collect()
    }

    fn notes(&self) -> Vec<EvidenceNote> {
        self.evidence
            .iter()
            .filter(|item| item.kind != EvidenceKind::Baseline)
            .map(EvidenceItem::to_note)
            .collect()
    }
}
