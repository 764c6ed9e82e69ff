use serde::{Deserialize, Serialize};
use vigil_core::RiskLevel;
use vigil_infer::Synthesis;

use crate::baseline::BaselineReport;

/// Ceiling applied when a reasoning call timed out but synthesis still answered.
pub const TIMEOUT_CONFIDENCE_CAP: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedCause {
    ServiceUnavailable,
    Timeout,
    Malformed,
    InvestigationDisabled,
}

impl DegradedCause {
    pub fn describe(self) -> &'static str {
        match self {
            Self::ServiceUnavailable => "reasoning service unavailable",
            Self::Timeout => "reasoning service timed out",
            Self::Malformed => "reasoning service returned malformed responses",
            Self::InvestigationDisabled => "investigation disabled by configuration",
        }
    }
}

/// Grades a file by its count of HIGH baseline signals: two or more is HIGH,
/// one is MEDIUM, none is LOW.
pub fn degraded_level(report: &BaselineReport) -> RiskLevel {
    match report.high_count() {
        0 => RiskLevel::Low,
        1 => RiskLevel::Medium,
        _ => RiskLevel::High,
    }
}

/// Heuristic assessment from baseline signals alone. Confidence is zero.
pub fn degraded_synthesis(reports: &[BaselineReport], cause: DegradedCause) -> Synthesis {
    let risk_level = reports
        .iter()
        .map(degraded_level)
        .max()
        .unwrap_or(RiskLevel::Low);

    let key_evidence = reports
        .iter()
        .flat_map(|report| {
            report
                .signals
                .iter()
                .filter(|outcome| outcome.level() == Some(RiskLevel::High))
                .map(move |outcome| format!("{}: {}", report.file_path, outcome.describe()))
        })
        .collect::<Vec<_>>();

    let mut recommendations = Vec::new();
    if risk_level != RiskLevel::Low {
        recommendations.push("review the HIGH baseline signals manually before merging".to_owned());
    }
    if cause != DegradedCause::InvestigationDisabled {
        recommendations.push("re-run the risk check once the reasoning service is healthy".to_owned());
    }

    let high_signals = key_evidence.len();
    Synthesis {
        risk_level,
        confidence: 0.0,
        key_evidence,
        recommendations,
        reasoning_text: format!(
            "Deep investigation skipped: {}. Risk derived from {high_signals} HIGH baseline signal(s) across {} file(s).",
            cause.describe(),
            reports.len()
        ),
    }
}

pub fn cap_confidence(synthesis: &mut Synthesis, cap: f64) {
    synthesis.confidence = synthesis.confidence.clamp(0.0, cap);
}

#[cfg(test)]
mod tests {
    use vigil_core::SignalName;

    use super::*;
    use crate::signals::{SignalOutcome, SignalResult};

    fn report(file: &str, levels: &[RiskLevel]) -> BaselineReport {
        let signals = SignalName::BASELINE
            .into_iter()
            .zip(levels)
            .map(|(name, level)| {
                SignalOutcome::Known(SignalResult::new(name, file, 1.0, *level, format!("{name} reading")))
            })
            .collect();
        BaselineReport {
            file_path: file.to_owned(),
            risk_level: RiskLevel::High,
            escalate: true,
            signals,
        }
    }

    #[test]
    fn high_signal_counts_map_to_levels() {
        use RiskLevel::*;
        let cases = [
            (vec![Low, Low, Medium], Low),
            (vec![High, Low, Medium], Medium),
            (vec![High, High, Low], High),
            (vec![High, High, High], High),
        ];
        for (levels, expected) in cases {
            let synthesis =
                degraded_synthesis(&[report("a.rs", &levels)], DegradedCause::ServiceUnavailable);
            assert_eq!(synthesis.risk_level, expected, "levels {levels:?}");
            assert_eq!(synthesis.confidence, 0.0);
        }
    }

    #[test]
    fn overall_level_is_worst_file() {
        let synthesis = degraded_synthesis(
            &[
                report("a.rs", &[RiskLevel::Low, RiskLevel::Low, RiskLevel::Low]),
                report("b.rs", &[RiskLevel::High, RiskLevel::Low, RiskLevel::Low]),
            ],
            DegradedCause::Timeout,
        );
        assert_eq!(synthesis.risk_level, RiskLevel::Medium);
        assert!(synthesis.reasoning_text.contains("timed out"));
        assert_eq!(synthesis.key_evidence.len(), 1);
    }

    #[test]
    fn empty_reports_are_low() {
        let synthesis = degraded_synthesis(&[], DegradedCause::InvestigationDisabled);
        assert_eq!(synthesis.risk_level, RiskLevel::Low);
        assert!(synthesis.recommendations.is_empty());
    }

    #[test]
    fn cap_confidence_clamps() {
        let mut synthesis = degraded_synthesis(&[], DegradedCause::Timeout);
        synthesis.confidence = 0.85;
        cap_confidence(&mut synthesis, TIMEOUT_CONFIDENCE_CAP);
        assert_eq!(synthesis.confidence, TIMEOUT_CONFIDENCE_CAP);
    }
}
