use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tokio::time::Instant;
use vigil_core::{RiskLevel, SignalName};
use vigil_infer::{
    DecisionAction, DecisionRequest, ProviderOverrides, ReasoningClient, SignalObservation,
    SynthesisRequest, load_reasoner_from_workspace,
};

fn observation(signal: SignalName, level: RiskLevel) -> SignalObservation {
    SignalObservation {
        file_path: "src/billing.rs".to_owned(),
        signal,
        level: Some(level),
        value: Some(1.0),
        evidence: format!("{signal} reads {level}"),
    }
}

#[tokio::test]
async fn workspace_mock_provider_drives_client_round_trip() {
    let temp = tempdir().expect("tempdir");
    let loaded = load_reasoner_from_workspace(
        temp.path(),
        ProviderOverrides {
            provider: Some(vigil_config::InferenceProviderKind::Mock),
            ..ProviderOverrides::default()
        },
    )
    .expect("load reasoner")
    .expect("mock reasoner");
    assert_eq!(loaded.provider_name, "mock");

    let client = ReasoningClient::new(Arc::clone(&loaded.service), Duration::from_secs(1));
    let deadline = Instant::now() + Duration::from_secs(5);
    let baseline = vec![
        observation(SignalName::Coupling, RiskLevel::High),
        observation(SignalName::TestRatio, RiskLevel::Medium),
    ];

    let decision = client
        .decide(
            &DecisionRequest {
                hop: 1,
                max_hops: 3,
                files: vec!["src/billing.rs".to_owned()],
                baseline: baseline.clone(),
                evidence: Vec::new(),
                available_signals: vec![SignalName::IncidentSimilarity],
                context_files: 4,
                can_expand_context: true,
            },
            deadline,
        )
        .await
        .expect("decision");
    assert_eq!(
        decision.action,
        DecisionAction::CalculateSignal(SignalName::IncidentSimilarity)
    );

    let synthesis = client
        .synthesize(
            &SynthesisRequest {
                files: vec!["src/billing.rs".to_owned()],
                baseline,
                evidence: Vec::new(),
                finalize_reason: "requested".to_owned(),
            },
            deadline,
        )
        .await
        .expect("synthesis");
    assert_eq!(synthesis.risk_level, RiskLevel::Medium);
    assert!((0.0..=1.0).contains(&synthesis.confidence));
}
