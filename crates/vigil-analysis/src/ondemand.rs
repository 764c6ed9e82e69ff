use std::sync::Arc;

use vigil_config::VigilConfig;
use vigil_core::{SECONDS_PER_DAY, SignalName, now_unix_seconds};
use vigil_store::{IncidentSearch, OwnershipWindow, StoreError};

use crate::signals::{
    SignalComputer, SignalOutcome, SignalResult, classify_incident_score, classify_ownership,
};

pub const INCIDENT_MATCH_LIMIT: usize = 3;

/// Tier-2 signals, computed only when the investigation asks for them.
pub struct OnDemandCalculator {
    computer: Arc<SignalComputer>,
    search: Arc<dyn IncidentSearch>,
    ownership: OwnershipWindow,
    commit_message_limit: usize,
}

impl OnDemandCalculator {
    pub fn new(
        computer: Arc<SignalComputer>,
        search: Arc<dyn IncidentSearch>,
        ownership: OwnershipWindow,
        commit_message_limit: usize,
    ) -> Self {
        Self {
            computer,
            search,
            ownership,
            commit_message_limit,
        }
    }

    pub fn from_config(
        computer: Arc<SignalComputer>,
        search: Arc<dyn IncidentSearch>,
        config: &VigilConfig,
    ) -> Self {
        Self::new(
            computer,
            search,
            OwnershipWindow {
                window_days: config.ownership.window_days,
                current_owner_days: config.ownership.current_owner_days,
            },
            config.incidents.commit_message_limit,
        )
    }

    pub fn calculate(&self, name: SignalName, file_path: &str) -> SignalOutcome {
        match name {
            SignalName::OwnershipChurn => self
                .computer
                .evaluate(name, file_path, || self.ownership_churn(file_path)),
            SignalName::IncidentSimilarity => self
                .computer
                .evaluate(name, file_path, || self.incident_similarity(file_path)),
            other => self.computer.evaluate_baseline(other, file_path),
        }
    }

    fn ownership_churn(&self, file_path: &str) -> Result<SignalResult, StoreError> {
        let history = self.computer.graph().ownership_history(
            file_path,
            self.ownership,
            now_unix_seconds(),
        )?;

        let level = classify_ownership(history.days_since_transition);
        let value = history.days_since_transition.map_or(-1.0, |days| days as f64);
        let evidence_text = match (
            history.current_owner.as_deref(),
            history.previous_owner.as_deref(),
            history.days_since_transition,
        ) {
            (Some(current), Some(previous), Some(days)) => format!(
                "ownership moved from {previous} to {current} {days} days ago ({} commits in {} days)",
                history.commit_count, history.window_days
            ),
            (Some(current), _, _) => format!(
                "stable owner {current} ({} commits in {} days)",
                history.commit_count, history.window_days
            ),
            _ => format!("no commits in the last {} days", history.window_days),
        };

        Ok(SignalResult::new(
            SignalName::OwnershipChurn,
            file_path,
            value,
            level,
            evidence_text,
        ))
    }

    fn incident_similarity(&self, file_path: &str) -> Result<SignalResult, StoreError> {
        let since = now_unix_seconds() - i64::from(self.ownership.window_days) * SECONDS_PER_DAY;
        let messages = self.computer.graph().recent_commit_messages(
            file_path,
            since,
            self.commit_message_limit,
        )?;
        let query = messages.join("\n");
        if query.trim().is_empty() {
            return Ok(SignalResult::new(
                SignalName::IncidentSimilarity,
                file_path,
                0.0,
                classify_incident_score(0.0),
                "no recent commit messages to compare".to_owned(),
            ));
        }

        let matches = self.search.rank(&query, INCIDENT_MATCH_LIMIT)?;
        let top_score = matches.first().map_or(0.0, |top| top.score);
        let evidence_text = if matches.is_empty() {
            format!("{} recent commits match no known incident", messages.len())
        } else {
            let listed = matches
                .iter()
                .map(|hit| format!("{} \"{}\" ({:.2})", hit.incident_id, hit.title, hit.score))
                .collect::<Vec<_>>()
                .join(", ");
            format!("recent commits resemble {listed}")
        };

        Ok(SignalResult::new(
            SignalName::IncidentSimilarity,
            file_path,
            top_score,
            classify_incident_score(top_score),
            evidence_text,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use vigil_cache::MemoryCache;
    use vigil_core::RiskLevel;
    use vigil_store::{
        DisablePolicy, IncidentMatch, MemoryGraphStore, MemoryStatStore, OwnershipHistory,
    };

    use super::*;
    use crate::validator::SignalValidator;

    struct StaticSearch {
        matches: Vec<IncidentMatch>,
        queries: Mutex<Vec<String>>,
    }

    impl IncidentSearch for StaticSearch {
        fn rank(&self, query: &str, limit: usize) -> Result<Vec<IncidentMatch>, StoreError> {
            self.queries
                .lock()
                .expect("queries lock")
                .push(query.to_owned());
            Ok(self.matches.iter().take(limit).cloned().collect())
        }
    }

    fn calculator(graph: MemoryGraphStore, matches: Vec<IncidentMatch>) -> (OnDemandCalculator, Arc<StaticSearch>) {
        let computer = Arc::new(SignalComputer::new(
            Arc::new(graph),
            Arc::new(MemoryCache::new()),
            SignalValidator::new(Arc::new(MemoryStatStore::new()), DisablePolicy::default()),
            Duration::from_secs(900),
        ));
        let search = Arc::new(StaticSearch {
            matches,
            queries: Mutex::new(Vec::new()),
        });
        (
            OnDemandCalculator::new(computer, search.clone(), OwnershipWindow::default(), 20),
            search,
        )
    }

    fn hit(id: &str, score: f64) -> IncidentMatch {
        IncidentMatch {
            incident_id: id.to_owned(),
            title: format!("incident {id}"),
            score,
        }
    }

    #[test]
    fn recent_ownership_transition_is_high() {
        let graph = MemoryGraphStore::new();
        graph.set_ownership(
            "src/auth.rs",
            OwnershipHistory {
                current_owner: Some("bob@example.com".to_owned()),
                previous_owner: Some("alice@example.com".to_owned()),
                days_since_transition: Some(12),
                commit_count: 9,
                window_days: 90,
            },
        );
        let (calculator, _) = calculator(graph, Vec::new());

        let outcome = calculator.calculate(SignalName::OwnershipChurn, "src/auth.rs");
        assert_eq!(outcome.level(), Some(RiskLevel::High));
        assert_eq!(outcome.value(), Some(12.0));
        assert!(outcome.describe().contains("alice@example.com"));
    }

    #[test]
    fn file_without_transition_is_low() {
        let (calculator, _) = calculator(MemoryGraphStore::new(), Vec::new());
        let outcome = calculator.calculate(SignalName::OwnershipChurn, "src/quiet.rs");
        assert_eq!(outcome.level(), Some(RiskLevel::Low));
        assert_eq!(outcome.value(), Some(-1.0));
    }

    #[test]
    fn incident_similarity_uses_top_score_and_commit_messages() {
        let graph = MemoryGraphStore::new();
        let now = now_unix_seconds();
        graph.add_commit_message("src/auth.rs", now - 60, "fix token refresh race");
        graph.add_commit_message("src/auth.rs", now - 120, "retry session lookup");
        let (calculator, search) = calculator(graph, vec![hit("INC-7", 11.5), hit("INC-2", 4.0)]);

        let outcome = calculator.calculate(SignalName::IncidentSimilarity, "src/auth.rs");
        assert_eq!(outcome.level(), Some(RiskLevel::High));
        assert_eq!(outcome.value(), Some(11.5));
        assert!(outcome.describe().contains("INC-7"));

        let queries = search.queries.lock().expect("queries lock");
        assert_eq!(queries.len(), 1);
        assert!(queries[0].contains("token refresh race"));
        assert!(queries[0].contains("retry session lookup"));
    }

    #[test]
    fn no_commit_messages_skips_search() {
        let (calculator, search) = calculator(MemoryGraphStore::new(), vec![hit("INC-7", 11.5)]);
        let outcome = calculator.calculate(SignalName::IncidentSimilarity, "src/new.rs");
        assert_eq!(outcome.level(), Some(RiskLevel::Low));
        assert_eq!(outcome.value(), Some(0.0));
        assert!(search.queries.lock().expect("queries lock").is_empty());
    }

    #[test]
    fn medium_band_for_middling_scores() {
        let graph = MemoryGraphStore::new();
        graph.add_commit_message("src/db.rs", now_unix_seconds(), "pool exhaustion under load");
        let (calculator, _) = calculator(graph, vec![hit("INC-3", 5.0)]);
        let outcome = calculator.calculate(SignalName::IncidentSimilarity, "src/db.rs");
        assert_eq!(outcome.level(), Some(RiskLevel::Medium));
    }

    #[test]
    fn graph_outage_reports_unknown() {
        let graph = MemoryGraphStore::new();
        graph.set_unavailable(true);
        let (calculator, _) = calculator(graph, Vec::new());
        let outcome = calculator.calculate(SignalName::OwnershipChurn, "src/auth.rs");
        assert!(matches!(outcome, SignalOutcome::Unknown { .. }));
    }
}
