use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::{IncidentRecord, SqliteGraphStore, StoreError};

const K1: f64 = 1.2;
const B: f64 = 0.75;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "into", "is", "it",
    "of", "on", "or", "that", "the", "this", "to", "was", "were", "with",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentMatch {
    pub incident_id: String,
    pub title: String,
    pub score: f64,
}

/// Lexical ranking of incident text against a free-form query.
pub trait IncidentSearch: Send + Sync {
    fn rank(&self, query: &str, limit: usize) -> Result<Vec<IncidentMatch>, StoreError>;
}

pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| token.chars().count() > 1)
        .map(str::to_lowercase)
        .filter(|token| !STOPWORDS.contains(&token.as_str()))
        .collect()
}

struct IndexedIncident {
    id: String,
    title: String,
    length: usize,
    term_counts: HashMap<String, u32>,
}

/// Okapi BM25 over incident title and description.
pub struct Bm25IncidentIndex {
    documents: Vec<IndexedIncident>,
    document_frequency: HashMap<String, u32>,
    average_length: f64,
}

impl Bm25IncidentIndex {
    pub fn build(incidents: &[IncidentRecord]) -> Self {
        let mut documents = Vec::with_capacity(incidents.len());
        let mut document_frequency = HashMap::<String, u32>::new();
        let mut total_length = 0usize;

        for incident in incidents {
            let tokens = tokenize(&format!("{} {}", incident.title, incident.description));
            let mut term_counts = HashMap::<String, u32>::new();
            for token in &tokens {
                *term_counts.entry(token.clone()).or_default() += 1;
            }
            for term in term_counts.keys() {
                *document_frequency.entry(term.clone()).or_default() += 1;
            }
            total_length += tokens.len();
            documents.push(IndexedIncident {
                id: incident.id.clone(),
                title: incident.title.clone(),
                length: tokens.len(),
                term_counts,
            });
        }

        let average_length = if documents.is_empty() {
            0.0
        } else {
            total_length as f64 / documents.len() as f64
        };

        Self {
            documents,
            document_frequency,
            average_length,
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn idf(&self, term: &str) -> f64 {
        let total = self.documents.len() as f64;
        let containing = f64::from(self.document_frequency.get(term).copied().unwrap_or(0));
        (1.0 + (total - containing + 0.5) / (containing + 0.5)).ln()
    }

    pub fn search(&self, query: &str, limit: usize) -> Vec<IncidentMatch> {
        if limit == 0 || self.documents.is_empty() {
            return Vec::new();
        }
        let terms = tokenize(query).into_iter().collect::<BTreeSet<_>>();
        if terms.is_empty() {
            return Vec::new();
        }

        let mut matches = self
            .documents
            .iter()
            .filter_map(|document| {
                let mut score = 0.0;
                for term in &terms {
                    let Some(frequency) = document.term_counts.get(term) else {
                        continue;
                    };
                    let frequency = f64::from(*frequency);
                    let length_norm = if self.average_length > 0.0 {
                        document.length as f64 / self.average_length
                    } else {
                        1.0
                    };
                    score += self.idf(term) * (frequency * (K1 + 1.0))
                        / (frequency + K1 * (1.0 - B + B * length_norm));
                }
                (score > 0.0).then(|| IncidentMatch {
                    incident_id: document.id.clone(),
                    title: document.title.clone(),
                    score,
                })
            })
            .collect::<Vec<_>>();

        matches.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| left.incident_id.cmp(&right.incident_id))
        });
        matches.truncate(limit);
        matches
    }
}

impl IncidentSearch for Bm25IncidentIndex {
    fn rank(&self, query: &str, limit: usize) -> Result<Vec<IncidentMatch>, StoreError> {
        Ok(self.search(query, limit))
    }
}

/// Indexes the incidents currently stored in the graph database on every query,
/// so newly linked incidents are visible without a refresh step.
pub struct SqliteIncidentSearch {
    store: SqliteGraphStore,
}

impl SqliteIncidentSearch {
    pub fn new(store: SqliteGraphStore) -> Self {
        Self { store }
    }
}

impl IncidentSearch for SqliteIncidentSearch {
    fn rank(&self, query: &str, limit: usize) -> Result<Vec<IncidentMatch>, StoreError> {
        let incidents = self.store.list_incidents()?;
        Ok(Bm25IncidentIndex::build(&incidents).search(query, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incident(id: &str, title: &str, description: &str) -> IncidentRecord {
        IncidentRecord {
            id: id.to_owned(),
            title: title.to_owned(),
            description: description.to_owned(),
            severity: "high".to_owned(),
            occurred_at: 0,
        }
    }

    #[test]
    fn tokenize_lowercases_and_drops_stopwords() {
        assert_eq!(
            tokenize("Fix the Token-Refresh race in auth/session.rs"),
            vec!["fix", "token", "refresh", "race", "auth", "session", "rs"]
        );
    }

    #[test]
    fn search_ranks_most_relevant_incident_first() {
        let index = Bm25IncidentIndex::build(&[
            incident(
                "INC-1",
                "Login outage",
                "token refresh race caused session loss for all users",
            ),
            incident("INC-2", "Slow dashboard", "report query timed out"),
            incident("INC-3", "Billing mismatch", "invoice rounding error"),
        ]);

        let matches = index.search("fix token refresh race in session handling", 5);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].incident_id, "INC-1");
        assert!(matches[0].score > 0.0);

        assert!(index.search("completely unrelated words", 5).is_empty());
        assert!(index.search("", 5).is_empty());
    }

    #[test]
    fn rare_terms_outweigh_common_terms() {
        let index = Bm25IncidentIndex::build(&[
            incident("INC-1", "auth failure", "auth deadlock"),
            incident("INC-2", "auth failure", "auth timeout"),
            incident("INC-3", "auth failure", "auth quota"),
        ]);
        let matches = index.search("auth deadlock", 3);
        assert_eq!(matches[0].incident_id, "INC-1");
        assert!(matches[0].score > matches[1].score);
    }

    #[test]
    fn empty_index_returns_nothing() {
        let index = Bm25IncidentIndex::build(&[]);
        assert!(index.is_empty());
        assert!(index.search("anything", 3).is_empty());
    }
}
