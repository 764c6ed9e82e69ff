use serde::{Deserialize, Serialize};
use thiserror::Error;
use vigil_core::SignalName;

mod graph;
mod memory;
mod schema;
mod search;
mod stats;

pub use graph::SqliteGraphStore;
pub use memory::MemoryGraphStore;
pub use search::{Bm25IncidentIndex, IncidentMatch, IncidentSearch, SqliteIncidentSearch, tokenize};
pub use stats::{DisablePolicy, MemoryStatStore, SignalStat, SignalStatStore, SqliteSignalStatStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("graph unavailable: {0}")]
    Unavailable(String),
    #[error("invalid stored record: {0}")]
    InvalidRecord(String),
}

impl StoreError {
    /// Errors worth one retry before the caller degrades.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Read-only queries the risk engine issues against the knowledge graph.
pub trait GraphStore: Send + Sync {
    fn coupling(&self, file_path: &str) -> Result<u32, StoreError>;
    fn co_changed(&self, file_path: &str) -> Result<Vec<CoChangePartner>, StoreError>;
    fn test_ratio(&self, file_path: &str) -> Result<TestRatioRecord, StoreError>;
    fn ownership_history(
        &self,
        file_path: &str,
        window: OwnershipWindow,
        now_unix: i64,
    ) -> Result<OwnershipHistory, StoreError>;
    fn neighbors(&self, file_path: &str, hops: u32) -> Result<Vec<NeighborRecord>, StoreError>;
    fn recent_commit_messages(
        &self,
        file_path: &str,
        since_unix: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub language: String,
    pub loc: u64,
    pub is_test: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntity {
    pub name: String,
    pub kind: String,
    pub line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyKind {
    Imports,
    Calls,
}

impl DependencyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Imports => "IMPORTS",
            Self::Calls => "CALLS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDependency {
    pub target_path: String,
    pub kind: DependencyKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub hash: String,
    pub author_email: String,
    pub author_name: String,
    pub committed_at: i64,
    pub message: String,
    pub files: Vec<String>,
}

/// Commit as seen by the coupling builder, tagged with its ingestion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedCommit {
    pub seq: i64,
    pub hash: String,
    pub committed_at: i64,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub severity: String,
    pub occurred_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentRelation {
    CausedBy,
    Affects,
}

impl IncidentRelation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CausedBy => "CAUSED_BY",
            Self::Affects => "AFFECTS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentTarget {
    Commit(String),
    File(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoChangePartner {
    pub path: String,
    pub frequency: f64,
    pub co_change_count: u64,
    pub window_days: u32,
}

/// Stored with `file_a < file_b`; one row serves both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoChangeEdge {
    pub file_a: String,
    pub file_b: String,
    pub frequency: f64,
    pub co_change_count: u64,
    pub window_days: u32,
}

impl CoChangeEdge {
    pub fn new(left: &str, right: &str, frequency: f64, co_change_count: u64, window_days: u32) -> Self {
        let (file_a, file_b) = if left <= right { (left, right) } else { (right, left) };
        Self {
            file_a: file_a.to_owned(),
            file_b: file_b.to_owned(),
            frequency,
            co_change_count,
            window_days,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouplingBuildState {
    pub last_seq: i64,
    pub last_built_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRatioRecord {
    pub source_loc: u64,
    pub test_loc: u64,
    pub test_files: Vec<String>,
    pub ratio: f64,
}

impl TestRatioRecord {
    /// Smoothed `(test + 1) / (source + 1)`; zero when nothing is known.
    pub fn from_loc(source_loc: u64, test_loc: u64, test_files: Vec<String>) -> Self {
        let ratio = if source_loc == 0 && test_loc == 0 {
            0.0
        } else {
            (test_loc as f64 + 1.0) / (source_loc as f64 + 1.0)
        };
        Self {
            source_loc,
            test_loc,
            test_files,
            ratio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipWindow {
    pub window_days: u32,
    pub current_owner_days: u32,
}

impl Default for OwnershipWindow {
    fn default() -> Self {
        Self {
            window_days: 90,
            current_owner_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OwnershipHistory {
    pub current_owner: Option<String>,
    pub previous_owner: Option<String>,
    pub days_since_transition: Option<i64>,
    pub commit_count: u64,
    pub window_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NeighborRecord {
    pub path: String,
    pub hop: u32,
    pub relation: String,
}

pub(crate) fn parse_signal_name(raw: &str) -> Result<SignalName, StoreError> {
    raw.parse::<SignalName>().map_err(StoreError::InvalidRecord)
}
