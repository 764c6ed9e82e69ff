use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use vigil_config::{CouplingConfig, load_workspace_config};
use vigil_core::{SECONDS_PER_DAY, normalize_path};
use vigil_store::{CoChangeEdge, CouplingBuildState, IngestedCommit, SqliteGraphStore};

use crate::AnalysisError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouplingBuildMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouplingBuildOutcome {
    pub mode: CouplingBuildMode,
    pub commits_scanned: usize,
    pub bulk_commits_skipped: usize,
    pub affected_files: Vec<String>,
    pub edges_written: usize,
    pub last_seq: i64,
    pub built_at: i64,
}

#[derive(Debug, Default)]
struct PairAggregate {
    count: u64,
}

#[derive(Debug, Default)]
struct WindowScan {
    edges: Vec<CoChangeEdge>,
    commits_scanned: usize,
    bulk_commits_skipped: usize,
}

/// Derives CO_CHANGED edge weights from commit history over a rolling window.
pub struct CouplingBuilder {
    store: SqliteGraphStore,
    config: CouplingConfig,
}

impl CouplingBuilder {
    pub fn new(store: SqliteGraphStore, config: CouplingConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CouplingConfig {
        &self.config
    }

    /// Recomputes every edge in the window and replaces the stored set.
    pub fn rebuild(&self, now_unix: i64) -> Result<CouplingBuildOutcome, AnalysisError> {
        let last_seq = self.store.latest_commit_seq()?;
        let commits = self.store.commits_since(self.window_start(now_unix))?;
        let scan = self.scan_window(&commits, None);
        let previous = self.store.list_co_change_edges()?;

        let state = CouplingBuildState {
            last_seq,
            last_built_at: now_unix,
        };
        self.store.replace_all_co_change_edges(&scan.edges, state)?;

        let affected_files = edge_endpoints(previous.iter().chain(&scan.edges));
        tracing::info!(
            commits = scan.commits_scanned,
            bulk_skipped = scan.bulk_commits_skipped,
            edges = scan.edges.len(),
            "co-change edges rebuilt"
        );

        Ok(CouplingBuildOutcome {
            mode: CouplingBuildMode::Full,
            commits_scanned: scan.commits_scanned,
            bulk_commits_skipped: scan.bulk_commits_skipped,
            affected_files,
            edges_written: scan.edges.len(),
            last_seq,
            built_at: now_unix,
        })
    }

    /// Recomputes only the edges of files touched by commits ingested since the
    /// last run. Falls back to a full rebuild when no run has been recorded.
    pub fn update_incremental(&self, now_unix: i64) -> Result<CouplingBuildOutcome, AnalysisError> {
        let Some(previous) = self.store.coupling_state()? else {
            return self.rebuild(now_unix);
        };

        let fresh = self.store.commits_after_seq(previous.last_seq)?;
        let last_seq = fresh
            .iter()
            .map(|commit| commit.seq)
            .max()
            .unwrap_or(previous.last_seq);

        let affected = fresh
            .iter()
            .filter(|commit| !self.is_bulk(commit))
            .flat_map(|commit| commit.files.iter())
            .map(|path| normalize_path(path))
            .filter(|path| !self.is_excluded(path))
            .collect::<BTreeSet<_>>();

        let state = CouplingBuildState {
            last_seq,
            last_built_at: now_unix,
        };
        if affected.is_empty() {
            self.store.replace_co_change_edges_for(&[], &[], state)?;
            return Ok(CouplingBuildOutcome {
                mode: CouplingBuildMode::Incremental,
                commits_scanned: fresh.len(),
                bulk_commits_skipped: fresh.iter().filter(|commit| self.is_bulk(commit)).count(),
                affected_files: Vec::new(),
                edges_written: 0,
                last_seq,
                built_at: now_unix,
            });
        }

        let commits = self.store.commits_since(self.window_start(now_unix))?;
        let scan = self.scan_window(&commits, Some(&affected));
        let previous = self
            .store
            .list_co_change_edges()?
            .into_iter()
            .filter(|edge| affected.contains(&edge.file_a) || affected.contains(&edge.file_b))
            .collect::<Vec<_>>();
        let replaced = affected.iter().cloned().collect::<Vec<_>>();
        self.store
            .replace_co_change_edges_for(&replaced, &scan.edges, state)?;

        let mut affected_files = edge_endpoints(previous.iter().chain(&scan.edges));
        affected_files.extend(replaced);
        affected_files.sort();
        affected_files.dedup();

        tracing::info!(
            new_commits = fresh.len(),
            affected = affected_files.len(),
            edges = scan.edges.len(),
            "co-change edges updated incrementally"
        );

        Ok(CouplingBuildOutcome {
            mode: CouplingBuildMode::Incremental,
            commits_scanned: scan.commits_scanned,
            bulk_commits_skipped: scan.bulk_commits_skipped,
            affected_files,
            edges_written: scan.edges.len(),
            last_seq,
            built_at: now_unix,
        })
    }

    fn window_start(&self, now_unix: i64) -> i64 {
        now_unix - i64::from(self.config.window_days) * SECONDS_PER_DAY
    }

    fn is_bulk(&self, commit: &IngestedCommit) -> bool {
        commit.files.len() > self.config.bulk_commit_threshold
    }

    /// `frequency = together / (commits touching a + commits touching b - together)`.
    fn scan_window(
        &self,
        commits: &[IngestedCommit],
        only: Option<&BTreeSet<String>>,
    ) -> WindowScan {
        let mut per_file_commit_count = HashMap::<String, u64>::new();
        let mut pairs = BTreeMap::<(String, String), PairAggregate>::new();
        let mut scan = WindowScan::default();

        for commit in commits {
            scan.commits_scanned += 1;
            if self.is_bulk(commit) {
                scan.bulk_commits_skipped += 1;
                continue;
            }

            let sorted_files = commit
                .files
                .iter()
                .map(|path| normalize_path(path))
                .filter(|path| !self.is_excluded(path))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect::<Vec<_>>();

            for file in &sorted_files {
                *per_file_commit_count.entry(file.clone()).or_insert(0) += 1;
            }
            for left_idx in 0..sorted_files.len() {
                for right_idx in (left_idx + 1)..sorted_files.len() {
                    let file_a = &sorted_files[left_idx];
                    let file_b = &sorted_files[right_idx];
                    if only.is_some_and(|only| !only.contains(file_a) && !only.contains(file_b)) {
                        continue;
                    }
                    pairs
                        .entry((file_a.clone(), file_b.clone()))
                        .or_default()
                        .count += 1;
                }
            }
        }

        for ((file_a, file_b), aggregate) in pairs {
            let total_a = per_file_commit_count.get(&file_a).copied().unwrap_or(0);
            let total_b = per_file_commit_count.get(&file_b).copied().unwrap_or(0);
            let touching_either = (total_a + total_b).saturating_sub(aggregate.count);
            if touching_either == 0 {
                continue;
            }
            let frequency = aggregate.count as f64 / touching_either as f64;
            if frequency < self.config.min_frequency {
                continue;
            }
            scan.edges.push(CoChangeEdge::new(
                &file_a,
                &file_b,
                frequency,
                aggregate.count,
                self.config.window_days,
            ));
        }

        scan
    }

    fn is_excluded(&self, path: &str) -> bool {
        if path.is_empty() {
            return true;
        }

        let file_name = Path::new(path)
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or(path);

        self.config.exclude_patterns.iter().any(|pattern| {
            let pattern = pattern.trim();
            if pattern.is_empty() {
                return false;
            }

            wildcard_match(pattern, path)
                || (!pattern.contains('/') && wildcard_match(pattern, file_name))
        })
    }
}

/// Files whose co-change reading may differ after the edges were replaced.
fn edge_endpoints<'a>(edges: impl Iterator<Item = &'a CoChangeEdge>) -> Vec<String> {
    edges
        .flat_map(|edge| [edge.file_a.clone(), edge.file_b.clone()])
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn open_coupling_builder(
    workspace_root: impl AsRef<Path>,
) -> Result<CouplingBuilder, AnalysisError> {
    let workspace_root = workspace_root.as_ref();
    let config = load_workspace_config(workspace_root)?;
    Ok(CouplingBuilder::new(
        SqliteGraphStore::open(workspace_root)?,
        config.coupling,
    ))
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    let pattern = pattern.as_bytes();
    let text = text.as_bytes();
    let mut previous = vec![false; text.len() + 1];
    let mut current = vec![false; text.len() + 1];
    previous[0] = true;

    for &token in pattern {
        current[0] = token == b'*' && previous[0];
        for index in 1..=text.len() {
            current[index] = match token {
                b'*' => current[index - 1] || previous[index],
                b'?' => previous[index - 1],
                _ => previous[index - 1] && token == text[index - 1],
            };
        }
        std::mem::swap(&mut previous, &mut current);
        current.fill(false);
    }

    previous[text.len()]
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use vigil_store::{CommitRecord, GraphStore};

    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn record(store: &SqliteGraphStore, hash: &str, days_ago: i64, files: &[&str]) {
        store
            .record_commit(&CommitRecord {
                hash: hash.to_owned(),
                author_email: "dev@example.com".to_owned(),
                author_name: "Dev".to_owned(),
                committed_at: NOW - days_ago * SECONDS_PER_DAY,
                message: format!("commit {hash}"),
                files: files.iter().map(|file| (*file).to_owned()).collect(),
            })
            .expect("record commit");
    }

    fn builder(workspace: &Path) -> CouplingBuilder {
        CouplingBuilder::new(
            SqliteGraphStore::open(workspace).expect("open store"),
            CouplingConfig {
                bulk_commit_threshold: 5,
                ..CouplingConfig::default()
            },
        )
    }

    #[test]
    fn wildcard_match_handles_star_and_question_mark() {
        assert!(wildcard_match("*.lock", "Cargo.lock"));
        assert!(wildcard_match("src/?.rs", "src/a.rs"));
        assert!(!wildcard_match("*.lock", "Cargo.toml"));
    }

    #[test]
    fn rebuild_computes_jaccard_frequency_and_prunes_weak_pairs() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteGraphStore::open(temp.path()).expect("open store");
        record(&store, "c1", 10, &["a.rs", "b.rs"]);
        record(&store, "c2", 9, &["a.rs", "b.rs"]);
        record(&store, "c3", 8, &["a.rs", "b.rs", "c.rs"]);
        record(&store, "c4", 7, &["a.rs"]);
        record(&store, "c5", 6, &["c.rs", "d.rs"]);
        record(&store, "c6", 5, &["c.rs", "d.rs"]);
        record(&store, "c7", 4, &["d.rs", "Cargo.lock"]);
        record(&store, "c8", 200, &["a.rs", "e.rs"]);

        let outcome = builder(temp.path()).rebuild(NOW).expect("rebuild");
        assert_eq!(outcome.mode, CouplingBuildMode::Full);
        assert_eq!(outcome.commits_scanned, 7);
        assert_eq!(outcome.last_seq, 8);

        let from_a = store.co_changed("a.rs").expect("a partners");
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_a[0].path, "b.rs");
        assert!((from_a[0].frequency - 0.75).abs() < 1e-9);
        assert_eq!(from_a[0].co_change_count, 3);

        let from_d = store.co_changed("d.rs").expect("d partners");
        assert_eq!(from_d.len(), 1);
        assert_eq!(from_d[0].path, "c.rs");
        assert!((from_d[0].frequency - 0.5).abs() < 1e-9);
        assert!(store.co_changed("Cargo.lock").expect("lock").is_empty());
        assert!(store.co_changed("e.rs").expect("out of window").is_empty());

        for edge in store.list_co_change_edges().expect("edges") {
            let forward = store.co_changed(&edge.file_a).expect("forward");
            let backward = store.co_changed(&edge.file_b).expect("backward");
            let ab = forward.iter().find(|p| p.path == edge.file_b).expect("a->b");
            let ba = backward.iter().find(|p| p.path == edge.file_a).expect("b->a");
            assert_eq!(ab.frequency, ba.frequency);
        }
    }

    #[test]
    fn bulk_commits_are_skipped() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteGraphStore::open(temp.path()).expect("open store");
        record(
            &store,
            "bulk",
            1,
            &["a.rs", "b.rs", "c.rs", "d.rs", "e.rs", "f.rs"],
        );

        let outcome = builder(temp.path()).rebuild(NOW).expect("rebuild");
        assert_eq!(outcome.bulk_commits_skipped, 1);
        assert_eq!(outcome.edges_written, 0);
    }

    #[test]
    fn incremental_update_replaces_only_affected_edges() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteGraphStore::open(temp.path()).expect("open store");
        let builder = builder(temp.path());

        record(&store, "c1", 10, &["a.rs", "b.rs"]);
        record(&store, "c2", 9, &["x.rs", "y.rs"]);
        let first = builder.update_incremental(NOW).expect("first run rebuilds");
        assert_eq!(first.mode, CouplingBuildMode::Full);
        assert_eq!(store.co_changed("a.rs").expect("a")[0].frequency, 1.0);

        record(&store, "c3", 1, &["a.rs"]);
        record(&store, "c4", 1, &["a.rs"]);
        let second = builder.update_incremental(NOW).expect("incremental");
        assert_eq!(second.mode, CouplingBuildMode::Incremental);
        assert_eq!(
            second.affected_files,
            vec!["a.rs".to_owned(), "b.rs".to_owned()]
        );
        assert_eq!(second.last_seq, 4);

        let from_b = store.co_changed("b.rs").expect("b");
        assert!((from_b[0].frequency - (1.0 / 3.0)).abs() < 1e-9);
        assert_eq!(store.co_changed("x.rs").expect("x")[0].frequency, 1.0);

        let third = builder.update_incremental(NOW).expect("no new commits");
        assert!(third.affected_files.is_empty());
        assert_eq!(third.last_seq, 4);
        assert_eq!(
            store.coupling_state().expect("state").map(|s| s.last_seq),
            Some(4)
        );
    }
}
