use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, params};
use vigil_core::{SECONDS_PER_DAY, days_between, normalize_path, now_unix_seconds};

use crate::schema::{open_connection, prepare_database};
use crate::{
    CoChangeEdge, CoChangePartner, CommitRecord, CouplingBuildState, FileDependency, FileEntity,
    FileRecord, GraphStore, IncidentRecord, IncidentRelation, IncidentTarget, IngestedCommit,
    NeighborRecord, OwnershipHistory, OwnershipWindow, StoreError, TestRatioRecord,
};

#[derive(Debug, Clone)]
pub struct SqliteGraphStore {
    sqlite_path: PathBuf,
}

impl SqliteGraphStore {
    pub fn open(workspace_root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let sqlite_path = prepare_database(workspace_root.as_ref())?;
        Ok(Self { sqlite_path })
    }

    pub fn sqlite_path(&self) -> &Path {
        &self.sqlite_path
    }

    fn connection(&self) -> Result<Connection, StoreError> {
        open_connection(&self.sqlite_path)
    }

    pub fn upsert_file(&self, record: &FileRecord) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.execute(
            r#"
            INSERT INTO files (path, language, loc, is_test, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(path) DO UPDATE SET
                language = excluded.language,
                loc = excluded.loc,
                is_test = excluded.is_test,
                updated_at = excluded.updated_at
            "#,
            params![
                normalize_path(&record.path),
                record.language,
                record.loc as i64,
                record.is_test as i64,
                now_unix_seconds(),
            ],
        )?;
        Ok(())
    }

    /// Sub-file entities are replaced wholesale whenever the owning file is reparsed.
    pub fn replace_file_entities(
        &self,
        file_path: &str,
        entities: &[FileEntity],
    ) -> Result<(), StoreError> {
        let file_path = normalize_path(file_path);
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM file_entities WHERE file_path = ?1",
            params![file_path],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO file_entities (file_path, name, kind, line) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for entity in entities {
                stmt.execute(params![file_path, entity.name, entity.kind, entity.line as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_file_entities(&self, file_path: &str) -> Result<Vec<FileEntity>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT name, kind, line FROM file_entities WHERE file_path = ?1 ORDER BY line ASC, name ASC",
        )?;
        let rows = stmt.query_map(params![normalize_path(file_path)], |row| {
            Ok(FileEntity {
                name: row.get(0)?,
                kind: row.get(1)?,
                line: row.get::<_, i64>(2)?.max(0) as u32,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Replaces the outgoing dependency edges of `source_path`.
    pub fn replace_dependencies(
        &self,
        source_path: &str,
        dependencies: &[FileDependency],
    ) -> Result<(), StoreError> {
        let source_path = normalize_path(source_path);
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM file_dependencies WHERE source_path = ?1",
            params![source_path],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO file_dependencies (source_path, target_path, kind) VALUES (?1, ?2, ?3)",
            )?;
            for dependency in dependencies {
                let target = normalize_path(&dependency.target_path);
                if target.is_empty() || target == source_path {
                    continue;
                }
                stmt.execute(params![source_path, target, dependency.kind.as_str()])?;
            }
        }
        tx.commit()?;
        tracing::debug!(file = %source_path, edges = dependencies.len(), "dependency edges replaced");
        Ok(())
    }

    pub fn link_test(&self, test_path: &str, source_path: &str) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR IGNORE INTO test_links (test_path, source_path) VALUES (?1, ?2)",
            params![normalize_path(test_path), normalize_path(source_path)],
        )?;
        Ok(())
    }

    /// Commits are append-only. Returns the files whose cached signals are now stale,
    /// or nothing when the commit was already ingested.
    pub fn record_commit(&self, commit: &CommitRecord) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            r#"
            INSERT OR IGNORE INTO commits (hash, author_email, author_name, committed_at, message)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                commit.hash.trim(),
                commit.author_email.trim(),
                commit.author_name.trim(),
                commit.committed_at,
                commit.message,
            ],
        )?;
        if inserted == 0 {
            tracing::debug!(hash = %commit.hash.trim(), "commit already ingested");
            return Ok(Vec::new());
        }

        let files = commit
            .files
            .iter()
            .map(|path| normalize_path(path))
            .filter(|path| !path.is_empty())
            .collect::<BTreeSet<_>>();
        {
            let mut stmt =
                tx.prepare("INSERT OR IGNORE INTO commit_files (commit_hash, path) VALUES (?1, ?2)")?;
            for path in &files {
                stmt.execute(params![commit.hash.trim(), path])?;
            }
        }
        tx.commit()?;
        Ok(files.into_iter().collect())
    }

    pub fn upsert_incident(&self, incident: &IncidentRecord) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.execute(
            r#"
            INSERT INTO incidents (id, title, description, severity, occurred_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                severity = excluded.severity,
                occurred_at = excluded.occurred_at
            "#,
            params![
                incident.id,
                incident.title,
                incident.description,
                incident.severity,
                incident.occurred_at,
            ],
        )?;
        Ok(())
    }

    /// Links an incident to a commit or file. Returns the files whose incident
    /// similarity is now stale.
    pub fn link_incident(
        &self,
        incident_id: &str,
        target: &IncidentTarget,
        relation: IncidentRelation,
    ) -> Result<Vec<String>, StoreError> {
        let conn = self.connection()?;
        let (target_kind, target_value) = match target {
            IncidentTarget::Commit(hash) => ("commit", hash.trim().to_owned()),
            IncidentTarget::File(path) => ("file", normalize_path(path)),
        };
        conn.execute(
            r#"
            INSERT OR IGNORE INTO incident_links (incident_id, target_kind, target, relation)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![incident_id, target_kind, target_value, relation.as_str()],
        )?;

        match target {
            IncidentTarget::File(_) => Ok(vec![target_value]),
            IncidentTarget::Commit(_) => {
                let mut stmt = conn.prepare(
                    "SELECT path FROM commit_files WHERE commit_hash = ?1 ORDER BY path ASC",
                )?;
                let rows = stmt.query_map(params![target_value], |row| row.get::<_, String>(0))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            }
        }
    }

    pub fn list_incidents(&self) -> Result<Vec<IncidentRecord>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, title, description, severity, occurred_at
            FROM incidents
            ORDER BY occurred_at DESC, id ASC
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(IncidentRecord {
                id: row.get(0)?,
                title: row.get(1)?,
                description: row.get(2)?,
                severity: row.get(3)?,
                occurred_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn latest_commit_seq(&self) -> Result<i64, StoreError> {
        let conn = self.connection()?;
        let seq = conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM commits", [], |row| {
            row.get::<_, i64>(0)
        })?;
        Ok(seq)
    }

    /// Commits in the window, ordered by ingestion.
    pub fn commits_since(&self, since_unix: i64) -> Result<Vec<IngestedCommit>, StoreError> {
        let conn = self.connection()?;
        load_commits(
            &conn,
            "WHERE c.committed_at >= ?1",
            params![since_unix],
        )
    }

    pub fn commits_after_seq(&self, seq: i64) -> Result<Vec<IngestedCommit>, StoreError> {
        let conn = self.connection()?;
        load_commits(&conn, "WHERE c.seq > ?1", params![seq])
    }

    pub fn coupling_state(&self) -> Result<Option<CouplingBuildState>, StoreError> {
        let conn = self.connection()?;
        let state = conn
            .query_row(
                "SELECT last_seq, last_built_at FROM coupling_build_state WHERE id = 1",
                [],
                |row| {
                    Ok(CouplingBuildState {
                        last_seq: row.get(0)?,
                        last_built_at: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    /// Drops every co-change edge and writes `edges` in their place.
    pub fn replace_all_co_change_edges(
        &self,
        edges: &[CoChangeEdge],
        state: CouplingBuildState,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM co_change_edges", [])?;
        insert_edges(&tx, edges, state.last_built_at)?;
        save_state(&tx, state)?;
        tx.commit()?;
        tracing::info!(edges = edges.len(), "co-change edges rebuilt");
        Ok(())
    }

    /// Drops edges touching any of `files` and writes `edges`, leaving the rest intact.
    pub fn replace_co_change_edges_for(
        &self,
        files: &[String],
        edges: &[CoChangeEdge],
        state: CouplingBuildState,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("DELETE FROM co_change_edges WHERE file_a = ?1 OR file_b = ?1")?;
            for file in files {
                stmt.execute(params![normalize_path(file)])?;
            }
        }
        insert_edges(&tx, edges, state.last_built_at)?;
        save_state(&tx, state)?;
        tx.commit()?;
        tracing::debug!(
            files = files.len(),
            edges = edges.len(),
            "co-change edges replaced for touched files"
        );
        Ok(())
    }

    pub fn list_co_change_edges(&self) -> Result<Vec<CoChangeEdge>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT file_a, file_b, frequency, co_change_count, window_days
            FROM co_change_edges
            ORDER BY file_a ASC, file_b ASC
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CoChangeEdge {
                file_a: row.get(0)?,
                file_b: row.get(1)?,
                frequency: row.get(2)?,
                co_change_count: row.get::<_, i64>(3)?.max(0) as u64,
                window_days: row.get::<_, i64>(4)?.max(0) as u32,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl GraphStore for SqliteGraphStore {
    fn coupling(&self, file_path: &str) -> Result<u32, StoreError> {
        let file_path = normalize_path(file_path);
        let conn = self.connection()?;
        let count = conn.query_row(
            r#"
            SELECT COUNT(*) FROM (
                SELECT target_path AS other FROM file_dependencies WHERE source_path = ?1
                UNION
                SELECT source_path AS other FROM file_dependencies WHERE target_path = ?1
            )
            WHERE other <> ?1
            "#,
            params![file_path],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count.max(0) as u32)
    }

    fn co_changed(&self, file_path: &str) -> Result<Vec<CoChangePartner>, StoreError> {
        let file_path = normalize_path(file_path);
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT file_b, frequency, co_change_count, window_days
            FROM co_change_edges WHERE file_a = ?1
            UNION ALL
            SELECT file_a, frequency, co_change_count, window_days
            FROM co_change_edges WHERE file_b = ?1
            ORDER BY 2 DESC, 1 ASC
            "#,
        )?;
        let rows = stmt.query_map(params![file_path], |row| {
            Ok(CoChangePartner {
                path: row.get(0)?,
                frequency: row.get(1)?,
                co_change_count: row.get::<_, i64>(2)?.max(0) as u64,
                window_days: row.get::<_, i64>(3)?.max(0) as u32,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn test_ratio(&self, file_path: &str) -> Result<TestRatioRecord, StoreError> {
        let file_path = normalize_path(file_path);
        let conn = self.connection()?;
        let source_loc = conn
            .query_row(
                "SELECT loc FROM files WHERE path = ?1",
                params![file_path],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .unwrap_or(0)
            .max(0) as u64;

        let mut stmt = conn.prepare(
            r#"
            SELECT t.test_path, COALESCE(f.loc, 0)
            FROM test_links t
            LEFT JOIN files f ON f.path = t.test_path
            WHERE t.source_path = ?1
            ORDER BY t.test_path ASC
            "#,
        )?;
        let rows = stmt.query_map(params![file_path], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut test_files = Vec::new();
        let mut test_loc = 0u64;
        for row in rows {
            let (path, loc) = row?;
            test_loc += loc.max(0) as u64;
            test_files.push(path);
        }

        Ok(TestRatioRecord::from_loc(source_loc, test_loc, test_files))
    }

    fn ownership_history(
        &self,
        file_path: &str,
        window: OwnershipWindow,
        now_unix: i64,
    ) -> Result<OwnershipHistory, StoreError> {
        let file_path = normalize_path(file_path);
        let since = now_unix - i64::from(window.window_days) * SECONDS_PER_DAY;
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT c.author_email, c.committed_at
            FROM commits c
            JOIN commit_files cf ON cf.commit_hash = c.hash
            WHERE cf.path = ?1 AND c.committed_at >= ?2 AND c.committed_at <= ?3
            ORDER BY c.committed_at ASC, c.seq ASC
            "#,
        )?;
        let rows = stmt.query_map(params![file_path, since, now_unix], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let authored = rows.collect::<Result<Vec<_>, _>>()?;

        Ok(summarize_ownership(&authored, window, now_unix))
    }

    fn neighbors(&self, file_path: &str, hops: u32) -> Result<Vec<NeighborRecord>, StoreError> {
        let file_path = normalize_path(file_path);
        if hops == 0 || file_path.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            WITH RECURSIVE adjacency(from_path, to_path, relation) AS (
                SELECT source_path, target_path, kind FROM file_dependencies
                UNION ALL
                SELECT target_path, source_path, kind FROM file_dependencies
                UNION ALL
                SELECT file_a, file_b, 'CO_CHANGED' FROM co_change_edges
                UNION ALL
                SELECT file_b, file_a, 'CO_CHANGED' FROM co_change_edges
                UNION ALL
                SELECT test_path, source_path, 'TESTS' FROM test_links
                UNION ALL
                SELECT source_path, test_path, 'TESTS' FROM test_links
            ),
            reachable(path, hop, relation) AS (
                SELECT to_path, 1, relation FROM adjacency WHERE from_path = ?1
                UNION
                SELECT adjacency.to_path, reachable.hop + 1, adjacency.relation
                FROM reachable
                JOIN adjacency ON adjacency.from_path = reachable.path
                WHERE reachable.hop < ?2
            )
            SELECT path, MIN(hop) AS hop, relation
            FROM reachable
            WHERE path <> ?1
            GROUP BY path
            ORDER BY hop ASC, path ASC
            "#,
        )?;
        let rows = stmt.query_map(params![file_path, hops as i64], |row| {
            Ok(NeighborRecord {
                path: row.get(0)?,
                hop: row.get::<_, i64>(1)?.max(0) as u32,
                relation: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn recent_commit_messages(
        &self,
        file_path: &str,
        since_unix: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT c.message
            FROM commits c
            JOIN commit_files cf ON cf.commit_hash = c.hash
            WHERE cf.path = ?1 AND c.committed_at >= ?2
            ORDER BY c.committed_at DESC, c.seq DESC
            LIMIT ?3
            "#,
        )?;
        let rows = stmt.query_map(
            params![normalize_path(file_path), since_unix, limit as i64],
            |row| row.get::<_, String>(0),
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn load_commits(
    conn: &Connection,
    filter: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<IngestedCommit>, StoreError> {
    let sql = format!(
        r#"
        SELECT c.seq, c.hash, c.committed_at, cf.path
        FROM commits c
        LEFT JOIN commit_files cf ON cf.commit_hash = c.hash
        {filter}
        ORDER BY c.seq ASC, cf.path ASC
        "#
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(args, |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, Option<String>>(3)?,
        ))
    })?;

    let mut commits: Vec<IngestedCommit> = Vec::new();
    for row in rows {
        let (seq, hash, committed_at, path) = row?;
        if commits.last().map(|last| last.seq) != Some(seq) {
            commits.push(IngestedCommit {
                seq,
                hash,
                committed_at,
                files: Vec::new(),
            });
        }
        if let (Some(path), Some(commit)) = (path, commits.last_mut()) {
            commit.files.push(path);
        }
    }
    Ok(commits)
}

fn insert_edges(
    tx: &rusqlite::Transaction<'_>,
    edges: &[CoChangeEdge],
    built_at: i64,
) -> Result<(), StoreError> {
    let mut stmt = tx.prepare(
        r#"
        INSERT INTO co_change_edges (file_a, file_b, frequency, co_change_count, window_days, built_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(file_a, file_b) DO UPDATE SET
            frequency = excluded.frequency,
            co_change_count = excluded.co_change_count,
            window_days = excluded.window_days,
            built_at = excluded.built_at
        "#,
    )?;
    for edge in edges {
        let edge = CoChangeEdge::new(
            &edge.file_a,
            &edge.file_b,
            edge.frequency,
            edge.co_change_count,
            edge.window_days,
        );
        if edge.file_a == edge.file_b {
            continue;
        }
        stmt.execute(params![
            edge.file_a,
            edge.file_b,
            edge.frequency,
            edge.co_change_count as i64,
            edge.window_days as i64,
            built_at,
        ])?;
    }
    Ok(())
}

fn save_state(tx: &rusqlite::Transaction<'_>, state: CouplingBuildState) -> Result<(), StoreError> {
    tx.execute(
        r#"
        INSERT INTO coupling_build_state (id, last_seq, last_built_at)
        VALUES (1, ?1, ?2)
        ON CONFLICT(id) DO UPDATE SET
            last_seq = excluded.last_seq,
            last_built_at = excluded.last_built_at
        "#,
        params![state.last_seq, state.last_built_at],
    )?;
    Ok(())
}

/// Current owner dominates the recent period, previous owner the older part of
/// the window. Falls back to the top two authors overall.
fn summarize_ownership(
    authored: &[(String, i64)],
    window: OwnershipWindow,
    now_unix: i64,
) -> OwnershipHistory {
    let recent_cutoff = now_unix - i64::from(window.current_owner_days) * SECONDS_PER_DAY;

    let mut overall = HashMap::<&str, u64>::new();
    let mut recent = HashMap::<&str, u64>::new();
    let mut older = HashMap::<&str, u64>::new();
    for (email, committed_at) in authored {
        *overall.entry(email.as_str()).or_default() += 1;
        if *committed_at > recent_cutoff {
            *recent.entry(email.as_str()).or_default() += 1;
        } else {
            *older.entry(email.as_str()).or_default() += 1;
        }
    }

    let ranked_overall = rank_authors(&overall);
    let mut current_owner = rank_authors(&recent).first().map(|email| (*email).to_owned());
    let mut previous_owner = rank_authors(&older)
        .into_iter()
        .find(|email| Some(*email) != current_owner.as_deref())
        .map(str::to_owned);

    if current_owner.is_none() {
        current_owner = ranked_overall.first().map(|email| (*email).to_owned());
    }
    if previous_owner.is_none() {
        previous_owner = ranked_overall
            .iter()
            .find(|email| Some(**email) != current_owner.as_deref())
            .map(|email| (*email).to_owned());
    }

    let days_since_transition = match (&current_owner, &previous_owner) {
        (Some(current), Some(previous)) => {
            let previous_last = authored
                .iter()
                .filter(|(email, _)| email == previous)
                .map(|(_, at)| *at)
                .max();
            previous_last.and_then(|cutoff| {
                authored
                    .iter()
                    .filter(|(email, at)| email == current && *at >= cutoff)
                    .map(|(_, at)| *at)
                    .min()
                    .map(|handover| days_between(handover, now_unix))
            })
        }
        _ => None,
    };

    OwnershipHistory {
        current_owner,
        previous_owner,
        days_since_transition,
        commit_count: authored.len() as u64,
        window_days: window.window_days,
    }
}

fn rank_authors<'a>(counts: &HashMap<&'a str, u64>) -> Vec<&'a str> {
    let mut ranked = counts.iter().map(|(email, count)| (*email, *count)).collect::<Vec<_>>();
    ranked.sort_by(|left, right| right.1.cmp(&left.1).then_with(|| left.0.cmp(right.0)));
    ranked.into_iter().map(|(email, _)| email).collect()
}
