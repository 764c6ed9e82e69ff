use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use vigil_config::{store_path, vigil_dir};

use crate::StoreError;

pub(crate) fn prepare_database(workspace_root: &Path) -> Result<PathBuf, StoreError> {
    fs::create_dir_all(vigil_dir(workspace_root))?;
    let sqlite_path = store_path(workspace_root);

    let conn = Connection::open(&sqlite_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    run_migrations(&conn)?;
    drop(conn);

    tracing::debug!(path = %sqlite_path.display(), "vigil store ready");
    Ok(sqlite_path)
}

pub(crate) fn open_connection(sqlite_path: &Path) -> Result<Connection, StoreError> {
    if !sqlite_path.exists() {
        tracing::warn!(path = %sqlite_path.display(), "vigil store missing");
        return Err(StoreError::Unavailable(format!(
            "graph database missing at {}",
            sqlite_path.display()
        )));
    }
    let conn = Connection::open(sqlite_path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            path TEXT PRIMARY KEY,
            language TEXT NOT NULL,
            loc INTEGER NOT NULL DEFAULT 0,
            is_test INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS file_entities (
            file_path TEXT NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            line INTEGER NOT NULL,
            PRIMARY KEY (file_path, name, line)
        );

        CREATE TABLE IF NOT EXISTS file_dependencies (
            source_path TEXT NOT NULL,
            target_path TEXT NOT NULL,
            kind TEXT NOT NULL,
            PRIMARY KEY (source_path, target_path, kind)
        );

        CREATE INDEX IF NOT EXISTS idx_file_dependencies_target
            ON file_dependencies(target_path);

        CREATE TABLE IF NOT EXISTS test_links (
            test_path TEXT NOT NULL,
            source_path TEXT NOT NULL,
            PRIMARY KEY (test_path, source_path)
        );

        CREATE INDEX IF NOT EXISTS idx_test_links_source
            ON test_links(source_path);

        CREATE TABLE IF NOT EXISTS commits (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            hash TEXT NOT NULL UNIQUE,
            author_email TEXT NOT NULL,
            author_name TEXT NOT NULL,
            committed_at INTEGER NOT NULL,
            message TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_commits_committed_at
            ON commits(committed_at);

        CREATE TABLE IF NOT EXISTS commit_files (
            commit_hash TEXT NOT NULL,
            path TEXT NOT NULL,
            PRIMARY KEY (commit_hash, path)
        );

        CREATE INDEX IF NOT EXISTS idx_commit_files_path
            ON commit_files(path);

        CREATE TABLE IF NOT EXISTS co_change_edges (
            file_a TEXT NOT NULL,
            file_b TEXT NOT NULL,
            frequency REAL NOT NULL,
            co_change_count INTEGER NOT NULL,
            window_days INTEGER NOT NULL,
            built_at INTEGER NOT NULL,
            PRIMARY KEY (file_a, file_b),
            CHECK (file_a < file_b)
        );

        CREATE INDEX IF NOT EXISTS idx_co_change_edges_file_b
            ON co_change_edges(file_b);

        CREATE TABLE IF NOT EXISTS coupling_build_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_seq INTEGER NOT NULL,
            last_built_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS incidents (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            severity TEXT NOT NULL,
            occurred_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS incident_links (
            incident_id TEXT NOT NULL,
            target_kind TEXT NOT NULL,
            target TEXT NOT NULL,
            relation TEXT NOT NULL,
            PRIMARY KEY (incident_id, target_kind, target, relation)
        );

        CREATE TABLE IF NOT EXISTS signal_stats (
            name TEXT PRIMARY KEY,
            total_uses INTEGER NOT NULL DEFAULT 0,
            false_positives INTEGER NOT NULL DEFAULT 0,
            true_positives INTEGER NOT NULL DEFAULT 0,
            fp_rate REAL NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL DEFAULT 1,
            updated_at INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS signal_feedback (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            signal TEXT NOT NULL,
            was_false_positive INTEGER NOT NULL,
            reason TEXT,
            recorded_at INTEGER NOT NULL
        );
        "#,
    )?;

    Ok(())
}
