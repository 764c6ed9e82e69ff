use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use vigil_core::SignalName;

use crate::schema::{open_connection, prepare_database};
use crate::{StoreError, parse_signal_name};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalStat {
    pub name: SignalName,
    pub total_uses: u64,
    pub false_positives: u64,
    pub true_positives: u64,
    pub fp_rate: f64,
    pub enabled: bool,
    pub updated_at: i64,
}

impl SignalStat {
    pub fn new(name: SignalName) -> Self {
        Self {
            name,
            total_uses: 0,
            false_positives: 0,
            true_positives: 0,
            fp_rate: 0.0,
            enabled: true,
            updated_at: 0,
        }
    }
}

/// Auto-disable thresholds applied inside the same atomic update as the counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisablePolicy {
    pub min_uses: u64,
    pub max_fp_rate: f64,
}

impl DisablePolicy {
    pub fn should_disable(&self, total_uses: u64, fp_rate: f64) -> bool {
        total_uses >= self.min_uses && fp_rate > self.max_fp_rate
    }
}

impl Default for DisablePolicy {
    fn default() -> Self {
        Self {
            min_uses: 20,
            max_fp_rate: 0.03,
        }
    }
}

pub trait SignalStatStore: Send + Sync {
    /// Counts one feedback event atomically. Never re-enables a disabled signal.
    fn record_outcome(
        &self,
        name: SignalName,
        was_false_positive: bool,
        reason: Option<&str>,
        policy: DisablePolicy,
        recorded_at: i64,
    ) -> Result<SignalStat, StoreError>;

    fn signal_stat(&self, name: SignalName) -> Result<Option<SignalStat>, StoreError>;

    fn set_signal_enabled(
        &self,
        name: SignalName,
        enabled: bool,
        updated_at: i64,
    ) -> Result<SignalStat, StoreError>;

    fn list_signal_stats(&self) -> Result<Vec<SignalStat>, StoreError>;
}

pub struct SqliteSignalStatStore {
    sqlite_path: PathBuf,
}

impl SqliteSignalStatStore {
    pub fn open(workspace_root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let sqlite_path = prepare_database(workspace_root.as_ref())?;
        Ok(Self { sqlite_path })
    }

    fn connection(&self) -> Result<Connection, StoreError> {
        open_connection(&self.sqlite_path)
    }
}

const SELECT_STAT: &str = r#"
    SELECT name, total_uses, false_positives, true_positives, fp_rate, enabled, updated_at
    FROM signal_stats
"#;

fn read_stat_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawStat> {
    Ok(RawStat {
        name: row.get(0)?,
        total_uses: row.get(1)?,
        false_positives: row.get(2)?,
        true_positives: row.get(3)?,
        fp_rate: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        updated_at: row.get(6)?,
    })
}

struct RawStat {
    name: String,
    total_uses: i64,
    false_positives: i64,
    true_positives: i64,
    fp_rate: f64,
    enabled: bool,
    updated_at: i64,
}

impl RawStat {
    fn into_stat(self) -> Result<SignalStat, StoreError> {
        Ok(SignalStat {
            name: parse_signal_name(&self.name)?,
            total_uses: self.total_uses.max(0) as u64,
            false_positives: self.false_positives.max(0) as u64,
            true_positives: self.true_positives.max(0) as u64,
            fp_rate: self.fp_rate,
            enabled: self.enabled,
            updated_at: self.updated_at,
        })
    }
}

fn query_stat(conn: &Connection, name: SignalName) -> Result<Option<SignalStat>, StoreError> {
    let raw = conn
        .query_row(
            &format!("{SELECT_STAT} WHERE name = ?1"),
            params![name.as_str()],
            read_stat_row,
        )
        .optional()?;
    raw.map(RawStat::into_stat).transpose()
}

impl SignalStatStore for SqliteSignalStatStore {
    fn record_outcome(
        &self,
        name: SignalName,
        was_false_positive: bool,
        reason: Option<&str>,
        policy: DisablePolicy,
        recorded_at: i64,
    ) -> Result<SignalStat, StoreError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT OR IGNORE INTO signal_stats (name, updated_at) VALUES (?1, ?2)",
            params![name.as_str(), recorded_at],
        )?;
        let (fp_delta, tp_delta) = if was_false_positive { (1i64, 0i64) } else { (0, 1) };
        tx.execute(
            r#"
            UPDATE signal_stats SET
                total_uses = total_uses + 1,
                false_positives = false_positives + ?2,
                true_positives = true_positives + ?3,
                fp_rate = CAST(false_positives + ?2 AS REAL) / (total_uses + 1),
                enabled = CASE
                    WHEN total_uses + 1 >= ?4
                     AND CAST(false_positives + ?2 AS REAL) / (total_uses + 1) > ?5
                    THEN 0
                    ELSE enabled
                END,
                updated_at = ?6
            WHERE name = ?1
            "#,
            params![
                name.as_str(),
                fp_delta,
                tp_delta,
                policy.min_uses as i64,
                policy.max_fp_rate,
                recorded_at,
            ],
        )?;
        tx.execute(
            r#"
            INSERT INTO signal_feedback (signal, was_false_positive, reason, recorded_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![name.as_str(), was_false_positive as i64, reason, recorded_at],
        )?;

        let stat = query_stat(&tx, name)?.ok_or_else(|| {
            StoreError::InvalidRecord(format!("signal stat for {name} vanished mid-update"))
        })?;
        tx.commit()?;
        tracing::debug!(
            signal = %name,
            total_uses = stat.total_uses,
            fp_rate = stat.fp_rate,
            enabled = stat.enabled,
            "signal feedback stored"
        );
        Ok(stat)
    }

    fn signal_stat(&self, name: SignalName) -> Result<Option<SignalStat>, StoreError> {
        let conn = self.connection()?;
        query_stat(&conn, name)
    }

    fn set_signal_enabled(
        &self,
        name: SignalName,
        enabled: bool,
        updated_at: i64,
    ) -> Result<SignalStat, StoreError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            r#"
            INSERT INTO signal_stats (name, enabled, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET
                enabled = excluded.enabled,
                updated_at = excluded.updated_at
            "#,
            params![name.as_str(), enabled as i64, updated_at],
        )?;
        let stat = query_stat(&tx, name)?.ok_or_else(|| {
            StoreError::InvalidRecord(format!("signal stat for {name} vanished mid-update"))
        })?;
        tx.commit()?;
        tracing::info!(signal = %name, enabled, "signal enabled flag set");
        Ok(stat)
    }

    fn list_signal_stats(&self) -> Result<Vec<SignalStat>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!("{SELECT_STAT} ORDER BY name ASC"))?;
        let rows = stmt.query_map([], read_stat_row)?;
        rows.collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(RawStat::into_stat)
            .collect()
    }
}

/// In-process stat store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStatStore {
    stats: Mutex<HashMap<SignalName, SignalStat>>,
}

impl MemoryStatStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<SignalName, SignalStat>>, StoreError> {
        self.stats
            .lock()
            .map_err(|_| StoreError::Unavailable("signal stat lock poisoned".to_owned()))
    }
}

impl SignalStatStore for MemoryStatStore {
    fn record_outcome(
        &self,
        name: SignalName,
        was_false_positive: bool,
        _reason: Option<&str>,
        policy: DisablePolicy,
        recorded_at: i64,
    ) -> Result<SignalStat, StoreError> {
        let mut stats = self.lock()?;
        let stat = stats.entry(name).or_insert_with(|| SignalStat::new(name));
        stat.total_uses += 1;
        if was_false_positive {
            stat.false_positives += 1;
        } else {
            stat.true_positives += 1;
        }
        stat.fp_rate = stat.false_positives as f64 / stat.total_uses as f64;
        if policy.should_disable(stat.total_uses, stat.fp_rate) {
            stat.enabled = false;
        }
        stat.updated_at = recorded_at;
        Ok(stat.clone())
    }

    fn signal_stat(&self, name: SignalName) -> Result<Option<SignalStat>, StoreError> {
        Ok(self.lock()?.get(&name).cloned())
    }

    fn set_signal_enabled(
        &self,
        name: SignalName,
        enabled: bool,
        updated_at: i64,
    ) -> Result<SignalStat, StoreError> {
        let mut stats = self.lock()?;
        let stat = stats.entry(name).or_insert_with(|| SignalStat::new(name));
        stat.enabled = enabled;
        stat.updated_at = updated_at;
        Ok(stat.clone())
    }

    fn list_signal_stats(&self) -> Result<Vec<SignalStat>, StoreError> {
        let mut stats = self.lock()?.values().cloned().collect::<Vec<_>>();
        stats.sort_by(|left, right| left.name.as_str().cmp(right.name.as_str()));
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;

    fn exercise_disable_boundary(store: &dyn SignalStatStore) {
        let policy = DisablePolicy::default();
        let first = store
            .record_outcome(SignalName::Coupling, true, Some("noisy"), policy, 1)
            .expect("first event");
        assert!(first.enabled);
        assert_eq!(first.fp_rate, 1.0);

        for idx in 2..20 {
            let stat = store
                .record_outcome(SignalName::Coupling, false, None, policy, idx)
                .expect("true positive");
            assert!(stat.enabled, "disabled before reaching min uses at {idx}");
        }

        let twentieth = store
            .record_outcome(SignalName::Coupling, false, None, policy, 20)
            .expect("twentieth event");
        assert_eq!(twentieth.total_uses, 20);
        assert!((twentieth.fp_rate - 0.05).abs() < 1e-9);
        assert!(!twentieth.enabled);

        let after = store
            .record_outcome(SignalName::Coupling, false, None, policy, 21)
            .expect("later event");
        assert!(!after.enabled);

        let other = store
            .signal_stat(SignalName::CoChange)
            .expect("read other");
        assert!(other.is_none());
    }

    #[test]
    fn sqlite_store_disables_exactly_at_boundary() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteSignalStatStore::open(temp.path()).expect("open stat store");
        exercise_disable_boundary(&store);

        let reenabled = store
            .set_signal_enabled(SignalName::Coupling, true, 99)
            .expect("manual enable");
        assert!(reenabled.enabled);
        assert_eq!(reenabled.total_uses, 21);
        assert_eq!(store.list_signal_stats().expect("list").len(), 1);
    }

    #[test]
    fn memory_store_disables_exactly_at_boundary() {
        let store = MemoryStatStore::new();
        exercise_disable_boundary(&store);
    }

    #[test]
    fn fp_rate_at_threshold_keeps_signal_enabled() {
        let store = MemoryStatStore::new();
        let policy = DisablePolicy {
            min_uses: 100,
            max_fp_rate: 0.03,
        };
        for idx in 0..100 {
            store
                .record_outcome(SignalName::TestRatio, idx < 3, None, policy, idx)
                .expect("event");
        }
        let stat = store
            .signal_stat(SignalName::TestRatio)
            .expect("read")
            .expect("stat exists");
        assert_eq!(stat.total_uses, 100);
        assert!(stat.enabled);
    }

    #[test]
    fn concurrent_sqlite_updates_are_not_lost() {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(SqliteSignalStatStore::open(temp.path()).expect("open stat store"));

        let handles = (0..4)
            .map(|worker| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for idx in 0..10 {
                        store
                            .record_outcome(
                                SignalName::CoChange,
                                false,
                                None,
                                DisablePolicy::default(),
                                worker * 100 + idx,
                            )
                            .expect("concurrent event");
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("worker joins");
        }

        let stat = store
            .signal_stat(SignalName::CoChange)
            .expect("read")
            .expect("stat exists");
        assert_eq!(stat.total_uses, 40);
        assert_eq!(stat.true_positives, 40);
    }
}
