use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use vigil_core::normalize_path;

use crate::{
    CoChangePartner, GraphStore, NeighborRecord, OwnershipHistory, OwnershipWindow, StoreError,
    TestRatioRecord,
};

#[derive(Default)]
struct MemoryGraph {
    coupling: HashMap<String, u32>,
    co_changed: HashMap<String, Vec<CoChangePartner>>,
    test_ratio: HashMap<String, TestRatioRecord>,
    ownership: HashMap<String, OwnershipHistory>,
    adjacency: HashMap<String, BTreeMap<String, String>>,
    messages: HashMap<String, Vec<(i64, String)>>,
}

/// Graph snapshot held in memory. Backs tests and embedders that ingest
/// elsewhere; can simulate outages and slow queries.
#[derive(Default)]
pub struct MemoryGraphStore {
    graph: RwLock<MemoryGraph>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryGraph>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory graph marked unavailable".to_owned()));
        }
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            std::thread::sleep(Duration::from_millis(latency));
        }
        self.graph
            .read()
            .map_err(|_| StoreError::Unavailable("memory graph lock poisoned".to_owned()))
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryGraph> {
        self.graph
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_coupling(&self, file_path: &str, count: u32) {
        self.write().coupling.insert(normalize_path(file_path), count);
    }

    /// Records a symmetric co-change edge.
    pub fn add_co_change(&self, left: &str, right: &str, frequency: f64, co_change_count: u64) {
        let left = normalize_path(left);
        let right = normalize_path(right);
        let mut graph = self.write();
        for (from, to) in [(&left, &right), (&right, &left)] {
            let partners = graph.co_changed.entry(from.clone()).or_default();
            partners.retain(|partner| &partner.path != to);
            partners.push(CoChangePartner {
                path: to.clone(),
                frequency,
                co_change_count,
                window_days: 90,
            });
            partners.sort_by(|a, b| {
                b.frequency
                    .total_cmp(&a.frequency)
                    .then_with(|| a.path.cmp(&b.path))
            });
        }
        graph
            .adjacency
            .entry(left.clone())
            .or_default()
            .entry(right.clone())
            .or_insert_with(|| "CO_CHANGED".to_owned());
        graph
            .adjacency
            .entry(right)
            .or_default()
            .entry(left)
            .or_insert_with(|| "CO_CHANGED".to_owned());
    }

    pub fn set_test_ratio(&self, file_path: &str, ratio: f64) {
        self.write().test_ratio.insert(
            normalize_path(file_path),
            TestRatioRecord {
                source_loc: 0,
                test_loc: 0,
                test_files: Vec::new(),
                ratio,
            },
        );
    }

    pub fn set_ownership(&self, file_path: &str, history: OwnershipHistory) {
        self.write().ownership.insert(normalize_path(file_path), history);
    }

    pub fn add_edge(&self, left: &str, right: &str, relation: &str) {
        let left = normalize_path(left);
        let right = normalize_path(right);
        let mut graph = self.write();
        graph
            .adjacency
            .entry(left.clone())
            .or_default()
            .insert(right.clone(), relation.to_owned());
        graph
            .adjacency
            .entry(right)
            .or_default()
            .insert(left, relation.to_owned());
    }

    pub fn add_commit_message(&self, file_path: &str, committed_at: i64, message: &str) {
        self.write()
            .messages
            .entry(normalize_path(file_path))
            .or_default()
            .push((committed_at, message.to_owned()));
    }
}

impl GraphStore for MemoryGraphStore {
    fn coupling(&self, file_path: &str) -> Result<u32, StoreError> {
        Ok(self
            .read()?
            .coupling
            .get(&normalize_path(file_path))
            .copied()
            .unwrap_or(0))
    }

    fn co_changed(&self, file_path: &str) -> Result<Vec<CoChangePartner>, StoreError> {
        Ok(self
            .read()?
            .co_changed
            .get(&normalize_path(file_path))
            .cloned()
            .unwrap_or_default())
    }

    fn test_ratio(&self, file_path: &str) -> Result<TestRatioRecord, StoreError> {
        Ok(self
            .read()?
            .test_ratio
            .get(&normalize_path(file_path))
            .cloned()
            .unwrap_or_else(|| TestRatioRecord::from_loc(0, 0, Vec::new())))
    }

    fn ownership_history(
        &self,
        file_path: &str,
        window: OwnershipWindow,
        _now_unix: i64,
    ) -> Result<OwnershipHistory, StoreError> {
        Ok(self
            .read()?
            .ownership
            .get(&normalize_path(file_path))
            .cloned()
            .unwrap_or_else(|| OwnershipHistory {
                window_days: window.window_days,
                ..OwnershipHistory::default()
            }))
    }

    fn neighbors(&self, file_path: &str, hops: u32) -> Result<Vec<NeighborRecord>, StoreError> {
        let origin = normalize_path(file_path);
        let graph = self.read()?;

        let mut seen = HashMap::<String, (u32, String)>::new();
        let mut queue = VecDeque::from([(origin.clone(), 0u32)]);
        while let Some((path, hop)) = queue.pop_front() {
            if hop >= hops {
                continue;
            }
            let Some(edges) = graph.adjacency.get(&path) else {
                continue;
            };
            for (next, relation) in edges {
                if *next == origin || seen.contains_key(next) {
                    continue;
                }
                seen.insert(next.clone(), (hop + 1, relation.clone()));
                queue.push_back((next.clone(), hop + 1));
            }
        }

        let mut records = seen
            .into_iter()
            .map(|(path, (hop, relation))| NeighborRecord {
                path,
                hop,
                relation,
            })
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.hop.cmp(&b.hop).then_with(|| a.path.cmp(&b.path)));
        Ok(records)
    }

    fn recent_commit_messages(
        &self,
        file_path: &str,
        since_unix: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let graph = self.read()?;
        let mut messages = graph
            .messages
            .get(&normalize_path(file_path))
            .map(|messages| {
                messages
                    .iter()
                    .filter(|(at, _)| *at >= since_unix)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        messages.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(messages
            .into_iter()
            .take(limit)
            .map(|(_, message)| message)
            .collect())
    }
}
