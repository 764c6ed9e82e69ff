use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use vigil_core::{SignalName, normalize_path};

pub const DEFAULT_SIGNAL_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cache payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Memoization store for computed values. Every `get` may miss.
pub trait SignalCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
    fn remove(&self, key: &str) -> Result<(), CacheError>;
}

pub fn get_json<T: DeserializeOwned>(
    cache: &dyn SignalCache,
    key: &str,
) -> Result<Option<T>, CacheError> {
    match cache.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub fn set_json<T: Serialize>(
    cache: &dyn SignalCache,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), CacheError> {
    cache.set(key, serde_json::to_string(value)?, ttl)
}

pub fn signal_key(signal: SignalName, file_path: &str) -> String {
    format!("{}:{}", signal.as_str(), normalize_path(file_path))
}

pub fn trace_key(request_id: &str) -> String {
    format!("trace:{request_id}")
}

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// Concurrent map with per-entry expiry checked on read. Writes are last-write-wins.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SignalCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        Ok(None)
    }

    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        if ttl.is_zero() {
            self.entries.remove(key);
            return Ok(());
        }
        self.entries.insert(
            key.to_owned(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Always misses. Used when caching is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl SignalCache for NoopCache {
    fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    fn remove(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }
}

const COMMIT_SCOPED_SIGNALS: [SignalName; 4] = [
    SignalName::Coupling,
    SignalName::CoChange,
    SignalName::TestRatio,
    SignalName::OwnershipChurn,
];

/// Event-driven invalidation of per-file signal keys.
#[derive(Clone)]
pub struct CacheInvalidator {
    cache: Arc<dyn SignalCache>,
}

impl CacheInvalidator {
    pub fn new(cache: Arc<dyn SignalCache>) -> Self {
        Self { cache }
    }

    /// A commit touching `files` stales their structural, temporal and test keys.
    pub fn on_commit(&self, files: &[String]) -> usize {
        let mut removed = 0;
        for file in files {
            for signal in COMMIT_SCOPED_SIGNALS {
                removed += self.remove_key(&signal_key(signal, file));
            }
        }
        removed
    }

    /// Edge weights changed for `files` and their partners after a coupling run.
    pub fn on_coupling_rebuilt(&self, files: &[String]) -> usize {
        files
            .iter()
            .map(|file| self.remove_key(&signal_key(SignalName::CoChange, file)))
            .sum()
    }

    pub fn on_incident_linked(&self, files: &[String]) -> usize {
        files
            .iter()
            .map(|file| self.remove_key(&signal_key(SignalName::IncidentSimilarity, file)))
            .sum()
    }

    fn remove_key(&self, key: &str) -> usize {
        match self.cache.remove(key) {
            Ok(()) => 1,
            Err(err) => {
                tracing::warn!(error = %err, key, "cache invalidation failed");
                0
            }
        }
    }
}
