use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct RegistryEntry {
    path: PathBuf,
    registered_at: Instant,
}

/// Maps opaque database ids to uploaded database files. Entries expire after
/// `ttl`; expired entries are invisible to `get` and removed by `sweep_expired`.
#[derive(Debug)]
pub struct DbRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
    ttl: Duration,
}

impl DbRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Register a database file and return its id
    pub fn put(&self, path: impl AsRef<Path>) -> String {
        let id = Uuid::new_v4().to_string();
        let entry = RegistryEntry {
            path: path.as_ref().to_path_buf(),
            registered_at: Instant::now(),
        };
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.insert(id.clone(), entry);
        id
    }

    pub fn get(&self, id: &str) -> Option<PathBuf> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries
            .get(id)
            .filter(|e| !self.is_expired(e))
            .map(|e| e.path.clone())
    }

    /// Drop expired entries, returning how many were removed
    pub fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        let before = entries.len();
        entries.retain(|_, e| e.registered_at.elapsed() < self.ttl);
        let removed = before - entries.len();
        if removed > 0 {
            info!("Swept {} expired database registrations", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, entry: &RegistryEntry) -> bool {
        entry.registered_at.elapsed() >= self.ttl
    }
}
