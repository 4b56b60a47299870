use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::job::JobRecord;

/// Process-wide registry mapping job ids to their records.
///
/// Each record sits behind its own async mutex so that stage coordinators
/// serialize work per job (the lock is held across the whole stage,
/// collaborator await included) without serializing unrelated jobs.
/// The registry is volatile by design: nothing survives a process restart.
#[derive(Debug, Default)]
pub struct SessionStore {
    jobs: DashMap<String, Arc<Mutex<JobRecord>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: JobRecord) -> Arc<Mutex<JobRecord>> {
        let id = record.id.clone();
        let entry = Arc::new(Mutex::new(record));
        self.jobs.insert(id, entry.clone());
        entry
    }

    /// Looks up a job. Never creates an entry for an unknown id.
    pub fn get(&self, id: &str) -> Option<Arc<Mutex<JobRecord>>> {
        self.jobs.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    /// Evicts a job. Returns whether an entry was actually removed, so
    /// eviction of an already-disposed id is a visible no-op.
    pub fn remove(&self, id: &str) -> bool {
        self.jobs.remove(id).is_some()
    }

    pub fn ids(&self) -> Vec<String> {
        self.jobs.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
