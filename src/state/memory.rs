//! In-memory state storage backend.
//!
//! Used by the `memory` backend setting and throughout the test suite.
//! Handles created with [`MemoryStateStore::handle`] share one snapshot but
//! track their own observed serial, like two processes on one state file.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, StateError};

use super::lock::{generate_holder_id, LockInfo};
use super::store::StateStore;
use super::types::{HistoryEntry, ResourceRecord, StateSnapshot};

#[derive(Debug, Default)]
struct Shared {
    snapshot: Option<StateSnapshot>,
    lock: Option<LockInfo>,
}

/// In-memory state store.
#[derive(Debug)]
pub struct MemoryStateStore {
    shared: Arc<Mutex<Shared>>,
    observed: Mutex<Option<u64>>,
    project: String,
    environment: String,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            observed: Mutex::new(None),
            project: project.to_string(),
            environment: environment.to_string(),
        }
    }

    /// Creates a store seeded with `snapshot`.
    #[must_use]
    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        let project = snapshot.project.clone();
        let environment = snapshot.environment.clone();
        Self {
            shared: Arc::new(Mutex::new(Shared {
                snapshot: Some(snapshot),
                lock: None,
            })),
            observed: Mutex::new(None),
            project,
            environment,
        }
    }

    /// Returns a second handle onto the same state with its own observed serial.
    #[must_use]
    pub fn handle(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            observed: Mutex::new(None),
            project: self.project.clone(),
            environment: self.environment.clone(),
        }
    }

    /// Returns a copy of the current snapshot without observing it.
    pub async fn snapshot(&self) -> Option<StateSnapshot> {
        self.shared.lock().await.snapshot.clone()
    }

    async fn modify<F>(&self, change: F) -> Result<u64>
    where
        F: FnOnce(&mut StateSnapshot) + Send,
    {
        let mut observed = self.observed.lock().await;
        let mut shared = self.shared.lock().await;

        let found = shared.snapshot.as_ref().map_or(0, |s| s.serial);
        if let Some(expected) = *observed
            && expected != found
        {
            return Err(StateError::Conflict { expected, found }.into());
        }

        let snapshot = shared
            .snapshot
            .get_or_insert_with(|| StateSnapshot::new(&self.project, &self.environment));
        change(snapshot);
        snapshot.serial = found + 1;
        snapshot.last_updated = Utc::now();

        *observed = Some(snapshot.serial);
        Ok(snapshot.serial)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        let mut observed = self.observed.lock().await;
        let snapshot = self.shared.lock().await.snapshot.clone();
        *observed = Some(snapshot.as_ref().map_or(0, |s| s.serial));
        Ok(snapshot)
    }

    async fn save_record(&self, record: ResourceRecord) -> Result<u64> {
        self.modify(move |snapshot| snapshot.upsert(record)).await
    }

    async fn delete_record(&self, name: &str) -> Result<u64> {
        self.modify(|snapshot| {
            snapshot.remove(name);
        })
        .await
    }

    async fn append_history(&self, entry: HistoryEntry) -> Result<u64> {
        self.modify(move |snapshot| snapshot.add_history(entry)).await
    }

    async fn purge(&self) -> Result<()> {
        let mut observed = self.observed.lock().await;
        let mut shared = self.shared.lock().await;
        shared.snapshot = None;
        shared.lock = None;
        *observed = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.shared.lock().await.snapshot.is_some())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let mut shared = self.shared.lock().await;
        if let Some(existing) = &shared.lock
            && !existing.is_expired()
        {
            return Err(StateError::LockedByOther {
                holder: existing.holder.clone(),
                since: existing.acquired_at.to_rfc3339(),
            }
            .into());
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(&holder_id, operation);
        shared.lock = Some(lock_info.clone());
        debug!("Acquired in-memory state lock {}", lock_info.lock_id);
        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut shared = self.shared.lock().await;
        if shared.lock.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            shared.lock = None;
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        self.shared.lock().await.lock = None;
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.shared.lock().await.lock.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TopoformError;

    #[tokio::test]
    async fn test_records_roundtrip() {
        let store = MemoryStateStore::new("edge", "dev");
        store.save_record(ResourceRecord::new("a", "t", "t-1")).await.unwrap();
        store.save_record(ResourceRecord::new("b", "t", "t-2")).await.unwrap();
        store.delete_record("a").await.unwrap();

        let snapshot = store.load().await.unwrap().unwrap();
        assert_eq!(snapshot.names(), vec!["b"]);
        assert_eq!(snapshot.serial, 3);
    }

    #[tokio::test]
    async fn test_handles_detect_conflict() {
        let first = MemoryStateStore::new("edge", "dev");
        let second = first.handle();

        second.load().await.unwrap();
        first.save_record(ResourceRecord::new("a", "t", "t-1")).await.unwrap();

        let err = second
            .save_record(ResourceRecord::new("b", "t", "t-2"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TopoformError::State(StateError::Conflict { expected: 0, found: 1 })
        ));
    }

    #[tokio::test]
    async fn test_seeded_store() {
        let mut snapshot = StateSnapshot::new("edge", "dev");
        snapshot.serial = 7;
        let store = MemoryStateStore::with_snapshot(snapshot);
        let loaded = store.load_or_default("edge", "dev").await.unwrap();
        assert_eq!(loaded.serial, 7);
    }

    #[tokio::test]
    async fn test_lock_is_shared_between_handles() {
        let first = MemoryStateStore::new("edge", "dev");
        let second = first.handle();
        let lock = first.acquire_lock("ops", "apply").await.unwrap();
        assert!(second.acquire_lock("ops-2", "apply").await.is_err());
        first.release_lock(&lock.lock_id).await.unwrap();
        assert!(!second.is_locked().await.unwrap());
    }
}
