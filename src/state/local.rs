//! Local file-based state storage backend.
//!
//! State lives in a single JSON file. Writes go to a temporary file that
//! is renamed over the original, so readers never see a partial snapshot.

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StateError, TopoformError};

use super::lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::{HistoryEntry, ResourceRecord, StateSnapshot, STATE_VERSION};

/// Default state directory name.
pub const STATE_DIR: &str = ".topoform";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Project recorded in a freshly created snapshot.
    project: String,
    /// Environment recorded in a freshly created snapshot.
    environment: String,
    /// Serial this handle last read or wrote. Held across each read-modify-write.
    observed: Mutex<Option<u64>>,
}

impl LocalStateStore {
    /// Creates a new local state store under `./.topoform`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| TopoformError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
            project: String::new(),
            environment: String::new(),
            observed: Mutex::new(None),
        }
    }

    /// Creates a new local state store from a custom state file path.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
            project: String::new(),
            environment: String::new(),
            observed: Mutex::new(None),
        }
    }

    /// Sets the project and environment stamped on a new snapshot.
    #[must_use]
    pub fn for_project(mut self, project: &str, environment: &str) -> Self {
        self.project = project.to_string();
        self.environment = environment.to_string();
        self
    }

    /// Returns the state file path.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| StateError::write(format!("Failed to create state directory: {e}")))?;
        }
        Ok(())
    }

    /// Reads the state file without touching the observed serial.
    async fn read_snapshot(&self) -> Result<Option<StateSnapshot>> {
        if !self.state_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.state_path)
            .await
            .map_err(|e| StateError::corrupted(format!("Failed to read state file: {e}")))?;

        let snapshot: StateSnapshot = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state file: {e}")))?;

        if snapshot.version != STATE_VERSION {
            return Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: snapshot.version,
            }
            .into());
        }

        Ok(Some(snapshot))
    }

    /// Writes the snapshot through a uniquely named temp file and a rename.
    async fn write_snapshot(&self, snapshot: &StateSnapshot) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        let temp_path = self
            .base_dir
            .join(format!("{STATE_FILE}.{}.tmp", Uuid::new_v4().simple()));

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::write(format!("Failed to create temp state file: {e}")))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::write(format!("Failed to write state file: {e}")))?;

        file.sync_all()
            .await
            .map_err(|e| StateError::write(format!("Failed to sync state file: {e}")))?;

        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(|e| StateError::write(format!("Failed to rename state file: {e}")))?;

        Ok(())
    }

    /// Runs one read-modify-write cycle under the handle mutex.
    async fn modify<F>(&self, change: F) -> Result<u64>
    where
        F: FnOnce(&mut StateSnapshot) + Send,
    {
        let mut observed = self.observed.lock().await;

        let current = self.read_snapshot().await?;
        let found = current.as_ref().map_or(0, |s| s.serial);
        if let Some(expected) = *observed
            && expected != found
        {
            warn!("State changed on disk: expected serial {expected}, found {found}");
            return Err(StateError::Conflict { expected, found }.into());
        }

        let mut snapshot =
            current.unwrap_or_else(|| StateSnapshot::new(&self.project, &self.environment));
        change(&mut snapshot);
        snapshot.serial = found + 1;
        snapshot.last_updated = Utc::now();

        self.write_snapshot(&snapshot).await?;
        *observed = Some(snapshot.serial);

        debug!("State written at serial {}", snapshot.serial);
        Ok(snapshot.serial)
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path)
            .await
            .map_err(|e| StateError::corrupted(format!("Failed to read lock file: {e}")))?;

        let lock_info: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")))?;

        Ok(Some(lock_info))
    }

    /// Creates the lock file. Returns `false` if it already exists.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<bool> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let lock_failed = |e: std::io::Error| StateError::LockFailed {
            message: format!("Failed to write lock file: {e}"),
        };

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(lock_failed(e).into()),
        };
        file.write_all(content.as_bytes()).await.map_err(lock_failed)?;
        file.sync_all().await.map_err(lock_failed)?;

        Ok(true)
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path)
                .await
                .map_err(|e| StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        let mut observed = self.observed.lock().await;

        let snapshot = self.read_snapshot().await?;
        match &snapshot {
            Some(s) => info!(
                "Loaded state from {} (serial {}, {} resources)",
                self.state_path.display(),
                s.serial,
                s.resources.len()
            ),
            None => debug!("State file does not exist: {}", self.state_path.display()),
        }

        *observed = Some(snapshot.as_ref().map_or(0, |s| s.serial));
        Ok(snapshot)
    }

    async fn save_record(&self, record: ResourceRecord) -> Result<u64> {
        let name = record.name.clone();
        let serial = self.modify(move |snapshot| snapshot.upsert(record)).await?;
        debug!("Saved record '{name}'");
        Ok(serial)
    }

    async fn delete_record(&self, name: &str) -> Result<u64> {
        let serial = self
            .modify(|snapshot| {
                snapshot.remove(name);
            })
            .await?;
        debug!("Deleted record '{name}'");
        Ok(serial)
    }

    async fn append_history(&self, entry: HistoryEntry) -> Result<u64> {
        self.modify(move |snapshot| snapshot.add_history(entry)).await
    }

    async fn purge(&self) -> Result<()> {
        let mut observed = self.observed.lock().await;

        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path)
                .await
                .map_err(|e| StateError::write(format!("Failed to delete state file: {e}")))?;
        }
        self.delete_lock_file().await?;

        *observed = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(&holder_id, operation);

        // A second round only follows the removal of an expired lock.
        for _ in 0..2 {
            if self.create_lock_file(&lock_info).await? {
                info!(
                    "Acquired state lock: {} for {operation} (expires in {}s)",
                    lock_info.lock_id, LOCK_EXPIRY_SECS
                );
                return Ok(lock_info);
            }

            match self.read_lock_file().await? {
                Some(existing) if !existing.is_expired() => {
                    return Err(StateError::LockedByOther {
                        holder: existing.holder,
                        since: existing.acquired_at.to_rfc3339(),
                    }
                    .into());
                }
                Some(existing) => {
                    debug!("Expired lock from {} found, taking over", existing.holder);
                    self.delete_lock_file().await?;
                }
                None => {}
            }
        }

        Err(StateError::LockFailed {
            message: String::from("lock file was recreated while taking over an expired lock"),
        }
        .into())
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            warn!("Force-unlocking state held by {}", existing.holder);
        }
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path()).for_project("edge", "dev");
        (store, temp_dir)
    }

    fn record(name: &str) -> ResourceRecord {
        let mut record = ResourceRecord::new(name, "subnet", &format!("subnet-{name}"));
        record
            .attributes
            .insert("id".into(), Value::string(format!("subnet-{name}")));
        record
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let serial = store.save_record(record("a")).await.expect("save failed");
        assert_eq!(serial, 1);

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.project, "edge");
        assert_eq!(loaded.serial, 1);
        assert_eq!(loaded.record("a").map(|r| r.provider_id.as_str()), Some("subnet-a"));
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_none());
        assert!(!store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_delete_record_bumps_serial() {
        let (store, _temp) = create_test_store();

        store.save_record(record("a")).await.expect("save failed");
        store.save_record(record("b")).await.expect("save failed");
        let serial = store.delete_record("a").await.expect("delete failed");
        assert_eq!(serial, 3);

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.names(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_concurrent_writes_do_not_lose_updates() {
        let (store, _temp) = create_test_store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.save_record(record(&format!("r{i}"))).await })
            })
            .collect();
        for handle in handles {
            handle.await.expect("task panicked").expect("save failed");
        }

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.resources.len(), 8);
        assert_eq!(loaded.serial, 8);
    }

    #[tokio::test]
    async fn test_conflict_when_state_changes_underneath() {
        let temp_dir = TempDir::new().unwrap();
        let first = LocalStateStore::with_base_dir(temp_dir.path());
        let second = LocalStateStore::with_base_dir(temp_dir.path());

        first.save_record(record("a")).await.unwrap();
        second.load().await.unwrap();
        first.save_record(record("b")).await.unwrap();

        let err = second.save_record(record("c")).await.unwrap_err();
        assert!(err.is_state_conflict());
        assert!(matches!(
            err,
            TopoformError::State(StateError::Conflict { expected: 1, found: 2 })
        ));
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let (store, temp) = create_test_store();
        store.save_record(record("a")).await.unwrap();

        let mut entries = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        entries.sort();
        assert_eq!(entries, vec!["state.json"]);
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder", "apply")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked().await.expect("is_locked failed"));

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1", "apply")
            .await
            .expect("Failed to acquire first lock");

        let result = store.acquire_lock("holder-2", "destroy").await;
        assert!(matches!(
            result,
            Err(TopoformError::State(StateError::LockedByOther { .. }))
        ));

        store.force_unlock().await.unwrap();
        assert!(store.acquire_lock("holder-2", "destroy").await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let first = LocalStateStore::with_base_dir(temp_dir.path()).for_project("edge", "dev");
        let second = LocalStateStore::with_base_dir(temp_dir.path()).for_project("edge", "dev");

        let (a, b) = tokio::join!(
            first.acquire_lock("holder-1", "apply"),
            second.acquire_lock("holder-2", "apply")
        );
        assert_eq!(usize::from(a.is_ok()) + usize::from(b.is_ok()), 1);

        let winner = a.or(b).expect("one acquisition succeeds");
        let held = first.get_lock_info().await.unwrap().unwrap();
        assert_eq!(held.lock_id, winner.lock_id);
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, _temp) = create_test_store();
        let stale = LockInfo::with_expiry("crashed", "apply", chrono::Duration::seconds(-1));
        assert!(store.create_lock_file(&stale).await.unwrap());

        let lock = store.acquire_lock("holder-2", "apply").await.unwrap();
        assert_ne!(lock.lock_id, stale.lock_id);
        assert_eq!(store.get_lock_info().await.unwrap().unwrap().holder, "holder-2");
    }

    #[tokio::test]
    async fn test_purge() {
        let (store, _temp) = create_test_store();
        store.save_record(record("a")).await.unwrap();
        store.purge().await.unwrap();
        assert!(!store.exists().await.unwrap());
    }
}
