//! State store trait definition.
//!
//! Every write is a per-record read-modify-write: the backend re-reads the
//! current snapshot, checks its serial against the last one this handle
//! observed, applies the change and bumps the serial. A serial that moved
//! underneath the handle is reported as [`StateError::Conflict`].
//!
//! [`StateError::Conflict`]: crate::error::StateError::Conflict

use async_trait::async_trait;

use crate::error::Result;

use super::lock::LockInfo;
use super::types::{HistoryEntry, ResourceRecord, StateSnapshot};

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the current snapshot and remembers its serial.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<StateSnapshot>>;

    /// Inserts or replaces one record atomically. Returns the new serial.
    async fn save_record(&self, record: ResourceRecord) -> Result<u64>;

    /// Removes one record atomically. Returns the new serial.
    ///
    /// Removing an absent record is not an error.
    async fn delete_record(&self, name: &str) -> Result<u64>;

    /// Appends a history entry. Returns the new serial.
    async fn append_history(&self, entry: HistoryEntry) -> Result<u64>;

    /// Deletes the whole state, including any lock.
    async fn purge(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the state lock for `operation`.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` still holds it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes any lock regardless of holder.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Loads the snapshot, or an empty one for `project`/`environment`.
    async fn load_or_default(&self, project: &str, environment: &str) -> Result<StateSnapshot> {
        Ok(self
            .load()
            .await?
            .unwrap_or_else(|| StateSnapshot::new(project, environment)))
    }

    /// Checks if the state is locked by an unexpired lock.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        (**self).load().await
    }

    async fn save_record(&self, record: ResourceRecord) -> Result<u64> {
        (**self).save_record(record).await
    }

    async fn delete_record(&self, name: &str) -> Result<u64> {
        (**self).delete_record(name).await
    }

    async fn append_history(&self, entry: HistoryEntry) -> Result<u64> {
        (**self).append_history(entry).await
    }

    async fn purge(&self) -> Result<()> {
        (**self).purge().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder, operation).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn force_unlock(&self) -> Result<()> {
        (**self).force_unlock().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
