//! Drift detection.
//!
//! Reads every recorded resource back from the provider and compares what
//! it reports against what was recorded at apply time. With writing
//! enabled, observations are folded into state so the next plan repairs
//! the drift: vanished resources are forgotten and recreated, changed
//! attributes show up as updates.

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineSettings, TypeSchema};
use crate::error::{Result, TopoformError};
use crate::planner::{AttributeChange, DiffEngine, RetryPolicy};
use crate::provider::{ResourceHandle, ResourceProvider};
use crate::state::{HistoryEntry, HistoryOperation, ResourceRecord, StateStore};
use crate::value::{Attributes, Value};

/// Drift status of one recorded resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    /// Provider and state agree.
    InSync,
    /// Attributes changed outside of the engine.
    Drifted,
    /// The object no longer exists.
    Missing,
}

/// Drift of one resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDrift {
    /// Resource name.
    pub resource: String,
    /// Resource type.
    pub resource_type: String,
    /// Provider identifier.
    pub provider_id: String,
    /// Status.
    pub status: DriftStatus,
    /// Recorded values as `old`, observed values as `new`.
    pub changes: Vec<AttributeChange>,
}

/// Report of a refresh.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// Per-resource results, in state order.
    pub resources: Vec<ResourceDrift>,
    /// Whether observations were written to state.
    pub written: bool,
    /// State serial after the refresh.
    pub serial: u64,
}

/// Compares recorded resources against the provider.
pub struct Refresher<'a> {
    provider: &'a dyn ResourceProvider,
    store: &'a dyn StateStore,
    parallelism: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
    write: bool,
}

impl<'a> Refresher<'a> {
    /// Creates a read-only refresher.
    #[must_use]
    pub fn new(
        provider: &'a dyn ResourceProvider,
        store: &'a dyn StateStore,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            provider,
            store,
            parallelism: settings.parallelism.max(1),
            retry: RetryPolicy::from_settings(&settings.retry),
            cancel: CancellationToken::new(),
            write: false,
        }
    }

    /// Enables writing observations back into state.
    #[must_use]
    pub const fn with_write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    /// Uses `token` to abandon pending retries.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Reads every recorded resource and reports drift.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or written, or if the
    /// provider fails to answer a read after retries.
    pub async fn refresh(&self, config_hash: &str) -> Result<DriftReport> {
        let Some(snapshot) = self.store.load().await? else {
            info!("No state to refresh");
            return Ok(DriftReport {
                resources: Vec::new(),
                written: false,
                serial: 0,
            });
        };

        info!("Refreshing {} recorded resources", snapshot.resources.len());
        let semaphore = Semaphore::new(self.parallelism);
        let observed = join_all(
            snapshot
                .resources
                .values()
                .map(|record| self.observe(record, &semaphore)),
        )
        .await;

        let mut resources = Vec::with_capacity(observed.len());
        let mut updates: Vec<(ResourceRecord, Option<Attributes>)> = Vec::new();
        for (record, observation) in snapshot.resources.values().zip(observed) {
            let entry = match observation? {
                None => {
                    warn!("{} no longer exists", record.address());
                    updates.push((record.clone(), None));
                    drift_of(record, DriftStatus::Missing, Vec::new())
                }
                Some(attributes) => {
                    let changes = DiffEngine::new().attribute_changes(
                        &attributes,
                        &record.attributes,
                        &TypeSchema::default(),
                    );
                    if changes.is_empty() {
                        debug!("{} in sync", record.address());
                        drift_of(record, DriftStatus::InSync, changes)
                    } else {
                        warn!("{} drifted: {} attribute(s)", record.address(), changes.len());
                        updates.push((record.clone(), Some(attributes)));
                        drift_of(record, DriftStatus::Drifted, changes)
                    }
                }
            };
            resources.push(entry);
        }

        let mut serial = snapshot.serial;
        let written = self.write && !updates.is_empty();
        if written {
            let names = updates.iter().map(|(r, _)| r.name.clone()).collect();
            for (record, observed) in updates {
                serial = match observed {
                    None => self.store.delete_record(&record.name).await?,
                    Some(attributes) => self.store.save_record(absorb(record, attributes)).await?,
                };
            }
            serial = self
                .store
                .append_history(HistoryEntry::new(HistoryOperation::Refresh, config_hash, names))
                .await?;
            info!("Wrote refreshed state (serial {serial})");
        }

        Ok(DriftReport {
            resources,
            written,
            serial,
        })
    }

    async fn observe(&self, record: &ResourceRecord, semaphore: &Semaphore) -> Result<Option<Attributes>> {
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|e| TopoformError::internal(format!("worker pool unavailable: {e}")))?;

        let handle = ResourceHandle {
            name: record.name.clone(),
            resource_type: record.resource_type.clone(),
            provider_id: record.provider_id.clone(),
        };
        let label = format!("read {}", record.name);
        let outcome = self
            .retry
            .run(&label, &self.cancel, || self.provider.read(&handle))
            .await;
        Ok(outcome.result?)
    }
}

impl std::fmt::Debug for Refresher<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Refresher")
            .field("provider", &self.provider.name())
            .field("write", &self.write)
            .finish_non_exhaustive()
    }
}

impl DriftReport {
    /// Returns true if anything drifted or vanished.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        self.resources.iter().any(|r| r.status != DriftStatus::InSync)
    }

    /// Resources with the given status.
    pub fn with_status(&self, status: DriftStatus) -> impl Iterator<Item = &ResourceDrift> {
        self.resources.iter().filter(move |r| r.status == status)
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_drift() {
            return write!(f, "No drift detected - {} resources in sync", self.resources.len());
        }
        writeln!(f, "Drift detected:")?;
        for r in self.resources.iter().filter(|r| r.status != DriftStatus::InSync) {
            match r.status {
                DriftStatus::Missing => writeln!(f, "  - {}.{}: missing", r.resource_type, r.resource)?,
                _ => {
                    let attributes: Vec<&str> = r.changes.iter().map(|c| c.attribute.as_str()).collect();
                    writeln!(f, "  ~ {}.{}: {}", r.resource_type, r.resource, attributes.join(", "))?;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InSync => "in sync",
            Self::Drifted => "drifted",
            Self::Missing => "missing",
        };
        write!(f, "{s}")
    }
}

fn drift_of(record: &ResourceRecord, status: DriftStatus, changes: Vec<AttributeChange>) -> ResourceDrift {
    ResourceDrift {
        resource: record.name.clone(),
        resource_type: record.resource_type.clone(),
        provider_id: record.provider_id.clone(),
        status,
        changes,
    }
}

/// Folds observed attributes into a record. Configured keys take the
/// observed value so the next plan sees the difference from the declaration.
fn absorb(mut record: ResourceRecord, observed: Attributes) -> ResourceRecord {
    for (key, value) in &mut record.configured {
        match observed.get(key) {
            Some(seen) => value.clone_from(seen),
            None => *value = Value::Null,
        }
    }
    record.attributes = observed;
    record.updated_at = chrono::Utc::now();
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProjectConfig, ResourceSpec, TopologyConfig};
    use crate::planner::{OperationKind, PlanExecutor, Planner};
    use crate::provider::SimulatedProvider;
    use crate::state::MemoryStateStore;

    fn config() -> TopologyConfig {
        TopologyConfig {
            project: ProjectConfig {
                name: String::from("edge"),
                environment: String::from("dev"),
            },
            state: Default::default(),
            engine: Default::default(),
            simulator: Default::default(),
            guardrails: None,
            types: Default::default(),
            resources: vec![
                ResourceSpec::new("logs", "bucket").with_attribute("versioning", true),
                ResourceSpec::new("assets", "bucket").with_attribute("versioning", false),
            ],
        }
    }

    async fn applied(cfg: &TopologyConfig) -> (SimulatedProvider, MemoryStateStore) {
        let provider = SimulatedProvider::new();
        let store = MemoryStateStore::new("edge", "dev");
        let plan = Planner::new(cfg).plan(None).unwrap();
        let report = PlanExecutor::new(&provider, &store, &cfg.engine)
            .execute(&plan)
            .await
            .unwrap();
        assert!(report.is_success());
        (provider, store)
    }

    #[tokio::test]
    async fn test_untouched_resources_are_in_sync() {
        let cfg = config();
        let (provider, store) = applied(&cfg).await;

        let report = Refresher::new(&provider, &store, &cfg.engine)
            .refresh("hash")
            .await
            .unwrap();
        assert!(!report.has_drift());
        assert_eq!(report.with_status(DriftStatus::InSync).count(), 2);
        assert!(!report.written);
    }

    #[tokio::test]
    async fn test_drift_is_reported_without_writing() {
        let cfg = config();
        let (provider, store) = applied(&cfg).await;
        let serial = store.snapshot().await.unwrap().serial;
        assert!(provider.tamper("logs", "versioning", Value::Bool(false)).await);

        let report = Refresher::new(&provider, &store, &cfg.engine)
            .refresh("hash")
            .await
            .unwrap();
        assert!(report.has_drift());
        let drifted: Vec<_> = report.with_status(DriftStatus::Drifted).collect();
        assert_eq!(drifted.len(), 1);
        assert_eq!(drifted[0].changes[0].attribute, "versioning");
        assert_eq!(drifted[0].changes[0].new, Some(Value::Bool(false)));
        assert_eq!(store.snapshot().await.unwrap().serial, serial);
    }

    #[tokio::test]
    async fn test_written_drift_is_repaired_by_next_plan() {
        let cfg = config();
        let (provider, store) = applied(&cfg).await;
        provider.tamper("logs", "versioning", Value::Bool(false)).await;
        provider.remove_out_of_band("assets").await;

        let report = Refresher::new(&provider, &store, &cfg.engine)
            .with_write(true)
            .refresh("hash")
            .await
            .unwrap();
        assert!(report.written);
        assert_eq!(report.with_status(DriftStatus::Missing).count(), 1);

        let state = store.load().await.unwrap().unwrap();
        assert!(state.record("assets").is_none());
        assert_eq!(state.record("logs").unwrap().configured["versioning"], Value::Bool(false));
        assert_eq!(state.history.last().unwrap().operation, HistoryOperation::Refresh);

        let plan = Planner::new(&cfg).plan(Some(&state)).unwrap();
        assert_eq!(plan.operation("logs").unwrap().kind, OperationKind::Update);
        assert_eq!(plan.operation("assets").unwrap().kind, OperationKind::Create);
    }
}
