//! Plan executor.
//!
//! Operations run wave by wave. Within a wave they run concurrently on a
//! worker pool bounded by a semaphore; the next wave starts only once every
//! operation of the previous one is terminal. A successful operation is
//! written to the state store before it counts as done, so a crash never
//! loses a materialized resource that later operations already relied on.
//! Records whose dependencies changed without any remote change are
//! rewritten before the first wave.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineSettings;
use crate::error::{ApiError, ApplyError, Result, StateError, TopoformError};
use crate::provider::{ProviderResource, ResourceHandle, ResourceProvider, ResourceRequest};
use crate::report::{ApplyReport, OperationResult, OperationStatus, RootCause};
use crate::state::{HistoryEntry, HistoryOperation, ResourceRecord, StateSnapshot, StateStore};
use crate::value::{resolve_attributes, Attributes};

use super::plan::{OperationKind, Plan, PlannedOperation, ReplaceStrategy};
use super::retry::RetryPolicy;

/// Attributes of materialized resources, keyed by resource name.
type Materialized = HashMap<String, Attributes>;

/// Why a single operation stopped short.
#[derive(Debug)]
enum StepError {
    /// The provider rejected the call.
    Api(ApiError),
    /// The operation could not be attempted.
    Invalid(String),
    /// Cancellation interrupted a retry.
    Cancelled(ApiError),
    /// The state store rejected a write.
    State(TopoformError),
}

/// Result of a completed step.
#[derive(Debug)]
struct Step {
    provider_id: Option<String>,
    /// Attributes for dependents to resolve against, `None` once destroyed.
    attributes: Option<Attributes>,
    serial: u64,
}

/// An operation in terminal state.
#[derive(Debug)]
struct Executed {
    result: OperationResult,
    attributes: Option<Attributes>,
    serial: Option<u64>,
    state_error: Option<TopoformError>,
}

type StepResult = std::result::Result<Step, StepError>;

/// Executor for plans.
pub struct PlanExecutor<'a> {
    provider: &'a dyn ResourceProvider,
    store: &'a dyn StateStore,
    parallelism: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
    operation: HistoryOperation,
}

impl<'a> PlanExecutor<'a> {
    /// Creates an executor applying changes through `provider` and
    /// recording them in `store`.
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
            operation: HistoryOperation::Apply,
        }
    }

    /// Overrides the number of operations in flight per wave.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Uses `token` to stop scheduling new work.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Sets the operation recorded in history.
    #[must_use]
    pub const fn with_history(mut self, operation: HistoryOperation) -> Self {
        self.operation = operation;
        self
    }

    /// Returns a handle to the cancellation token.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Executes a plan.
    ///
    /// Failures of single operations do not fail the call: they show up in
    /// the report, with their dependents skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::Aborted`] for plans violating guardrails, and
    /// [`StateError::Conflict`] if the state changed since the plan was
    /// made or changes under the apply. State write failures stop the apply
    /// after the current wave drains.
    pub async fn execute(&self, plan: &Plan) -> Result<ApplyReport> {
        if !plan.passes_guardrails {
            error!("Plan does not pass guardrails");
            for violation in &plan.guardrail_violations {
                error!("  - {violation}");
            }
            return Err(ApplyError::Aborted {
                reason: String::from("plan violates guardrails"),
            }
            .into());
        }

        let snapshot = self.store.load().await?;
        let found = snapshot.as_ref().map_or(0, |s| s.serial);
        if found != plan.state_serial {
            return Err(StateError::Conflict {
                expected: plan.state_serial,
                found,
            }
            .into());
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        let mut context: Materialized = snapshot
            .as_ref()
            .map(StateSnapshot::attribute_context)
            .unwrap_or_default();
        let mut serial = found;
        if let Some(snapshot) = &snapshot {
            serial = serial.max(self.sync_records(plan, snapshot).await?);
        }
        let mut results: Vec<Option<OperationResult>> = vec![None; plan.operations.len()];

        for op in plan.operations.iter().filter(|op| !op.kind.is_actionable()) {
            results[op.index] = Some(OperationResult::new(op, OperationStatus::Unchanged));
        }

        let waves = plan.waves();
        info!(
            "Applying {} operations in {} waves via {} provider (parallelism {})",
            plan.actionable().count(),
            waves.len(),
            self.provider.name(),
            self.parallelism
        );

        for (number, wave) in waves.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("Cancelled, not starting wave {}", number + 1);
                for &index in wave {
                    results[index] = Some(OperationResult::new(
                        &plan.operations[index],
                        OperationStatus::Cancelled,
                    ));
                }
                continue;
            }

            let mut runnable = Vec::with_capacity(wave.len());
            for &index in wave {
                let op = &plan.operations[index];
                match blocking_cause(op, &results) {
                    Some(cause) => {
                        warn!("Skipping {} of {}: {} did not succeed", op.kind, op.resource, cause.resource);
                        results[index] = Some(OperationResult::skipped(op, cause));
                    }
                    None => runnable.push(op),
                }
            }

            debug!("Wave {}: {} of {} operations runnable", number + 1, runnable.len(), wave.len());
            let semaphore = Semaphore::new(self.parallelism);
            let executed = join_all(
                runnable
                    .iter()
                    .map(|op| self.run(op, &semaphore, &context, snapshot.as_ref())),
            )
            .await;

            let mut state_error = None;
            for done in executed {
                if let Some(s) = done.serial {
                    serial = serial.max(s);
                }
                if done.result.status == OperationStatus::Succeeded {
                    match done.attributes {
                        Some(attributes) => {
                            context.insert(done.result.resource.clone(), attributes);
                        }
                        None => {
                            context.remove(&done.result.resource);
                        }
                    }
                }
                if state_error.is_none() {
                    state_error = done.state_error;
                }
                let index = done.result.index;
                results[index] = Some(done.result);
            }

            if let Some(err) = state_error {
                error!("State write failed, stopping apply: {err}");
                return Err(err);
            }
        }

        let operations = results
            .into_iter()
            .zip(&plan.operations)
            .map(|(result, op)| {
                result.unwrap_or_else(|| OperationResult::new(op, OperationStatus::Cancelled))
            })
            .collect();

        let mut report = ApplyReport {
            started_at,
            finished_at: Utc::now(),
            duration_ms: elapsed_ms(clock),
            operations,
            cancelled: self.cancel.is_cancelled(),
            serial,
        };

        if plan.has_changes() {
            self.record_history(plan, &mut report).await;
        }

        info!(
            "Apply finished: {} succeeded, {} failed, {} skipped, {} cancelled",
            report.count(OperationStatus::Succeeded),
            report.count(OperationStatus::Failed),
            report.count(OperationStatus::Skipped),
            report.count(OperationStatus::Cancelled)
        );

        Ok(report)
    }

    /// Runs one operation once a worker slot is free.
    async fn run(
        &self,
        op: &PlannedOperation,
        semaphore: &Semaphore,
        context: &Materialized,
        snapshot: Option<&StateSnapshot>,
    ) -> Executed {
        let _permit = match semaphore.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                let mut result = OperationResult::new(op, OperationStatus::Failed);
                result.error = Some(format!("worker pool unavailable: {e}"));
                return Executed::finished(result, None);
            }
        };

        if self.cancel.is_cancelled() {
            debug!("Cancelled before {} of {} started", op.kind, op.resource);
            return Executed::finished(OperationResult::new(op, OperationStatus::Cancelled), None);
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        let mut attempts = 0;
        info!("{} {}.{}", op.kind, op.resource_type, op.resource);

        let step = match op.kind {
            OperationKind::Create => self.create(op, context, &mut attempts).await,
            OperationKind::Update => self.update(op, context, snapshot, &mut attempts).await,
            OperationKind::Replace => self.replace(op, context, snapshot, &mut attempts).await,
            OperationKind::Destroy => self.destroy(op, snapshot, &mut attempts).await,
            OperationKind::NoOp => Err(StepError::Invalid(String::from("no-op scheduled"))),
        };

        let mut result = OperationResult::new(op, OperationStatus::Succeeded);
        result.attempts = attempts;
        result.started_at = Some(started_at);
        result.duration_ms = elapsed_ms(clock);

        match step {
            Ok(step) => {
                if let Some(id) = step.provider_id {
                    result.provider_id = Some(id);
                }
                info!("{} of {} succeeded in {}ms", op.kind, op.resource, result.duration_ms);
                Executed {
                    result,
                    attributes: step.attributes,
                    serial: Some(step.serial),
                    state_error: None,
                }
            }
            Err(StepError::Cancelled(e)) => {
                warn!("{} of {} cancelled during retry: {e}", op.kind, op.resource);
                result.status = OperationStatus::Cancelled;
                result.error = Some(e.to_string());
                Executed::finished(result, None)
            }
            Err(StepError::State(e)) => {
                error!("{} of {}: {e}", op.kind, op.resource);
                result.status = OperationStatus::Failed;
                result.error = Some(e.to_string());
                Executed::finished(result, Some(e))
            }
            Err(StepError::Api(e)) => {
                error!("{} of {} failed after {attempts} attempt(s): {e}", op.kind, op.resource);
                result.status = OperationStatus::Failed;
                result.error = Some(e.to_string());
                Executed::finished(result, None)
            }
            Err(StepError::Invalid(message)) => {
                error!("{} of {} failed: {message}", op.kind, op.resource);
                result.status = OperationStatus::Failed;
                result.error = Some(message);
                Executed::finished(result, None)
            }
        }
    }

    async fn create(&self, op: &PlannedOperation, context: &Materialized, attempts: &mut u32) -> StepResult {
        let request = request_for(op, context)?;
        let created = self.call(op, attempts, || self.provider.create(&request)).await?;
        self.save(op, request, created, None).await
    }

    async fn update(
        &self,
        op: &PlannedOperation,
        context: &Materialized,
        snapshot: Option<&StateSnapshot>,
        attempts: &mut u32,
    ) -> StepResult {
        let existing = existing_handle(op, snapshot)?;
        let request = request_for(op, context)?;
        let updated = self
            .call(op, attempts, || self.provider.update(&existing.provider_id, &request))
            .await?;
        let created_at = snapshot
            .and_then(|s| s.record(&op.resource))
            .map(|r| r.created_at);
        self.save(op, request, updated, created_at).await
    }

    async fn replace(
        &self,
        op: &PlannedOperation,
        context: &Materialized,
        snapshot: Option<&StateSnapshot>,
        attempts: &mut u32,
    ) -> StepResult {
        // resolved up front so a bad reference leaves the old object alone
        let request = request_for(op, context)?;

        match op.replace_strategy.unwrap_or(ReplaceStrategy::DestroyBeforeCreate) {
            ReplaceStrategy::CreateBeforeDestroy => {
                let old = existing_handle(op, snapshot)?;
                let created = self.call(op, attempts, || self.provider.create(&request)).await?;
                let step = self.save(op, request, created, None).await?;
                self.delete_remote(op, &old, attempts).await.map_err(|e| match e {
                    StepError::Api(api) => StepError::Invalid(format!(
                        "replacement created but old object '{}' could not be deleted: {api}",
                        old.provider_id
                    )),
                    other => other,
                })?;
                Ok(step)
            }
            // the old object went with the destroy half of this replacement
            ReplaceStrategy::DestroyBeforeCreate => {
                let created = self.call(op, attempts, || self.provider.create(&request)).await?;
                self.save(op, request, created, None).await
            }
        }
    }

    async fn destroy(
        &self,
        op: &PlannedOperation,
        snapshot: Option<&StateSnapshot>,
        attempts: &mut u32,
    ) -> StepResult {
        let handle = existing_handle(op, snapshot)?;
        self.delete_remote(op, &handle, attempts).await?;
        let serial = self
            .store
            .delete_record(&op.resource)
            .await
            .map_err(StepError::State)?;
        Ok(Step {
            provider_id: None,
            attributes: None,
            serial,
        })
    }

    /// Deletes a remote object; an object that is already gone counts as deleted.
    async fn delete_remote(
        &self,
        op: &PlannedOperation,
        handle: &ResourceHandle,
        attempts: &mut u32,
    ) -> std::result::Result<(), StepError> {
        match self.call(op, attempts, || self.provider.delete(handle)).await {
            Err(StepError::Api(ApiError::NotFound { .. })) => {
                debug!("{} '{}' already gone", handle.resource_type, handle.provider_id);
                Ok(())
            }
            other => other,
        }
    }

    /// Calls the provider with retries.
    async fn call<T, F, Fut>(
        &self,
        op: &PlannedOperation,
        attempts: &mut u32,
        call: F,
    ) -> std::result::Result<T, StepError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ApiError>>,
    {
        let label = format!("{} {}", op.kind, op.resource);
        let outcome = self.retry.run(&label, &self.cancel, call).await;
        *attempts += outcome.attempts;
        match outcome.result {
            Ok(value) => Ok(value),
            Err(e) if outcome.cancelled => Err(StepError::Cancelled(e)),
            Err(e) => Err(StepError::Api(e)),
        }
    }

    /// Records a materialized resource.
    async fn save(
        &self,
        op: &PlannedOperation,
        request: ResourceRequest,
        resource: ProviderResource,
        created_at: Option<DateTime<Utc>>,
    ) -> StepResult {
        let mut record = ResourceRecord::new(&op.resource, &op.resource_type, &resource.id);
        record.configured = request.attributes;
        record.attributes = resource.attributes.clone();
        record.dependencies = op.resource_dependencies.clone();
        record.spec_hash = op.spec_hash.clone();
        if let Some(created_at) = created_at {
            record.created_at = created_at;
        }

        let serial = self
            .store
            .save_record(record)
            .await
            .map_err(StepError::State)?;
        Ok(Step {
            provider_id: Some(resource.id),
            attributes: Some(resource.attributes),
            serial,
        })
    }

    /// Rewrites stale records of unchanged resources, returning the last serial.
    async fn sync_records(&self, plan: &Plan, snapshot: &StateSnapshot) -> Result<u64> {
        let mut serial = snapshot.serial;
        for op in plan.stale_records() {
            let Some(mut record) = snapshot.record(&op.resource).cloned() else {
                continue;
            };
            debug!("Refreshing recorded dependencies of {}", op.resource);
            record.dependencies = op.resource_dependencies.clone();
            record.spec_hash = op.spec_hash.clone();
            serial = self.store.save_record(record).await?;
        }
        Ok(serial)
    }

    async fn record_history(&self, plan: &Plan, report: &mut ApplyReport) {
        let resources = plan
            .actionable()
            .filter(|op| op.replaced_by.is_none())
            .map(|op| op.resource.clone())
            .collect();
        let entry = match report.first_error() {
            None => HistoryEntry::new(self.operation, &plan.config_hash, resources),
            Some(error) => HistoryEntry::failed(self.operation, &plan.config_hash, resources, &error),
        };
        match self.store.append_history(entry).await {
            Ok(serial) => report.serial = serial,
            Err(e) => warn!("Failed to record {} history: {e}", self.operation),
        }
    }
}

impl std::fmt::Debug for PlanExecutor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("provider", &self.provider.name())
            .field("store", &self.store.backend_type())
            .field("parallelism", &self.parallelism)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Executed {
    const fn finished(result: OperationResult, state_error: Option<TopoformError>) -> Self {
        Self {
            result,
            attributes: None,
            serial: None,
            state_error,
        }
    }
}

/// First failure among the operation's dependencies.
fn blocking_cause(op: &PlannedOperation, results: &[Option<OperationResult>]) -> Option<RootCause> {
    op.dependencies
        .iter()
        .filter_map(|&dep| results.get(dep)?.as_ref()?.blocking_cause())
        .next()
}

/// Resolves the desired attributes against materialized dependencies.
fn request_for(op: &PlannedOperation, context: &Materialized) -> std::result::Result<ResourceRequest, StepError> {
    let attributes = resolve_attributes(&op.desired, context)
        .map_err(|e| StepError::Invalid(e.to_string()))?;
    Ok(ResourceRequest {
        name: op.resource.clone(),
        resource_type: op.resource_type.clone(),
        attributes,
        computed: op.computed.clone(),
    })
}

/// Handle of the object currently recorded for the operation's resource.
fn existing_handle(
    op: &PlannedOperation,
    snapshot: Option<&StateSnapshot>,
) -> std::result::Result<ResourceHandle, StepError> {
    if let Some(record) = snapshot.and_then(|s| s.record(&op.resource)) {
        return Ok(ResourceHandle {
            name: record.name.clone(),
            resource_type: record.resource_type.clone(),
            provider_id: record.provider_id.clone(),
        });
    }
    op.provider_id
        .as_ref()
        .map(|id| ResourceHandle {
            name: op.resource.clone(),
            resource_type: op.resource_type.clone(),
            provider_id: id.clone(),
        })
        .ok_or_else(|| StepError::Invalid(format!("no provider id recorded for '{}'", op.resource)))
}

fn elapsed_ms(clock: Instant) -> u64 {
    u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        LifecycleConfig, ProjectConfig, ResourceSpec, RetrySettings, TopologyConfig, TypeSchema,
    };
    use crate::planner::Planner;
    use crate::provider::{CallKind, CallRecord, MockResourceProvider, SimulatedProvider};
    use crate::state::MemoryStateStore;
    use crate::value::Value;
    use std::time::Duration;

    fn config(resources: Vec<ResourceSpec>) -> TopologyConfig {
        let mut types = indexmap::IndexMap::new();
        types.insert(
            String::from("subnet"),
            TypeSchema {
                immutable: vec![String::from("cidr_block")],
                ..TypeSchema::default()
            },
        );
        TopologyConfig {
            project: ProjectConfig {
                name: String::from("edge"),
                environment: String::from("dev"),
            },
            state: Default::default(),
            engine: EngineSettings {
                parallelism: 4,
                retry: RetrySettings {
                    max_attempts: 4,
                    initial_backoff_ms: 1,
                    max_backoff_ms: 5,
                    multiplier: 2.0,
                },
            },
            simulator: Default::default(),
            guardrails: None,
            types,
            resources,
        }
    }

    fn network() -> Vec<ResourceSpec> {
        vec![
            ResourceSpec::new("main", "vpc").with_attribute("cidr_block", "10.0.0.0/16"),
            ResourceSpec::new("public_a", "subnet")
                .with_attribute("vpc_id", Value::reference("main", "id"))
                .with_attribute("cidr_block", "10.0.1.0/24"),
            ResourceSpec::new("nat", "nat_gateway")
                .with_attribute("subnet_id", Value::reference("public_a", "id")),
            ResourceSpec::new("logs", "bucket").with_attribute("versioning", true),
        ]
    }

    async fn apply(
        cfg: &TopologyConfig,
        provider: &dyn ResourceProvider,
        store: &MemoryStateStore,
    ) -> ApplyReport {
        let state = store.load().await.unwrap();
        let plan = Planner::new(cfg).plan(state.as_ref()).unwrap();
        PlanExecutor::new(provider, store, &cfg.engine)
            .execute(&plan)
            .await
            .unwrap()
    }

    /// Start and finish sequence numbers of the last matching call.
    fn span(calls: &[CallRecord], kind: CallKind, resource: &str) -> (u64, u64) {
        let call = calls
            .iter()
            .rfind(|c| c.kind == kind && c.resource == resource)
            .unwrap();
        (call.started, call.finished)
    }

    fn status<'r>(report: &'r ApplyReport, resource: &str) -> &'r OperationResult {
        report
            .operations
            .iter()
            .find(|r| r.resource == resource)
            .unwrap()
    }

    #[tokio::test]
    async fn test_apply_follows_dependency_order() {
        let cfg = config(network());
        let provider = SimulatedProvider::new();
        let store = MemoryStateStore::new("edge", "dev");

        let report = apply(&cfg, &provider, &store).await;
        assert!(report.is_success());
        assert_eq!(report.count(OperationStatus::Succeeded), 4);

        let calls = provider.calls().await;
        let finished = |name: &str| calls.iter().find(|c| c.resource == name).unwrap().finished;
        let started = |name: &str| calls.iter().find(|c| c.resource == name).unwrap().started;
        assert!(finished("main") < started("public_a"));
        assert!(finished("public_a") < started("nat"));

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.resources.len(), 4);
        assert_eq!(
            snapshot.record("public_a").unwrap().configured["vpc_id"],
            snapshot.record("main").unwrap().attributes["id"]
        );
        assert_eq!(snapshot.record("nat").unwrap().dependencies, vec!["public_a"]);
        assert_eq!(snapshot.history.len(), 1);
        assert_eq!(report.serial, snapshot.serial);
    }

    #[tokio::test]
    async fn test_second_apply_changes_nothing() {
        let cfg = config(network());
        let provider = SimulatedProvider::new();
        let store = MemoryStateStore::new("edge", "dev");
        apply(&cfg, &provider, &store).await;
        let calls_before = provider.calls().await.len();

        let report = apply(&cfg, &provider, &store).await;
        assert!(report.is_success());
        assert_eq!(report.count(OperationStatus::Unchanged), 4);
        assert_eq!(provider.calls().await.len(), calls_before);
    }

    #[tokio::test]
    async fn test_parallelism_bounds_in_flight_calls() {
        let resources = (0..6)
            .map(|i| ResourceSpec::new(format!("bucket_{i}"), "bucket"))
            .collect();
        let mut cfg = config(resources);
        cfg.engine.parallelism = 2;
        let provider = SimulatedProvider::new().with_latency(Duration::from_millis(10));
        let store = MemoryStateStore::new("edge", "dev");

        let report = apply(&cfg, &provider, &store).await;
        assert!(report.is_success());
        assert_eq!(provider.peak_concurrency(), 2);
        assert!(report.operations.iter().all(|r| r.wave == 1));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let cfg = config(network());
        let provider = SimulatedProvider::new();
        provider.fail_transient("main", 2).await;
        provider.throttle("logs", 1, 1).await;
        let store = MemoryStateStore::new("edge", "dev");

        let report = apply(&cfg, &provider, &store).await;
        assert!(report.is_success());
        assert_eq!(status(&report, "main").attempts, 3);
        assert_eq!(status(&report, "logs").attempts, 2);
        assert_eq!(status(&report, "nat").attempts, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_dependents_only() {
        let cfg = config(network());
        let provider = SimulatedProvider::new();
        provider.fail_permanent("main", "quota exceeded").await;
        let store = MemoryStateStore::new("edge", "dev");

        let report = apply(&cfg, &provider, &store).await;
        assert!(!report.is_success());
        assert_eq!(status(&report, "main").status, OperationStatus::Failed);
        assert_eq!(status(&report, "main").attempts, 1);
        assert_eq!(status(&report, "public_a").status, OperationStatus::Skipped);
        assert_eq!(status(&report, "nat").status, OperationStatus::Skipped);
        assert_eq!(status(&report, "nat").root_cause.as_ref().unwrap().resource, "main");
        assert_eq!(status(&report, "logs").status, OperationStatus::Succeeded);

        let branches = report.failed_branches();
        assert_eq!(branches.len(), 1);
        assert!(branches[0].root.error.contains("quota exceeded"));
        assert_eq!(branches[0].skipped, vec!["public_a", "nat"]);

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.names(), vec!["logs"]);
        assert!(!snapshot.history[0].success);
    }

    #[tokio::test]
    async fn test_cancel_before_start_runs_nothing() {
        let cfg = config(network());
        let provider = SimulatedProvider::new();
        let store = MemoryStateStore::new("edge", "dev");
        let plan = Planner::new(&cfg).plan(None).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let report = PlanExecutor::new(&provider, &store, &cfg.engine)
            .with_cancellation(token)
            .execute(&plan)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.count(OperationStatus::Cancelled), 4);
        assert!(provider.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_lets_in_flight_wave_drain() {
        let cfg = config(network());
        let provider = SimulatedProvider::new().with_latency(Duration::from_millis(50));
        let store = MemoryStateStore::new("edge", "dev");
        let plan = Planner::new(&cfg).plan(None).unwrap();

        let executor = PlanExecutor::new(&provider, &store, &cfg.engine);
        let token = executor.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let report = executor.execute(&plan).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(status(&report, "main").status, OperationStatus::Succeeded);
        assert_eq!(status(&report, "logs").status, OperationStatus::Succeeded);
        assert_eq!(status(&report, "public_a").status, OperationStatus::Cancelled);
        assert_eq!(status(&report, "nat").status, OperationStatus::Cancelled);
        assert_eq!(store.snapshot().await.unwrap().resources.len(), 2);
    }

    #[tokio::test]
    async fn test_state_changed_since_plan_is_conflict() {
        let cfg = config(network());
        let provider = SimulatedProvider::new();
        let store = MemoryStateStore::new("edge", "dev");
        let plan = Planner::new(&cfg).plan(None).unwrap();

        let other = store.handle();
        other
            .save_record(ResourceRecord::new("intruder", "bucket", "bucket-9"))
            .await
            .unwrap();

        let err = PlanExecutor::new(&provider, &store, &cfg.engine)
            .execute(&plan)
            .await
            .unwrap_err();
        assert!(err.is_state_conflict());
        assert_eq!(provider.object_count().await, 0);
    }

    #[tokio::test]
    async fn test_guardrail_violation_aborts() {
        let cfg = config(network());
        let provider = SimulatedProvider::new();
        let store = MemoryStateStore::new("edge", "dev");
        let mut plan = Planner::new(&cfg).plan(None).unwrap();
        plan.passes_guardrails = false;

        let err = PlanExecutor::new(&provider, &store, &cfg.engine)
            .execute(&plan)
            .await
            .unwrap_err();
        assert!(matches!(err, TopoformError::Apply(ApplyError::Aborted { .. })));
        assert!(provider.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_of_vanished_object_succeeds() {
        let mut snapshot = StateSnapshot::new("edge", "dev");
        snapshot.upsert(ResourceRecord::new("old_logs", "bucket", "bucket-1"));
        snapshot.serial = 4;
        let store = MemoryStateStore::with_snapshot(snapshot.clone());

        let mut provider = MockResourceProvider::new();
        provider.expect_name().return_const("mock");
        provider.expect_delete().times(1).returning(|handle| {
            Err(ApiError::NotFound {
                resource_type: handle.resource_type.clone(),
                id: handle.provider_id.clone(),
            })
        });

        let cfg = config(Vec::new());
        let plan = Planner::new(&cfg).plan_destroy(&snapshot, &[]).unwrap();
        let report = PlanExecutor::new(&provider, &store, &cfg.engine)
            .with_history(HistoryOperation::Destroy)
            .execute(&plan)
            .await
            .unwrap();

        assert!(report.is_success());
        let after = store.snapshot().await.unwrap();
        assert!(after.is_empty());
        assert_eq!(after.history[0].operation, HistoryOperation::Destroy);
    }

    #[tokio::test]
    async fn test_replace_create_before_destroy() {
        let mut resources = network();
        resources[1].lifecycle = LifecycleConfig {
            create_before_destroy: Some(true),
            prevent_destroy: false,
        };
        let mut cfg = config(resources);
        let provider = SimulatedProvider::new();
        let store = MemoryStateStore::new("edge", "dev");
        apply(&cfg, &provider, &store).await;
        let old_id = store.snapshot().await.unwrap().record("public_a").unwrap().provider_id.clone();

        cfg.resources[1] = cfg.resources[1]
            .clone()
            .with_attribute("cidr_block", "10.0.9.0/24");
        let report = apply(&cfg, &provider, &store).await;

        assert!(report.is_success());
        assert_eq!(status(&report, "public_a").kind, OperationKind::Replace);
        assert_eq!(status(&report, "nat").kind, OperationKind::Update);

        let snapshot = store.snapshot().await.unwrap();
        let new_id = &snapshot.record("public_a").unwrap().provider_id;
        assert_ne!(new_id, &old_id);
        assert_eq!(snapshot.record("nat").unwrap().configured["subnet_id"], Value::string(new_id));
        assert_eq!(provider.object_count().await, 4);

        let calls = provider.calls().await;
        let create = calls
            .iter()
            .rposition(|c| c.resource == "public_a" && c.kind == CallKind::Create)
            .unwrap();
        let delete = calls
            .iter()
            .position(|c| c.resource == "public_a" && c.kind == CallKind::Delete)
            .unwrap();
        assert!(create < delete);
    }

    #[tokio::test]
    async fn test_update_keeps_identity() {
        let mut cfg = config(network());
        let provider = SimulatedProvider::new();
        let store = MemoryStateStore::new("edge", "dev");
        apply(&cfg, &provider, &store).await;
        let before = store.snapshot().await.unwrap().record("logs").unwrap().clone();

        cfg.resources[3] = cfg.resources[3].clone().with_attribute("versioning", false);
        let report = apply(&cfg, &provider, &store).await;

        assert_eq!(status(&report, "logs").kind, OperationKind::Update);
        assert_eq!(report.count(OperationStatus::Succeeded), 1);
        let after = store.snapshot().await.unwrap().record("logs").unwrap().clone();
        assert_eq!(after.provider_id, before.provider_id);
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.configured["versioning"], Value::Bool(false));
    }

    #[tokio::test]
    async fn test_destroy_finishes_dependents_first() {
        let provider = SimulatedProvider::new();
        let store = MemoryStateStore::new("edge", "dev");
        apply(&config(network()), &provider, &store).await;

        let kept = config(vec![ResourceSpec::new("logs", "bucket").with_attribute("versioning", true)]);
        let report = apply(&kept, &provider, &store).await;
        assert!(report.is_success());
        assert_eq!(report.count(OperationStatus::Succeeded), 3);

        let calls = provider.calls().await;
        let nat = span(&calls, CallKind::Delete, "nat");
        let public_a = span(&calls, CallKind::Delete, "public_a");
        let main = span(&calls, CallKind::Delete, "main");
        assert!(nat.1 < public_a.0);
        assert!(public_a.1 < main.0);
        assert_eq!(store.snapshot().await.unwrap().names(), vec!["logs"]);
    }

    #[tokio::test]
    async fn test_replace_destroy_before_create_removes_dependents_first() {
        let mut cfg = config(network());
        cfg.types.insert(
            String::from("vpc"),
            TypeSchema {
                immutable: vec![String::from("cidr_block")],
                ..TypeSchema::default()
            },
        );
        cfg.types.insert(
            String::from("subnet"),
            TypeSchema {
                immutable: vec![String::from("cidr_block"), String::from("vpc_id")],
                ..TypeSchema::default()
            },
        );
        let provider = SimulatedProvider::new();
        let store = MemoryStateStore::new("edge", "dev");
        apply(&cfg, &provider, &store).await;

        cfg.resources[0] = ResourceSpec::new("main", "vpc").with_attribute("cidr_block", "10.1.0.0/16");
        let report = apply(&cfg, &provider, &store).await;

        assert!(report.is_success());
        assert_eq!(status(&report, "main").kind, OperationKind::Replace);
        assert_eq!(status(&report, "public_a").kind, OperationKind::Replace);
        assert_eq!(status(&report, "nat").kind, OperationKind::Update);

        let calls = provider.calls().await;
        let deleted: Vec<&str> = calls
            .iter()
            .filter(|c| c.kind == CallKind::Delete)
            .map(|c| c.resource.as_str())
            .collect();
        assert_eq!(deleted, vec!["public_a", "main"]);
        assert!(span(&calls, CallKind::Delete, "public_a").1 < span(&calls, CallKind::Delete, "main").0);
        assert!(span(&calls, CallKind::Delete, "main").1 < span(&calls, CallKind::Create, "main").0);
        assert!(span(&calls, CallKind::Create, "main").1 < span(&calls, CallKind::Create, "public_a").0);
        assert!(span(&calls, CallKind::Create, "public_a").1 < span(&calls, CallKind::Update, "nat").0);

        assert_eq!(provider.object_count().await, 4);
        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(
            snapshot.record("public_a").unwrap().configured["vpc_id"],
            snapshot.record("main").unwrap().attributes["id"]
        );
        assert_eq!(snapshot.history.last().unwrap().resources, vec!["main", "public_a", "nat"]);
    }

    #[tokio::test]
    async fn test_reversed_dependency_is_recorded_and_destroyed_in_order() {
        let provider = SimulatedProvider::new();
        let store = MemoryStateStore::new("edge", "dev");
        let before = config(vec![
            ResourceSpec::new("a", "bucket").with_attribute("tier", "hot"),
            ResourceSpec::new("b", "bucket").with_depends_on("a"),
        ]);
        apply(&before, &provider, &store).await;

        let reversed = config(vec![
            ResourceSpec::new("a", "bucket")
                .with_attribute("tier", "cold")
                .with_depends_on("b"),
            ResourceSpec::new("b", "bucket"),
        ]);
        let report = apply(&reversed, &provider, &store).await;
        assert!(report.is_success());
        assert_eq!(status(&report, "a").kind, OperationKind::Update);
        assert_eq!(status(&report, "b").status, OperationStatus::Unchanged);

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.record("a").unwrap().dependencies, vec!["b"]);
        assert!(snapshot.record("b").unwrap().dependencies.is_empty());
        assert_eq!(report.serial, snapshot.serial);

        // a cyclic record graph would fail this plan
        let report = apply(&config(Vec::new()), &provider, &store).await;
        assert!(report.is_success());
        let calls = provider.calls().await;
        assert!(span(&calls, CallKind::Delete, "a").1 < span(&calls, CallKind::Delete, "b").0);
        assert!(store.snapshot().await.unwrap().is_empty());
    }
}
