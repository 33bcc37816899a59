//! Structured apply report.
//!
//! One [`OperationResult`] per planned operation, in plan order, with
//! timing, attempts and the error that stopped it. Skipped operations
//! point at the failure that blocked their branch.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::planner::{OperationKind, PlannedOperation};

/// Terminal status of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// The provider call and the state write both completed.
    Succeeded,
    /// Nothing to do.
    Unchanged,
    /// The operation failed.
    Failed,
    /// Not attempted because a dependency did not succeed.
    Skipped,
    /// Not attempted, or abandoned mid-retry, because the apply was cancelled.
    Cancelled,
}

/// The failure at the root of a blocked branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootCause {
    /// Resource whose operation failed.
    pub resource: String,
    /// Its error.
    pub error: String,
}

/// Outcome of one planned operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    /// Position in the plan.
    pub index: usize,
    /// Resource name.
    pub resource: String,
    /// Resource type.
    pub resource_type: String,
    /// Planned operation kind.
    pub kind: OperationKind,
    /// Terminal status.
    pub status: OperationStatus,
    /// Provider calls made, retries included.
    pub attempts: u32,
    /// Wave the operation belonged to.
    pub wave: usize,
    /// When the operation started, if it did.
    pub started_at: Option<DateTime<Utc>>,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
    /// Provider identifier after the operation.
    pub provider_id: Option<String>,
    /// Error message for failed or cancelled operations.
    pub error: Option<String>,
    /// First failure upstream of a skipped operation.
    pub root_cause: Option<RootCause>,
}

/// A failed operation and everything it blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedBranch {
    /// The failure.
    pub root: RootCause,
    /// Resources skipped because of it.
    pub skipped: Vec<String>,
}

/// Report of a whole apply.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// When the apply started.
    pub started_at: DateTime<Utc>,
    /// When the apply finished.
    pub finished_at: DateTime<Utc>,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
    /// Results in plan order.
    pub operations: Vec<OperationResult>,
    /// Whether a cancellation stopped the apply.
    pub cancelled: bool,
    /// State serial after the apply.
    pub serial: u64,
}

impl OperationResult {
    /// Creates a result for `op` with no timing information.
    #[must_use]
    pub fn new(op: &PlannedOperation, status: OperationStatus) -> Self {
        Self {
            index: op.index,
            resource: op.resource.clone(),
            resource_type: op.resource_type.clone(),
            kind: op.kind,
            status,
            attempts: 0,
            wave: op.wave,
            started_at: None,
            duration_ms: 0,
            provider_id: op.provider_id.clone(),
            error: None,
            root_cause: None,
        }
    }

    /// Creates a result for an operation blocked by `cause`.
    #[must_use]
    pub fn skipped(op: &PlannedOperation, cause: RootCause) -> Self {
        Self {
            root_cause: Some(cause),
            ..Self::new(op, OperationStatus::Skipped)
        }
    }

    /// Returns the root cause this result propagates to its dependents.
    ///
    /// `None` if the operation did not block anything.
    #[must_use]
    pub fn blocking_cause(&self) -> Option<RootCause> {
        match self.status {
            OperationStatus::Failed => Some(RootCause {
                resource: self.resource.clone(),
                error: self.error.clone().unwrap_or_default(),
            }),
            OperationStatus::Skipped => self.root_cause.clone(),
            OperationStatus::Cancelled => Some(RootCause {
                resource: self.resource.clone(),
                error: String::from("cancelled"),
            }),
            OperationStatus::Succeeded | OperationStatus::Unchanged => None,
        }
    }
}

impl ApplyReport {
    /// Results with the given status.
    pub fn with_status(&self, status: OperationStatus) -> impl Iterator<Item = &OperationResult> {
        self.operations.iter().filter(move |r| r.status == status)
    }

    /// Number of results with the given status.
    #[must_use]
    pub fn count(&self, status: OperationStatus) -> usize {
        self.with_status(status).count()
    }

    /// Returns true if nothing failed, was skipped or was cancelled.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.operations.iter().all(|r| {
                matches!(r.status, OperationStatus::Succeeded | OperationStatus::Unchanged)
            })
    }

    /// Failed operations with the resources each one blocked.
    #[must_use]
    pub fn failed_branches(&self) -> Vec<FailedBranch> {
        self.with_status(OperationStatus::Failed)
            .map(|failed| FailedBranch {
                root: RootCause {
                    resource: failed.resource.clone(),
                    error: failed.error.clone().unwrap_or_default(),
                },
                skipped: self
                    .with_status(OperationStatus::Skipped)
                    .filter(|s| {
                        s.root_cause
                            .as_ref()
                            .is_some_and(|c| c.resource == failed.resource)
                    })
                    .map(|s| s.resource.clone())
                    .collect(),
            })
            .collect()
    }

    /// The first error of a failed apply, for history entries.
    #[must_use]
    pub fn first_error(&self) -> Option<String> {
        self.with_status(OperationStatus::Failed)
            .next()
            .map(|r| format!("{}: {}", r.resource, r.error.as_deref().unwrap_or("failed")))
            .or_else(|| self.cancelled.then(|| String::from("apply cancelled")))
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Attributes;

    fn op(index: usize, name: &str) -> PlannedOperation {
        PlannedOperation {
            index,
            kind: OperationKind::Create,
            resource: name.to_string(),
            resource_type: String::from("subnet"),
            desired: Attributes::new(),
            planned: Attributes::new(),
            changes: Vec::new(),
            dependencies: Vec::new(),
            resource_dependencies: Vec::new(),
            wave: 1,
            replace_strategy: None,
            provider_id: None,
            computed: Vec::new(),
            spec_hash: String::new(),
            reason: String::new(),
            stale_record: false,
            replaced_by: None,
        }
    }

    fn report(operations: Vec<OperationResult>) -> ApplyReport {
        let now = Utc::now();
        ApplyReport {
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            operations,
            cancelled: false,
            serial: 3,
        }
    }

    #[test]
    fn test_branches_group_skipped_under_root() {
        let mut failed = OperationResult::new(&op(0, "main"), OperationStatus::Failed);
        failed.error = Some(String::from("quota exceeded"));
        let cause = failed.blocking_cause().unwrap();
        let skipped = OperationResult::skipped(&op(1, "public_a"), cause.clone());
        let transitively = OperationResult::skipped(&op(2, "nat"), skipped.blocking_cause().unwrap());
        let ok = OperationResult::new(&op(3, "bucket"), OperationStatus::Succeeded);

        let r = report(vec![failed, skipped, transitively, ok]);
        assert!(!r.is_success());
        assert_eq!(r.count(OperationStatus::Skipped), 2);

        let branches = r.failed_branches();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].root, cause);
        assert_eq!(branches[0].skipped, vec!["public_a", "nat"]);
        assert_eq!(r.first_error().unwrap(), "main: quota exceeded");
    }

    #[test]
    fn test_success_requires_terminal_success() {
        let r = report(vec![
            OperationResult::new(&op(0, "a"), OperationStatus::Succeeded),
            OperationResult::new(&op(1, "b"), OperationStatus::Unchanged),
        ]);
        assert!(r.is_success());
        assert!(r.first_error().is_none());

        let mut cancelled = r.clone();
        cancelled.cancelled = true;
        assert!(!cancelled.is_success());
        assert_eq!(cancelled.first_error().unwrap(), "apply cancelled");
    }

    #[test]
    fn test_report_serializes_snake_case() {
        let r = report(vec![OperationResult::new(&op(0, "a"), OperationStatus::Succeeded)]);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["operations"][0]["status"], "succeeded");
        assert_eq!(json["operations"][0]["kind"], "create");
    }
}
