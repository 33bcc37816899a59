//! Plan types.
//!
//! A plan lists one operation per resource: forward operations in
//! dependency order first, then destroys with dependents first. A
//! destroy-before-create replacement adds a second, destroy-only operation
//! for the old object. Every actionable operation is assigned to a wave; a
//! wave only depends on earlier waves.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::value::{Attributes, Value};

/// What the executor will do to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Materialize a new resource.
    Create,
    /// Change mutable attributes in place.
    Update,
    /// Destroy and recreate because an immutable attribute changed.
    Replace,
    /// Remove a resource no longer declared.
    Destroy,
    /// Nothing to do.
    #[serde(rename = "no_op")]
    NoOp,
}

/// Ordering of the two halves of a replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceStrategy {
    /// Create the new resource, then destroy the old one.
    CreateBeforeDestroy,
    /// Destroy the old resource, then create the new one.
    DestroyBeforeCreate,
}

/// One attribute difference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub attribute: String,
    /// Last applied value, `None` if newly added.
    pub old: Option<Value>,
    /// Planned value, `None` if removed.
    pub new: Option<Value>,
    /// Whether this change alone forces replacement.
    pub requires_replacement: bool,
}

/// A single planned operation.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedOperation {
    /// Position in the plan.
    pub index: usize,
    /// Operation kind.
    pub kind: OperationKind,
    /// Resource name.
    pub resource: String,
    /// Resource type.
    pub resource_type: String,
    /// Desired attributes with defaults filled in, references unresolved.
    pub desired: Attributes,
    /// Desired attributes as far as they can be resolved before apply.
    pub planned: Attributes,
    /// Attribute differences against the last applied state.
    pub changes: Vec<AttributeChange>,
    /// Indices of operations that must finish first.
    pub dependencies: Vec<usize>,
    /// Names of the resources this one depends on in the graph.
    pub resource_dependencies: Vec<String>,
    /// Wave number, starting at 1. Zero for no-ops, which are never scheduled.
    pub wave: usize,
    /// Replacement ordering, set for replaces only.
    pub replace_strategy: Option<ReplaceStrategy>,
    /// Provider identifier of the existing resource.
    pub provider_id: Option<String>,
    /// Attributes the provider assigns.
    pub computed: Vec<String>,
    /// Hash of the declaration.
    pub spec_hash: String,
    /// Why this operation exists.
    pub reason: String,
    /// For a no-op: the record's dependencies or declaration hash are out
    /// of date and get rewritten without calling the provider.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stale_record: bool,
    /// For the destroy half of a destroy-before-create replacement: index
    /// of the replace operation that creates the new object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaced_by: Option<usize>,
}

/// Counts per operation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Creates.
    pub create: usize,
    /// Updates.
    pub update: usize,
    /// Replaces.
    pub replace: usize,
    /// Destroys.
    pub destroy: usize,
    /// No-ops.
    pub unchanged: usize,
}

/// A complete execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Configuration hash this plan is based on.
    pub config_hash: String,
    /// State serial the plan was computed against.
    pub state_serial: u64,
    /// State lineage the plan was computed against.
    pub state_lineage: Option<String>,
    /// Operations in plan order.
    pub operations: Vec<PlannedOperation>,
    /// Whether the plan passes guardrails.
    pub passes_guardrails: bool,
    /// Guardrail violations (if any).
    pub guardrail_violations: Vec<String>,
}

impl OperationKind {
    /// Returns true if the executor has work to do.
    #[must_use]
    pub const fn is_actionable(self) -> bool {
        !matches!(self, Self::NoOp)
    }

    /// Plan output symbol.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Destroy => "-",
            Self::NoOp => " ",
        }
    }
}

impl Plan {
    /// Returns operations the executor acts on.
    pub fn actionable(&self) -> impl Iterator<Item = &PlannedOperation> {
        self.operations.iter().filter(|op| op.kind.is_actionable())
    }

    /// Returns true if the plan has any actionable operation or record to
    /// bring up to date.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.actionable().next().is_some() || self.stale_records().next().is_some()
    }

    /// Returns no-ops whose records are rewritten on apply.
    pub fn stale_records(&self) -> impl Iterator<Item = &PlannedOperation> {
        self.operations.iter().filter(|op| op.stale_record)
    }

    /// Returns the operation for a resource, never the destroy half of a
    /// replacement.
    #[must_use]
    pub fn operation(&self, resource: &str) -> Option<&PlannedOperation> {
        self.operations
            .iter()
            .find(|op| op.resource == resource && op.replaced_by.is_none())
    }

    /// Returns actionable operation indices grouped by wave.
    #[must_use]
    pub fn waves(&self) -> Vec<Vec<usize>> {
        let mut waves: Vec<Vec<usize>> = Vec::new();
        for op in self.actionable() {
            if waves.len() < op.wave {
                waves.resize_with(op.wave, Vec::new);
            }
            waves[op.wave - 1].push(op.index);
        }
        waves
    }

    /// Counts operations per kind. A split replacement counts once.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for op in self.operations.iter().filter(|op| op.replaced_by.is_none()) {
            match op.kind {
                OperationKind::Create => summary.create += 1,
                OperationKind::Update => summary.update += 1,
                OperationKind::Replace => summary.replace += 1,
                OperationKind::Destroy => summary.destroy += 1,
                OperationKind::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Destroy => "destroy",
            Self::NoOp => "no-op",
        };
        write!(f, "{kind}")
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to destroy, {} unchanged",
            self.create, self.update, self.replace, self.destroy, self.unchanged
        )
    }
}
