//! Plan construction.
//!
//! The planner walks the desired graph in topological order, resolving
//! each resource against what is already known: recorded attributes for
//! unchanged resources, planned attributes for updated ones, and unknowns
//! for anything a create or replace will only produce at apply time.
//! State records no longer declared become destroys, dependents first.
//! A destroy-before-create replacement gets a separate destroy operation
//! that waits for the destruction of whatever still uses the old object.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::config::{ConfigHasher, GuardrailsConfig, ResourceSpec, TopologyConfig};
use crate::error::{PlanError, Result};
use crate::graph::{GraphBuilder, ResourceGraph};
use crate::state::{ResourceRecord, StateSnapshot};
use crate::value::{Attributes, Lookup, Reference, ResolveContext, Value};

use super::diff::DiffEngine;
use super::plan::{AttributeChange, OperationKind, Plan, PlannedOperation, ReplaceStrategy};

/// What the planner knows about a resource while planning its dependents.
#[derive(Debug)]
enum Planned {
    /// Every attribute is known.
    Known(Attributes),
    /// Listed attributes are known, everything else appears after apply.
    Pending(Attributes),
}

/// Resolution context built up while planning.
#[derive(Debug, Default)]
struct PlanningContext {
    resources: HashMap<String, Planned>,
}

impl ResolveContext for PlanningContext {
    fn lookup(&self, reference: &Reference) -> Lookup<'_> {
        match self.resources.get(&reference.resource) {
            None => Lookup::MissingResource,
            Some(Planned::Known(attributes)) => attributes
                .get(&reference.attribute)
                .map_or(Lookup::MissingAttribute, Lookup::Known),
            Some(Planned::Pending(attributes)) => attributes
                .get(&reference.attribute)
                .map_or(Lookup::Unknown, Lookup::Known),
        }
    }
}

/// Computes plans from a topology and the last known state.
#[derive(Debug)]
pub struct Planner<'a> {
    config: &'a TopologyConfig,
    hasher: ConfigHasher,
    diff: DiffEngine,
}

impl<'a> Planner<'a> {
    /// Creates a planner for `config`.
    #[must_use]
    pub const fn new(config: &'a TopologyConfig) -> Self {
        Self {
            config,
            hasher: ConfigHasher::new(),
            diff: DiffEngine::new(),
        }
    }

    /// Plans the changes that bring `state` to the declared topology.
    ///
    /// # Errors
    ///
    /// Returns graph errors for cyclic or dangling declarations, value
    /// errors for references to undeclared attributes, and
    /// [`PlanError::PreventDestroy`] if a protected resource would go away.
    pub fn plan(&self, state: Option<&StateSnapshot>) -> Result<Plan> {
        let graph = GraphBuilder::new().build(&self.config.resources)?;
        info!("Planning {} declared resources", graph.len());

        let mut ctx = PlanningContext::default();
        let mut operations: Vec<PlannedOperation> = Vec::with_capacity(graph.len());
        let mut forward: HashMap<String, usize> = HashMap::new();

        for i in graph.topological_order() {
            let spec = &self.config.resources[i];
            let op = self.plan_resource(spec, &graph, state, &ctx, &forward, operations.len())?;

            let known = match op.kind {
                OperationKind::NoOp | OperationKind::Update => {
                    let mut attributes = state
                        .and_then(|s| s.record(&spec.name))
                        .map(|r| r.attributes.clone())
                        .unwrap_or_default();
                    for (key, value) in &op.planned {
                        attributes.insert(key.clone(), value.clone());
                    }
                    Planned::Known(attributes)
                }
                _ => Planned::Pending(op.planned.clone()),
            };
            ctx.resources.insert(spec.name.clone(), known);
            forward.insert(spec.name.clone(), op.index);
            operations.push(op);
        }

        if let Some(snapshot) = state {
            let declared: HashSet<&str> = self.config.resources.iter().map(|r| r.name.as_str()).collect();
            let doomed: Vec<&str> = snapshot
                .resources
                .keys()
                .map(String::as_str)
                .filter(|name| !declared.contains(name))
                .collect();
            let destroyed =
                self.append_destroys(&mut operations, snapshot, &doomed, &forward, "removed from configuration")?;
            split_replacements(&mut operations, snapshot, &destroyed);
        }

        Ok(self.finish(operations, state))
    }

    /// Plans destruction of `targets` and everything depending on them, or
    /// of the whole state when `targets` is empty.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::UnknownTarget`] for a target missing from state
    /// and [`PlanError::PreventDestroy`] for protected resources.
    pub fn plan_destroy(&self, state: &StateSnapshot, targets: &[String]) -> Result<Plan> {
        let doomed: Vec<&str> = if targets.is_empty() {
            state.names()
        } else {
            let graph = self.state_graph(state)?;
            let mut roots = Vec::with_capacity(targets.len());
            for target in targets {
                let index = graph
                    .index_of(target)
                    .ok_or_else(|| PlanError::UnknownTarget { name: target.clone() })?;
                roots.push(index);
            }
            graph
                .with_transitive_dependents(&roots)
                .into_iter()
                .map(|i| graph.nodes()[i].name.as_str())
                .filter_map(|name| state.resources.get_key_value(name).map(|(k, _)| k.as_str()))
                .collect()
        };

        info!("Planning destruction of {} resources", doomed.len());

        let mut operations = Vec::with_capacity(doomed.len());
        self.append_destroys(&mut operations, state, &doomed, &HashMap::new(), "targeted for destruction")?;

        Ok(self.finish(operations, Some(state)))
    }

    /// Plans the forward operation of one declared resource.
    fn plan_resource(
        &self,
        spec: &ResourceSpec,
        graph: &ResourceGraph,
        state: Option<&StateSnapshot>,
        ctx: &PlanningContext,
        forward: &HashMap<String, usize>,
        index: usize,
    ) -> Result<PlannedOperation> {
        let schema = self.config.schema(&spec.resource_type);
        let desired = spec.desired_attributes(&schema);
        let planned = desired
            .iter()
            .map(|(key, value)| Ok((key.clone(), value.resolve_partial(ctx)?)))
            .collect::<Result<Attributes>>()?;

        let record = state.and_then(|s| s.record(&spec.name));
        let diff = self
            .diff
            .diff_resource(&spec.resource_type, &planned, record, &schema, &spec.lifecycle);

        if diff.kind == OperationKind::Replace && spec.lifecycle.prevent_destroy {
            return Err(PlanError::PreventDestroy {
                resource: spec.name.clone(),
                action: String::from("replace"),
            }
            .into());
        }

        let resource_dependencies: Vec<String> = graph
            .dependencies_of(&spec.name)
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut computed = vec![String::from("id")];
        computed.extend(schema.computed.iter().filter(|c| *c != "id").cloned());

        let spec_hash = self.hasher.hash_resource(spec);
        let stale_record = diff.kind == OperationKind::NoOp
            && record.is_some_and(|r| r.dependencies != resource_dependencies || r.spec_hash != spec_hash);

        debug!("{} -> {} ({})", spec.address(), diff.kind, diff.reason);

        Ok(PlannedOperation {
            index,
            kind: diff.kind,
            resource: spec.name.clone(),
            resource_type: spec.resource_type.clone(),
            desired,
            planned,
            changes: diff.changes,
            dependencies: resource_dependencies
                .iter()
                .filter_map(|dep| forward.get(dep).copied())
                .collect(),
            resource_dependencies,
            wave: 0,
            replace_strategy: diff.replace_strategy,
            provider_id: record.map(|r| r.provider_id.clone()),
            computed,
            spec_hash,
            reason: diff.reason,
            stale_record,
            replaced_by: None,
        })
    }

    /// Appends destroy operations for `doomed`, dependents first.
    ///
    /// Returns the index of each destroy by resource name.
    fn append_destroys(
        &self,
        operations: &mut Vec<PlannedOperation>,
        state: &StateSnapshot,
        doomed: &[&str],
        forward: &HashMap<String, usize>,
        reason: &str,
    ) -> Result<HashMap<String, usize>> {
        let mut destroy_of: HashMap<String, usize> = HashMap::new();
        if doomed.is_empty() {
            return Ok(destroy_of);
        }

        let doomed_set: HashSet<&str> = doomed.iter().copied().collect();
        let graph = self.state_graph(state)?;

        for i in graph.topological_order().into_iter().rev() {
            let name = graph.nodes()[i].name.as_str();
            if !doomed_set.contains(name) {
                continue;
            }
            let Some(record) = state.record(name) else {
                continue;
            };

            if self
                .config
                .resource(name)
                .is_some_and(|spec| spec.lifecycle.prevent_destroy)
            {
                return Err(PlanError::PreventDestroy {
                    resource: name.to_string(),
                    action: String::from("destroy"),
                }
                .into());
            }

            // Everything that used this resource must finish with it first.
            let mut dependencies: Vec<usize> = graph
                .dependents_of(name)
                .into_iter()
                .filter_map(|dependent| {
                    destroy_of
                        .get(dependent)
                        .or_else(|| forward.get(dependent))
                        .copied()
                })
                .collect();
            dependencies.sort_unstable();
            dependencies.dedup();

            let index = operations.len();
            destroy_of.insert(name.to_string(), index);
            debug!("{} -> destroy ({reason})", record.address());
            operations.push(destroy_operation(index, record, dependencies, reason, None));
        }

        Ok(destroy_of)
    }

    /// Builds the dependency graph of recorded resources.
    ///
    /// Records still declared are ordered by declaration, the rest by their
    /// position in state, so ties break the same way creation did.
    fn state_graph(&self, state: &StateSnapshot) -> Result<ResourceGraph> {
        let declared: HashMap<&str, usize> = self
            .config
            .resources
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.as_str(), i))
            .collect();

        let mut records: Vec<(usize, &ResourceRecord)> = state
            .resources
            .values()
            .enumerate()
            .map(|(pos, record)| {
                let key = declared
                    .get(record.name.as_str())
                    .copied()
                    .unwrap_or(self.config.resources.len() + pos);
                (key, record)
            })
            .collect();
        records.sort_by_key(|(key, _)| *key);

        let specs: Vec<ResourceSpec> = records
            .into_iter()
            .map(|(_, record)| {
                let mut spec = ResourceSpec::new(&record.name, &record.resource_type);
                spec.depends_on = record
                    .dependencies
                    .iter()
                    .filter(|dep| state.resources.contains_key(*dep))
                    .cloned()
                    .collect();
                spec
            })
            .collect();

        Ok(GraphBuilder::new().build(&specs)?)
    }

    /// Prunes dependencies on no-ops, assigns waves and checks guardrails.
    fn finish(&self, mut operations: Vec<PlannedOperation>, state: Option<&StateSnapshot>) -> Plan {
        let actionable: Vec<bool> = operations.iter().map(|op| op.kind.is_actionable()).collect();
        for op in &mut operations {
            op.dependencies.retain(|&d| actionable[d]);
        }

        // Destroy halves of replacements sit after the operations waiting on
        // them, so waves cannot be assigned in a single forward pass.
        let mut waves = vec![None; operations.len()];
        for i in 0..operations.len() {
            wave_of(&operations, &actionable, i, &mut waves);
        }
        for (op, wave) in operations.iter_mut().zip(waves) {
            op.wave = wave.unwrap_or(0);
        }

        let (passes_guardrails, guardrail_violations) =
            check_guardrails(self.config.guardrails.as_ref(), &operations);

        let plan = Plan {
            created_at: Utc::now(),
            config_hash: self.hasher.hash_config(self.config),
            state_serial: state.map_or(0, |s| s.serial),
            state_lineage: state.map(|s| s.lineage.clone()),
            operations,
            passes_guardrails,
            guardrail_violations,
        };

        info!("Plan: {}", plan.summary());
        plan
    }
}

/// Checks guardrails for the plan.
fn check_guardrails(
    guardrails: Option<&GuardrailsConfig>,
    operations: &[PlannedOperation],
) -> (bool, Vec<String>) {
    let mut violations = Vec::new();

    if let Some(guardrails) = guardrails {
        let destroys = operations
            .iter()
            .filter(|op| op.replaced_by.is_none())
            .filter(|op| matches!(op.kind, OperationKind::Destroy | OperationKind::Replace))
            .count();
        if let Some(max) = guardrails.max_destroys
            && destroys > max
        {
            violations.push(format!(
                "Plan destroys {destroys} resources but max_destroys is {max}"
            ));
        }

        if !guardrails.allow_replace {
            for op in operations.iter().filter(|op| op.kind == OperationKind::Replace) {
                violations.push(format!(
                    "Resource '{}' would be replaced but allow_replace is false",
                    op.resource
                ));
            }
        }
    }

    (violations.is_empty(), violations)
}

/// Builds the operation destroying a recorded resource.
fn destroy_operation(
    index: usize,
    record: &ResourceRecord,
    dependencies: Vec<usize>,
    reason: &str,
    replaced_by: Option<usize>,
) -> PlannedOperation {
    PlannedOperation {
        index,
        kind: OperationKind::Destroy,
        resource: record.name.clone(),
        resource_type: record.resource_type.clone(),
        desired: Attributes::new(),
        planned: Attributes::new(),
        changes: record
            .configured
            .iter()
            .map(|(key, value)| AttributeChange {
                attribute: key.clone(),
                old: Some(value.clone()),
                new: None,
                requires_replacement: false,
            })
            .collect(),
        dependencies,
        resource_dependencies: record.dependencies.clone(),
        wave: 0,
        replace_strategy: None,
        provider_id: Some(record.provider_id.clone()),
        computed: Vec::new(),
        spec_hash: record.spec_hash.clone(),
        reason: reason.to_string(),
        stale_record: false,
        replaced_by,
    }
}

/// Moves the destroy of every destroy-before-create replacement into its
/// own operation.
///
/// The destroy half waits for the destroy halves and destroys of recorded
/// dependents. Dependents that are kept, updated or replaced create-first
/// need the new object and keep pointing at the old one until then.
fn split_replacements(
    operations: &mut Vec<PlannedOperation>,
    state: &StateSnapshot,
    destroyed: &HashMap<String, usize>,
) {
    let replaced: Vec<usize> = operations
        .iter()
        .filter(|op| {
            op.kind == OperationKind::Replace
                && op.replace_strategy != Some(ReplaceStrategy::CreateBeforeDestroy)
        })
        .map(|op| op.index)
        .collect();

    let mut halves: Vec<(String, usize)> = Vec::with_capacity(replaced.len());
    for forward in replaced {
        let Some(record) = state.record(&operations[forward].resource) else {
            continue;
        };
        let index = operations.len();
        operations.push(destroy_operation(
            index,
            record,
            Vec::new(),
            "replaced, old object destroyed first",
            Some(forward),
        ));
        operations[forward].dependencies.push(index);
        halves.push((record.name.clone(), index));
    }

    let half_of: HashMap<&str, usize> = halves.iter().map(|(name, i)| (name.as_str(), *i)).collect();
    for (name, half) in &halves {
        let users = state
            .resources
            .values()
            .filter(|r| r.dependencies.iter().any(|d| d == name));
        for user in users {
            let Some(&before) = half_of
                .get(user.name.as_str())
                .or_else(|| destroyed.get(&user.name))
            else {
                continue;
            };
            if reaches(operations, before, *half) {
                debug!("{} is destroyed after its replacement of {name} exists", user.name);
                continue;
            }
            operations[*half].dependencies.push(before);
        }
        operations[*half].dependencies.sort_unstable();
        operations[*half].dependencies.dedup();
    }
}

/// Returns true if operation `from` transitively waits on `to`.
fn reaches(operations: &[PlannedOperation], from: usize, to: usize) -> bool {
    let mut seen = HashSet::new();
    let mut stack = vec![from];
    while let Some(i) = stack.pop() {
        if i == to {
            return true;
        }
        if seen.insert(i) {
            stack.extend(operations[i].dependencies.iter().copied());
        }
    }
    false
}

/// Wave of operation `i`: one past its latest dependency, zero for no-ops.
fn wave_of(
    operations: &[PlannedOperation],
    actionable: &[bool],
    i: usize,
    memo: &mut [Option<usize>],
) -> usize {
    if let Some(wave) = memo[i] {
        return wave;
    }
    let wave = if actionable[i] {
        1 + operations[i]
            .dependencies
            .iter()
            .map(|&d| wave_of(operations, actionable, d, memo))
            .max()
            .unwrap_or(0)
    } else {
        0
    };
    memo[i] = Some(wave);
    wave
}

/// Returns true if any value of `planned` is unknown until apply.
#[must_use]
pub fn has_unknowns(planned: &Attributes) -> bool {
    planned.values().any(|v| !v.is_known())
}
