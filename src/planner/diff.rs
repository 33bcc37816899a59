//! Diff engine for comparing desired attributes against last applied state.
//!
//! The comparison covers the union of keys: attributes added, changed and
//! removed all count. Values not known before apply always count as a
//! change. Provider-computed attributes are never diffed.

use tracing::debug;

use crate::config::{LifecycleConfig, TypeSchema};
use crate::state::ResourceRecord;
use crate::value::Attributes;

use super::plan::{AttributeChange, OperationKind, ReplaceStrategy};

/// Engine for computing per-resource diffs.
#[derive(Debug, Default)]
pub struct DiffEngine;

/// Outcome of diffing one declared resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDiff {
    /// Operation the diff calls for.
    pub kind: OperationKind,
    /// Attribute differences.
    pub changes: Vec<AttributeChange>,
    /// Replacement ordering, for replaces only.
    pub replace_strategy: Option<ReplaceStrategy>,
    /// Human-readable reason.
    pub reason: String,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Diffs a declared resource against its record.
    ///
    /// `planned` holds the desired attributes, resolved as far as possible.
    #[must_use]
    pub fn diff_resource(
        &self,
        resource_type: &str,
        planned: &Attributes,
        record: Option<&ResourceRecord>,
        schema: &TypeSchema,
        lifecycle: &LifecycleConfig,
    ) -> ResourceDiff {
        let Some(record) = record else {
            let changes = planned
                .iter()
                .filter(|(key, _)| !schema.is_computed(key))
                .map(|(key, value)| AttributeChange {
                    attribute: key.clone(),
                    old: None,
                    new: Some(value.clone()),
                    requires_replacement: false,
                })
                .collect();
            return ResourceDiff {
                kind: OperationKind::Create,
                changes,
                replace_strategy: None,
                reason: String::from("not in state"),
            };
        };

        let mut changes = self.attribute_changes(planned, &record.configured, schema);
        let type_changed = record.resource_type != resource_type;
        if type_changed {
            changes.insert(
                0,
                AttributeChange {
                    attribute: String::from("type"),
                    old: Some(record.resource_type.as_str().into()),
                    new: Some(resource_type.into()),
                    requires_replacement: true,
                },
            );
        }

        if changes.is_empty() {
            return ResourceDiff {
                kind: OperationKind::NoOp,
                changes,
                replace_strategy: None,
                reason: String::from("up to date"),
            };
        }

        let forcing: Vec<&str> = changes
            .iter()
            .filter(|c| c.requires_replacement)
            .map(|c| c.attribute.as_str())
            .collect();

        if forcing.is_empty() {
            debug!("{} attribute(s) changed in place", changes.len());
            let reason = format!("{} attribute(s) changed", changes.len());
            return ResourceDiff {
                kind: OperationKind::Update,
                changes,
                replace_strategy: None,
                reason,
            };
        }

        let strategy = if lifecycle
            .create_before_destroy
            .unwrap_or(schema.create_before_destroy)
        {
            ReplaceStrategy::CreateBeforeDestroy
        } else {
            ReplaceStrategy::DestroyBeforeCreate
        };
        let reason = format!("{} forces replacement", forcing.join(", "));

        ResourceDiff {
            kind: OperationKind::Replace,
            changes,
            replace_strategy: Some(strategy),
            reason,
        }
    }

    /// Compares planned attributes against last applied ones over the union of keys.
    #[must_use]
    pub fn attribute_changes(
        &self,
        planned: &Attributes,
        configured: &Attributes,
        schema: &TypeSchema,
    ) -> Vec<AttributeChange> {
        let mut changes = Vec::new();

        for (key, new) in planned {
            if schema.is_computed(key) {
                continue;
            }
            let old = configured.get(key);
            if !new.is_known() || old != Some(new) {
                changes.push(AttributeChange {
                    attribute: key.clone(),
                    old: old.cloned(),
                    new: Some(new.clone()),
                    requires_replacement: schema.is_immutable(key),
                });
            }
        }

        for (key, old) in configured {
            if schema.is_computed(key) || planned.contains_key(key) {
                continue;
            }
            changes.push(AttributeChange {
                attribute: key.clone(),
                old: Some(old.clone()),
                new: None,
                requires_replacement: schema.is_immutable(key),
            });
        }

        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn schema() -> TypeSchema {
        TypeSchema {
            immutable: vec![String::from("cidr_block")],
            ..TypeSchema::default()
        }
    }

    fn attrs(pairs: &[(&str, Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn record(configured: Attributes) -> ResourceRecord {
        let mut record = ResourceRecord::new("public_a", "subnet", "subnet-1");
        record.configured = configured;
        record
    }

    #[test]
    fn test_missing_record_is_create() {
        let planned = attrs(&[("cidr_block", Value::string("10.0.1.0/24"))]);
        let diff = DiffEngine::new().diff_resource(
            "subnet",
            &planned,
            None,
            &schema(),
            &LifecycleConfig::default(),
        );
        assert_eq!(diff.kind, OperationKind::Create);
        assert_eq!(diff.changes.len(), 1);
    }

    #[test]
    fn test_identical_is_noop() {
        let planned = attrs(&[
            ("cidr_block", Value::string("10.0.1.0/24")),
            ("tags", Value::Map(attrs(&[("a", Value::int(1)), ("b", Value::int(2))]))),
        ]);
        // same map in a different order
        let configured = attrs(&[
            ("tags", Value::Map(attrs(&[("b", Value::int(2)), ("a", Value::int(1))]))),
            ("cidr_block", Value::string("10.0.1.0/24")),
        ]);
        let diff = DiffEngine::new().diff_resource(
            "subnet",
            &planned,
            Some(&record(configured)),
            &schema(),
            &LifecycleConfig::default(),
        );
        assert_eq!(diff.kind, OperationKind::NoOp);
    }

    #[test]
    fn test_mutable_change_is_update() {
        let planned = attrs(&[
            ("cidr_block", Value::string("10.0.1.0/24")),
            ("map_public_ip", Value::Bool(true)),
        ]);
        let configured = attrs(&[
            ("cidr_block", Value::string("10.0.1.0/24")),
            ("map_public_ip", Value::Bool(false)),
        ]);
        let diff = DiffEngine::new().diff_resource(
            "subnet",
            &planned,
            Some(&record(configured)),
            &schema(),
            &LifecycleConfig::default(),
        );
        assert_eq!(diff.kind, OperationKind::Update);
        assert_eq!(diff.changes[0].attribute, "map_public_ip");
    }

    #[test]
    fn test_immutable_change_is_replace() {
        let planned = attrs(&[("cidr_block", Value::string("10.0.2.0/24"))]);
        let configured = attrs(&[("cidr_block", Value::string("10.0.1.0/24"))]);
        let lifecycle = LifecycleConfig {
            create_before_destroy: Some(true),
            prevent_destroy: false,
        };
        let diff = DiffEngine::new().diff_resource(
            "subnet",
            &planned,
            Some(&record(configured)),
            &schema(),
            &lifecycle,
        );
        assert_eq!(diff.kind, OperationKind::Replace);
        assert_eq!(diff.replace_strategy, Some(ReplaceStrategy::CreateBeforeDestroy));
        assert!(diff.reason.contains("cidr_block"));
    }

    #[test]
    fn test_removed_and_unknown_attributes_are_changes() {
        let planned = attrs(&[("vpc_id", Value::Unknown)]);
        let configured = attrs(&[
            ("vpc_id", Value::string("vpc-1")),
            ("description", Value::string("old")),
        ]);
        let changes = DiffEngine::new().attribute_changes(&planned, &configured, &schema());
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].new, Some(Value::Unknown));
        assert_eq!(changes[1].attribute, "description");
        assert_eq!(changes[1].new, None);
    }

    #[test]
    fn test_type_change_forces_replacement() {
        let planned = attrs(&[("cidr_block", Value::string("10.0.1.0/24"))]);
        let configured = planned.clone();
        let diff = DiffEngine::new().diff_resource(
            "network",
            &planned,
            Some(&record(configured)),
            &TypeSchema::default(),
            &LifecycleConfig::default(),
        );
        assert_eq!(diff.kind, OperationKind::Replace);
        assert_eq!(diff.replace_strategy, Some(ReplaceStrategy::DestroyBeforeCreate));
    }
}
