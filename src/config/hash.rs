//! Configuration hashing for change detection.
//!
//! This module provides deterministic hashing of configuration structures
//! so plans, records and history entries can be tied to the exact
//! configuration that produced them.

use sha2::{Digest, Sha256};

use crate::value::Value;

use super::spec::{ResourceSpec, TopologyConfig, TypeSchema};

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire topology configuration.
    ///
    /// This hash changes when any resource or type schema changes.
    #[must_use]
    pub fn hash_config(&self, config: &TopologyConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update(config.project.environment.as_bytes());

        // Types (sorted by name for determinism)
        let mut types: Vec<_> = config.types.iter().collect();
        types.sort_by(|a, b| a.0.cmp(b.0));
        for (name, schema) in types {
            hasher.update(name.as_bytes());
            Self::feed_schema(&mut hasher, schema);
        }

        // Resources keep declaration order, which is itself significant
        for resource in &config.resources {
            hasher.update(self.hash_resource(resource).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource declaration.
    #[must_use]
    pub fn hash_resource(&self, resource: &ResourceSpec) -> String {
        let mut hasher = Sha256::new();

        hasher.update(resource.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(resource.resource_type.as_bytes());
        hasher.update([0u8]);

        // Attributes (sorted for determinism)
        let mut attributes: Vec<_> = resource.attributes.iter().collect();
        attributes.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in attributes {
            hasher.update(key.as_bytes());
            Self::feed_value(&mut hasher, value);
        }

        let mut depends_on: Vec<_> = resource.depends_on.iter().collect();
        depends_on.sort();
        for dep in depends_on {
            hasher.update(dep.as_bytes());
        }

        hasher.update([
            u8::from(resource.lifecycle.prevent_destroy),
            match resource.lifecycle.create_before_destroy {
                None => 0,
                Some(false) => 1,
                Some(true) => 2,
            },
        ]);

        hex::encode(hasher.finalize())
    }

    fn feed_schema(hasher: &mut Sha256, schema: &TypeSchema) {
        let mut immutable: Vec<_> = schema.immutable.iter().collect();
        immutable.sort();
        for attribute in immutable {
            hasher.update(b"i:");
            hasher.update(attribute.as_bytes());
        }

        let mut computed: Vec<_> = schema.computed.iter().collect();
        computed.sort();
        for attribute in computed {
            hasher.update(b"c:");
            hasher.update(attribute.as_bytes());
        }

        let mut defaults: Vec<_> = schema.defaults.iter().collect();
        defaults.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in defaults {
            hasher.update(b"d:");
            hasher.update(key.as_bytes());
            Self::feed_value(hasher, value);
        }

        hasher.update([u8::from(schema.create_before_destroy)]);
    }

    /// Feeds a value into the hasher with map keys sorted.
    fn feed_value(hasher: &mut Sha256, value: &Value) {
        match value {
            Value::Null => hasher.update(b"n"),
            Value::Bool(b) => hasher.update([b'b', u8::from(*b)]),
            Value::Number(n) => {
                hasher.update(b"#");
                hasher.update(n.to_string().as_bytes());
            }
            Value::String(s) => {
                hasher.update(b"s");
                hasher.update(s.len().to_be_bytes());
                hasher.update(s.as_bytes());
            }
            Value::List(items) => {
                hasher.update(b"[");
                for item in items {
                    Self::feed_value(hasher, item);
                }
                hasher.update(b"]");
            }
            Value::Map(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                hasher.update(b"{");
                for (key, item) in entries {
                    hasher.update(key.as_bytes());
                    hasher.update(b"=");
                    Self::feed_value(hasher, item);
                }
                hasher.update(b"}");
            }
            Value::Ref(reference) => {
                hasher.update(b"r");
                hasher.update(reference.to_string().as_bytes());
            }
            Value::Unknown => hasher.update(b"?"),
        }
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(name: &str) -> ResourceSpec {
        ResourceSpec::new(name, "subnet")
            .with_attribute("cidr_block", "10.0.1.0/24")
            .with_attribute("vpc_id", Value::reference("main", "id"))
    }

    #[test]
    fn test_resource_hash_deterministic() {
        let hasher = ConfigHasher::new();
        assert_eq!(hasher.hash_resource(&subnet("a")), hasher.hash_resource(&subnet("a")));
    }

    #[test]
    fn test_attribute_order_does_not_change_hash() {
        let hasher = ConfigHasher::new();
        let reordered = ResourceSpec::new("a", "subnet")
            .with_attribute("vpc_id", Value::reference("main", "id"))
            .with_attribute("cidr_block", "10.0.1.0/24");
        assert_eq!(hasher.hash_resource(&subnet("a")), hasher.hash_resource(&reordered));
    }

    #[test]
    fn test_different_resources_different_hash() {
        let hasher = ConfigHasher::new();
        assert_ne!(hasher.hash_resource(&subnet("a")), hasher.hash_resource(&subnet("b")));
    }

    #[test]
    fn test_short_hash() {
        let short = ConfigHasher::short_hash("abcdef1234567890abcdef1234567890");
        assert_eq!(short, "abcdef12");
    }
}
