//! State types for tracking materialized resources.
//!
//! A snapshot maps every materialized resource to the attributes last
//! applied to it. The planner diffs against `configured`, the executor
//! resolves references against `attributes`.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::value::Attributes;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Number of history entries retained in a snapshot.
pub const MAX_HISTORY: usize = 100;

/// The complete persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State format version.
    pub version: String,
    /// Identifier shared by every serial of the same state.
    pub lineage: String,
    /// Incremented on every write.
    pub serial: u64,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Materialized resources keyed by name, in materialization order.
    #[serde(default)]
    pub resources: IndexMap<String, ResourceRecord>,
    /// When the state was last written.
    pub last_updated: DateTime<Utc>,
    /// Recent operations, oldest first.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Last-applied view of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Resource name.
    pub name: String,
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Identifier assigned by the provider.
    pub provider_id: String,
    /// Resolved desired attributes as last applied.
    #[serde(default)]
    pub configured: Attributes,
    /// Full provider view, including computed attributes.
    #[serde(default)]
    pub attributes: Attributes,
    /// Names of resources this one depended on when applied.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Hash of the declaration that produced this record.
    #[serde(default)]
    pub spec_hash: String,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the operation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the operation finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: HistoryOperation,
    /// Configuration hash at the time of the operation.
    pub config_hash: String,
    /// Resources affected.
    pub resources: Vec<String>,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of recorded operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOperation {
    /// Plan applied.
    Apply,
    /// Destroy plan applied.
    Destroy,
    /// Observed attributes written back.
    Refresh,
    /// Record removed by hand.
    StateRm,
}

impl StateSnapshot {
    /// Creates a new empty snapshot with a fresh lineage.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            lineage: Uuid::new_v4().to_string(),
            serial: 0,
            project: project.to_string(),
            environment: environment.to_string(),
            resources: IndexMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a record by name.
    #[must_use]
    pub fn record(&self, name: &str) -> Option<&ResourceRecord> {
        self.resources.get(name)
    }

    /// Inserts or replaces a record, keeping its position if it already exists.
    pub fn upsert(&mut self, record: ResourceRecord) {
        self.resources.insert(record.name.clone(), record);
        self.last_updated = Utc::now();
    }

    /// Removes a record by name, preserving the order of the rest.
    pub fn remove(&mut self, name: &str) -> Option<ResourceRecord> {
        let result = self.resources.shift_remove(name);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Adds a history entry, dropping the oldest beyond [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            let excess = self.history.len() + 1 - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.history.push(entry);
    }

    /// Returns all record names in stored order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Returns true if no resources are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Provider attributes of every record, usable as a resolution context.
    #[must_use]
    pub fn attribute_context(&self) -> HashMap<String, Attributes> {
        self.resources
            .iter()
            .map(|(name, record)| (name.clone(), record.attributes.clone()))
            .collect()
    }
}

impl ResourceRecord {
    /// Creates a record for a freshly materialized resource.
    #[must_use]
    pub fn new(name: &str, resource_type: &str, provider_id: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            provider_id: provider_id.to_string(),
            configured: Attributes::new(),
            attributes: Attributes::new(),
            dependencies: Vec::new(),
            spec_hash: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the `type.name` address.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }
}

impl HistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: HistoryOperation, config_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: HistoryOperation,
        config_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(operation, config_hash, resources)
        }
    }
}

impl std::fmt::Display for HistoryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Refresh => "refresh",
            Self::StateRm => "state rm",
        };
        write!(f, "{op}")
    }
}
