//! Provider interface between the executor and the external API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::value::Attributes;

/// Desired state of one resource, with every reference resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Resource name.
    pub name: String,
    /// Resource type.
    pub resource_type: String,
    /// Fully resolved attributes.
    pub attributes: Attributes,
    /// Attributes the provider is expected to fill in.
    #[serde(default)]
    pub computed: Vec<String>,
}

/// Identifies a materialized resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHandle {
    /// Resource name.
    pub name: String,
    /// Resource type.
    pub resource_type: String,
    /// Identifier assigned by the provider.
    pub provider_id: String,
}

/// A resource as seen by the provider after a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResource {
    /// Identifier assigned by the provider.
    pub id: String,
    /// All attributes, computed ones included.
    pub attributes: Attributes,
}

/// External API used to materialize resources.
///
/// Transient failures are reported as [`ApiError::Transient`] and retried by
/// the executor; everything else fails the operation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Provider name for logs and reports.
    fn name(&self) -> &'static str;

    /// Creates a resource.
    async fn create(&self, request: &ResourceRequest) -> Result<ProviderResource, ApiError>;

    /// Updates a resource in place.
    async fn update(
        &self,
        provider_id: &str,
        request: &ResourceRequest,
    ) -> Result<ProviderResource, ApiError>;

    /// Deletes a resource. [`ApiError::NotFound`] if it is already gone.
    async fn delete(&self, handle: &ResourceHandle) -> Result<(), ApiError>;

    /// Reads current attributes, `None` if the resource no longer exists.
    async fn read(&self, handle: &ResourceHandle) -> Result<Option<Attributes>, ApiError>;
}

impl ResourceRequest {
    /// Returns the handle for this request once the provider assigned `provider_id`.
    #[must_use]
    pub fn handle(&self, provider_id: &str) -> ResourceHandle {
        ResourceHandle {
            name: self.name.clone(),
            resource_type: self.resource_type.clone(),
            provider_id: provider_id.to_string(),
        }
    }
}
