//! In-process simulated cloud.
//!
//! Keeps materialized objects in memory, optionally mirrored to a JSON file
//! so that consecutive CLI runs see the same cloud. Faults can be injected
//! per resource name, and every call is logged with start and finish
//! sequence numbers so tests can assert on ordering and concurrency.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{ApiError, Result, StateError, TransientKind};
use crate::value::{Attributes, Value};

use super::traits::{ProviderResource, ResourceHandle, ResourceProvider, ResourceRequest};

/// A materialized object in the simulated cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CloudObject {
    name: String,
    resource_type: String,
    attributes: Attributes,
}

/// Kind of provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// `create`
    Create,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `read`
    Read,
}

/// One logged provider call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// Call kind.
    pub kind: CallKind,
    /// Resource name.
    pub resource: String,
    /// Sequence number taken when the call started.
    pub started: u64,
    /// Sequence number taken when the call finished.
    pub finished: u64,
    /// Whether the call succeeded.
    pub ok: bool,
}

#[derive(Debug, Clone)]
enum Fault {
    Transient {
        remaining: u32,
        kind: TransientKind,
        retry_after_ms: Option<u64>,
    },
    Permanent {
        message: String,
    },
}

/// Simulated cloud provider.
#[derive(Debug, Default)]
pub struct SimulatedProvider {
    objects: Mutex<IndexMap<String, CloudObject>>,
    path: Option<PathBuf>,
    latency: Duration,
    faults: Mutex<HashMap<String, Fault>>,
    calls: Mutex<Vec<CallRecord>>,
    clock: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl SimulatedProvider {
    /// Creates an empty, purely in-memory cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a cloud mirrored to `path`, loading it if the file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub async fn persistent(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let objects = if path.exists() {
            let content = fs::read_to_string(&path)
                .await
                .map_err(|e| StateError::corrupted(format!("Failed to read simulated cloud: {e}")))?;
            serde_json::from_str(&content)
                .map_err(|e| StateError::corrupted(format!("Failed to parse simulated cloud: {e}")))?
        } else {
            IndexMap::new()
        };

        debug!("Opened simulated cloud at {} ({} objects)", path.display(), objects.len());

        Ok(Self {
            objects: Mutex::new(objects),
            path: Some(path),
            ..Self::default()
        })
    }

    /// Sets the artificial latency of every call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes the next `times` calls for `name` fail with a network error.
    pub async fn fail_transient(&self, name: &str, times: u32) {
        self.faults.lock().await.insert(
            name.to_string(),
            Fault::Transient {
                remaining: times,
                kind: TransientKind::Network,
                retry_after_ms: None,
            },
        );
    }

    /// Makes the next `times` calls for `name` fail as throttled.
    pub async fn throttle(&self, name: &str, times: u32, retry_after_ms: u64) {
        self.faults.lock().await.insert(
            name.to_string(),
            Fault::Transient {
                remaining: times,
                kind: TransientKind::Throttled,
                retry_after_ms: Some(retry_after_ms),
            },
        );
    }

    /// Makes every call for `name` fail permanently.
    pub async fn fail_permanent(&self, name: &str, message: &str) {
        self.faults.lock().await.insert(
            name.to_string(),
            Fault::Permanent {
                message: message.to_string(),
            },
        );
    }

    /// Overwrites one attribute of the object named `name`, simulating drift.
    pub async fn tamper(&self, name: &str, attribute: &str, value: Value) -> bool {
        let mut objects = self.objects.lock().await;
        let Some(object) = objects.values_mut().find(|o| o.name == name) else {
            return false;
        };
        object.attributes.insert(attribute.to_string(), value);
        true
    }

    /// Deletes the object named `name` behind the engine's back.
    pub async fn remove_out_of_band(&self, name: &str) -> bool {
        let mut objects = self.objects.lock().await;
        let before = objects.len();
        objects.retain(|_, o| o.name != name);
        before != objects.len()
    }

    /// Number of objects currently materialized.
    pub async fn object_count(&self) -> usize {
        self.objects.lock().await.len()
    }

    /// Returns the call log.
    pub async fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().await.clone()
    }

    /// Returns the highest number of calls that were in flight at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Mirrors the objects to disk if a path is configured.
    async fn persist(&self, objects: &IndexMap<String, CloudObject>) -> std::result::Result<(), ApiError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let content = serde_json::to_string_pretty(objects)
            .map_err(|e| ApiError::permanent(format!("Failed to serialize simulated cloud: {e}")))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ApiError::network(format!("Failed to create {}: {e}", parent.display())))?;
        }
        let temp = temp_path(path);
        fs::write(&temp, content)
            .await
            .map_err(|e| ApiError::network(format!("Failed to write simulated cloud: {e}")))?;
        fs::rename(&temp, path)
            .await
            .map_err(|e| ApiError::network(format!("Failed to write simulated cloud: {e}")))
    }

    /// Consumes one injected fault for `name`, if any.
    async fn take_fault(&self, name: &str) -> std::result::Result<(), ApiError> {
        let mut faults = self.faults.lock().await;
        let (err, exhausted) = match faults.get_mut(name) {
            None => return Ok(()),
            Some(Fault::Permanent { message }) => return Err(ApiError::permanent(message.clone())),
            Some(Fault::Transient {
                remaining,
                kind,
                retry_after_ms,
            }) => {
                *remaining = remaining.saturating_sub(1);
                let err = ApiError::Transient {
                    kind: *kind,
                    message: format!("simulated {kind} failure for '{name}'"),
                    retry_after_ms: *retry_after_ms,
                };
                (err, *remaining == 0)
            }
        };
        if exhausted {
            faults.remove(name);
        }
        Err(err)
    }

    /// Runs `op` with latency, fault injection and call logging around it.
    async fn call<T, F>(&self, kind: CallKind, name: &str, op: F) -> std::result::Result<T, ApiError>
    where
        F: Future<Output = std::result::Result<T, ApiError>>,
    {
        let started = self.clock.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let result = match self.take_fault(name).await {
            Ok(()) => op.await,
            Err(e) => Err(e),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let finished = self.clock.fetch_add(1, Ordering::SeqCst);
        trace!("simulated {kind:?} '{name}' -> {}", result.is_ok());
        self.calls.lock().await.push(CallRecord {
            kind,
            resource: name.to_string(),
            started,
            finished,
            ok: result.is_ok(),
        });

        result
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    path.with_file_name(name)
}

/// Provider-assigned identifier, e.g. `subnet-1a2b3c4d5e6f`.
fn generate_id(resource_type: &str) -> String {
    let prefix: String = resource_type
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &suffix[..12])
}

/// Fills every computed attribute a request declares.
fn computed_value(resource_type: &str, id: &str, attribute: &str) -> Value {
    match attribute {
        "id" => Value::string(id),
        "arn" => Value::string(format!("arn:sim:{resource_type}/{id}")),
        other => Value::string(format!("{id}-{other}")),
    }
}

#[async_trait]
impl ResourceProvider for SimulatedProvider {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn create(&self, request: &ResourceRequest) -> std::result::Result<ProviderResource, ApiError> {
        self.call(CallKind::Create, &request.name, async {
            let id = generate_id(&request.resource_type);
            let mut attributes = request.attributes.clone();
            attributes.insert(String::from("id"), Value::string(&id));
            for attribute in &request.computed {
                if !attributes.contains_key(attribute) {
                    attributes.insert(
                        attribute.clone(),
                        computed_value(&request.resource_type, &id, attribute),
                    );
                }
            }

            let mut objects = self.objects.lock().await;
            objects.insert(
                id.clone(),
                CloudObject {
                    name: request.name.clone(),
                    resource_type: request.resource_type.clone(),
                    attributes: attributes.clone(),
                },
            );
            self.persist(&objects).await?;

            debug!("simulated cloud created {} '{}' as {id}", request.resource_type, request.name);
            Ok(ProviderResource { id, attributes })
        })
        .await
    }

    async fn update(
        &self,
        provider_id: &str,
        request: &ResourceRequest,
    ) -> std::result::Result<ProviderResource, ApiError> {
        self.call(CallKind::Update, &request.name, async {
            let mut objects = self.objects.lock().await;
            let Some(object) = objects.get_mut(provider_id) else {
                return Err(ApiError::NotFound {
                    resource_type: request.resource_type.clone(),
                    id: provider_id.to_string(),
                });
            };

            let mut attributes = request.attributes.clone();
            attributes.insert(String::from("id"), Value::string(provider_id));
            for attribute in &request.computed {
                if attributes.contains_key(attribute) {
                    continue;
                }
                let value = object.attributes.get(attribute).cloned().unwrap_or_else(|| {
                    computed_value(&request.resource_type, provider_id, attribute)
                });
                attributes.insert(attribute.clone(), value);
            }
            object.attributes = attributes.clone();
            self.persist(&objects).await?;

            Ok(ProviderResource {
                id: provider_id.to_string(),
                attributes,
            })
        })
        .await
    }

    async fn delete(&self, handle: &ResourceHandle) -> std::result::Result<(), ApiError> {
        self.call(CallKind::Delete, &handle.name, async {
            let mut objects = self.objects.lock().await;
            if objects.shift_remove(&handle.provider_id).is_none() {
                return Err(ApiError::NotFound {
                    resource_type: handle.resource_type.clone(),
                    id: handle.provider_id.clone(),
                });
            }
            self.persist(&objects).await
        })
        .await
    }

    async fn read(&self, handle: &ResourceHandle) -> std::result::Result<Option<Attributes>, ApiError> {
        self.call(CallKind::Read, &handle.name, async {
            Ok(self
                .objects
                .lock()
                .await
                .get(&handle.provider_id)
                .map(|o| o.attributes.clone()))
        })
        .await
    }
}
