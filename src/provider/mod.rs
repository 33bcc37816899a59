//! Provider module: the external API seam.
//!
//! The executor only talks to [`ResourceProvider`]. The bundled
//! [`SimulatedProvider`] stands in for a real cloud.

mod simulated;
mod traits;

pub use simulated::{CallKind, CallRecord, SimulatedProvider};
#[cfg(test)]
pub use traits::MockResourceProvider;
pub use traits::{ProviderResource, ResourceHandle, ResourceProvider, ResourceRequest};
