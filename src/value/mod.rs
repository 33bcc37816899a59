//! Value model for resource attributes.
//!
//! This module provides the typed dynamic values used for resource
//! attributes, the reference syntax linking resources together, and the
//! resolution pass that turns references into concrete values.

mod reference;
mod resolve;
mod types;

pub use reference::Reference;
pub use resolve::{resolve_attributes, Lookup, ResolveContext};
pub use types::{Attributes, Value, UNKNOWN_MARKER};
