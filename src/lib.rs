// ============================================================================
// Linting - unsafe code is forbidden, everything else is reported
// ============================================================================

#![forbid(unsafe_code)]               // Unsafe code is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden
#![warn(missing_docs)]                // Public items should be documented
#![warn(dead_code)]                   // Unused code
#![warn(unused_imports)]              // Unused imports
#![warn(unused_variables)]            // Unused variables
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Topoform
//!
//! A declarative resource-graph engine: describe resources and the
//! references between them, and Topoform computes what has to change and
//! applies it in dependency order.
//!
//! ## Architecture
//!
//! 1. **Desired State**: resources declared in `topoform.yaml`
//! 2. **Graph**: references and `depends_on` form a DAG, split into waves
//! 3. **Plan**: desired attributes are diffed against the recorded state
//! 4. **Apply**: waves run in order, each with a bounded worker pool,
//!    retrying transient provider failures with exponential backoff
//! 5. **State**: every successful operation is recorded immediately
//!
//! ## Modules
//!
//! - [`value`]: Attribute values, references and resolution
//! - [`config`]: Configuration parsing and validation
//! - [`graph`]: Dependency graph construction
//! - [`planner`]: Diff computation, planning, retry and execution
//! - [`provider`]: Provider seam and the bundled simulated cloud
//! - [`state`]: State storage backends (local, memory)
//! - [`refresh`]: Drift detection against the provider
//! - [`report`]: Apply results
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: network
//!   environment: dev
//!
//! resources:
//!   - name: main
//!     type: vpc
//!     attributes:
//!       cidr: 10.0.0.0/16
//!   - name: public
//!     type: subnet
//!     attributes:
//!       vpc_id: ${main.id}
//!       cidr: 10.0.1.0/24
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod refresh;
pub mod report;
pub mod state;
pub mod value;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, TopologyConfig};
pub use error::{Result, TopoformError};
pub use graph::{GraphBuilder, ResourceGraph};
pub use planner::{DiffEngine, Plan, PlanExecutor, Planner, RetryPolicy};
pub use provider::{ResourceProvider, SimulatedProvider};
pub use refresh::{DriftReport, Refresher};
pub use report::{ApplyReport, OperationStatus};
pub use state::{LocalStateStore, MemoryStateStore, StateSnapshot, StateStore};
pub use value::{Attributes, Value};
