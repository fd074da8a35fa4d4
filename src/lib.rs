// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

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
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Thot Stack
//!
//! Declarative, dependency-ordered and idempotent provisioning for a static
//! website stack served through a CDN.
//!
//! ## Overview
//!
//! A stack file declares resources (a storage bucket, a TLS certificate, an
//! origin access identity, a bucket policy, a CDN distribution, a content
//! deployment, a function and its public URL) and the outputs they expose.
//! Thot turns the declarations into a dependency graph and provisions it:
//!
//! - Resources reference each other's outputs with `${resource-id.output}`
//! - Independent resources are provisioned concurrently, in batches
//! - A resource never starts before everything it references is provisioned
//! - Re-applying an unchanged stack performs no backend calls
//! - A failure stops later batches; a re-run picks up where it stopped
//!
//! ## Architecture
//!
//! 1. **Declarations**: parsed from `thot.stack.yaml`
//! 2. **Graph**: references become edges, cycles are rejected up front
//! 3. **Scheduler**: topological batches, deepest dependency chain first
//! 4. **Executor**: batch-by-batch backend calls against a saved snapshot
//!
//! ## Modules
//!
//! - [`resource`]: Resource kinds, declarations and input values
//! - [`graph`]: Dependency graph, scheduling and runtime node state
//! - [`backend`]: Provisioning backends (simulated, HTTP)
//! - [`planner`]: Convergence decisions, plans and execution
//! - [`outputs`]: Stack output resolution
//! - [`state`]: Snapshot storage backends (local, S3)
//! - [`config`]: Stack file parsing and validation
//! - [`deployer`]: Plan, apply, prune, destroy and drift detection
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! stack:
//!   name: thot-site
//!   environment: prod
//!
//! resources:
//!   - id: site-bucket
//!     kind: bucket
//!     inputs:
//!       bucketName: thot-site.com
//!       websiteIndexDocument: index.html
//!   - id: site-oai
//!     kind: origin-access-identity
//!   - id: site-policy
//!     kind: bucket-policy
//!     inputs:
//!       bucket: ${site-bucket.bucketName}
//!       actions: ["s3:GetObject"]
//!       resources: ["${site-bucket.arn}/*"]
//!       principal: ${site-oai.canonicalUserId}
//!
//! outputs:
//!   - name: BucketArn
//!     value: ${site-bucket.arn}
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod backend;
pub mod cli;
pub mod config;
pub mod deployer;
pub mod error;
pub mod graph;
pub mod outputs;
pub mod planner;
pub mod resource;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

// ============================================================================
// Re-exports
// ============================================================================

pub use backend::{BackendConfig, HttpBackend, ProvisioningBackend, SimulatedBackend};
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackConfig};
pub use deployer::{ApplyOutcome, Deployer, DriftReport};
pub use error::{Result, ThotError};
pub use graph::{ExecutionPlan, Scheduler, Stack};
pub use outputs::OutputResolver;
pub use planner::{CancelFlag, DeploymentPlan, PlanExecutor, RunReport};
pub use resource::{ResourceDeclaration, ResourceKind, StackOutput, Value};
pub use state::{LocalStateStore, S3StateStore, StackSnapshot, StateStore};
