//! Convergence harness scenarios.
//!
//! A scenario creates one or more driver deployments, waits for the operator to
//! converge them, disturbs them (spec edits, operator restarts, deleted or rewritten
//! children, a device mode switch) and waits for convergence again. `catalog` lists
//! every case; `Orchestrator::run` executes one under its deadline and always runs the
//! cleanups the body registered.

#![forbid(unsafe_code)]

pub mod catalog;
pub mod config;
pub mod conversion;
pub mod fixtures;
pub mod lifecycle;
pub mod orchestrator;
pub mod process;
pub mod tls;
pub mod tracker;

pub use catalog::{catalog, select, ScenarioDescriptor, ScenarioKind};
pub use config::HarnessConfig;
pub use lifecycle::{CaseReport, TestCase};
pub use orchestrator::Orchestrator;
pub use process::{ControllerProcess, ScaledDeploymentProcess};
