//! Orchestration of fleet configuration rollouts.
//!
//! `Orchestrator` is the process-wide singleton that validates requests,
//! resolves targets, and spawns one `Runner` per active deployment.
//! Each `Runner` drives its deployment's instances through the
//! per-instance state machine according to the chosen rollout strategy.

pub mod orchestrator;
pub mod recovery;
pub mod runner;
pub mod target;

pub use orchestrator::Orchestrator;
pub use runner::{InstanceResult, Runner};
