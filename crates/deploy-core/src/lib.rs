//! Core domain types and traits for the fleet configuration orchestrator.
//!
//! This crate contains:
//! - Resource identifiers and common types
//! - The fleet data model (Config, ConfigVersion, Instance, Deployment, DeploymentInstance)
//! - The Store trait used by the orchestrator to persist progress
//! - The AgentChannel trait used to push commands to and receive reports from agents

pub mod channel;
pub mod error;
pub mod id;
pub mod model;
pub mod store;

pub use error::{Error, Result};
pub use id::ResourceId;
