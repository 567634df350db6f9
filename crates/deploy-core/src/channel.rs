//! The Agent Channel: the push transport the orchestrator uses to
//! deliver `DeploymentCommand`s and receive `StatusReport`s.
//!
//! The core only depends on this trait. A production implementation
//! (WebSocket-backed) lives in `deploy-api`; tests use an in-memory
//! double.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{InstanceDeployStatus, Strategy};
use crate::{ResourceId, Result};

/// Command pushed to an agent to begin (or roll back) a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentCommand {
    pub deployment_id: String,
    pub config_id: String,
    /// Decimal integer, per the wire contract.
    pub config_version: String,
    pub strategy: Strategy,
    pub batch_number: u32,
    pub total_batches: u32,
    pub deadline: DateTime<Utc>,
    pub is_rollback: bool,
}

/// Report pushed back by an agent describing its progress on a single
/// deployment command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub instance_id: ResourceId,
    pub deployment_id: ResourceId,
    pub state: InstanceDeployStatus,
    pub message: String,
    pub error_details: String,
}

/// Capability set the orchestrator needs from the controller-to-agent
/// push transport: check liveness, deliver a command. Inbound reports
/// flow the other direction, into `Orchestrator::report_instance_status`,
/// and are not part of this trait.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    async fn is_subscribed(&self, instance_id: ResourceId) -> bool;
    async fn notify_deployment(
        &self,
        instance_id: ResourceId,
        command: DeploymentCommand,
    ) -> Result<()>;
}
