//! The fleet data model: Config, ConfigVersion, Instance, Deployment, DeploymentInstance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ResourceId;

/// A logical configuration identity. Versions of a Config are dense
/// starting at 1; `current_version` tracks the highest version created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub id: ResourceId,
    pub name: String,
    pub current_version: i32,
}

/// An immutable snapshot of a Config at a specific version. Never
/// mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigVersion {
    pub id: ResourceId,
    pub config_id: ResourceId,
    pub version: i32,
    pub content: serde_json::Value,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Connectivity status of a managed agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Online,
    Offline,
    Unknown,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        InstanceStatus::Unknown
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Online => write!(f, "online"),
            InstanceStatus::Offline => write!(f, "offline"),
            InstanceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(InstanceStatus::Online),
            "offline" => Ok(InstanceStatus::Offline),
            "unknown" => Ok(InstanceStatus::Unknown),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

/// A managed agent. Instances exist independent of any deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: ResourceId,
    pub name: String,
    pub labels: HashMap<String, String>,
    /// Currently applied config, if any.
    pub current_config_id: Option<ResourceId>,
    pub current_config_version: Option<i32>,
    pub status: InstanceStatus,
}

/// Which rollout algorithm a Deployment uses.
///
/// Unknown values (e.g. deserialized from a future wire variant)
/// should degrade to `Rolling` per the Runner's dispatch rule, not
/// fail — see `Strategy::or_default_rolling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
    AllAtOnce,
    Rolling,
    Canary,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Rolling
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::AllAtOnce => write!(f, "allAtOnce"),
            Strategy::Rolling => write!(f, "rolling"),
            Strategy::Canary => write!(f, "canary"),
        }
    }
}

impl Strategy {
    /// Unknown strategies degrade to `Rolling` rather than failing the
    /// deployment, per the Runner's dispatch rule.
    pub fn parse_or_default_rolling(s: &str) -> Self {
        match s {
            "allAtOnce" => Strategy::AllAtOnce,
            "canary" => Strategy::Canary,
            _ => Strategy::Rolling,
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse_or_default_rolling(s))
    }
}

/// Status of a Deployment as a whole. Transitions are monotonic along
/// one of: pending -> inProgress -> {completed|failed}, pending ->
/// cancelled, inProgress -> cancelled. Terminal states never transition
/// further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeploymentStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Completed | DeploymentStatus::Failed | DeploymentStatus::Cancelled
        )
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentStatus::Pending => write!(f, "pending"),
            DeploymentStatus::InProgress => write!(f, "in_progress"),
            DeploymentStatus::Completed => write!(f, "completed"),
            DeploymentStatus::Failed => write!(f, "failed"),
            DeploymentStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeploymentStatus::Pending),
            "in_progress" => Ok(DeploymentStatus::InProgress),
            "completed" => Ok(DeploymentStatus::Completed),
            "failed" => Ok(DeploymentStatus::Failed),
            "cancelled" => Ok(DeploymentStatus::Cancelled),
            other => Err(format!("unknown deployment status: {other}")),
        }
    }
}

/// Rollout progress counters, persisted as part of the Deployment row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    pub total_instances: usize,
    pub completed_instances: usize,
    pub failed_instances: usize,
    pub current_batch: usize,
    pub total_batches: usize,
    pub failure_reason: Option<String>,
}

/// A single rollout of a ConfigVersion to a target set of Instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: ResourceId,
    pub config_id: ResourceId,
    pub config_version: i32,
    pub target_instances: Vec<ResourceId>,
    pub strategy: Strategy,
    pub batch_size: usize,
    pub status: DeploymentStatus,
    pub progress: Progress,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-instance terminal and in-flight states for a DeploymentInstance
/// row. `LeaseExpired` and `NotConnected` are in-band transitions
/// folded into `Failed` for persistence (see `deploy_core::channel`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceDeployStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl InstanceDeployStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceDeployStatus::Completed
                | InstanceDeployStatus::Failed
                | InstanceDeployStatus::RolledBack
        )
    }
}

impl std::fmt::Display for InstanceDeployStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceDeployStatus::Pending => write!(f, "pending"),
            InstanceDeployStatus::InProgress => write!(f, "in_progress"),
            InstanceDeployStatus::Completed => write!(f, "completed"),
            InstanceDeployStatus::Failed => write!(f, "failed"),
            InstanceDeployStatus::RolledBack => write!(f, "rolled_back"),
        }
    }
}

impl std::str::FromStr for InstanceDeployStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InstanceDeployStatus::Pending),
            "in_progress" => Ok(InstanceDeployStatus::InProgress),
            "completed" => Ok(InstanceDeployStatus::Completed),
            "failed" => Ok(InstanceDeployStatus::Failed),
            "rolled_back" => Ok(InstanceDeployStatus::RolledBack),
            other => Err(format!("unknown instance deploy status: {other}")),
        }
    }
}

/// Per-instance rollout record, uniquely keyed by (deployment_id, instance_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentInstance {
    pub deployment_id: ResourceId,
    pub instance_id: ResourceId,
    pub status: InstanceDeployStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Refreshed on every StatusReport; used for lease-timeout detection.
    pub last_status_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl DeploymentInstance {
    pub fn new_pending(deployment_id: ResourceId, instance_id: ResourceId) -> Self {
        Self {
            deployment_id,
            instance_id,
            status: InstanceDeployStatus::Pending,
            started_at: None,
            completed_at: None,
            last_status_at: None,
            error_message: None,
        }
    }
}

/// Request body for `Orchestrator::create_deployment`.
#[derive(Debug, Clone, Default)]
pub struct CreateDeploymentRequest {
    pub config_id: ResourceId,
    pub config_version: Option<i32>,
    pub target_instances: Vec<ResourceId>,
    pub target_labels: Option<HashMap<String, String>>,
    pub strategy: Option<Strategy>,
    pub batch_size: Option<usize>,
    pub created_by: Option<String>,
}

/// Authoritative read returned by `Orchestrator::get_deployment_status`:
/// the Deployment row plus a per-instance result view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentStatusView {
    pub deployment: Deployment,
    pub instances: HashMap<ResourceId, DeploymentInstance>,
}
