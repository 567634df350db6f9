//! The persistence boundary the orchestrator core depends on.
//!
//! The concrete implementation (a Postgres-backed adapter) lives in the
//! `deploy-db` crate; this trait only names the operations the core
//! issues. The Store is assumed to serialize its own writes internally.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::model::{Config, ConfigVersion, Deployment, DeploymentInstance, Instance};
use crate::{ResourceId, Result};

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_config(&self, id: ResourceId) -> Result<Config>;
    async fn get_config_version(&self, config_id: ResourceId, version: i32)
    -> Result<ConfigVersion>;

    async fn get_instance(&self, id: ResourceId) -> Result<Instance>;
    /// List instances, optionally filtering by exact ID membership.
    async fn list_instances(&self, ids: Option<&[ResourceId]>) -> Result<Vec<Instance>>;
    async fn set_instance_config(
        &self,
        instance_id: ResourceId,
        config_id: ResourceId,
        version: i32,
    ) -> Result<()>;

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()>;
    async fn get_deployment(&self, id: ResourceId) -> Result<Deployment>;
    async fn update_deployment(&self, deployment: &Deployment) -> Result<()>;
    /// List deployments whose status is one of `statuses`, in creation order.
    async fn list_deployments_by_status(
        &self,
        statuses: &[crate::model::DeploymentStatus],
    ) -> Result<Vec<Deployment>>;

    async fn create_deployment_instance(&self, row: &DeploymentInstance) -> Result<()>;
    async fn update_deployment_instance(&self, row: &DeploymentInstance) -> Result<()>;
    async fn list_deployment_instances(
        &self,
        deployment_id: ResourceId,
    ) -> Result<HashMap<ResourceId, DeploymentInstance>>;
}
