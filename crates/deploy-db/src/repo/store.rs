//! Postgres-backed implementation of `deploy_core::store::Store`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deploy_core::model::{
    Config, ConfigVersion, Deployment, DeploymentInstance, DeploymentStatus, Instance,
    InstanceDeployStatus, InstanceStatus, Progress, Strategy,
};
use deploy_core::store::Store;
use deploy_core::{ResourceId, Result};
use sqlx::PgPool;
use std::collections::HashMap;
use std::str::FromStr;

use crate::DbError;

/// PostgreSQL implementation of the orchestrator's `Store` trait.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ConfigRow {
    id: uuid::Uuid,
    name: String,
    current_version: i32,
}

impl From<ConfigRow> for Config {
    fn from(r: ConfigRow) -> Self {
        Config {
            id: ResourceId::from_uuid(r.id),
            name: r.name,
            current_version: r.current_version,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ConfigVersionRow {
    id: uuid::Uuid,
    config_id: uuid::Uuid,
    version: i32,
    content: serde_json::Value,
    content_hash: String,
    created_at: DateTime<Utc>,
}

impl From<ConfigVersionRow> for ConfigVersion {
    fn from(r: ConfigVersionRow) -> Self {
        ConfigVersion {
            id: ResourceId::from_uuid(r.id),
            config_id: ResourceId::from_uuid(r.config_id),
            version: r.version,
            content: r.content,
            content_hash: r.content_hash,
            created_at: r.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: uuid::Uuid,
    name: String,
    labels: serde_json::Value,
    current_config_id: Option<uuid::Uuid>,
    current_config_version: Option<i32>,
    status: String,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = DbError;

    fn try_from(r: InstanceRow) -> std::result::Result<Self, Self::Error> {
        let labels: HashMap<String, String> = serde_json::from_value(r.labels)
            .map_err(|e| DbError::Database(sqlx::Error::Decode(Box::new(e))))?;
        let status = InstanceStatus::from_str(&r.status)
            .map_err(|e| DbError::Database(sqlx::Error::Decode(e.into())))?;
        Ok(Instance {
            id: ResourceId::from_uuid(r.id),
            name: r.name,
            labels,
            current_config_id: r.current_config_id.map(ResourceId::from_uuid),
            current_config_version: r.current_config_version,
            status,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DeploymentRow {
    id: uuid::Uuid,
    config_id: uuid::Uuid,
    config_version: i32,
    target_instances: serde_json::Value,
    strategy: String,
    batch_size: i32,
    status: String,
    progress: serde_json::Value,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_by: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DeploymentRow> for Deployment {
    type Error = DbError;

    fn try_from(r: DeploymentRow) -> std::result::Result<Self, Self::Error> {
        let target_ids: Vec<uuid::Uuid> = serde_json::from_value(r.target_instances)
            .map_err(|e| DbError::Database(sqlx::Error::Decode(Box::new(e))))?;
        let progress: Progress = serde_json::from_value(r.progress)
            .map_err(|e| DbError::Database(sqlx::Error::Decode(Box::new(e))))?;
        Ok(Deployment {
            id: ResourceId::from_uuid(r.id),
            config_id: ResourceId::from_uuid(r.config_id),
            config_version: r.config_version,
            target_instances: target_ids.into_iter().map(ResourceId::from_uuid).collect(),
            strategy: Strategy::parse_or_default_rolling(&r.strategy),
            batch_size: r.batch_size.max(1) as usize,
            status: DeploymentStatus::from_str(&r.status)
                .map_err(|e| DbError::Database(sqlx::Error::Decode(e.into())))?,
            progress,
            started_at: r.started_at,
            completed_at: r.completed_at,
            created_by: r.created_by,
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DeploymentInstanceRow {
    deployment_id: uuid::Uuid,
    instance_id: uuid::Uuid,
    status: String,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    last_status_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl TryFrom<DeploymentInstanceRow> for DeploymentInstance {
    type Error = DbError;

    fn try_from(r: DeploymentInstanceRow) -> std::result::Result<Self, Self::Error> {
        Ok(DeploymentInstance {
            deployment_id: ResourceId::from_uuid(r.deployment_id),
            instance_id: ResourceId::from_uuid(r.instance_id),
            status: InstanceDeployStatus::from_str(&r.status)
                .map_err(|e| DbError::Database(sqlx::Error::Decode(e.into())))?,
            started_at: r.started_at,
            completed_at: r.completed_at,
            last_status_at: r.last_status_at,
            error_message: r.error_message,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_config(&self, id: ResourceId) -> Result<Config> {
        let row = sqlx::query_as::<_, ConfigRow>("SELECT id, name, current_version FROM configs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Database)?
            .ok_or_else(|| DbError::NotFound(format!("config {id}")))?;
        Ok(row.into())
    }

    async fn get_config_version(
        &self,
        config_id: ResourceId,
        version: i32,
    ) -> Result<ConfigVersion> {
        let row = sqlx::query_as::<_, ConfigVersionRow>(
            "SELECT id, config_id, version, content, content_hash, created_at \
             FROM config_versions WHERE config_id = $1 AND version = $2",
        )
        .bind(config_id.as_uuid())
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Database)?
        .ok_or_else(|| DbError::NotFound(format!("config_version {config_id}@{version}")))?;
        Ok(row.into())
    }

    async fn get_instance(&self, id: ResourceId) -> Result<Instance> {
        let row = sqlx::query_as::<_, InstanceRow>(
            "SELECT id, name, labels, current_config_id, current_config_version, status \
             FROM instances WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Database)?
        .ok_or_else(|| DbError::NotFound(format!("instance {id}")))?;
        Ok(Instance::try_from(row)?)
    }

    async fn list_instances(&self, ids: Option<&[ResourceId]>) -> Result<Vec<Instance>> {
        let rows = match ids {
            Some(ids) => {
                let uuids: Vec<uuid::Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
                sqlx::query_as::<_, InstanceRow>(
                    "SELECT id, name, labels, current_config_id, current_config_version, status \
                     FROM instances WHERE id = ANY($1)",
                )
                .bind(&uuids)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, InstanceRow>(
                    "SELECT id, name, labels, current_config_id, current_config_version, status \
                     FROM instances",
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(DbError::Database)?;

        rows.into_iter()
            .map(|r| Instance::try_from(r).map_err(Into::into))
            .collect()
    }

    async fn set_instance_config(
        &self,
        instance_id: ResourceId,
        config_id: ResourceId,
        version: i32,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE instances SET current_config_id = $1, current_config_version = $2 WHERE id = $3",
        )
        .bind(config_id.as_uuid())
        .bind(version)
        .bind(instance_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(DbError::Database)?;
        Ok(())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        let target_ids: Vec<uuid::Uuid> = deployment
            .target_instances
            .iter()
            .map(|id| *id.as_uuid())
            .collect();
        sqlx::query(
            r#"
            INSERT INTO deployments
                (id, config_id, config_version, target_instances, strategy, batch_size,
                 status, progress, started_at, completed_at, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(deployment.id.as_uuid())
        .bind(deployment.config_id.as_uuid())
        .bind(deployment.config_version)
        .bind(serde_json::to_value(&target_ids).map_err(|e| DbError::Database(sqlx::Error::Encode(Box::new(e))))?)
        .bind(deployment.strategy.to_string())
        .bind(deployment.batch_size as i32)
        .bind(deployment.status.to_string())
        .bind(serde_json::to_value(&deployment.progress).map_err(|e| DbError::Database(sqlx::Error::Encode(Box::new(e))))?)
        .bind(deployment.started_at)
        .bind(deployment.completed_at)
        .bind(&deployment.created_by)
        .bind(deployment.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::Database)?;
        Ok(())
    }

    async fn get_deployment(&self, id: ResourceId) -> Result<Deployment> {
        let row = sqlx::query_as::<_, DeploymentRow>(
            "SELECT id, config_id, config_version, target_instances, strategy, batch_size, \
                    status, progress, started_at, completed_at, created_by, created_at \
             FROM deployments WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Database)?
        .ok_or_else(|| DbError::NotFound(format!("deployment {id}")))?;
        Ok(Deployment::try_from(row)?)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deployments
            SET status = $1, progress = $2, started_at = $3, completed_at = $4
            WHERE id = $5
            "#,
        )
        .bind(deployment.status.to_string())
        .bind(serde_json::to_value(&deployment.progress).map_err(|e| DbError::Database(sqlx::Error::Encode(Box::new(e))))?)
        .bind(deployment.started_at)
        .bind(deployment.completed_at)
        .bind(deployment.id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(DbError::Database)?;
        Ok(())
    }

    async fn list_deployments_by_status(
        &self,
        statuses: &[DeploymentStatus],
    ) -> Result<Vec<Deployment>> {
        let status_strs: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
        let rows = sqlx::query_as::<_, DeploymentRow>(
            "SELECT id, config_id, config_version, target_instances, strategy, batch_size, \
                    status, progress, started_at, completed_at, created_by, created_at \
             FROM deployments WHERE status = ANY($1) ORDER BY created_at ASC",
        )
        .bind(&status_strs)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Database)?;

        rows.into_iter()
            .map(|r| Deployment::try_from(r).map_err(Into::into))
            .collect()
    }

    async fn create_deployment_instance(&self, row: &DeploymentInstance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO deployment_instances
                (deployment_id, instance_id, status, started_at, completed_at, last_status_at, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(row.deployment_id.as_uuid())
        .bind(row.instance_id.as_uuid())
        .bind(row.status.to_string())
        .bind(row.started_at)
        .bind(row.completed_at)
        .bind(row.last_status_at)
        .bind(&row.error_message)
        .execute(&self.pool)
        .await
        .map_err(DbError::Database)?;
        Ok(())
    }

    async fn update_deployment_instance(&self, row: &DeploymentInstance) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deployment_instances
            SET status = $1, started_at = $2, completed_at = $3, last_status_at = $4, error_message = $5
            WHERE deployment_id = $6 AND instance_id = $7
            "#,
        )
        .bind(row.status.to_string())
        .bind(row.started_at)
        .bind(row.completed_at)
        .bind(row.last_status_at)
        .bind(&row.error_message)
        .bind(row.deployment_id.as_uuid())
        .bind(row.instance_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(DbError::Database)?;
        Ok(())
    }

    async fn list_deployment_instances(
        &self,
        deployment_id: ResourceId,
    ) -> Result<HashMap<ResourceId, DeploymentInstance>> {
        let rows = sqlx::query_as::<_, DeploymentInstanceRow>(
            "SELECT deployment_id, instance_id, status, started_at, completed_at, last_status_at, error_message \
             FROM deployment_instances WHERE deployment_id = $1",
        )
        .bind(deployment_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Database)?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let di = DeploymentInstance::try_from(row)?;
            out.insert(di.instance_id, di);
        }
        Ok(out)
    }
}
