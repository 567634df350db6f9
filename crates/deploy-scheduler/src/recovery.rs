//! Startup crash recovery (spec §4.5).
//!
//! On controller restart, any Deployment left `pending` or `inProgress`
//! was orphaned by the crash — no Runner survives a process restart.
//! These are failed outright rather than resumed; the operator re-issues
//! a fresh CreateDeployment if the rollout should continue.

use deploy_core::model::{DeploymentStatus, InstanceDeployStatus};
use deploy_core::store::Store;
use deploy_core::Result;
use chrono::Utc;
use tracing::info;

const RESTART_REASON: &str = "hub_restart: deployment interrupted by hub restart";

pub async fn recover(store: &dyn Store) -> Result<()> {
    let orphaned = store
        .list_deployments_by_status(&[DeploymentStatus::Pending, DeploymentStatus::InProgress])
        .await?;

    if orphaned.is_empty() {
        info!("no orphaned deployments found at startup");
        return Ok(());
    }

    for mut deployment in orphaned {
        info!(deployment_id = %deployment.id, "failing deployment orphaned by restart");
        deployment.status = DeploymentStatus::Failed;
        deployment.completed_at = Some(Utc::now());
        deployment.progress.failure_reason = Some(RESTART_REASON.to_string());
        store.update_deployment(&deployment).await?;

        let instances = store.list_deployment_instances(deployment.id).await?;
        for (_, mut row) in instances {
            if matches!(
                row.status,
                InstanceDeployStatus::Pending | InstanceDeployStatus::InProgress
            ) {
                row.status = InstanceDeployStatus::Failed;
                row.completed_at = Some(Utc::now());
                row.error_message = Some(RESTART_REASON.to_string());
                store.update_deployment_instance(&row).await?;
            }
        }
    }

    Ok(())
}
