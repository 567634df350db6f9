//! The Orchestrator: process-wide entry point for deployment lifecycle
//! operations (spec §4.1, §4.3).

use crate::recovery;
use crate::runner::Runner;
use crate::target::resolve_targets;
use chrono::Utc;
use deploy_config::OrchestratorConfig;
use deploy_core::channel::AgentChannel;
use deploy_core::model::{
    CreateDeploymentRequest, Deployment, DeploymentStatus, DeploymentStatusView,
    InstanceDeployStatus,
};
use deploy_core::store::Store;
use deploy_core::{Error, ResourceId, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct Orchestrator {
    store: Arc<dyn Store>,
    channel: Arc<dyn AgentChannel>,
    config: OrchestratorConfig,
    runners: Arc<Mutex<HashMap<ResourceId, Arc<Runner>>>>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn Store>, channel: Arc<dyn AgentChannel>, config: OrchestratorConfig) -> Self {
        Self {
            store,
            channel,
            config,
            runners: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fail any Deployment orphaned by a prior crash (spec §4.5). Call
    /// once at process startup, before serving requests.
    pub async fn start(&self) -> Result<()> {
        recovery::recover(&*self.store).await
    }

    /// Cancel every active Runner and wait up to the configured grace
    /// period for them to unwind before returning.
    pub async fn stop(&self) -> Result<()> {
        let runners: Vec<Arc<Runner>> = self.runners.lock().await.values().cloned().collect();
        for runner in &runners {
            runner.cancel();
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        while tokio::time::Instant::now() < deadline {
            if self.runners.lock().await.is_empty() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if !self.runners.lock().await.is_empty() {
            warn!("shutdown grace period elapsed with runners still active");
        }
        Ok(())
    }

    /// Validate the request, resolve its targets, persist the pending
    /// Deployment, and spawn its Runner (spec §4.1).
    pub async fn create_deployment(&self, req: CreateDeploymentRequest) -> Result<Deployment> {
        let config = self
            .store
            .get_config(req.config_id)
            .await
            .map_err(|_| Error::NotFound(format!("config not found: {}", req.config_id)))?;

        let version = req.config_version.unwrap_or(config.current_version);
        let config_version = self
            .store
            .get_config_version(config.id, version)
            .await
            .map_err(|_| Error::NotFound(format!("config version not found: {}/{version}", config.id)))?;

        let targets = resolve_targets(&*self.store, &req.target_instances, req.target_labels.as_ref()).await?;
        if targets.is_empty() {
            return Err(Error::InvalidRequest("no target instances resolved".to_string()));
        }

        let deployment = Deployment {
            id: ResourceId::new(),
            config_id: config.id,
            config_version: version,
            target_instances: targets.clone(),
            strategy: req.strategy.unwrap_or_default(),
            batch_size: req.batch_size.unwrap_or(1).max(1),
            status: DeploymentStatus::Pending,
            progress: deploy_core::model::Progress {
                total_instances: targets.len(),
                ..Default::default()
            },
            started_at: None,
            completed_at: None,
            created_by: req.created_by,
            created_at: Utc::now(),
        };
        self.store.create_deployment(&deployment).await?;

        let runner = Runner::new(
            deployment.clone(),
            config_version,
            self.store.clone(),
            self.channel.clone(),
            self.config.runner,
            self.config.default_timeout,
        )
        .await?;

        self.runners.lock().await.insert(deployment.id, runner.clone());
        let runners = self.runners.clone();
        let deployment_id = deployment.id;
        tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                info!(deployment_id = %deployment_id, error = %e, "deployment run finished with error");
            }
            runners.lock().await.remove(&deployment_id);
        });

        info!(deployment_id = %deployment.id, targets = targets.len(), "deployment created");
        Ok(deployment)
    }

    /// Request cancellation of an active Deployment (spec §4.3). A
    /// no-op, not an error, if the Deployment is already terminal or
    /// unknown to this process (e.g. post-restart with no active
    /// Runner): the row is still marked cancelled if it exists and is
    /// non-terminal.
    pub async fn cancel_deployment(&self, id: ResourceId) -> Result<()> {
        if let Some(runner) = self.runners.lock().await.get(&id) {
            runner.cancel();
        }

        let mut deployment = self.store.get_deployment(id).await?;
        if !deployment.status.is_terminal() {
            deployment.status = DeploymentStatus::Cancelled;
            deployment.completed_at = Some(Utc::now());
            self.store.update_deployment(&deployment).await?;
        }
        Ok(())
    }

    /// Authoritative status read (spec §4.3): prefers the active
    /// Runner's in-memory view, falling back to the Store for
    /// Deployments with no live Runner.
    pub async fn get_deployment_status(&self, id: ResourceId) -> Result<DeploymentStatusView> {
        if let Some(runner) = self.runners.lock().await.get(&id).cloned() {
            return Ok(DeploymentStatusView {
                deployment: runner.deployment_snapshot().await,
                instances: runner.results_snapshot().await,
            });
        }

        let deployment = self.store.get_deployment(id).await?;
        let instances = self.store.list_deployment_instances(id).await?;
        Ok(DeploymentStatusView { deployment, instances })
    }

    /// Route an inbound StatusReport to the owning Runner. Reports for
    /// a Deployment with no active Runner (already terminal, or this
    /// process never saw it) are logged and dropped (spec §9, open
    /// question on reports arriving after a deployment's terminal
    /// transition).
    pub async fn report_instance_status(
        &self,
        deployment_id: ResourceId,
        instance_id: ResourceId,
        state: InstanceDeployStatus,
        error_details: &str,
    ) {
        let runner = self.runners.lock().await.get(&deployment_id).cloned();
        match runner {
            Some(runner) => runner.report_instance_status(instance_id, state, error_details).await,
            None => {
                warn!(
                    deployment_id = %deployment_id,
                    instance_id = %instance_id,
                    "status report for inactive deployment dropped"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use deploy_core::channel::DeploymentCommand;
    use deploy_core::model::{Config, ConfigVersion, DeploymentInstance, Instance, InstanceStatus};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemStore {
        configs: StdMutex<HashMap<ResourceId, Config>>,
        versions: StdMutex<HashMap<(ResourceId, i32), ConfigVersion>>,
        instances: StdMutex<HashMap<ResourceId, Instance>>,
        deployments: StdMutex<HashMap<ResourceId, Deployment>>,
        deployment_instances: StdMutex<HashMap<ResourceId, DeploymentInstance>>,
    }

    #[async_trait]
    impl Store for MemStore {
        async fn get_config(&self, id: ResourceId) -> Result<Config> {
            self.configs.lock().unwrap().get(&id).cloned().ok_or_else(|| Error::NotFound(id.to_string()))
        }
        async fn get_config_version(&self, config_id: ResourceId, version: i32) -> Result<ConfigVersion> {
            self.versions
                .lock()
                .unwrap()
                .get(&(config_id, version))
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("{config_id}/{version}")))
        }
        async fn get_instance(&self, id: ResourceId) -> Result<Instance> {
            self.instances.lock().unwrap().get(&id).cloned().ok_or_else(|| Error::NotFound(id.to_string()))
        }
        async fn list_instances(&self, _ids: Option<&[ResourceId]>) -> Result<Vec<Instance>> {
            Ok(self.instances.lock().unwrap().values().cloned().collect())
        }
        async fn set_instance_config(&self, _instance_id: ResourceId, _config_id: ResourceId, _version: i32) -> Result<()> {
            Ok(())
        }
        async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
            self.deployments.lock().unwrap().insert(deployment.id, deployment.clone());
            Ok(())
        }
        async fn get_deployment(&self, id: ResourceId) -> Result<Deployment> {
            self.deployments.lock().unwrap().get(&id).cloned().ok_or_else(|| Error::NotFound(id.to_string()))
        }
        async fn update_deployment(&self, deployment: &Deployment) -> Result<()> {
            self.deployments.lock().unwrap().insert(deployment.id, deployment.clone());
            Ok(())
        }
        async fn list_deployments_by_status(&self, statuses: &[DeploymentStatus]) -> Result<Vec<Deployment>> {
            Ok(self.deployments.lock().unwrap().values().filter(|d| statuses.contains(&d.status)).cloned().collect())
        }
        async fn create_deployment_instance(&self, row: &DeploymentInstance) -> Result<()> {
            self.deployment_instances.lock().unwrap().insert(row.instance_id, row.clone());
            Ok(())
        }
        async fn update_deployment_instance(&self, row: &DeploymentInstance) -> Result<()> {
            self.deployment_instances.lock().unwrap().insert(row.instance_id, row.clone());
            Ok(())
        }
        async fn list_deployment_instances(&self, deployment_id: ResourceId) -> Result<HashMap<ResourceId, DeploymentInstance>> {
            Ok(self
                .deployment_instances
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, row)| row.deployment_id == deployment_id)
                .map(|(id, row)| (*id, row.clone()))
                .collect())
        }
    }

    struct NeverSubscribedChannel;

    #[async_trait]
    impl AgentChannel for NeverSubscribedChannel {
        async fn is_subscribed(&self, _instance_id: ResourceId) -> bool {
            false
        }
        async fn notify_deployment(&self, _instance_id: ResourceId, _command: DeploymentCommand) -> Result<()> {
            Ok(())
        }
    }

    fn seed_config_with_instance(store: &MemStore) -> (ResourceId, ResourceId) {
        let config_id = ResourceId::new();
        store.configs.lock().unwrap().insert(
            config_id,
            Config { id: config_id, name: "app".to_string(), current_version: 1 },
        );
        store.versions.lock().unwrap().insert(
            (config_id, 1),
            ConfigVersion {
                id: ResourceId::new(),
                config_id,
                version: 1,
                content: serde_json::json!({}),
                content_hash: "abc".to_string(),
                created_at: Utc::now(),
            },
        );
        let instance_id = ResourceId::new();
        store.instances.lock().unwrap().insert(
            instance_id,
            Instance {
                id: instance_id,
                name: "i1".to_string(),
                labels: HashMap::new(),
                current_config_id: None,
                current_config_version: None,
                status: InstanceStatus::Online,
            },
        );
        (config_id, instance_id)
    }

    #[tokio::test]
    async fn create_deployment_rejects_unknown_config() {
        let store = Arc::new(MemStore::default());
        let orchestrator = Orchestrator::new(store, Arc::new(NeverSubscribedChannel), OrchestratorConfig::default());
        let req = CreateDeploymentRequest {
            config_id: ResourceId::new(),
            ..Default::default()
        };
        let err = orchestrator.create_deployment(req).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn create_deployment_rejects_empty_target_set() {
        let store = Arc::new(MemStore::default());
        let (config_id, _) = seed_config_with_instance(&store);
        let orchestrator = Orchestrator::new(store, Arc::new(NeverSubscribedChannel), OrchestratorConfig::default());
        let req = CreateDeploymentRequest {
            config_id,
            target_labels: Some([("env".to_string(), "nope".to_string())].into_iter().collect()),
            ..Default::default()
        };
        let err = orchestrator.create_deployment(req).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn cancel_deployment_marks_terminal_row_without_active_runner() {
        let store = Arc::new(MemStore::default());
        let deployment = Deployment {
            id: ResourceId::new(),
            config_id: ResourceId::new(),
            config_version: 1,
            target_instances: vec![],
            strategy: deploy_core::model::Strategy::Rolling,
            batch_size: 1,
            status: DeploymentStatus::Pending,
            progress: Default::default(),
            started_at: None,
            completed_at: None,
            created_by: None,
            created_at: Utc::now(),
        };
        store.create_deployment(&deployment).await.unwrap();
        let orchestrator = Orchestrator::new(store.clone(), Arc::new(NeverSubscribedChannel), OrchestratorConfig::default());

        orchestrator.cancel_deployment(deployment.id).await.unwrap();

        let updated = store.get_deployment(deployment.id).await.unwrap();
        assert_eq!(updated.status, DeploymentStatus::Cancelled);
    }

    #[tokio::test]
    async fn report_for_inactive_deployment_is_dropped_without_error() {
        let store = Arc::new(MemStore::default());
        let orchestrator = Orchestrator::new(store, Arc::new(NeverSubscribedChannel), OrchestratorConfig::default());
        orchestrator
            .report_instance_status(ResourceId::new(), ResourceId::new(), InstanceDeployStatus::Completed, "")
            .await;
    }
}
