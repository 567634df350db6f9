//! The Runner: drives a single Deployment's instances through the
//! per-instance state machine according to its rollout strategy
//! (spec §4.2).

use chrono::{DateTime, Utc};
use deploy_config::RunnerConfig;
use deploy_core::channel::{AgentChannel, DeploymentCommand};
use deploy_core::model::{
    ConfigVersion, Deployment, DeploymentInstance, DeploymentStatus, InstanceDeployStatus,
    Strategy,
};
use deploy_core::store::Store;
use deploy_core::{Error, ResourceId, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// In-memory mirror of a DeploymentInstance row. The Runner exclusively
/// owns this map while its Deployment is active; the Store owns
/// durable state (spec §3, Ownership).
#[derive(Debug, Clone)]
pub struct InstanceResult {
    pub status: InstanceDeployStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_status_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl InstanceResult {
    fn pending() -> Self {
        Self {
            status: InstanceDeployStatus::Pending,
            started_at: None,
            completed_at: None,
            last_status_at: None,
            error_message: None,
        }
    }

    fn to_row(&self, deployment_id: ResourceId, instance_id: ResourceId) -> DeploymentInstance {
        DeploymentInstance {
            deployment_id,
            instance_id,
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            last_status_at: self.last_status_at,
            error_message: self.error_message.clone(),
        }
    }
}

pub struct Runner {
    store: Arc<dyn Store>,
    channel: Arc<dyn AgentChannel>,
    config: RunnerConfig,
    default_timeout: Duration,
    deployment: Mutex<Deployment>,
    config_version: ConfigVersion,
    results: Mutex<HashMap<ResourceId, InstanceResult>>,
    cancel: CancellationToken,
}

impl Runner {
    /// Construct a Runner for `deployment`, seeding a `pending` entry
    /// (in memory and in the Store) for every target instance.
    pub async fn new(
        deployment: Deployment,
        config_version: ConfigVersion,
        store: Arc<dyn Store>,
        channel: Arc<dyn AgentChannel>,
        config: RunnerConfig,
        default_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let mut results = HashMap::with_capacity(deployment.target_instances.len());
        for instance_id in &deployment.target_instances {
            let result = InstanceResult::pending();
            store
                .create_deployment_instance(&result.to_row(deployment.id, *instance_id))
                .await?;
            results.insert(*instance_id, result);
        }

        Ok(Arc::new(Self {
            store,
            channel,
            config,
            default_timeout,
            deployment: Mutex::new(deployment),
            config_version,
            results: Mutex::new(results),
            cancel: CancellationToken::new(),
        }))
    }

    /// Signal cooperative cancellation; observed by every suspension
    /// point on its next tick (spec §5, Cancellation).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn deployment_snapshot(&self) -> Deployment {
        self.deployment.lock().await.clone()
    }

    pub async fn results_snapshot(&self) -> HashMap<ResourceId, DeploymentInstance> {
        let deployment_id = self.deployment.lock().await.id;
        self.results
            .lock()
            .await
            .iter()
            .map(|(id, r)| (*id, r.to_row(deployment_id, *id)))
            .collect()
    }

    /// Drive the deployment to completion (spec §4.2, `Run`).
    pub async fn run(self: Arc<Self>) -> Result<()> {
        match tokio::time::timeout(self.default_timeout, self.clone().run_inner()).await {
            Ok(result) => result,
            Err(_) => {
                self.cancel.cancel();
                let err = Error::Timeout("deployment exceeded default timeout".to_string());
                let _ = self
                    .finish(DeploymentStatus::Failed, Some(err.to_string()))
                    .await;
                Err(err)
            }
        }
    }

    async fn run_inner(self: Arc<Self>) -> Result<()> {
        {
            let mut deployment = self.deployment.lock().await;
            deployment.status = DeploymentStatus::InProgress;
            deployment.started_at = Some(Utc::now());
            self.store.update_deployment(&deployment).await?;
        }

        let strategy = self.deployment.lock().await.strategy;
        let result = match strategy {
            Strategy::AllAtOnce => self.run_all_at_once().await,
            Strategy::Rolling => self.run_rolling().await,
            Strategy::Canary => self.run_canary().await,
        };

        match result {
            // `cancel_deployment` already wrote `status=Cancelled` to the store the
            // moment cancellation was requested; this Runner noticed only on its
            // next poll tick and must not overwrite that terminal state with Failed.
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                self.finish(DeploymentStatus::Failed, Some(e.to_string()))
                    .await?;
                Err(e)
            }
            Ok(()) => {
                let all_completed = {
                    let results = self.results.lock().await;
                    results
                        .values()
                        .all(|r| r.status == InstanceDeployStatus::Completed)
                };
                if all_completed {
                    self.finish(DeploymentStatus::Completed, None).await?;
                } else {
                    self.finish(
                        DeploymentStatus::Failed,
                        Some("some instances failed".to_string()),
                    )
                    .await?;
                }
                Ok(())
            }
        }
    }

    async fn finish(&self, status: DeploymentStatus, failure_reason: Option<String>) -> Result<()> {
        let mut deployment = self.deployment.lock().await;
        deployment.status = status;
        deployment.completed_at = Some(Utc::now());
        if failure_reason.is_some() {
            deployment.progress.failure_reason = failure_reason;
        }
        let results = self.results.lock().await;
        deployment.progress.completed_instances = results
            .values()
            .filter(|r| r.status == InstanceDeployStatus::Completed)
            .count();
        deployment.progress.failed_instances = results
            .values()
            .filter(|r| r.status == InstanceDeployStatus::Failed)
            .count();
        self.store.update_deployment(&deployment).await
    }

    // ---- strategies (spec §4.2.1-4.2.3) ----

    async fn run_all_at_once(self: &Arc<Self>) -> Result<()> {
        let targets = self.deployment.lock().await.target_instances.clone();
        self.dispatch_batch(&targets, 1, 1).await
    }

    async fn run_rolling(self: &Arc<Self>) -> Result<()> {
        let (targets, batch_size) = {
            let deployment = self.deployment.lock().await;
            (deployment.target_instances.clone(), deployment.batch_size.max(1))
        };
        self.run_rolling_from(&targets, batch_size, 1).await
    }

    /// Shared rolling-batch driver; `start_batch_num` lets canary
    /// number its post-canary batches starting at 2 (spec §4.2.3).
    async fn run_rolling_from(
        self: &Arc<Self>,
        targets: &[ResourceId],
        batch_size: usize,
        start_batch_num: u32,
    ) -> Result<()> {
        let batches: Vec<&[ResourceId]> = targets.chunks(batch_size.max(1)).collect();
        let total_batches = batches.len();

        for (idx, batch) in batches.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let batch_num = start_batch_num + idx as u32;
            if let Err(e) = self
                .dispatch_batch(batch, batch_num, total_batches as u32)
                .await
            {
                self.rollback().await;
                return Err(e);
            }

            {
                let mut deployment = self.deployment.lock().await;
                let results = self.results.lock().await;
                deployment.progress.current_batch = batch_num as usize;
                deployment.progress.total_batches = total_batches;
                deployment.progress.completed_instances = results
                    .values()
                    .filter(|r| r.status == InstanceDeployStatus::Completed)
                    .count();
                deployment.progress.failed_instances = results
                    .values()
                    .filter(|r| r.status == InstanceDeployStatus::Failed)
                    .count();
                drop(results);
                self.store.update_deployment(&deployment).await?;
            }

            let is_last = idx + 1 == batches.len();
            if !is_last {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.batch_delay) => {}
                    _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                }
            }
        }

        Ok(())
    }

    async fn run_canary(self: &Arc<Self>) -> Result<()> {
        let targets = self.deployment.lock().await.target_instances.clone();
        if targets.len() < 2 {
            return self.run_all_at_once().await;
        }

        let canary_size = (targets.len() / 10).max(1);
        let (canary, rest) = targets.split_at(canary_size);

        if let Err(e) = self.dispatch_batch(canary, 1, 0).await {
            self.rollback().await;
            return Err(e);
        }

        tokio::select! {
            _ = tokio::time::sleep(self.config.canary_validation_delay) => {}
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
        }

        let canary_ok = {
            let results = self.results.lock().await;
            canary
                .iter()
                .all(|id| matches!(results.get(id), Some(r) if r.status == InstanceDeployStatus::Completed))
        };
        if !canary_ok {
            self.rollback().await;
            return Err(Error::AgentFailed(
                "canary validation failed: not all canary instances completed".to_string(),
            ));
        }

        if rest.is_empty() {
            return Ok(());
        }
        let batch_size = self.deployment.lock().await.batch_size.max(1);
        self.run_rolling_from(rest, batch_size, 2).await
    }

    // ---- batch + per-instance dispatch (spec §4.2.4-4.2.5) ----

    async fn dispatch_batch(
        self: &Arc<Self>,
        batch: &[ResourceId],
        batch_num: u32,
        total_batches: u32,
    ) -> Result<()> {
        let futures = batch.iter().map(|instance_id| {
            let this = self.clone();
            let instance_id = *instance_id;
            async move { this.deploy_to_instance(instance_id, batch_num, total_batches).await }
        });
        let results = futures::future::join_all(futures).await;
        let failed: Vec<_> = results.into_iter().filter_map(|r| r.err()).collect();
        if failed.is_empty() {
            Ok(())
        } else if failed.iter().any(|e| matches!(e, Error::Cancelled)) {
            // Don't let a cancellation racing one instance's wait loop get
            // relabeled as an agent failure; the caller needs to see Cancelled
            // to skip re-finishing an already-terminal deployment.
            Err(Error::Cancelled)
        } else {
            Err(Error::AgentFailed(format!("{} instances failed", failed.len())))
        }
    }

    async fn deploy_to_instance(
        self: &Arc<Self>,
        instance_id: ResourceId,
        batch_num: u32,
        total_batches: u32,
    ) -> Result<()> {
        let now = Utc::now();
        self.mutate_result(instance_id, |r| {
            r.status = InstanceDeployStatus::InProgress;
            r.started_at = Some(now);
            r.last_status_at = Some(now);
        })
        .await?;

        if !self.channel.is_subscribed(instance_id).await {
            self.mutate_result(instance_id, |r| {
                r.status = InstanceDeployStatus::Failed;
                r.error_message = Some("instance not connected".to_string());
                r.completed_at = Some(Utc::now());
            })
            .await?;
            return Err(Error::Unavailable(format!(
                "instance {instance_id} not connected"
            )));
        }

        let deployment_id = self.deployment.lock().await.id;
        let config_id = self.deployment.lock().await.config_id;
        let command = DeploymentCommand {
            deployment_id: deployment_id.to_string(),
            config_id: config_id.to_string(),
            config_version: self.config_version.version.to_string(),
            strategy: self.deployment.lock().await.strategy,
            batch_number: batch_num,
            total_batches: total_batches.max(1),
            deadline: Utc::now() + self.config.instance_timeout,
            is_rollback: false,
        };

        if let Err(e) = self.channel.notify_deployment(instance_id, command).await {
            self.mutate_result(instance_id, |r| {
                r.status = InstanceDeployStatus::Failed;
                r.error_message = Some(e.to_string());
                r.completed_at = Some(Utc::now());
            })
            .await?;
            return Err(e);
        }

        self.wait_for_terminal(instance_id).await?;

        self.mutate_result(instance_id, |r| {
            r.status = InstanceDeployStatus::Completed;
            r.completed_at = Some(Utc::now());
        })
        .await?;

        self.store
            .set_instance_config(instance_id, config_id, self.config_version.version)
            .await?;

        Ok(())
    }

    // ---- wait loop + lease semantics (spec §4.2.7) ----

    async fn wait_for_terminal(&self, instance_id: ResourceId) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.instance_timeout;
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::Timeout(format!(
                        "instance {instance_id} did not reach a terminal state in time"
                    )));
                }
                _ = ticker.tick() => {
                    let deployment_id = self.deployment.lock().await.id;
                    let mut results = self.results.lock().await;
                    let Some(result) = results.get_mut(&instance_id) else {
                        return Err(Error::Internal(format!("unknown instance {instance_id}")));
                    };
                    match result.status {
                        InstanceDeployStatus::Completed => return Ok(()),
                        InstanceDeployStatus::Failed => {
                            return Err(Error::AgentFailed(
                                result.error_message.clone().unwrap_or_default(),
                            ));
                        }
                        InstanceDeployStatus::RolledBack => {
                            return Err(Error::RolledBack("instance rolled back".to_string()));
                        }
                        InstanceDeployStatus::InProgress => {
                            if let Some(last) = result.last_status_at {
                                let since = Utc::now().signed_duration_since(last);
                                if since.to_std().unwrap_or(Duration::ZERO) > self.config.lease_timeout {
                                    let message = format!(
                                        "lease expired: agent stopped reporting (last status {since}s ago)",
                                        since = since.num_seconds(),
                                    );
                                    result.status = InstanceDeployStatus::Failed;
                                    result.error_message = Some(message.clone());
                                    result.completed_at = Some(Utc::now());
                                    let row = result.to_row(deployment_id, instance_id);
                                    drop(results);
                                    self.store.update_deployment_instance(&row).await?;
                                    return Err(Error::LeaseExpired(message));
                                }
                            }
                        }
                        InstanceDeployStatus::Pending => {}
                    }
                }
            }
        }
    }

    async fn mutate_result(
        &self,
        instance_id: ResourceId,
        f: impl FnOnce(&mut InstanceResult),
    ) -> Result<()> {
        let deployment_id = self.deployment.lock().await.id;
        let row = {
            let mut results = self.results.lock().await;
            let Some(result) = results.get_mut(&instance_id) else {
                return Err(Error::Internal(format!("unknown instance {instance_id}")));
            };
            f(result);
            result.to_row(deployment_id, instance_id)
        };
        self.store.update_deployment_instance(&row).await
    }

    // ---- rollback (spec §4.2.6) ----

    async fn rollback(&self) {
        let completed: Vec<ResourceId> = {
            let results = self.results.lock().await;
            results
                .iter()
                .filter(|(_, r)| r.status == InstanceDeployStatus::Completed)
                .map(|(id, _)| *id)
                .collect()
        };
        if completed.is_empty() {
            return;
        }

        let (deployment_id, config_id) = {
            let deployment = self.deployment.lock().await;
            (deployment.id, deployment.config_id)
        };

        let prev_version = self.config_version.version - 1;
        if prev_version < 1 {
            info!(deployment_id = %deployment_id, "no rollback target: already at version 1");
            return;
        }

        let prev = match self.store.get_config_version(config_id, prev_version).await {
            Ok(v) => v,
            Err(e) => {
                warn!(deployment_id = %deployment_id, error = %e, "rollback target version missing, skipping rollback");
                return;
            }
        };

        for instance_id in completed {
            if !self.channel.is_subscribed(instance_id).await {
                continue;
            }
            let command = DeploymentCommand {
                deployment_id: format!("{deployment_id}-rollback"),
                config_id: config_id.to_string(),
                config_version: prev.version.to_string(),
                strategy: Strategy::AllAtOnce,
                batch_number: 1,
                total_batches: 1,
                deadline: Utc::now() + self.config.instance_timeout,
                is_rollback: true,
            };
            if let Err(e) = self.channel.notify_deployment(instance_id, command).await {
                error!(instance_id = %instance_id, error = %e, "rollback command delivery failed");
            }
        }
    }

    // ---- inbound status reports (spec §4.2.7) ----

    /// Apply a StatusReport to this Runner's in-memory state. Unknown
    /// instance IDs are silently dropped.
    pub async fn report_instance_status(
        &self,
        instance_id: ResourceId,
        state: InstanceDeployStatus,
        error_details: &str,
    ) {
        let deployment_id = self.deployment.lock().await.id;
        let row = {
            let mut results = self.results.lock().await;
            let Some(result) = results.get_mut(&instance_id) else {
                warn!(instance_id = %instance_id, "status report for unknown instance dropped");
                return;
            };
            result.status = state;
            result.last_status_at = Some(Utc::now());
            if state.is_terminal() {
                result.completed_at = Some(Utc::now());
            }
            if !error_details.is_empty() {
                result.error_message = Some(error_details.to_string());
            }
            result.to_row(deployment_id, instance_id)
        };
        if let Err(e) = self.store.update_deployment_instance(&row).await {
            error!(instance_id = %instance_id, error = %e, "failed to persist status report");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use deploy_core::model::{Config, Instance};
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct FakeStore {
        deployments: StdMutex<HashMap<ResourceId, Deployment>>,
        instances: StdMutex<HashMap<ResourceId, DeploymentInstance>>,
        versions: StdMutex<HashMap<(ResourceId, i32), ConfigVersion>>,
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn get_config(&self, _id: ResourceId) -> Result<Config> {
            Err(Error::NotFound("unused".into()))
        }
        async fn get_config_version(&self, config_id: ResourceId, version: i32) -> Result<ConfigVersion> {
            self.versions
                .lock()
                .unwrap()
                .get(&(config_id, version))
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("{config_id}/{version}")))
        }
        async fn get_instance(&self, _id: ResourceId) -> Result<Instance> {
            Err(Error::NotFound("unused".into()))
        }
        async fn list_instances(&self, _ids: Option<&[ResourceId]>) -> Result<Vec<Instance>> {
            Ok(vec![])
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
            self.instances.lock().unwrap().insert(row.instance_id, row.clone());
            Ok(())
        }
        async fn update_deployment_instance(&self, row: &DeploymentInstance) -> Result<()> {
            self.instances.lock().unwrap().insert(row.instance_id, row.clone());
            Ok(())
        }
        async fn list_deployment_instances(&self, deployment_id: ResourceId) -> Result<HashMap<ResourceId, DeploymentInstance>> {
            Ok(self
                .instances
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, row)| row.deployment_id == deployment_id)
                .map(|(id, row)| (*id, row.clone()))
                .collect())
        }
    }

    /// Records every command handed to it and forwards it to the test over
    /// `sent_tx` so a task can play the part of a responding agent.
    struct MockChannel {
        subscribed: HashSet<ResourceId>,
        sent_tx: mpsc::UnboundedSender<(ResourceId, DeploymentCommand)>,
        sent: StdMutex<Vec<(ResourceId, DeploymentCommand)>>,
    }

    impl MockChannel {
        fn new(
            subscribed: impl IntoIterator<Item = ResourceId>,
        ) -> (Arc<Self>, mpsc::UnboundedReceiver<(ResourceId, DeploymentCommand)>) {
            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    subscribed: subscribed.into_iter().collect(),
                    sent_tx,
                    sent: StdMutex::new(Vec::new()),
                }),
                sent_rx,
            )
        }

        fn sent_snapshot(&self) -> Vec<(ResourceId, DeploymentCommand)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentChannel for MockChannel {
        async fn is_subscribed(&self, instance_id: ResourceId) -> bool {
            self.subscribed.contains(&instance_id)
        }
        async fn notify_deployment(&self, instance_id: ResourceId, command: DeploymentCommand) -> Result<()> {
            self.sent.lock().unwrap().push((instance_id, command.clone()));
            let _ = self.sent_tx.send((instance_id, command));
            Ok(())
        }
    }

    fn fast_config() -> RunnerConfig {
        RunnerConfig {
            instance_timeout: Duration::from_secs(2),
            lease_timeout: Duration::from_millis(50),
            batch_delay: Duration::from_millis(10),
            canary_validation_delay: Duration::from_millis(10),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn make_deployment(
        target_instances: Vec<ResourceId>,
        strategy: Strategy,
        batch_size: usize,
        config_version: i32,
    ) -> Deployment {
        Deployment {
            id: ResourceId::new(),
            config_id: ResourceId::new(),
            config_version,
            target_instances: target_instances.clone(),
            strategy,
            batch_size,
            status: DeploymentStatus::Pending,
            progress: deploy_core::model::Progress {
                total_instances: target_instances.len(),
                ..Default::default()
            },
            started_at: None,
            completed_at: None,
            created_by: None,
            created_at: Utc::now(),
        }
    }

    fn make_config_version(config_id: ResourceId, version: i32) -> ConfigVersion {
        ConfigVersion {
            id: ResourceId::new(),
            config_id,
            version,
            content: serde_json::json!({}),
            content_hash: "hash".to_string(),
            created_at: Utc::now(),
        }
    }

    /// Spawns a task that answers every dispatched command as instructed by
    /// `respond`, simulating an agent pushing StatusReports back.
    fn spawn_responder(
        runner: Arc<Runner>,
        mut commands: mpsc::UnboundedReceiver<(ResourceId, DeploymentCommand)>,
        respond: impl Fn(ResourceId, &DeploymentCommand) -> Option<(InstanceDeployStatus, &'static str)> + Send + 'static,
    ) {
        tokio::spawn(async move {
            while let Some((instance_id, command)) = commands.recv().await {
                if let Some((status, error)) = respond(instance_id, &command) {
                    runner.report_instance_status(instance_id, status, error).await;
                }
            }
        });
    }

    #[tokio::test]
    async fn all_at_once_happy_path_completes_every_instance() {
        let i1 = ResourceId::new();
        let i2 = ResourceId::new();
        let deployment = make_deployment(vec![i1, i2], Strategy::AllAtOnce, 1, 1);
        let config_version = make_config_version(deployment.config_id, 1);
        let store = Arc::new(FakeStore::default());
        let (channel, commands) = MockChannel::new([i1, i2]);

        let runner = Runner::new(
            deployment.clone(),
            config_version,
            store.clone(),
            channel.clone(),
            fast_config(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        spawn_responder(runner.clone(), commands, |_instance_id, command| {
            assert!(!command.is_rollback);
            Some((InstanceDeployStatus::Completed, ""))
        });

        runner.run().await.unwrap();

        let finished = store.get_deployment(deployment.id).await.unwrap();
        assert_eq!(finished.status, DeploymentStatus::Completed);
        assert_eq!(finished.progress.completed_instances, 2);
        assert_eq!(finished.progress.failed_instances, 0);
    }

    #[tokio::test]
    async fn rolling_batch_failure_triggers_rollback_to_prior_version() {
        let instances: Vec<ResourceId> = (0..4).map(|_| ResourceId::new()).collect();
        let failing = instances[2];
        let deployment = make_deployment(instances.clone(), Strategy::Rolling, 2, 2);
        let config_id = deployment.config_id;
        let config_version = make_config_version(config_id, 2);
        let store = Arc::new(FakeStore::default());
        store
            .versions
            .lock()
            .unwrap()
            .insert((config_id, 1), make_config_version(config_id, 1));
        let (channel, commands) = MockChannel::new(instances.clone());

        let runner = Runner::new(
            deployment.clone(),
            config_version,
            store.clone(),
            channel.clone(),
            fast_config(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        spawn_responder(runner.clone(), commands, move |instance_id, command| {
            if command.is_rollback {
                return None;
            }
            if instance_id == failing {
                Some((InstanceDeployStatus::Failed, "agent rejected config"))
            } else {
                Some((InstanceDeployStatus::Completed, ""))
            }
        });

        let err = runner.clone().run().await.unwrap_err();
        assert!(matches!(err, Error::AgentFailed(_)));

        let finished = store.get_deployment(deployment.id).await.unwrap();
        assert_eq!(finished.status, DeploymentStatus::Failed);

        let sent = channel.sent_snapshot();
        let rollback_targets: HashSet<ResourceId> = sent
            .iter()
            .filter(|(_, cmd)| cmd.is_rollback)
            .map(|(id, _)| *id)
            .collect();
        // Every instance that reached Completed gets rolled back, including
        // the failing batch's other member, which finished concurrently.
        assert_eq!(
            rollback_targets,
            [instances[0], instances[1], instances[3]].into_iter().collect()
        );
        for (_, cmd) in sent.iter().filter(|(_, cmd)| cmd.is_rollback) {
            assert_eq!(cmd.config_version, "1");
            assert_eq!(cmd.strategy, Strategy::AllAtOnce);
            assert_eq!(cmd.deployment_id, format!("{}-rollback", deployment.id));
        }

        let rows = runner.results_snapshot().await;
        let failed_row = &rows[&failing];
        assert_eq!(failed_row.status, InstanceDeployStatus::Failed);
        assert_eq!(failed_row.error_message.as_deref(), Some("agent rejected config"));
    }

    #[tokio::test]
    async fn lease_expiry_fails_instance_with_expected_message() {
        let instance_id = ResourceId::new();
        let deployment = make_deployment(vec![instance_id], Strategy::AllAtOnce, 1, 1);
        let config_version = make_config_version(deployment.config_id, 1);
        let store = Arc::new(FakeStore::default());
        let (channel, _commands) = MockChannel::new([instance_id]);

        let runner = Runner::new(
            deployment.clone(),
            config_version,
            store.clone(),
            channel,
            fast_config(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        // No responder: the agent never reports back, so its lease expires.
        let err = runner.clone().run().await.unwrap_err();
        assert!(matches!(err, Error::AgentFailed(_)));

        let rows = runner.results_snapshot().await;
        let row = &rows[&instance_id];
        assert_eq!(row.status, InstanceDeployStatus::Failed);
        assert!(
            row.error_message
                .as_deref()
                .unwrap_or_default()
                .contains("lease expired: agent stopped reporting"),
            "unexpected message: {:?}",
            row.error_message
        );
    }

    #[tokio::test]
    async fn cancellation_after_external_terminal_write_is_not_overwritten() {
        let instance_id = ResourceId::new();
        let deployment = make_deployment(vec![instance_id], Strategy::AllAtOnce, 1, 1);
        let config_version = make_config_version(deployment.config_id, 1);
        let store = Arc::new(FakeStore::default());
        let (channel, _commands) = MockChannel::new([instance_id]);

        let runner = Runner::new(
            deployment.clone(),
            config_version,
            store.clone(),
            channel,
            fast_config(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        // Mirrors what `Orchestrator::cancel_deployment` does: write the
        // terminal status to the store directly, then signal the Runner.
        let mut cancelled = store.get_deployment(deployment.id).await.unwrap();
        cancelled.status = DeploymentStatus::Cancelled;
        cancelled.completed_at = Some(Utc::now());
        store.update_deployment(&cancelled).await.unwrap();
        runner.cancel();

        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        // The Runner must not have raced its own `Failed` write over the
        // `Cancelled` status the orchestrator already committed.
        let finished = store.get_deployment(deployment.id).await.unwrap();
        assert_eq!(finished.status, DeploymentStatus::Cancelled);
    }
}
