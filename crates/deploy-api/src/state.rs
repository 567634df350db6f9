//! Application state.

use std::sync::Arc;

use deploy_config::OrchestratorConfig;
use deploy_core::channel::AgentChannel;
use deploy_db::PgStore;
use deploy_scheduler::Orchestrator;
use sqlx::PgPool;

use crate::agent::WsAgentChannel;

/// Shared application state, cloned into every Axum handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub orchestrator: Arc<Orchestrator>,
    pub agent_channel: Arc<WsAgentChannel>,
}

impl AppState {
    pub fn new(pool: PgPool, config: OrchestratorConfig) -> Self {
        let store = Arc::new(PgStore::new(pool.clone()));
        let agent_channel = Arc::new(WsAgentChannel::new());
        let orchestrator = Arc::new(Orchestrator::new(
            store,
            agent_channel.clone() as Arc<dyn AgentChannel>,
            config,
        ));

        Self {
            pool,
            orchestrator,
            agent_channel,
        }
    }
}
