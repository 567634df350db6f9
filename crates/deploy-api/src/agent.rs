//! WebSocket transport between the orchestrator and agent instances.
//!
//! Each connected agent identifies itself with a `hello` frame naming
//! its instance id; `WsAgentChannel` keeps a per-instance outbound
//! sender so `notify_deployment` can address a single agent directly,
//! unlike a broadcast channel.

use async_trait::async_trait;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use deploy_core::channel::{AgentChannel, DeploymentCommand, StatusReport};
use deploy_core::{Error, ResourceId, Result};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentFrame {
    Hello { instance_id: ResourceId },
    StatusReport(StatusReport),
}

/// Per-instance outbound sender registry. Implements `AgentChannel` for
/// the orchestrator; `AppState` also holds it directly so the inbound
/// handler below can register/remove connections.
#[derive(Default)]
pub struct WsAgentChannel {
    connections: Mutex<HashMap<ResourceId, mpsc::UnboundedSender<Message>>>,
}

impl WsAgentChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentChannel for WsAgentChannel {
    async fn is_subscribed(&self, instance_id: ResourceId) -> bool {
        self.connections.lock().await.contains_key(&instance_id)
    }

    async fn notify_deployment(&self, instance_id: ResourceId, command: DeploymentCommand) -> Result<()> {
        let connections = self.connections.lock().await;
        let sender = connections
            .get(&instance_id)
            .ok_or_else(|| Error::Unavailable(format!("instance {instance_id} not connected")))?;

        let body = serde_json::to_string(&command)
            .map_err(|e| Error::Internal(format!("failed to encode deployment command: {e}")))?;
        sender
            .send(Message::Text(body.into()))
            .map_err(|_| Error::Unavailable(format!("instance {instance_id} connection closed")))
    }
}

/// Upgrade handler mounted at the agent WebSocket endpoint.
pub async fn agent_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

async fn handle_agent_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    let Some(instance_id) = await_hello(&mut receiver).await else {
        warn!("agent disconnected before sending a hello frame");
        return;
    };

    info!(instance_id = %instance_id, "agent connected");
    state
        .agent_channel
        .connections
        .lock()
        .await
        .insert(instance_id, outbound_tx);

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if sender.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound_frame(&state, instance_id, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(instance_id = %instance_id, error = %e, "agent socket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.agent_channel.connections.lock().await.remove(&instance_id);
    info!(instance_id = %instance_id, "agent disconnected");
}

async fn await_hello(receiver: &mut futures::stream::SplitStream<WebSocket>) -> Option<ResourceId> {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<AgentFrame>(&text) {
                Ok(AgentFrame::Hello { instance_id }) => return Some(instance_id),
                Ok(AgentFrame::StatusReport(_)) => {
                    warn!("status report received before hello, ignoring");
                }
                Err(e) => warn!(error = %e, "malformed agent frame before hello"),
            },
            Ok(Message::Close(_)) | Err(_) => return None,
            _ => {}
        }
    }
    None
}

async fn handle_inbound_frame(state: &AppState, instance_id: ResourceId, text: &str) {
    match serde_json::from_str::<AgentFrame>(text) {
        Ok(AgentFrame::StatusReport(report)) => {
            state
                .orchestrator
                .report_instance_status(
                    report.deployment_id,
                    report.instance_id,
                    report.state,
                    &report.error_details,
                )
                .await;
        }
        Ok(AgentFrame::Hello { .. }) => {
            warn!(instance_id = %instance_id, "duplicate hello frame ignored");
        }
        Err(e) => warn!(instance_id = %instance_id, error = %e, "malformed agent frame"),
    }
}
