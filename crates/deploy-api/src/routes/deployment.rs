//! Deployment lifecycle routes.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::AppState;
use crate::error::ApiError;
use deploy_core::model::{
    CreateDeploymentRequest, Deployment, DeploymentInstance, Strategy,
};
use deploy_core::ResourceId;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/deployments", post(create_deployment))
        .route("/deployments/{id}", get(get_deployment_status))
        .route("/deployments/{id}/cancel", post(cancel_deployment))
}

#[derive(Debug, Deserialize)]
pub struct CreateDeploymentBody {
    pub config_id: ResourceId,
    pub config_version: Option<i32>,
    #[serde(default)]
    pub target_instances: Vec<ResourceId>,
    pub target_labels: Option<HashMap<String, String>>,
    pub strategy: Option<Strategy>,
    pub batch_size: Option<usize>,
    pub created_by: Option<String>,
}

impl From<CreateDeploymentBody> for CreateDeploymentRequest {
    fn from(body: CreateDeploymentBody) -> Self {
        Self {
            config_id: body.config_id,
            config_version: body.config_version,
            target_instances: body.target_instances,
            target_labels: body.target_labels,
            strategy: body.strategy,
            batch_size: body.batch_size,
            created_by: body.created_by,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeploymentStatusResponse {
    pub deployment: Deployment,
    pub instances: HashMap<ResourceId, DeploymentInstance>,
}

async fn create_deployment(
    State(state): State<AppState>,
    Json(body): Json<CreateDeploymentBody>,
) -> Result<Json<Deployment>, ApiError> {
    let deployment = state.orchestrator.create_deployment(body.into()).await?;
    Ok(Json(deployment))
}

async fn get_deployment_status(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> Result<Json<DeploymentStatusResponse>, ApiError> {
    let view = state.orchestrator.get_deployment_status(id).await?;
    Ok(Json(DeploymentStatusResponse {
        deployment: view.deployment,
        instances: view.instances,
    }))
}

async fn cancel_deployment(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.orchestrator.cancel_deployment(id).await?;
    Ok(Json(serde_json::json!({ "cancelled": true })))
}
