//! API routes.

pub mod deployment;
pub mod health;

use crate::AppState;
use crate::agent::agent_ws_handler;
use axum::Router;
use axum::routing::get;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .route("/agents/ws", get(agent_ws_handler))
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new().merge(deployment::router())
}
