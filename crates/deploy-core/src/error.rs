//! Error types for the orchestrator core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("lease expired: {0}")]
    LeaseExpired(String),

    #[error("cancelled")]
    Cancelled,

    #[error("agent failed: {0}")]
    AgentFailed(String),

    #[error("rolled back: {0}")]
    RolledBack(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
