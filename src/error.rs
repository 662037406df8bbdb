//! Error taxonomy shared by the feed client, the store, agents and the supervisor.

use std::time::Duration;

use thiserror::Error;

use crate::models::AgentId;

/// Outcome of a single upstream request, as classified by the transport.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Upstream asked us to slow down (HTTP 429).
    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    /// Timeouts, connection failures, 5xx, undecodable bodies.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Anything retrying will not fix (bad participant, unknown market, 4xx).
    #[error("upstream rejected request: {0}")]
    Fatal(String),
}

/// Failures surfaced by the rate-limited feed client to agents.
#[derive(Error, Debug, Clone)]
pub enum FeedError {
    #[error("feed unavailable after {attempts} attempts: {reason}")]
    Unavailable { attempts: u32, reason: String },

    #[error("feed query failed: {0}")]
    QueryFailed(String),
}

impl FeedError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FeedError::Unavailable { .. })
    }
}

/// Failures submitting an order.
#[derive(Error, Debug, Clone)]
pub enum OrderError {
    /// Worth retrying on a later cycle.
    #[error("order venue unavailable: {0}")]
    Unavailable(String),

    #[error("order rejected: {0}")]
    Rejected(String),
}

/// Failures from the persistence gateway.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("corrupt {column} value: {value}")]
    Corrupt { column: &'static str, value: String },
}

/// Errors raised inside one agent's execution context.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error("initialization failed: {0}")]
    Initialization(String),
}

/// Errors reported to callers of the agent supervisor.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("agent {0} not found")]
    NotFound(AgentId),

    #[error("agent {0} is already running")]
    AlreadyRunning(AgentId),

    #[error("agent {0} is not running")]
    NotRunning(AgentId),

    #[error("agent {0} is faulted; restart it after fixing its configuration")]
    Faulted(AgentId),

    #[error("supervisor is shutting down")]
    ShuttingDown,

    #[error("agent {agent_id} did not stop within {waited:?}")]
    StopTimedOut { agent_id: AgentId, waited: Duration },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Engine configuration problems.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("backoff cap {cap:?} is below the base {base:?}")]
    BackoffCap { base: Duration, cap: Duration },
}
