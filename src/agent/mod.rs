//! Agent execution: behaviors, the polling runner and the supervisor.

mod runner;
mod supervisor;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::error::AgentError;
use crate::models::{AgentConfig, AgentMode};

pub use runner::{AgentRunner, RunnerSettings};
pub use supervisor::{AgentSummary, AgentSupervisor};

/// Lifecycle state of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Needs an operator restart after fixing configuration
    Faulted,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Stopped => "stopped",
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Stopping => "stopping",
            AgentState::Faulted => "faulted",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live view of one agent, published by its runner.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub state: AgentState,
    pub mode: AgentMode,
    pub open_positions: usize,
    pub cycles: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub restarting: bool,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self {
            state: AgentState::Stopped,
            mode: AgentMode::Inactive,
            open_positions: 0,
            cycles: 0,
            last_poll_at: None,
            last_error: None,
            restarting: false,
        }
    }
}

impl AgentStatus {
    /// Move to `state`. While a restart is in progress the old runner's
    /// wind-down reads as `Starting`, never as a stop.
    pub fn enter(&mut self, state: AgentState) {
        self.state = match state {
            AgentState::Stopping | AgentState::Stopped if self.restarting => AgentState::Starting,
            other => other,
        };
    }
}

/// Cooperative cancellation token handed to a runner.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once cancellation is requested (or the sender is gone).
    pub async fn cancelled(&mut self) {
        // Err means the sender was dropped, which we treat as cancellation
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// What happened during one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub events: usize,
    pub opened: usize,
    pub closed: usize,
    pub stop_losses: usize,
    pub rejected: usize,
    pub duplicates: usize,
    /// Cancellation arrived while waiting on the feed
    pub cancelled: bool,
}

impl CycleReport {
    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Default::default()
        }
    }
}

/// One kind of agent work, driven by an [`AgentRunner`].
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    /// Load state and resolve configuration; errors fault the agent.
    async fn initialize(&mut self) -> Result<(), AgentError>;

    /// Run one poll cycle. Cancellation is observed only while waiting on
    /// upstream or the order venue, never between persistence writes.
    async fn run_cycle(&mut self, cancel: &mut CancelSignal) -> Result<CycleReport, AgentError>;

    fn open_positions(&self) -> usize;
}

/// Builds the behavior selected by an agent's kind.
pub trait BehaviorFactory: Send + Sync {
    fn build(&self, config: &AgentConfig, mode: AgentMode) -> Box<dyn AgentBehavior>;
}
