//! Agent lifecycle: create, start, stop, restart, list and shut down.
//!
//! The supervisor owns one entry per agent id. Lifecycle transitions for an
//! agent serialize on that entry's lock, so at most one runner task is ever
//! live per id. Status reads never take the lifecycle lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::db::PersistenceGateway;
use crate::error::{PersistenceError, SupervisorError};
use crate::models::{
    AgentConfig, AgentFilter, AgentId, AgentMode, AgentUpdate, CloseReason, PaperWallet,
};

use super::{AgentRunner, AgentState, AgentStatus, BehaviorFactory, CancelSignal, RunnerSettings};

type SupervisorResult<T> = Result<T, SupervisorError>;

struct RunningAgent {
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<AgentState>,
}

impl RunningAgent {
    fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }
}

struct AgentEntry {
    lifecycle: Mutex<Option<RunningAgent>>,
    status: Arc<watch::Sender<AgentStatus>>,
    restarting: AtomicBool,
}

impl AgentEntry {
    fn new() -> Self {
        Self {
            lifecycle: Mutex::new(None),
            status: Arc::new(watch::Sender::new(AgentStatus::default())),
            restarting: AtomicBool::new(false),
        }
    }

    fn set_restarting(&self, restarting: bool) {
        self.restarting.store(restarting, Ordering::SeqCst);
        self.status.send_modify(|s| s.restarting = restarting);
    }
}

/// Read-only view of one agent for operators.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub config: AgentConfig,
    pub status: AgentStatus,
    pub open_positions: usize,
    pub realized_pnl: Decimal,
    pub paper_balance: Decimal,
}

/// Outcome of [`AgentSupervisor::shutdown`].
#[derive(Debug, Default, Clone)]
pub struct ShutdownReport {
    pub stopped: Vec<AgentId>,
    pub timed_out: Vec<AgentId>,
}

/// Owns every agent's execution context.
pub struct AgentSupervisor {
    store: Arc<dyn PersistenceGateway>,
    factory: Arc<dyn BehaviorFactory>,
    settings: RunnerSettings,
    stop_timeout: Duration,
    agents: RwLock<HashMap<AgentId, Arc<AgentEntry>>>,
    closed: AtomicBool,
}

impl AgentSupervisor {
    pub fn new(
        store: Arc<dyn PersistenceGateway>,
        factory: Arc<dyn BehaviorFactory>,
        settings: RunnerSettings,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            store,
            factory,
            settings,
            stop_timeout,
            agents: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    async fn entry(&self, id: &AgentId) -> Arc<AgentEntry> {
        if let Some(entry) = self.agents.read().await.get(id) {
            return entry.clone();
        }
        self.agents
            .write()
            .await
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AgentEntry::new()))
            .clone()
    }

    async fn load(&self, id: &AgentId) -> SupervisorResult<AgentConfig> {
        match self.store.get_agent(id).await {
            Ok(config) => Ok(config),
            Err(PersistenceError::NotFound { .. }) => Err(SupervisorError::NotFound(id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    fn ensure_open(&self) -> SupervisorResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SupervisorError::ShuttingDown);
        }
        Ok(())
    }

    // ==================== Configuration ====================

    /// Validate and persist a new agent.
    pub async fn create_agent(&self, config: AgentConfig) -> SupervisorResult<AgentId> {
        config.validate().map_err(SupervisorError::InvalidConfig)?;
        let id = self.store.create_agent(&config).await?;
        info!(agent = %id, name = %config.name, "Agent created");
        Ok(id)
    }

    /// Change a stopped agent's configuration.
    pub async fn update_agent(&self, id: &AgentId, update: AgentUpdate) -> SupervisorResult<AgentConfig> {
        let current = self.load(id).await?;
        let entry = self.entry(id).await;
        let slot = entry.lifecycle.lock().await;
        if slot.as_ref().is_some_and(RunningAgent::is_live) {
            return Err(SupervisorError::AlreadyRunning(id.clone()));
        }

        update
            .apply(&current)
            .validate()
            .map_err(SupervisorError::InvalidConfig)?;
        let config = self.store.update_agent(id, &update).await?;
        info!(agent = %id, "Agent updated");
        Ok(config)
    }

    // ==================== Lifecycle ====================

    /// Spawn the agent's runner in `mode`.
    pub async fn start_agent(&self, id: &AgentId, mode: AgentMode) -> SupervisorResult<()> {
        if !mode.is_active() {
            return Err(SupervisorError::InvalidConfig(format!(
                "cannot start in {} mode",
                mode
            )));
        }
        let config = self.load(id).await?;
        let entry = self.entry(id).await;
        let mut slot = entry.lifecycle.lock().await;
        self.ensure_open()?;

        if slot.as_ref().is_some_and(RunningAgent::is_live) {
            return Err(SupervisorError::AlreadyRunning(id.clone()));
        }
        if entry.status.borrow().state == AgentState::Faulted {
            return Err(SupervisorError::Faulted(id.clone()));
        }

        self.launch(&entry, &mut slot, config, mode).await
    }

    /// Request cooperative cancellation and wait for the runner to finish.
    pub async fn stop_agent(&self, id: &AgentId) -> SupervisorResult<()> {
        self.load(id).await?;
        let entry = self.entry(id).await;
        let mut slot = entry.lifecycle.lock().await;

        let result = self.stop_locked(id, &entry, &mut slot).await;
        if matches!(result, Ok(_) | Err(SupervisorError::StopTimedOut { .. })) {
            self.store
                .update_agent(id, &AgentUpdate::mode(AgentMode::Inactive))
                .await?;
        }
        result.map(|_| ())
    }

    /// Stop (if running), apply `update`, and start again as one operation.
    ///
    /// The mode is the update's if active, else the mode the agent was
    /// running in, else its persisted mode, else simulated.
    pub async fn restart_agent(
        &self,
        id: &AgentId,
        update: Option<AgentUpdate>,
    ) -> SupervisorResult<()> {
        let current = self.load(id).await?;
        let entry = self.entry(id).await;
        let mut slot = entry.lifecycle.lock().await;
        self.ensure_open()?;

        entry.set_restarting(true);
        let result = self.restart_locked(id, &entry, &mut slot, current, update).await;
        entry.set_restarting(false);

        if result.is_err() && !slot.as_ref().is_some_and(RunningAgent::is_live) {
            entry.status.send_modify(|s| {
                if s.state == AgentState::Starting {
                    s.state = AgentState::Stopped;
                }
            });
        }
        result
    }

    async fn restart_locked(
        &self,
        id: &AgentId,
        entry: &AgentEntry,
        slot: &mut Option<RunningAgent>,
        mut config: AgentConfig,
        update: Option<AgentUpdate>,
    ) -> SupervisorResult<()> {
        let was_live = slot.as_ref().is_some_and(RunningAgent::is_live);
        let running_mode = entry.status.borrow().mode;

        match self.stop_locked(id, entry, slot).await {
            Ok(_) | Err(SupervisorError::NotRunning(_)) => {}
            Err(SupervisorError::StopTimedOut { waited, .. }) => {
                warn!(agent = %id, waited = ?waited, "Restart escalated to abort");
            }
            Err(e) => return Err(e),
        }

        if let Some(update) = update.filter(|u| !u.is_empty()) {
            update
                .apply(&config)
                .validate()
                .map_err(SupervisorError::InvalidConfig)?;
            config = self.store.update_agent(id, &update).await?;
        }

        let mode = if config.mode.is_active() {
            config.mode
        } else if was_live && running_mode.is_active() {
            running_mode
        } else {
            AgentMode::Simulated
        };

        info!(agent = %id, mode = %mode, "Restarting agent");
        self.launch(entry, slot, config, mode).await
    }

    async fn launch(
        &self,
        entry: &AgentEntry,
        slot: &mut Option<RunningAgent>,
        config: AgentConfig,
        mode: AgentMode,
    ) -> SupervisorResult<()> {
        config.validate().map_err(SupervisorError::InvalidConfig)?;

        let config = if config.mode != mode {
            self.store
                .update_agent(&config.id, &AgentUpdate::mode(mode))
                .await?
        } else {
            config
        };

        entry.status.send_modify(|s| {
            s.state = AgentState::Starting;
            s.mode = mode;
            s.last_error = None;
        });

        let behavior = self.factory.build(&config, mode);
        let (cancel_tx, cancel) = CancelSignal::channel();
        let runner = AgentRunner::new(
            config.id.clone(),
            mode,
            behavior,
            self.store.clone(),
            entry.status.clone(),
            cancel,
            self.settings,
        );

        let handle = tokio::spawn(runner.run());
        *slot = Some(RunningAgent { cancel_tx, handle });
        info!(agent = %config.id, name = %config.name, mode = %mode, "Agent started");
        Ok(())
    }

    /// Caller holds the entry's lifecycle lock.
    async fn stop_locked(
        &self,
        id: &AgentId,
        entry: &AgentEntry,
        slot: &mut Option<RunningAgent>,
    ) -> SupervisorResult<AgentState> {
        let Some(mut running) = slot.take() else {
            return Err(SupervisorError::NotRunning(id.clone()));
        };
        if !running.is_live() {
            // Already exited on its own (faulted); reap it
            let _ = (&mut running.handle).await;
            return Err(SupervisorError::NotRunning(id.clone()));
        }

        running.cancel_tx.send_replace(true);
        match timeout(self.stop_timeout, &mut running.handle).await {
            Ok(Ok(state)) => {
                info!(agent = %id, state = %state, "Agent stopped");
                Ok(state)
            }
            Ok(Err(e)) => {
                error!(agent = %id, error = %e, "Agent task panicked");
                entry.status.send_modify(|s| {
                    s.state = AgentState::Faulted;
                    s.last_error = Some(format!("agent task failed: {}", e));
                });
                Ok(AgentState::Faulted)
            }
            Err(_) => {
                running.handle.abort();
                warn!(agent = %id, waited = ?self.stop_timeout, "Agent did not stop in time, aborted");
                entry.status.send_modify(|s| {
                    s.enter(AgentState::Stopped);
                    s.last_error = Some("stop timed out; task aborted".to_string());
                });
                Err(SupervisorError::StopTimedOut {
                    agent_id: id.clone(),
                    waited: self.stop_timeout,
                })
            }
        }
    }

    // ==================== Queries ====================

    /// Current state, open positions and realized P&L of one agent.
    pub async fn status(&self, id: &AgentId) -> SupervisorResult<AgentSummary> {
        let config = self.load(id).await?;
        self.summarize(config).await
    }

    pub async fn list_agents(&self, filter: &AgentFilter) -> SupervisorResult<Vec<AgentSummary>> {
        let configs = self.store.list_agents(filter).await?;
        let mut summaries = Vec::with_capacity(configs.len());
        for config in configs {
            summaries.push(self.summarize(config).await?);
        }
        Ok(summaries)
    }

    async fn summarize(&self, config: AgentConfig) -> SupervisorResult<AgentSummary> {
        let entry = self.agents.read().await.get(&config.id).cloned();
        let mut status = entry
            .as_ref()
            .map(|e| e.status.borrow().clone())
            .unwrap_or_default();

        // A restart in progress is never reported as a stop
        if entry
            .as_ref()
            .is_some_and(|e| e.restarting.load(Ordering::SeqCst))
        {
            status.state = AgentState::Starting;
            status.restarting = true;
        }
        if status.state == AgentState::Stopped && !status.restarting {
            status.mode = AgentMode::Inactive;
        }

        let open_positions = self.store.get_open_trades(&config.id).await?.len();
        let realized_pnl = self.store.realized_pnl(&config.id).await?;
        let paper_balance = self.store.paper_wallet(&config.id).await?.balance;
        Ok(AgentSummary {
            config,
            status,
            open_positions,
            realized_pnl,
            paper_balance,
        })
    }

    /// Ids of agents whose runner is starting, running or stopping.
    pub async fn running_agents(&self) -> Vec<AgentId> {
        let agents = self.agents.read().await;
        let mut ids: Vec<AgentId> = agents
            .iter()
            .filter(|(_, e)| {
                matches!(
                    e.status.borrow().state,
                    AgentState::Starting | AgentState::Running | AgentState::Stopping
                )
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    // ==================== Trades ====================

    /// Mark a stopped agent's open trade cancelled with zero P&L.
    pub async fn cancel_trade(&self, id: &AgentId, trade_id: &str) -> SupervisorResult<()> {
        self.load(id).await?;
        let entry = self.entry(id).await;
        let _slot = {
            let slot = entry.lifecycle.lock().await;
            if slot.as_ref().is_some_and(RunningAgent::is_live) {
                return Err(SupervisorError::AlreadyRunning(id.clone()));
            }
            slot
        };

        let owned = self
            .store
            .get_open_trades(id)
            .await?
            .iter()
            .any(|t| t.trade_id == trade_id);
        if !owned || !self.store.cancel_trade(trade_id, CloseReason::Manual).await? {
            return Err(PersistenceError::NotFound {
                entity: "open trade",
                id: trade_id.to_string(),
            }
            .into());
        }

        info!(agent = %id, trade = %trade_id, "Trade cancelled");
        Ok(())
    }

    /// Refill an agent's simulated bankroll, optionally to a new amount.
    ///
    /// Safe while the agent runs: balance changes commit together with the
    /// trade rows that cause them.
    pub async fn reset_paper_wallet(
        &self,
        id: &AgentId,
        amount: Option<Decimal>,
    ) -> SupervisorResult<PaperWallet> {
        self.load(id).await?;
        if amount.is_some_and(|a| a < Decimal::ZERO) {
            return Err(SupervisorError::InvalidConfig(
                "paper balance must not be negative".to_string(),
            ));
        }
        let wallet = self.store.reset_paper_wallet(id, amount).await?;
        info!(agent = %id, balance = %wallet.balance, "Paper wallet reset");
        Ok(wallet)
    }

    // ==================== Shutdown ====================

    /// Cancel every live agent and wait up to `limit` for all of them.
    ///
    /// Stragglers are aborted. Persisted modes are left alone so the next
    /// process resumes the same agents.
    pub async fn shutdown(&self, limit: Duration) -> ShutdownReport {
        self.closed.store(true, Ordering::SeqCst);

        let entries: Vec<(AgentId, Arc<AgentEntry>)> = self
            .agents
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();

        let mut live = Vec::new();
        for (id, entry) in entries {
            let running = entry.lifecycle.lock().await.take();
            if let Some(running) = running.filter(RunningAgent::is_live) {
                running.cancel_tx.send_replace(true);
                live.push((id, entry, running));
            }
        }

        info!(agents = live.len(), "Stopping all agents");
        let handles = live.iter_mut().map(|(_, _, r)| &mut r.handle);
        if timeout(limit, join_all(handles)).await.is_err() {
            warn!(waited = ?limit, "Shutdown deadline reached");
        }

        let mut report = ShutdownReport::default();
        for (id, entry, running) in live {
            if running.handle.is_finished() {
                report.stopped.push(id);
            } else {
                running.handle.abort();
                entry.status.send_modify(|s| {
                    s.state = AgentState::Stopped;
                    s.last_error = Some("aborted at shutdown".to_string());
                });
                report.timed_out.push(id);
            }
        }
        report
    }
}
