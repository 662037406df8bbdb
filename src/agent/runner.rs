//! Polling loop for one agent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::db::PersistenceGateway;
use crate::error::{AgentError, FeedError, OrderError};
use crate::metrics::PerformanceCalculator;
use crate::models::{AgentId, AgentMode, PerformanceSnapshot, SnapshotKind};

use super::{AgentBehavior, AgentState, AgentStatus, CancelSignal};

/// Timing and fault policy for runners.
#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    pub poll_interval: Duration,
    pub snapshot_interval: Duration,
    /// Consecutive cycles lost to store failures before the agent faults
    pub persistence_fault_threshold: u32,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            snapshot_interval: Duration::from_secs(3600),
            persistence_fault_threshold: 5,
        }
    }
}

impl RunnerSettings {
    fn snapshot_kind(&self) -> SnapshotKind {
        let secs = self.snapshot_interval.as_secs();
        if secs >= 7 * 86_400 {
            SnapshotKind::Weekly
        } else if secs >= 86_400 {
            SnapshotKind::Daily
        } else {
            SnapshotKind::Hourly
        }
    }
}

enum Verdict {
    Continue,
    Fault,
}

/// Drives one behavior: initialize, then poll until cancelled or faulted.
pub struct AgentRunner {
    agent_id: AgentId,
    mode: AgentMode,
    behavior: Box<dyn AgentBehavior>,
    store: Arc<dyn PersistenceGateway>,
    status: Arc<watch::Sender<AgentStatus>>,
    cancel: CancelSignal,
    settings: RunnerSettings,
}

impl AgentRunner {
    pub fn new(
        agent_id: AgentId,
        mode: AgentMode,
        behavior: Box<dyn AgentBehavior>,
        store: Arc<dyn PersistenceGateway>,
        status: Arc<watch::Sender<AgentStatus>>,
        cancel: CancelSignal,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            agent_id,
            mode,
            behavior,
            store,
            status,
            cancel,
            settings,
        }
    }

    /// Run to completion and return the final state (`Stopped` or `Faulted`).
    pub async fn run(self) -> AgentState {
        let span = info_span!("agent", id = %self.agent_id);
        self.run_loop().instrument(span).await
    }

    async fn run_loop(mut self) -> AgentState {
        let mode = self.mode;
        self.status.send_modify(|s| {
            *s = AgentStatus {
                state: AgentState::Starting,
                mode,
                restarting: s.restarting,
                ..Default::default()
            };
        });

        if let Err(e) = self.behavior.initialize().await {
            error!(error = %e, "Agent failed to initialize");
            return self.fault(&e);
        }

        let open_positions = self.behavior.open_positions();
        self.status.send_modify(|s| {
            s.state = AgentState::Running;
            s.open_positions = open_positions;
        });
        info!(mode = %mode, poll_secs = self.settings.poll_interval.as_secs_f64(), "Agent running");

        let mut store_failures = 0u32;
        let mut next_snapshot = Instant::now() + self.settings.snapshot_interval;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.behavior.run_cycle(&mut self.cancel).await {
                Ok(report) if report.cancelled => break,
                Ok(_) => {
                    store_failures = 0;
                    let open_positions = self.behavior.open_positions();
                    self.status.send_modify(|s| {
                        s.cycles += 1;
                        s.last_poll_at = Some(Utc::now());
                        s.open_positions = open_positions;
                        s.last_error = None;
                    });
                }
                Err(e) => {
                    if let Verdict::Fault = self.classify(&e, &mut store_failures) {
                        return self.fault(&e);
                    }
                    self.status.send_modify(|s| {
                        s.cycles += 1;
                        s.last_error = Some(e.to_string());
                    });
                }
            }

            if Instant::now() >= next_snapshot {
                self.snapshot().await;
                next_snapshot = Instant::now() + self.settings.snapshot_interval;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = sleep(self.settings.poll_interval) => {}
            }
        }

        self.status.send_modify(|s| s.enter(AgentState::Stopping));
        self.snapshot().await;
        self.status.send_modify(|s| s.enter(AgentState::Stopped));
        info!("Agent stopped");
        AgentState::Stopped
    }

    /// Decide whether a failed cycle is survivable.
    fn classify(&self, err: &AgentError, store_failures: &mut u32) -> Verdict {
        match err {
            AgentError::Feed(FeedError::Unavailable { .. }) => {
                warn!(error = %err, "Feed unavailable, skipping cycle");
                Verdict::Continue
            }
            AgentError::Feed(FeedError::QueryFailed(_)) => {
                error!(error = %err, "Feed query failed, faulting agent");
                Verdict::Fault
            }
            AgentError::Persistence(_) => {
                *store_failures += 1;
                if *store_failures >= self.settings.persistence_fault_threshold {
                    error!(
                        error = %err,
                        failures = *store_failures,
                        "Store keeps failing, faulting agent"
                    );
                    Verdict::Fault
                } else {
                    warn!(error = %err, failures = *store_failures, "Store write failed, cycle aborted");
                    Verdict::Continue
                }
            }
            AgentError::Order(OrderError::Unavailable(_)) | AgentError::Order(OrderError::Rejected(_)) => {
                warn!(error = %err, "Order routing failed, cycle aborted");
                Verdict::Continue
            }
            AgentError::Initialization(_) => Verdict::Fault,
        }
    }

    fn fault(&self, err: &AgentError) -> AgentState {
        let message = err.to_string();
        self.status.send_modify(|s| {
            s.state = AgentState::Faulted;
            s.last_error = Some(message);
        });
        AgentState::Faulted
    }

    async fn snapshot(&self) {
        let trades = match self.store.get_closed_trades(&self.agent_id, None).await {
            Ok(trades) => trades,
            Err(e) => {
                warn!(error = %e, "Failed to load trades for snapshot");
                return;
            }
        };

        let performance = PerformanceCalculator::calculate(&trades);
        let snapshot = PerformanceSnapshot::from_performance(
            self.agent_id.clone(),
            &performance,
            Utc::now(),
            self.settings.snapshot_kind(),
        );

        match self.store.insert_snapshot(&snapshot).await {
            Ok(()) => debug!(
                trades = snapshot.total_trades,
                net_pnl = %snapshot.net_pnl,
                "Performance snapshot saved"
            ),
            Err(e) => warn!(error = %e, "Failed to save performance snapshot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::testing::{Plan, StubBehavior};
    use std::sync::atomic::Ordering;

    fn settings() -> RunnerSettings {
        RunnerSettings {
            poll_interval: Duration::from_millis(10),
            snapshot_interval: Duration::from_secs(3600),
            persistence_fault_threshold: 3,
        }
    }

    async fn runner(
        plan: Plan,
    ) -> (
        AgentRunner,
        watch::Sender<bool>,
        Arc<watch::Sender<AgentStatus>>,
        Arc<std::sync::atomic::AtomicU32>,
        Arc<Database>,
    ) {
        let store = Arc::new(Database::in_memory().await.unwrap());
        let (behavior, cycles) = StubBehavior::new(plan);
        let status = Arc::new(watch::Sender::new(AgentStatus::default()));
        let (cancel_tx, cancel) = CancelSignal::channel();
        let runner = AgentRunner::new(
            AgentId::from("agt_runner"),
            AgentMode::Simulated,
            Box::new(behavior),
            store.clone(),
            status.clone(),
            cancel,
            settings(),
        );
        (runner, cancel_tx, status, cycles, store)
    }

    #[tokio::test]
    async fn test_polls_until_cancelled() {
        let (runner, cancel_tx, status, cycles, store) = runner(Plan::Idle).await;
        let handle = tokio::spawn(runner.run());

        sleep(Duration::from_millis(60)).await;
        assert_eq!(status.borrow().state, AgentState::Running);

        cancel_tx.send_replace(true);
        assert_eq!(handle.await.unwrap(), AgentState::Stopped);
        assert_eq!(status.borrow().state, AgentState::Stopped);
        assert!(cycles.load(Ordering::SeqCst) >= 2);
        assert!(status.borrow().last_poll_at.is_some());

        // Final snapshot on the way out
        let snapshots = store
            .get_snapshots(&AgentId::from("agt_runner"), None)
            .await
            .unwrap();
        assert_eq!(snapshots.len(), 1);
    }

    #[tokio::test]
    async fn test_initialization_error_faults() {
        let (runner, _cancel_tx, status, cycles, _store) = runner(Plan::FailInit).await;
        assert_eq!(runner.run().await, AgentState::Faulted);

        let status = status.borrow();
        assert_eq!(status.state, AgentState::Faulted);
        assert!(status.last_error.as_deref().unwrap().contains("unresolvable"));
        assert_eq!(cycles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_query_failure_faults() {
        let (runner, _cancel_tx, status, cycles, _store) = runner(Plan::BadQuery).await;
        assert_eq!(runner.run().await, AgentState::Faulted);
        assert_eq!(status.borrow().state, AgentState::Faulted);
        assert_eq!(cycles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_feed_outage_keeps_running() {
        let (runner, cancel_tx, status, cycles, _store) = runner(Plan::FeedDown).await;
        let handle = tokio::spawn(runner.run());

        sleep(Duration::from_millis(60)).await;
        {
            let status = status.borrow();
            assert_eq!(status.state, AgentState::Running);
            assert!(status.last_error.is_some());
        }
        assert!(cycles.load(Ordering::SeqCst) >= 2);

        cancel_tx.send_replace(true);
        assert_eq!(handle.await.unwrap(), AgentState::Stopped);
    }

    #[tokio::test]
    async fn test_repeated_store_failures_fault() {
        let (runner, _cancel_tx, status, cycles, _store) = runner(Plan::StoreDown).await;
        assert_eq!(runner.run().await, AgentState::Faulted);
        assert_eq!(cycles.load(Ordering::SeqCst), 3);
        assert_eq!(status.borrow().state, AgentState::Faulted);
    }

    #[test]
    fn test_snapshot_kind_follows_interval() {
        let mut settings = settings();
        assert_eq!(settings.snapshot_kind(), SnapshotKind::Hourly);
        settings.snapshot_interval = Duration::from_secs(86_400);
        assert_eq!(settings.snapshot_kind(), SnapshotKind::Daily);
        settings.snapshot_interval = Duration::from_secs(7 * 86_400);
        assert_eq!(settings.snapshot_kind(), SnapshotKind::Weekly);
    }
}
