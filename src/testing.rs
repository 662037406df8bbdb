//! Shared fixtures for engine tests: an in-process feed and a store that fails on demand.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;

use crate::agent::{AgentBehavior, BehaviorFactory, CancelSignal, CycleReport};
use crate::api::{ActivityFeed, OrderFill, OrderIntent, OrderRouter};
use crate::db::{Database, PersistenceGateway};
use crate::error::{AgentError, FeedError, OrderError, PersistenceError};
use crate::models::{
    ActivityEvent, ActivityKind, AgentConfig, AgentFilter, AgentId, AgentMode, AgentUpdate,
    CloseReason, ClosedTrade, FeedCursor, MarketInfo, OpenPosition, PaperWallet,
    PerformanceSnapshot,
};

pub const TARGET: &str = "0x00000000000000000000000000000000000000aa";

/// Fixed origin for event timestamps.
pub fn t0() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

pub fn open_event(id: &str, secs: i64, amount: Decimal, price: Decimal) -> ActivityEvent {
    ActivityEvent {
        event_id: id.to_string(),
        source_trade_ref: id.to_string(),
        kind: ActivityKind::Open,
        market_id: "0xmarket".to_string(),
        outcome: "Yes".to_string(),
        amount,
        price,
        label: Some("Will it rain?".to_string()),
        occurred_at: t0() + Duration::seconds(secs),
    }
}

pub fn close_event(id: &str, closes: &str, secs: i64, price: Decimal) -> ActivityEvent {
    ActivityEvent {
        event_id: id.to_string(),
        source_trade_ref: closes.to_string(),
        kind: ActivityKind::Close,
        market_id: "0xmarket".to_string(),
        outcome: "Yes".to_string(),
        amount: Decimal::ZERO,
        price,
        label: None,
        occurred_at: t0() + Duration::seconds(secs),
    }
}

/// Upstream stand-in: a growing activity history plus queued failures.
#[derive(Default)]
pub struct ScriptedFeed {
    history: Mutex<Vec<ActivityEvent>>,
    failures: Mutex<VecDeque<FeedError>>,
    markets: Mutex<HashMap<String, MarketInfo>>,
    stall_markets: AtomicBool,
    pub fetches: AtomicU32,
}

impl ScriptedFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, event: ActivityEvent) {
        self.history.lock().unwrap().push(event);
    }

    pub fn fail_next(&self, error: FeedError) {
        self.failures.lock().unwrap().push_back(error);
    }

    /// Market lookups never answer from now on.
    pub fn stall_market_info(&self) {
        self.stall_markets.store(true, Ordering::SeqCst);
    }

    pub fn set_price(&self, market_id: &str, outcome: &str, price: Decimal) {
        let mut markets = self.markets.lock().unwrap();
        let info = markets.entry(market_id.to_string()).or_insert_with(|| MarketInfo {
            market_id: market_id.to_string(),
            label: Some("Will it rain?".to_string()),
            prices: HashMap::new(),
        });
        info.prices.insert(outcome.to_string(), price);
    }
}

#[async_trait]
impl ActivityFeed for ScriptedFeed {
    async fn fetch_activity(
        &self,
        _participant: &str,
        since: &FeedCursor,
    ) -> Result<Vec<ActivityEvent>, FeedError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut events: Vec<ActivityEvent> = self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.is_after(since))
            .cloned()
            .collect();
        events.sort_by(|a, b| a.position().cmp(&b.position()));
        Ok(events)
    }

    async fn fetch_market_info(&self, market_id: &str) -> Result<MarketInfo, FeedError> {
        if self.stall_markets.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.markets
            .lock()
            .unwrap()
            .get(market_id)
            .cloned()
            .ok_or_else(|| FeedError::QueryFailed(format!("unknown market {}", market_id)))
    }
}

/// Store wrapper that fails selected writes a set number of times.
pub struct FlakyStore {
    inner: Database,
    pub fail_inserts: AtomicU32,
    pub fail_cursor_saves: AtomicU32,
    pub fail_closes: AtomicU32,
}

impl FlakyStore {
    pub async fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Database::in_memory().await.unwrap(),
            fail_inserts: AtomicU32::new(0),
            fail_cursor_saves: AtomicU32::new(0),
            fail_closes: AtomicU32::new(0),
        })
    }

    fn trip(counter: &AtomicU32) -> Result<(), PersistenceError> {
        let tripped = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(PersistenceError::Database(sqlx::Error::PoolTimedOut))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PersistenceGateway for FlakyStore {
    async fn create_agent(&self, config: &AgentConfig) -> Result<AgentId, PersistenceError> {
        self.inner.create_agent(config).await
    }

    async fn update_agent(
        &self,
        id: &AgentId,
        update: &AgentUpdate,
    ) -> Result<AgentConfig, PersistenceError> {
        self.inner.update_agent(id, update).await
    }

    async fn get_agent(&self, id: &AgentId) -> Result<AgentConfig, PersistenceError> {
        self.inner.get_agent(id).await
    }

    async fn list_agents(&self, filter: &AgentFilter) -> Result<Vec<AgentConfig>, PersistenceError> {
        self.inner.list_agents(filter).await
    }

    async fn insert_open_trade(&self, position: &OpenPosition) -> Result<bool, PersistenceError> {
        Self::trip(&self.fail_inserts)?;
        self.inner.insert_open_trade(position).await
    }

    async fn has_mirrored(
        &self,
        agent_id: &AgentId,
        source_trade_ref: &str,
    ) -> Result<bool, PersistenceError> {
        self.inner.has_mirrored(agent_id, source_trade_ref).await
    }

    async fn close_trade(
        &self,
        trade_id: &str,
        exit_price: Decimal,
        closed_at: DateTime<Utc>,
        realized_pnl: Decimal,
        reason: CloseReason,
    ) -> Result<bool, PersistenceError> {
        Self::trip(&self.fail_closes)?;
        self.inner
            .close_trade(trade_id, exit_price, closed_at, realized_pnl, reason)
            .await
    }

    async fn cancel_trade(&self, trade_id: &str, reason: CloseReason) -> Result<bool, PersistenceError> {
        self.inner.cancel_trade(trade_id, reason).await
    }

    async fn get_open_trades(&self, agent_id: &AgentId) -> Result<Vec<OpenPosition>, PersistenceError> {
        self.inner.get_open_trades(agent_id).await
    }

    async fn get_closed_trades(
        &self,
        agent_id: &AgentId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ClosedTrade>, PersistenceError> {
        self.inner.get_closed_trades(agent_id, since).await
    }

    async fn realized_pnl(&self, agent_id: &AgentId) -> Result<Decimal, PersistenceError> {
        self.inner.realized_pnl(agent_id).await
    }

    async fn save_cursor(&self, agent_id: &AgentId, cursor: &FeedCursor) -> Result<(), PersistenceError> {
        Self::trip(&self.fail_cursor_saves)?;
        self.inner.save_cursor(agent_id, cursor).await
    }

    async fn load_cursor(&self, agent_id: &AgentId) -> Result<Option<FeedCursor>, PersistenceError> {
        self.inner.load_cursor(agent_id).await
    }

    async fn insert_snapshot(&self, snapshot: &PerformanceSnapshot) -> Result<(), PersistenceError> {
        self.inner.insert_snapshot(snapshot).await
    }

    async fn get_snapshots(
        &self,
        agent_id: &AgentId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PerformanceSnapshot>, PersistenceError> {
        self.inner.get_snapshots(agent_id, since).await
    }

    async fn paper_wallet(&self, agent_id: &AgentId) -> Result<PaperWallet, PersistenceError> {
        self.inner.paper_wallet(agent_id).await
    }

    async fn reset_paper_wallet(
        &self,
        agent_id: &AgentId,
        initial: Option<Decimal>,
    ) -> Result<PaperWallet, PersistenceError> {
        self.inner.reset_paper_wallet(agent_id, initial).await
    }

    async fn total_paper_balance(&self) -> Result<Decimal, PersistenceError> {
        self.inner.total_paper_balance().await
    }
}

/// Live venue stand-in that fills at the reference price and records every submit.
#[derive(Default)]
pub struct CountingRouter {
    /// Client refs in submission order
    pub submitted: Mutex<Vec<String>>,
    /// Submits never answer
    pub stall: AtomicBool,
}

impl CountingRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn submits(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

#[async_trait]
impl OrderRouter for CountingRouter {
    async fn submit(&self, intent: &OrderIntent) -> Result<OrderFill, OrderError> {
        self.submitted.lock().unwrap().push(intent.client_ref.clone());
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(OrderFill {
            order_ref: format!("live-{}", intent.client_ref),
            price: intent.price,
            simulated: false,
        })
    }
}

/// Create an agent mirroring [`TARGET`] whose cursor sits at [`t0`].
pub async fn seeded_agent(store: &dyn PersistenceGateway) -> AgentConfig {
    let config = AgentConfig::copy("test agent", TARGET);
    store.create_agent(&config).await.unwrap();
    store
        .save_cursor(&config.id, &FeedCursor::at(t0()))
        .await
        .unwrap();
    config
}

/// How a [`StubBehavior`] acts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Plan {
    /// Every cycle succeeds immediately
    #[default]
    Idle,
    /// Initialization fails
    FailInit,
    /// A cycle never returns and ignores cancellation
    Hang,
    /// Every cycle reports a non-transient feed error
    BadQuery,
    /// Every cycle reports a transient feed error
    FeedDown,
    /// Every cycle reports a store failure
    StoreDown,
}

pub struct StubBehavior {
    plan: Plan,
    cycles: Arc<AtomicU32>,
}

#[async_trait]
impl AgentBehavior for StubBehavior {
    async fn initialize(&mut self) -> Result<(), AgentError> {
        match self.plan {
            Plan::FailInit => Err(AgentError::Initialization("unresolvable participant".to_string())),
            _ => Ok(()),
        }
    }

    async fn run_cycle(&mut self, _cancel: &mut CancelSignal) -> Result<CycleReport, AgentError> {
        self.cycles.fetch_add(1, Ordering::SeqCst);
        match self.plan {
            Plan::Idle | Plan::FailInit => Ok(CycleReport::default()),
            Plan::Hang => std::future::pending().await,
            Plan::BadQuery => Err(FeedError::QueryFailed("unknown participant".to_string()).into()),
            Plan::FeedDown => Err(FeedError::Unavailable {
                attempts: 5,
                reason: "timeout".to_string(),
            }
            .into()),
            Plan::StoreDown => Err(PersistenceError::Database(sqlx::Error::PoolTimedOut).into()),
        }
    }

    fn open_positions(&self) -> usize {
        0
    }
}

impl StubBehavior {
    pub fn new(plan: Plan) -> (Self, Arc<AtomicU32>) {
        let cycles = Arc::new(AtomicU32::new(0));
        (
            Self {
                plan,
                cycles: cycles.clone(),
            },
            cycles,
        )
    }
}

/// Builds [`StubBehavior`]s, with a per-agent plan keyed by agent name.
#[derive(Default)]
pub struct StubFactory {
    plans: Mutex<HashMap<String, Plan>>,
    pub built: AtomicU32,
    pub cycles: Arc<AtomicU32>,
}

impl StubFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_plan(&self, agent_name: &str, plan: Plan) {
        self.plans.lock().unwrap().insert(agent_name.to_string(), plan);
    }
}

impl BehaviorFactory for StubFactory {
    fn build(&self, config: &AgentConfig, _mode: AgentMode) -> Box<dyn AgentBehavior> {
        self.built.fetch_add(1, Ordering::SeqCst);
        let plan = self
            .plans
            .lock()
            .unwrap()
            .get(&config.name)
            .copied()
            .unwrap_or_default();
        Box::new(StubBehavior {
            plan,
            cycles: self.cycles.clone(),
        })
    }
}
