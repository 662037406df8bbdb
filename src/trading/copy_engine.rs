//! Copy-mirroring behavior: follows one participant's activity feed and
//! mirrors their opens and closes onto the agent's account.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentBehavior, BehaviorFactory, CancelSignal, CycleReport};
use crate::api::{ActivityFeed, OrderFill, OrderIntent, OrderRouter, OrderSide, SimulatedRouter};
use crate::db::PersistenceGateway;
use crate::error::{AgentError, OrderError};
use crate::models::{
    ActivityEvent, ActivityKind, AgentConfig, AgentMode, CloseReason, FeedCursor, MarketInfo,
    OpenPosition,
};

use super::risk_guard::{RiskDecision, RiskGuard, RiskState};

/// (market_id, lowercase outcome)
type Instrument = (String, String);

fn instrument(market_id: &str, outcome: &str) -> Instrument {
    (market_id.to_string(), outcome.to_lowercase())
}

/// Outcome of handing one order to the router.
enum Submitted {
    Filled(OrderFill),
    Rejected(String),
    /// Cancellation arrived before the router answered
    Cancelled,
}

/// Outcome of trying to liquidate one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseOutcome {
    Closed,
    /// Still open; retried on a later cycle
    Kept,
    /// The store no longer had it open; dropped without touching risk state
    Stale,
    Cancelled,
}

/// A fill whose trade row has not been written yet.
#[derive(Debug, Clone)]
struct PendingFill {
    amount: Decimal,
    fill: OrderFill,
}

/// Mirrors one target participant.
///
/// Owns the agent's open positions and feed cursor while it runs. The store
/// stays the source of truth: every in-memory change follows a durable write.
pub struct CopyMirror {
    config: AgentConfig,
    mode: AgentMode,
    feed: Arc<dyn ActivityFeed>,
    store: Arc<dyn PersistenceGateway>,
    router: Option<Arc<dyn OrderRouter>>,

    participant: Option<String>,
    cursor: Option<FeedCursor>,

    // Keyed by source trade ref
    positions: HashMap<String, OpenPosition>,
    risk: RiskState,
    limit_hit: bool,

    // market_id -> label
    labels: HashMap<String, String>,

    // Keyed by client ref; a retried order reuses its fill instead of resubmitting
    unrecorded: HashMap<String, PendingFill>,
}

impl CopyMirror {
    pub fn new(
        config: AgentConfig,
        mode: AgentMode,
        feed: Arc<dyn ActivityFeed>,
        store: Arc<dyn PersistenceGateway>,
        router: Option<Arc<dyn OrderRouter>>,
    ) -> Self {
        Self {
            config,
            mode,
            feed,
            store,
            router,
            participant: None,
            cursor: None,
            positions: HashMap::new(),
            risk: RiskState::default(),
            limit_hit: false,
            labels: HashMap::new(),
            unrecorded: HashMap::new(),
        }
    }

    fn router(&self) -> Result<Arc<dyn OrderRouter>, AgentError> {
        self.router
            .clone()
            .ok_or_else(|| AgentError::Initialization("no order router configured".to_string()))
    }

    /// Route `intent` unless an earlier submit of the same order already
    /// filled and only its store write failed.
    async fn submit(
        &mut self,
        intent: &OrderIntent,
        amount: Decimal,
        cancel: &mut CancelSignal,
    ) -> Result<Submitted, AgentError> {
        if let Some(pending) = self.unrecorded.get(&intent.client_ref) {
            debug!(order = %pending.fill.order_ref, "Reusing fill of an unrecorded order");
            return Ok(Submitted::Filled(pending.fill.clone()));
        }

        let router = self.router()?;
        let submitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Submitted::Cancelled),
            submitted = router.submit(intent) => submitted,
        };

        match submitted {
            Ok(fill) => {
                self.unrecorded.insert(
                    intent.client_ref.clone(),
                    PendingFill {
                        amount,
                        fill: fill.clone(),
                    },
                );
                Ok(Submitted::Filled(fill))
            }
            Err(OrderError::Rejected(reason)) => Ok(Submitted::Rejected(reason)),
            Err(e) => Err(e.into()),
        }
    }

    /// Log transitions across the daily loss limit.
    fn refresh_limit(&mut self, now: DateTime<Utc>) {
        self.risk.expire(now);
        let hit = self.risk.limit_reached(&self.config.limits, now);
        if hit && !self.limit_hit {
            warn!(
                agent = %self.config.id,
                trailing_loss = %self.risk.trailing_loss(now),
                limit = %self.config.limits.max_daily_loss,
                "Daily loss limit reached, new opens paused"
            );
        } else if !hit && self.limit_hit {
            info!(agent = %self.config.id, "Daily loss back under limit, opens resumed");
        }
        self.limit_hit = hit;
    }

    /// Event label, then cached or fetched market label, then a placeholder.
    /// `None` when cancelled during the lookup.
    async fn resolve_label(
        &mut self,
        event: &ActivityEvent,
        cancel: &mut CancelSignal,
    ) -> Option<String> {
        if let Some(label) = event.label.as_ref().filter(|l| !l.trim().is_empty()) {
            self.labels
                .insert(event.market_id.clone(), label.clone());
            return Some(label.clone());
        }
        if let Some(label) = self.labels.get(&event.market_id) {
            return Some(label.clone());
        }

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            fetched = self.feed.fetch_market_info(&event.market_id) => fetched,
        };
        match fetched {
            Ok(info) => {
                if let Some(label) = info.label.filter(|l| !l.trim().is_empty()) {
                    self.labels.insert(event.market_id.clone(), label.clone());
                    return Some(label);
                }
            }
            Err(e) => debug!(market = %event.market_id, error = %e, "Market label lookup failed"),
        }

        Some(format!("Market {}", event.market_id))
    }

    async fn handle_open(
        &mut self,
        event: &ActivityEvent,
        report: &mut CycleReport,
        cancel: &mut CancelSignal,
    ) -> Result<(), AgentError> {
        if self.positions.contains_key(&event.source_trade_ref)
            || self
                .store
                .has_mirrored(&self.config.id, &event.source_trade_ref)
                .await?
        {
            debug!(source = %event.source_trade_ref, "Source trade already mirrored");
            report.duplicates += 1;
            return Ok(());
        }

        if event.price <= Decimal::ZERO {
            warn!(source = %event.source_trade_ref, price = %event.price, "Skipping open without a usable price");
            return Ok(());
        }

        let client_ref =
            OrderIntent::client_ref_for(&self.config.id, &event.source_trade_ref, OrderSide::Buy);
        let now = Utc::now();

        // An order that already filled is recorded as sized, whatever the limits say now
        let amount = match self.unrecorded.get(&client_ref) {
            Some(pending) => pending.amount,
            None => {
                let amount = match RiskGuard::evaluate(&self.config.limits, &self.risk, event.amount, now) {
                    RiskDecision::Accept(amount) => amount,
                    RiskDecision::Reject(reason) => {
                        info!(
                            agent = %self.config.id,
                            source = %event.source_trade_ref,
                            source_amount = %event.amount,
                            reason = %reason,
                            "Trade rejected"
                        );
                        report.rejected += 1;
                        return Ok(());
                    }
                };

                if self.mode == AgentMode::Simulated {
                    let wallet = self.store.paper_wallet(&self.config.id).await?;
                    if wallet.balance < amount {
                        info!(
                            agent = %self.config.id,
                            source = %event.source_trade_ref,
                            amount = %amount,
                            balance = %wallet.balance,
                            "Trade rejected, paper balance too low"
                        );
                        report.rejected += 1;
                        return Ok(());
                    }
                }
                amount
            }
        };

        let Some(label) = self.resolve_label(event, cancel).await else {
            report.cancelled = true;
            return Ok(());
        };
        let intent = OrderIntent {
            market_id: event.market_id.clone(),
            outcome: event.outcome.clone(),
            side: OrderSide::Buy,
            amount,
            price: event.price,
            client_ref,
        };

        let fill = match self.submit(&intent, amount, cancel).await? {
            Submitted::Filled(fill) => fill,
            Submitted::Rejected(reason) => {
                warn!(
                    agent = %self.config.id,
                    source = %event.source_trade_ref,
                    reason = %reason,
                    "Open order rejected, skipping source trade"
                );
                return Ok(());
            }
            Submitted::Cancelled => {
                report.cancelled = true;
                return Ok(());
            }
        };

        let position = OpenPosition {
            trade_id: uuid::Uuid::new_v4().to_string(),
            agent_id: self.config.id.clone(),
            source_trade_ref: event.source_trade_ref.clone(),
            order_ref: fill.order_ref,
            market_id: event.market_id.clone(),
            outcome: event.outcome.clone(),
            label,
            entry_price: fill.price,
            amount,
            opened_at: now,
            simulated: fill.simulated,
        };

        let inserted = self.store.insert_open_trade(&position).await?;
        self.unrecorded.remove(&intent.client_ref);
        if !inserted {
            report.duplicates += 1;
            return Ok(());
        }

        info!(
            agent = %self.config.id,
            market = %position.label,
            outcome = %position.outcome,
            amount = %position.amount,
            price = %position.entry_price,
            simulated = position.simulated,
            "Mirrored open"
        );
        self.positions
            .insert(position.source_trade_ref.clone(), position);
        report.opened += 1;
        Ok(())
    }

    async fn handle_close(
        &mut self,
        event: &ActivityEvent,
        report: &mut CycleReport,
        cancel: &mut CancelSignal,
    ) -> Result<(), AgentError> {
        // Exact source match first, else every position on the instrument
        let mut refs: Vec<String> = if self.positions.contains_key(&event.source_trade_ref) {
            vec![event.source_trade_ref.clone()]
        } else {
            self.positions
                .values()
                .filter(|p| p.is_instrument(&event.market_id, &event.outcome))
                .map(|p| p.source_trade_ref.clone())
                .collect()
        };

        if refs.is_empty() {
            debug!(source = %event.source_trade_ref, "Close for an unmirrored position");
            return Ok(());
        }
        refs.sort();

        for source_ref in refs {
            match self
                .close_position(&source_ref, event.price, CloseReason::SourceClosed, cancel)
                .await?
            {
                CloseOutcome::Closed => report.closed += 1,
                CloseOutcome::Cancelled => {
                    report.cancelled = true;
                    return Ok(());
                }
                CloseOutcome::Kept | CloseOutcome::Stale => {}
            }
        }
        Ok(())
    }

    /// Liquidate one position at `price`.
    async fn close_position(
        &mut self,
        source_ref: &str,
        price: Decimal,
        reason: CloseReason,
        cancel: &mut CancelSignal,
    ) -> Result<CloseOutcome, AgentError> {
        let Some(position) = self.positions.get(source_ref).cloned() else {
            return Ok(CloseOutcome::Stale);
        };

        let Some(expected_pnl) = position.pnl_at(price) else {
            warn!(
                agent = %self.config.id,
                trade = %position.trade_id,
                price = %price,
                "Exit price out of range, position kept open"
            );
            return Ok(CloseOutcome::Kept);
        };
        let proceeds = position
            .amount
            .checked_add(expected_pnl)
            .unwrap_or(position.amount)
            .max(Decimal::ZERO);

        let intent = OrderIntent {
            market_id: position.market_id.clone(),
            outcome: position.outcome.clone(),
            side: OrderSide::Sell,
            amount: proceeds,
            price,
            client_ref: OrderIntent::client_ref_for(
                &self.config.id,
                &position.source_trade_ref,
                OrderSide::Sell,
            ),
        };

        let fill = match self.submit(&intent, proceeds, cancel).await? {
            Submitted::Filled(fill) => fill,
            Submitted::Rejected(msg) => {
                error!(
                    agent = %self.config.id,
                    trade = %position.trade_id,
                    reason = %msg,
                    "Close order rejected, position kept open"
                );
                return Ok(CloseOutcome::Kept);
            }
            Submitted::Cancelled => return Ok(CloseOutcome::Cancelled),
        };

        let closed_at = Utc::now();
        let pnl = position.pnl_at(fill.price).unwrap_or(expected_pnl);
        let applied = self
            .store
            .close_trade(&position.trade_id, fill.price, closed_at, pnl, reason)
            .await?;
        self.unrecorded.remove(&intent.client_ref);
        self.positions.remove(source_ref);

        if !applied {
            warn!(
                agent = %self.config.id,
                trade = %position.trade_id,
                "Trade was no longer open in the store, dropped without recording P&L"
            );
            return Ok(CloseOutcome::Stale);
        }

        info!(
            agent = %self.config.id,
            market = %position.label,
            entry = %position.entry_price,
            exit = %fill.price,
            pnl = %pnl,
            reason = %reason,
            "Closed mirrored position"
        );
        self.risk.record(closed_at, pnl);
        self.refresh_limit(closed_at);
        Ok(CloseOutcome::Closed)
    }

    /// Force-close positions past the stop-loss threshold.
    async fn stop_loss_pass(
        &mut self,
        observed: &HashMap<Instrument, Decimal>,
        report: &mut CycleReport,
        cancel: &mut CancelSignal,
    ) -> Result<(), AgentError> {
        if self.config.limits.stop_loss_percentage.is_zero() || self.positions.is_empty() {
            return Ok(());
        }

        let mut candidates: Vec<OpenPosition> = self.positions.values().cloned().collect();
        candidates.sort_by(|a, b| {
            a.opened_at
                .cmp(&b.opened_at)
                .then_with(|| a.source_trade_ref.cmp(&b.source_trade_ref))
        });

        let mut quotes: HashMap<String, Option<MarketInfo>> = HashMap::new();
        for position in candidates {
            let key = instrument(&position.market_id, &position.outcome);
            let price = match observed.get(&key) {
                Some(price) => Some(*price),
                None => {
                    if !quotes.contains_key(&position.market_id) {
                        let fetched = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                report.cancelled = true;
                                return Ok(());
                            }
                            fetched = self.feed.fetch_market_info(&position.market_id) => fetched,
                        };
                        let info = match fetched {
                            Ok(info) => Some(info),
                            Err(e) => {
                                debug!(market = %position.market_id, error = %e, "No quote for stop-loss check");
                                None
                            }
                        };
                        quotes.insert(position.market_id.clone(), info);
                    }
                    quotes
                        .get(&position.market_id)
                        .and_then(|info| info.as_ref())
                        .and_then(|info| info.price_of(&position.outcome))
                }
            };

            let Some(price) = price else {
                continue;
            };

            if RiskGuard::stop_loss_triggered(&self.config.limits, &position, price) {
                warn!(
                    agent = %self.config.id,
                    market = %position.label,
                    entry = %position.entry_price,
                    current = %price,
                    loss_pct = %position.loss_pct_at(price).unwrap_or_default().round_dp(2),
                    "Stop-loss triggered"
                );
                match self
                    .close_position(&position.source_trade_ref, price, CloseReason::StopLoss, cancel)
                    .await?
                {
                    CloseOutcome::Closed => report.stop_losses += 1,
                    CloseOutcome::Cancelled => {
                        report.cancelled = true;
                        return Ok(());
                    }
                    CloseOutcome::Kept | CloseOutcome::Stale => {}
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AgentBehavior for CopyMirror {
    async fn initialize(&mut self) -> Result<(), AgentError> {
        let participant = self
            .config
            .target_participant()
            .map_err(AgentError::Initialization)?;

        if self.mode == AgentMode::Live && self.router.is_none() {
            return Err(AgentError::Initialization(
                "live mode requires an order API key".to_string(),
            ));
        }

        let cursor = match self.store.load_cursor(&self.config.id).await? {
            Some(cursor) => cursor,
            None => {
                // First run: mirror from now on, not the participant's history
                let cursor = FeedCursor::at(Utc::now());
                self.store.save_cursor(&self.config.id, &cursor).await?;
                cursor
            }
        };

        let open = self.store.get_open_trades(&self.config.id).await?;
        self.positions = open
            .into_iter()
            .map(|p| (p.source_trade_ref.clone(), p))
            .collect();

        let now = Utc::now();
        let recent = self
            .store
            .get_closed_trades(&self.config.id, Some(now - RiskState::window()))
            .await?;
        self.risk = RiskState::from_closed(&recent, now);
        self.refresh_limit(now);

        info!(
            agent = %self.config.id,
            participant = %participant,
            mode = %self.mode,
            open_positions = self.positions.len(),
            cursor = %cursor.occurred_at,
            "Copy agent initialized"
        );

        self.participant = Some(participant);
        self.cursor = Some(cursor);
        Ok(())
    }

    async fn run_cycle(&mut self, cancel: &mut CancelSignal) -> Result<CycleReport, AgentError> {
        let (Some(participant), Some(cursor)) = (self.participant.clone(), self.cursor.clone())
        else {
            return Err(AgentError::Initialization("agent not initialized".to_string()));
        };

        let events = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(CycleReport::cancelled()),
            fetched = self.feed.fetch_activity(&participant, &cursor) => fetched?,
        };

        let mut report = CycleReport {
            events: events.len(),
            ..Default::default()
        };
        self.refresh_limit(Utc::now());

        let mut observed: HashMap<Instrument, Decimal> = HashMap::new();
        for event in &events {
            if !event.is_after(&cursor) {
                continue;
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if event.price > Decimal::ZERO {
                observed.insert(instrument(&event.market_id, &event.outcome), event.price);
            }

            match event.kind {
                ActivityKind::Open => self.handle_open(event, &mut report, cancel).await?,
                ActivityKind::Close => self.handle_close(event, &mut report, cancel).await?,
            }
            if report.cancelled {
                break;
            }

            let position = event.position();
            self.store.save_cursor(&self.config.id, &position).await?;
            self.cursor = Some(position);
        }

        if report.cancelled {
            debug!(agent = %self.config.id, "Cycle interrupted by cancellation");
            return Ok(report);
        }
        self.stop_loss_pass(&observed, &mut report, cancel).await?;

        if report.events > 0 {
            debug!(
                agent = %self.config.id,
                events = report.events,
                opened = report.opened,
                closed = report.closed,
                stop_losses = report.stop_losses,
                rejected = report.rejected,
                "Cycle complete"
            );
        }
        Ok(report)
    }

    fn open_positions(&self) -> usize {
        self.positions.len()
    }
}

/// Builds [`CopyMirror`] behaviors wired to the shared feed, store and router.
pub struct CopyBehaviorFactory {
    feed: Arc<dyn ActivityFeed>,
    store: Arc<dyn PersistenceGateway>,
    live_router: Option<Arc<dyn OrderRouter>>,
}

impl CopyBehaviorFactory {
    pub fn new(
        feed: Arc<dyn ActivityFeed>,
        store: Arc<dyn PersistenceGateway>,
        live_router: Option<Arc<dyn OrderRouter>>,
    ) -> Self {
        Self {
            feed,
            store,
            live_router,
        }
    }
}

impl BehaviorFactory for CopyBehaviorFactory {
    fn build(&self, config: &AgentConfig, mode: AgentMode) -> Box<dyn AgentBehavior> {
        let router: Option<Arc<dyn OrderRouter>> = match mode {
            AgentMode::Simulated => Some(Arc::new(SimulatedRouter)),
            AgentMode::Live => self.live_router.clone(),
            AgentMode::Inactive => None,
        };
        Box::new(CopyMirror::new(
            config.clone(),
            mode,
            self.feed.clone(),
            self.store.clone(),
            router,
        ))
    }
}
