//! Durable state for every agent.
//!
//! Stores everything needed to resume after restart:
//! - Agent configuration and last requested mode
//! - Mirrored trades, open and closed (unique per source trade)
//! - Feed cursors
//! - Performance snapshots
//! - Simulated (paper) wallet balances

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, Sqlite, SqlitePool, Transaction};

use crate::error::PersistenceError;
use crate::models::{
    AgentConfig, AgentFilter, AgentId, AgentKind, AgentUpdate, CloseReason, ClosedTrade,
    FeedCursor, OpenPosition, PaperWallet, PerformanceSnapshot, RiskLimits, SnapshotKind,
    TradeStatus, DEFAULT_PAPER_BALANCE,
};

type StoreResult<T> = std::result::Result<T, PersistenceError>;

/// Storage contract the engine relies on.
///
/// Writes are durable on return. Per agent there is at most one writer at a
/// time; every write is safe to repeat.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    // Agents
    async fn create_agent(&self, config: &AgentConfig) -> StoreResult<AgentId>;
    async fn update_agent(&self, id: &AgentId, update: &AgentUpdate) -> StoreResult<AgentConfig>;
    async fn get_agent(&self, id: &AgentId) -> StoreResult<AgentConfig>;
    async fn list_agents(&self, filter: &AgentFilter) -> StoreResult<Vec<AgentConfig>>;

    // Trades
    //
    // Simulated trades move the agent's paper balance in the same write:
    // opens debit the amount, closes credit the proceeds, cancels refund.

    /// Record a newly mirrored position; `false` if its source trade was already mirrored.
    async fn insert_open_trade(&self, position: &OpenPosition) -> StoreResult<bool>;
    async fn has_mirrored(&self, agent_id: &AgentId, source_trade_ref: &str) -> StoreResult<bool>;
    /// Move an open trade to closed; `false` if it was not open.
    async fn close_trade(
        &self,
        trade_id: &str,
        exit_price: Decimal,
        closed_at: DateTime<Utc>,
        realized_pnl: Decimal,
        reason: CloseReason,
    ) -> StoreResult<bool>;
    /// Move an open trade to cancelled with zero P&L; `false` if it was not open.
    async fn cancel_trade(&self, trade_id: &str, reason: CloseReason) -> StoreResult<bool>;
    async fn get_open_trades(&self, agent_id: &AgentId) -> StoreResult<Vec<OpenPosition>>;
    /// Closed and cancelled trades closed at or after `since`, oldest first.
    async fn get_closed_trades(
        &self,
        agent_id: &AgentId,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<ClosedTrade>>;
    async fn realized_pnl(&self, agent_id: &AgentId) -> StoreResult<Decimal>;

    // Cursors
    async fn save_cursor(&self, agent_id: &AgentId, cursor: &FeedCursor) -> StoreResult<()>;
    async fn load_cursor(&self, agent_id: &AgentId) -> StoreResult<Option<FeedCursor>>;

    // Performance
    async fn insert_snapshot(&self, snapshot: &PerformanceSnapshot) -> StoreResult<()>;
    async fn get_snapshots(
        &self,
        agent_id: &AgentId,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<PerformanceSnapshot>>;

    // Paper wallets
    /// Current wallet; an agent that never traded has a fresh default one.
    async fn paper_wallet(&self, agent_id: &AgentId) -> StoreResult<PaperWallet>;
    /// Set the balance back to `initial`, or to the wallet's current initial amount.
    async fn reset_paper_wallet(
        &self,
        agent_id: &AgentId,
        initial: Option<Decimal>,
    ) -> StoreResult<PaperWallet>;
    /// Sum of every agent's paper balance.
    async fn total_paper_balance(&self) -> StoreResult<Decimal>;
}

/// SQLite-backed [`PersistenceGateway`].
pub struct Database {
    pool: SqlitePool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct AgentRow {
    id: String,
    name: String,
    kind: String,
    mode: String,
    copy_ratio: String,
    min_trade_value: String,
    max_trade_value: String,
    stop_loss_percentage: String,
    max_daily_loss: String,
    notes: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct TradeRow {
    id: String,
    agent_id: String,
    source_trade_ref: String,
    order_ref: String,
    market_id: String,
    outcome: String,
    label: String,
    entry_price: String,
    amount: String,
    opened_at: i64,
    simulated: bool,
    status: String,
    exit_price: Option<String>,
    closed_at: Option<i64>,
    realized_pnl: Option<String>,
    close_reason: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct SnapshotRow {
    agent_id: String,
    taken_at: i64,
    total_trades: i64,
    winning_trades: i64,
    net_pnl: String,
    win_rate: f64,
    kind: String,
}

fn decimal(column: &'static str, value: &str) -> StoreResult<Decimal> {
    Decimal::from_str(value).map_err(|_| PersistenceError::Corrupt {
        column,
        value: value.to_string(),
    })
}

fn timestamp(column: &'static str, millis: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| PersistenceError::Corrupt {
            column,
            value: millis.to_string(),
        })
}

fn parsed<T: FromStr>(column: &'static str, value: &str) -> StoreResult<T> {
    value.parse().map_err(|_| PersistenceError::Corrupt {
        column,
        value: value.to_string(),
    })
}

impl TryFrom<AgentRow> for AgentConfig {
    type Error = PersistenceError;

    fn try_from(row: AgentRow) -> StoreResult<Self> {
        let kind: AgentKind =
            serde_json::from_str(&row.kind).map_err(|_| PersistenceError::Corrupt {
                column: "kind",
                value: row.kind.clone(),
            })?;

        Ok(AgentConfig {
            id: AgentId::from(row.id),
            name: row.name,
            kind,
            mode: parsed("mode", &row.mode)?,
            limits: RiskLimits {
                copy_ratio: decimal("copy_ratio", &row.copy_ratio)?,
                min_trade_value: decimal("min_trade_value", &row.min_trade_value)?,
                max_trade_value: decimal("max_trade_value", &row.max_trade_value)?,
                stop_loss_percentage: decimal("stop_loss_percentage", &row.stop_loss_percentage)?,
                max_daily_loss: decimal("max_daily_loss", &row.max_daily_loss)?,
            },
            notes: row.notes,
            created_at: timestamp("created_at", row.created_at)?,
            updated_at: timestamp("updated_at", row.updated_at)?,
        })
    }
}

impl TradeRow {
    fn into_position(self) -> StoreResult<OpenPosition> {
        Ok(OpenPosition {
            trade_id: self.id,
            agent_id: AgentId::from(self.agent_id),
            source_trade_ref: self.source_trade_ref,
            order_ref: self.order_ref,
            market_id: self.market_id,
            outcome: self.outcome,
            label: self.label,
            entry_price: decimal("entry_price", &self.entry_price)?,
            amount: decimal("amount", &self.amount)?,
            opened_at: timestamp("opened_at", self.opened_at)?,
            simulated: self.simulated,
        })
    }

    fn into_closed(self) -> StoreResult<ClosedTrade> {
        let status: TradeStatus = parsed("status", &self.status)?;
        let exit_price = self
            .exit_price
            .as_deref()
            .map(|v| decimal("exit_price", v))
            .transpose()?
            .unwrap_or(Decimal::ZERO);
        let realized_pnl = self
            .realized_pnl
            .as_deref()
            .map(|v| decimal("realized_pnl", v))
            .transpose()?
            .unwrap_or(Decimal::ZERO);
        let closed_at = match self.closed_at {
            Some(ms) => timestamp("closed_at", ms)?,
            None => timestamp("opened_at", self.opened_at)?,
        };
        let reason = match self.close_reason.as_deref() {
            Some(r) => parsed("close_reason", r)?,
            None => CloseReason::Manual,
        };

        Ok(ClosedTrade {
            position: self.into_position()?,
            exit_price,
            closed_at,
            realized_pnl,
            status,
            reason,
        })
    }
}

impl TryFrom<SnapshotRow> for PerformanceSnapshot {
    type Error = PersistenceError;

    fn try_from(row: SnapshotRow) -> StoreResult<Self> {
        Ok(PerformanceSnapshot {
            agent_id: AgentId::from(row.agent_id),
            taken_at: timestamp("taken_at", row.taken_at)?,
            total_trades: row.total_trades.max(0) as u32,
            winning_trades: row.winning_trades.max(0) as u32,
            net_pnl: decimal("net_pnl", &row.net_pnl)?,
            win_rate: row.win_rate,
            kind: parsed::<SnapshotKind>("kind", &row.kind)?,
        })
    }
}

const TRADE_COLUMNS: &str = "id, agent_id, source_trade_ref, order_ref, market_id, outcome, label, \
     entry_price, amount, opened_at, simulated, status, exit_price, closed_at, realized_pnl, \
     close_reason";

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(database_url, 5).await
    }

    /// Private in-memory database; one connection so every query sees the same data.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations()
            .await
            .context("Failed to run database migrations")?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> StoreResult<()> {
        // Agent configuration
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                mode TEXT NOT NULL DEFAULT 'inactive',
                copy_ratio TEXT NOT NULL,
                min_trade_value TEXT NOT NULL,
                max_trade_value TEXT NOT NULL,
                stop_loss_percentage TEXT NOT NULL,
                max_daily_loss TEXT NOT NULL,
                notes TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Mirrored trades; one row per (agent, source trade)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                source_trade_ref TEXT NOT NULL,
                order_ref TEXT NOT NULL,
                market_id TEXT NOT NULL,
                outcome TEXT NOT NULL,
                label TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                amount TEXT NOT NULL,
                opened_at INTEGER NOT NULL,
                simulated INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'open',
                exit_price TEXT,
                closed_at INTEGER,
                realized_pnl TEXT,
                close_reason TEXT,
                UNIQUE (agent_id, source_trade_ref)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_trades_agent_status ON trades (agent_id, status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_trades_agent_closed ON trades (agent_id, closed_at)",
        )
        .execute(&self.pool)
        .await?;

        // Feed cursors
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_cursors (
                agent_id TEXT PRIMARY KEY,
                occurred_at INTEGER NOT NULL,
                event_id TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Performance snapshots
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS performance_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                taken_at INTEGER NOT NULL,
                total_trades INTEGER NOT NULL,
                winning_trades INTEGER NOT NULL,
                net_pnl TEXT NOT NULL,
                win_rate REAL NOT NULL,
                kind TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_snapshots_agent ON performance_snapshots (agent_id, taken_at)",
        )
        .execute(&self.pool)
        .await?;

        // Paper wallets; rows appear on first simulated trade or reset
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS paper_wallets (
                agent_id TEXT PRIMARY KEY,
                initial_balance TEXT NOT NULL,
                balance TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Move an agent's paper balance by `delta` inside `tx`.
    async fn adjust_paper_balance(
        tx: &mut Transaction<'_, Sqlite>,
        agent_id: &str,
        delta: Decimal,
    ) -> StoreResult<()> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT balance FROM paper_wallets WHERE agent_id = ?")
                .bind(agent_id)
                .fetch_optional(&mut **tx)
                .await?;

        let balance = match row {
            Some((value,)) => decimal("balance", &value)?,
            None => DEFAULT_PAPER_BALANCE,
        };
        let next = balance
            .checked_add(delta)
            .ok_or_else(|| PersistenceError::Corrupt {
                column: "balance",
                value: format!("{} + {}", balance, delta),
            })?;

        sqlx::query(
            r#"
            INSERT INTO paper_wallets (agent_id, initial_balance, balance, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(agent_id) DO UPDATE SET
                balance = excluded.balance,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(agent_id)
        .bind(DEFAULT_PAPER_BALANCE.to_string())
        .bind(next.to_string())
        .bind(Utc::now().timestamp_millis())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn write_agent(&self, config: &AgentConfig) -> StoreResult<()> {
        let kind = serde_json::to_string(&config.kind).map_err(|_| PersistenceError::Corrupt {
            column: "kind",
            value: format!("{:?}", config.kind),
        })?;

        sqlx::query(
            r#"
            UPDATE agents SET
                name = ?, kind = ?, mode = ?, copy_ratio = ?, min_trade_value = ?,
                max_trade_value = ?, stop_loss_percentage = ?, max_daily_loss = ?,
                notes = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&config.name)
        .bind(kind)
        .bind(config.mode.as_str())
        .bind(config.limits.copy_ratio.to_string())
        .bind(config.limits.min_trade_value.to_string())
        .bind(config.limits.max_trade_value.to_string())
        .bind(config.limits.stop_loss_percentage.to_string())
        .bind(config.limits.max_daily_loss.to_string())
        .bind(&config.notes)
        .bind(config.updated_at.timestamp_millis())
        .bind(config.id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_trade_final(
        &self,
        trade_id: &str,
        status: TradeStatus,
        exit_price: Option<Decimal>,
        closed_at: DateTime<Utc>,
        realized_pnl: Decimal,
        reason: CloseReason,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let open: Option<(String, String, bool)> = sqlx::query_as(
            "SELECT agent_id, amount, simulated FROM trades WHERE id = ? AND status = 'open'",
        )
        .bind(trade_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((agent_id, amount, simulated)) = open else {
            return Ok(false);
        };

        sqlx::query(
            r#"
            UPDATE trades SET
                status = ?, exit_price = ?, closed_at = ?, realized_pnl = ?, close_reason = ?
            WHERE id = ? AND status = 'open'
            "#,
        )
        .bind(status.as_str())
        .bind(exit_price.map(|p| p.to_string()))
        .bind(closed_at.timestamp_millis())
        .bind(realized_pnl.to_string())
        .bind(reason.as_str())
        .bind(trade_id)
        .execute(&mut *tx)
        .await?;

        if simulated {
            // Sale proceeds; a cancellation carries zero P&L and refunds the stake
            let amount = decimal("amount", &amount)?;
            let proceeds = amount
                .checked_add(realized_pnl)
                .unwrap_or(amount)
                .max(Decimal::ZERO);
            Self::adjust_paper_balance(&mut tx, &agent_id, proceeds).await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl PersistenceGateway for Database {
    // ==================== Agents ====================

    async fn create_agent(&self, config: &AgentConfig) -> StoreResult<AgentId> {
        let kind = serde_json::to_string(&config.kind).map_err(|_| PersistenceError::Corrupt {
            column: "kind",
            value: format!("{:?}", config.kind),
        })?;

        sqlx::query(
            r#"
            INSERT INTO agents (
                id, name, kind, mode, copy_ratio, min_trade_value, max_trade_value,
                stop_loss_percentage, max_daily_loss, notes, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(config.id.as_str())
        .bind(&config.name)
        .bind(kind)
        .bind(config.mode.as_str())
        .bind(config.limits.copy_ratio.to_string())
        .bind(config.limits.min_trade_value.to_string())
        .bind(config.limits.max_trade_value.to_string())
        .bind(config.limits.stop_loss_percentage.to_string())
        .bind(config.limits.max_daily_loss.to_string())
        .bind(&config.notes)
        .bind(config.created_at.timestamp_millis())
        .bind(config.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(config.id.clone())
    }

    async fn update_agent(&self, id: &AgentId, update: &AgentUpdate) -> StoreResult<AgentConfig> {
        let current = self.get_agent(id).await?;
        let next = update.apply(&current);
        self.write_agent(&next).await?;
        Ok(next)
    }

    async fn get_agent(&self, id: &AgentId) -> StoreResult<AgentConfig> {
        let row: Option<AgentRow> = sqlx::query_as("SELECT * FROM agents WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| PersistenceError::NotFound {
            entity: "agent",
            id: id.to_string(),
        })?
        .try_into()
    }

    async fn list_agents(&self, filter: &AgentFilter) -> StoreResult<Vec<AgentConfig>> {
        let rows: Vec<AgentRow> = sqlx::query_as("SELECT * FROM agents ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;

        let mut agents = Vec::with_capacity(rows.len());
        for row in rows {
            let config = AgentConfig::try_from(row)?;
            if filter.matches(&config) {
                agents.push(config);
            }
        }
        Ok(agents)
    }

    // ==================== Trades ====================

    async fn insert_open_trade(&self, position: &OpenPosition) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO trades (
                id, agent_id, source_trade_ref, order_ref, market_id, outcome, label,
                entry_price, amount, opened_at, simulated, status
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'open')
            "#,
        )
        .bind(&position.trade_id)
        .bind(position.agent_id.as_str())
        .bind(&position.source_trade_ref)
        .bind(&position.order_ref)
        .bind(&position.market_id)
        .bind(&position.outcome)
        .bind(&position.label)
        .bind(position.entry_price.to_string())
        .bind(position.amount.to_string())
        .bind(position.opened_at.timestamp_millis())
        .bind(position.simulated)
        .execute(&mut *tx)
        .await?;

        let inserted = result.rows_affected() == 1;
        if inserted && position.simulated {
            Self::adjust_paper_balance(&mut tx, position.agent_id.as_str(), -position.amount)
                .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn has_mirrored(&self, agent_id: &AgentId, source_trade_ref: &str) -> StoreResult<bool> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM trades WHERE agent_id = ? AND source_trade_ref = ?",
        )
        .bind(agent_id.as_str())
        .bind(source_trade_ref)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.0 > 0)
    }

    async fn close_trade(
        &self,
        trade_id: &str,
        exit_price: Decimal,
        closed_at: DateTime<Utc>,
        realized_pnl: Decimal,
        reason: CloseReason,
    ) -> StoreResult<bool> {
        self.set_trade_final(
            trade_id,
            TradeStatus::Closed,
            Some(exit_price),
            closed_at,
            realized_pnl,
            reason,
        )
        .await
    }

    async fn cancel_trade(&self, trade_id: &str, reason: CloseReason) -> StoreResult<bool> {
        self.set_trade_final(
            trade_id,
            TradeStatus::Cancelled,
            None,
            Utc::now(),
            Decimal::ZERO,
            reason,
        )
        .await
    }

    async fn get_open_trades(&self, agent_id: &AgentId) -> StoreResult<Vec<OpenPosition>> {
        let rows: Vec<TradeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM trades WHERE agent_id = ? AND status = 'open' ORDER BY opened_at, id",
            TRADE_COLUMNS
        ))
        .bind(agent_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TradeRow::into_position).collect()
    }

    async fn get_closed_trades(
        &self,
        agent_id: &AgentId,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<ClosedTrade>> {
        let since_ms = since.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN);

        let rows: Vec<TradeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM trades \
             WHERE agent_id = ? AND status != 'open' AND closed_at >= ? \
             ORDER BY closed_at, id",
            TRADE_COLUMNS
        ))
        .bind(agent_id.as_str())
        .bind(since_ms)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TradeRow::into_closed).collect()
    }

    async fn realized_pnl(&self, agent_id: &AgentId) -> StoreResult<Decimal> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT realized_pnl FROM trades \
             WHERE agent_id = ? AND status = 'closed' AND realized_pnl IS NOT NULL",
        )
        .bind(agent_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|(v,)| decimal("realized_pnl", v))
            .sum::<StoreResult<Decimal>>()
    }

    // ==================== Cursors ====================

    async fn save_cursor(&self, agent_id: &AgentId, cursor: &FeedCursor) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO feed_cursors (agent_id, occurred_at, event_id, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(agent_id) DO UPDATE SET
                occurred_at = excluded.occurred_at,
                event_id = excluded.event_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(agent_id.as_str())
        .bind(cursor.occurred_at.timestamp_millis())
        .bind(&cursor.event_id)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_cursor(&self, agent_id: &AgentId) -> StoreResult<Option<FeedCursor>> {
        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT occurred_at, event_id FROM feed_cursors WHERE agent_id = ?",
        )
        .bind(agent_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(ms, event_id)| {
            Ok(FeedCursor {
                occurred_at: timestamp("occurred_at", ms)?,
                event_id,
            })
        })
        .transpose()
    }

    // ==================== Performance ====================

    async fn insert_snapshot(&self, snapshot: &PerformanceSnapshot) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO performance_snapshots (
                agent_id, taken_at, total_trades, winning_trades, net_pnl, win_rate, kind
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(snapshot.agent_id.as_str())
        .bind(snapshot.taken_at.timestamp_millis())
        .bind(snapshot.total_trades as i64)
        .bind(snapshot.winning_trades as i64)
        .bind(snapshot.net_pnl.to_string())
        .bind(snapshot.win_rate)
        .bind(snapshot.kind.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_snapshots(
        &self,
        agent_id: &AgentId,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<PerformanceSnapshot>> {
        let since_ms = since.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN);

        let rows: Vec<SnapshotRow> = sqlx::query_as(
            "SELECT agent_id, taken_at, total_trades, winning_trades, net_pnl, win_rate, kind \
             FROM performance_snapshots WHERE agent_id = ? AND taken_at >= ? \
             ORDER BY taken_at, id",
        )
        .bind(agent_id.as_str())
        .bind(since_ms)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PerformanceSnapshot::try_from).collect()
    }

    // ==================== Paper wallets ====================

    async fn paper_wallet(&self, agent_id: &AgentId) -> StoreResult<PaperWallet> {
        let row: Option<(String, String, i64)> = sqlx::query_as(
            "SELECT initial_balance, balance, updated_at FROM paper_wallets WHERE agent_id = ?",
        )
        .bind(agent_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((initial, balance, updated_at)) => Ok(PaperWallet {
                agent_id: agent_id.clone(),
                initial: decimal("initial_balance", &initial)?,
                balance: decimal("balance", &balance)?,
                updated_at: timestamp("updated_at", updated_at)?,
            }),
            None => Ok(PaperWallet::fresh(agent_id.clone(), Utc::now())),
        }
    }

    async fn reset_paper_wallet(
        &self,
        agent_id: &AgentId,
        initial: Option<Decimal>,
    ) -> StoreResult<PaperWallet> {
        let current = self.paper_wallet(agent_id).await?;
        let initial = initial.unwrap_or(current.initial);
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO paper_wallets (agent_id, initial_balance, balance, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(agent_id) DO UPDATE SET
                initial_balance = excluded.initial_balance,
                balance = excluded.balance,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(agent_id.as_str())
        .bind(initial.to_string())
        .bind(initial.to_string())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(PaperWallet {
            agent_id: agent_id.clone(),
            initial,
            balance: initial,
            updated_at: now,
        })
    }

    async fn total_paper_balance(&self) -> StoreResult<Decimal> {
        let rows: Vec<(Option<String>,)> = sqlx::query_as(
            "SELECT w.balance FROM agents a LEFT JOIN paper_wallets w ON w.agent_id = a.id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|(balance,)| match balance {
                Some(value) => decimal("balance", value),
                None => Ok(DEFAULT_PAPER_BALANCE),
            })
            .sum::<StoreResult<Decimal>>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentMode;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn position(agent: &AgentConfig, trade_id: &str, source: &str) -> OpenPosition {
        OpenPosition {
            trade_id: trade_id.to_string(),
            agent_id: agent.id.clone(),
            source_trade_ref: source.to_string(),
            order_ref: format!("sim-{}", trade_id),
            market_id: "0xm".to_string(),
            outcome: "Yes".to_string(),
            label: "Will it rain?".to_string(),
            entry_price: dec!(0.50),
            amount: dec!(100),
            opened_at: Utc::now(),
            simulated: true,
        }
    }

    async fn setup() -> (Database, AgentConfig) {
        let db = Database::in_memory().await.unwrap();
        let agent = AgentConfig::copy("whale watcher", "0xabc");
        db.create_agent(&agent).await.unwrap();
        (db, agent)
    }

    #[tokio::test]
    async fn test_agent_round_trip_and_update() {
        let (db, agent) = setup().await;

        let loaded = db.get_agent(&agent.id).await.unwrap();
        assert_eq!(loaded.name, agent.name);
        assert_eq!(loaded.kind, agent.kind);
        assert_eq!(loaded.limits, agent.limits);
        assert_eq!(loaded.mode, AgentMode::Inactive);

        let update = AgentUpdate {
            mode: Some(AgentMode::Simulated),
            max_trade_value: Some(dec!(750)),
            ..Default::default()
        };
        let updated = db.update_agent(&agent.id, &update).await.unwrap();
        assert_eq!(updated.mode, AgentMode::Simulated);

        let reloaded = db.get_agent(&agent.id).await.unwrap();
        assert_eq!(reloaded.limits.max_trade_value, dec!(750));
        assert_eq!(reloaded.mode, AgentMode::Simulated);
    }

    #[tokio::test]
    async fn test_missing_agent_not_found() {
        let (db, _) = setup().await;
        let err = db.get_agent(&AgentId::from("agt_missing")).await.unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_agents_filtered() {
        let (db, _) = setup().await;
        let mut live = AgentConfig::copy("live one", "0xdef");
        live.mode = AgentMode::Live;
        db.create_agent(&live).await.unwrap();

        let all = db.list_agents(&AgentFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_live = db
            .list_agents(&AgentFilter {
                mode: Some(AgentMode::Live),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(only_live.len(), 1);
        assert_eq!(only_live[0].id, live.id);
    }

    #[tokio::test]
    async fn test_open_trade_is_unique_per_source() {
        let (db, agent) = setup().await;

        assert!(db.insert_open_trade(&position(&agent, "t1", "src1")).await.unwrap());
        // Same source trade under a different local id
        assert!(!db.insert_open_trade(&position(&agent, "t2", "src1")).await.unwrap());
        assert!(db.has_mirrored(&agent.id, "src1").await.unwrap());
        assert!(!db.has_mirrored(&agent.id, "src2").await.unwrap());

        let open = db.get_open_trades(&agent.id).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].trade_id, "t1");
        assert_eq!(open[0].entry_price, dec!(0.50));
    }

    #[tokio::test]
    async fn test_close_trade_only_once() {
        let (db, agent) = setup().await;
        db.insert_open_trade(&position(&agent, "t1", "src1")).await.unwrap();

        let closed_at = Utc::now();
        assert!(db
            .close_trade("t1", dec!(0.44), closed_at, dec!(-12), CloseReason::StopLoss)
            .await
            .unwrap());
        assert!(!db
            .close_trade("t1", dec!(0.40), closed_at, dec!(-20), CloseReason::SourceClosed)
            .await
            .unwrap());

        assert!(db.get_open_trades(&agent.id).await.unwrap().is_empty());

        let closed = db.get_closed_trades(&agent.id, None).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].realized_pnl, dec!(-12));
        assert_eq!(closed[0].exit_price, dec!(0.44));
        assert_eq!(closed[0].reason, CloseReason::StopLoss);
        assert_eq!(closed[0].status, TradeStatus::Closed);
        assert_eq!(db.realized_pnl(&agent.id).await.unwrap(), dec!(-12));
    }

    #[tokio::test]
    async fn test_closed_trades_window() {
        let (db, agent) = setup().await;
        db.insert_open_trade(&position(&agent, "old", "s-old")).await.unwrap();
        db.insert_open_trade(&position(&agent, "new", "s-new")).await.unwrap();

        let now = Utc::now();
        db.close_trade("old", dec!(0.3), now - Duration::hours(30), dec!(-40), CloseReason::SourceClosed)
            .await
            .unwrap();
        db.close_trade("new", dec!(0.6), now - Duration::hours(1), dec!(20), CloseReason::SourceClosed)
            .await
            .unwrap();

        let recent = db
            .get_closed_trades(&agent.id, Some(now - Duration::hours(24)))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].position.trade_id, "new");

        let all = db.get_closed_trades(&agent.id, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].position.trade_id, "old");
        assert_eq!(db.realized_pnl(&agent.id).await.unwrap(), dec!(-20));
    }

    #[tokio::test]
    async fn test_cancelled_trade_excluded_from_pnl() {
        let (db, agent) = setup().await;
        db.insert_open_trade(&position(&agent, "t1", "src1")).await.unwrap();

        assert!(db.cancel_trade("t1", CloseReason::Manual).await.unwrap());
        assert!(!db.cancel_trade("t1", CloseReason::Manual).await.unwrap());

        let closed = db.get_closed_trades(&agent.id, None).await.unwrap();
        assert_eq!(closed[0].status, TradeStatus::Cancelled);
        assert_eq!(db.realized_pnl(&agent.id).await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_cursor_upsert() {
        let (db, agent) = setup().await;
        assert!(db.load_cursor(&agent.id).await.unwrap().is_none());

        let first = FeedCursor {
            occurred_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            event_id: "a".to_string(),
        };
        db.save_cursor(&agent.id, &first).await.unwrap();

        let second = FeedCursor {
            occurred_at: Utc.timestamp_millis_opt(1_700_000_005_000).unwrap(),
            event_id: "b".to_string(),
        };
        db.save_cursor(&agent.id, &second).await.unwrap();

        assert_eq!(db.load_cursor(&agent.id).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_snapshots_by_period() {
        let (db, agent) = setup().await;
        let now = Utc::now();

        for hours_ago in [48, 2, 1] {
            db.insert_snapshot(&PerformanceSnapshot {
                agent_id: agent.id.clone(),
                taken_at: now - Duration::hours(hours_ago),
                total_trades: 4,
                winning_trades: 3,
                net_pnl: dec!(12.5),
                win_rate: 75.0,
                kind: SnapshotKind::Hourly,
            })
            .await
            .unwrap();
        }

        let day = db
            .get_snapshots(&agent.id, Some(now - Duration::hours(24)))
            .await
            .unwrap();
        assert_eq!(day.len(), 2);
        assert_eq!(day[0].net_pnl, dec!(12.5));
        assert_eq!(day[0].kind, SnapshotKind::Hourly);

        assert_eq!(db.get_snapshots(&agent.id, None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_paper_wallet_tracks_simulated_trades() {
        let (db, agent) = setup().await;
        let fresh = db.paper_wallet(&agent.id).await.unwrap();
        assert_eq!(fresh.balance, DEFAULT_PAPER_BALANCE);

        db.insert_open_trade(&position(&agent, "t1", "src1")).await.unwrap();
        db.insert_open_trade(&position(&agent, "t2", "src2")).await.unwrap();
        assert_eq!(db.paper_wallet(&agent.id).await.unwrap().balance, dec!(800));

        // A duplicate insert moves nothing
        db.insert_open_trade(&position(&agent, "t3", "src1")).await.unwrap();
        assert_eq!(db.paper_wallet(&agent.id).await.unwrap().balance, dec!(800));

        // Proceeds of 125 on a 100 stake
        db.close_trade("t1", dec!(0.625), Utc::now(), dec!(25), CloseReason::SourceClosed)
            .await
            .unwrap();
        assert_eq!(db.paper_wallet(&agent.id).await.unwrap().balance, dec!(925));

        db.cancel_trade("t2", CloseReason::Manual).await.unwrap();
        let wallet = db.paper_wallet(&agent.id).await.unwrap();
        assert_eq!(wallet.balance, dec!(1025));
        assert_eq!(wallet.change(), dec!(25));

        // A second close of the same trade credits nothing
        db.close_trade("t1", dec!(0.9), Utc::now(), dec!(80), CloseReason::SourceClosed)
            .await
            .unwrap();
        assert_eq!(db.paper_wallet(&agent.id).await.unwrap().balance, dec!(1025));
    }

    #[tokio::test]
    async fn test_live_trades_leave_paper_wallet_alone() {
        let (db, agent) = setup().await;
        let mut live = position(&agent, "t1", "src1");
        live.simulated = false;

        db.insert_open_trade(&live).await.unwrap();
        db.close_trade("t1", dec!(0.2), Utc::now(), dec!(-60), CloseReason::StopLoss)
            .await
            .unwrap();
        assert_eq!(db.paper_wallet(&agent.id).await.unwrap().balance, DEFAULT_PAPER_BALANCE);
    }

    #[tokio::test]
    async fn test_reset_paper_wallet() {
        let (db, agent) = setup().await;
        let other = AgentConfig::copy("second", "0xdef");
        db.create_agent(&other).await.unwrap();

        let wallet = db.reset_paper_wallet(&agent.id, Some(dec!(500))).await.unwrap();
        assert_eq!(wallet.initial, dec!(500));
        assert_eq!(wallet.balance, dec!(500));

        db.insert_open_trade(&position(&agent, "t1", "src1")).await.unwrap();
        assert_eq!(db.paper_wallet(&agent.id).await.unwrap().balance, dec!(400));
        assert_eq!(db.total_paper_balance().await.unwrap(), dec!(400) + DEFAULT_PAPER_BALANCE);

        let wallet = db.reset_paper_wallet(&agent.id, None).await.unwrap();
        assert_eq!(wallet.balance, dec!(500));
        assert_eq!(db.paper_wallet(&agent.id).await.unwrap().initial, dec!(500));
    }
}
