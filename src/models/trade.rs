//! Mirrored positions and their closed records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::AgentId;

/// Lifecycle status of a mirrored trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Open,
    Closed,
    Cancelled,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "open",
            TradeStatus::Closed => "closed",
            TradeStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(TradeStatus::Open),
            "closed" => Ok(TradeStatus::Closed),
            "cancelled" => Ok(TradeStatus::Cancelled),
            other => Err(format!("unknown trade status '{}'", other)),
        }
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a mirrored position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloseReason {
    /// The source participant closed the position
    SourceClosed,
    /// Forced close on an adverse move
    StopLoss,
    /// Operator action
    Manual,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::SourceClosed => "source-closed",
            CloseReason::StopLoss => "stop-loss",
            CloseReason::Manual => "manual",
        }
    }
}

impl FromStr for CloseReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source-closed" => Ok(CloseReason::SourceClosed),
            "stop-loss" => Ok(CloseReason::StopLoss),
            "manual" => Ok(CloseReason::Manual),
            other => Err(format!("unknown close reason '{}'", other)),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A currently mirrored position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    /// Local trade id (primary key in the store)
    pub trade_id: String,
    pub agent_id: AgentId,

    /// Source trade this position mirrors; unique per agent
    pub source_trade_ref: String,

    /// Order reference returned by the router
    pub order_ref: String,

    pub market_id: String,
    pub outcome: String,
    pub label: String,
    pub entry_price: Decimal,

    /// Bet amount in USDC
    pub amount: Decimal,
    pub opened_at: DateTime<Utc>,
    pub simulated: bool,
}

impl OpenPosition {
    /// Realized P&L of liquidating at `exit_price`.
    ///
    /// The bet bought `amount / entry` shares; they are sold at `exit`.
    /// `None` when the result does not fit a decimal.
    pub fn pnl_at(&self, exit_price: Decimal) -> Option<Decimal> {
        if self.entry_price.is_zero() {
            return Some(Decimal::ZERO);
        }
        exit_price
            .checked_div(self.entry_price)?
            .checked_sub(Decimal::ONE)?
            .checked_mul(self.amount)
    }

    /// Unrealized loss as a percentage of entry; negative when in profit.
    pub fn loss_pct_at(&self, current_price: Decimal) -> Option<Decimal> {
        if self.entry_price.is_zero() {
            return Some(Decimal::ZERO);
        }
        self.entry_price
            .checked_sub(current_price)?
            .checked_div(self.entry_price)?
            .checked_mul(Decimal::ONE_HUNDRED)
    }

    /// Same instrument as another market/outcome pair.
    pub fn is_instrument(&self, market_id: &str, outcome: &str) -> bool {
        self.market_id == market_id && self.outcome.eq_ignore_ascii_case(outcome)
    }

    pub fn close(
        self,
        exit_price: Decimal,
        closed_at: DateTime<Utc>,
        reason: CloseReason,
    ) -> Option<ClosedTrade> {
        let realized_pnl = self.pnl_at(exit_price)?;
        Some(ClosedTrade {
            position: self,
            exit_price,
            closed_at,
            realized_pnl,
            status: TradeStatus::Closed,
            reason,
        })
    }
}

/// Immutable record of a position that left the open set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position: OpenPosition,
    pub exit_price: Decimal,
    pub closed_at: DateTime<Utc>,
    pub realized_pnl: Decimal,
    pub status: TradeStatus,
    pub reason: CloseReason,
}

impl ClosedTrade {
    pub fn is_win(&self) -> bool {
        self.realized_pnl > Decimal::ZERO
    }
}
