//! Agent performance: aggregate statistics and periodic snapshots.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::AgentId;

/// Aggregate statistics over an agent's closed trades.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentPerformance {
    // === Counts ===
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,

    // === P&L ===
    /// Sum of positive realized P&L
    pub gross_profit: Decimal,

    /// Sum of negative realized P&L (absolute value)
    pub gross_loss: Decimal,

    /// Net realized P&L in USDC
    pub net_pnl: Decimal,

    /// Total USDC committed across closed trades
    pub total_volume: Decimal,

    // === Ratios ===
    /// Win rate in percent (0 to 100)
    pub win_rate: f64,

    /// Gross profit / gross loss; 0 when there are no losses
    pub profit_factor: f64,

    pub avg_win: Decimal,
    pub avg_loss: Decimal,

    // === Risk ===
    /// Standard deviation of per-trade realized P&L
    pub pnl_std_dev: f64,

    /// Largest peak-to-trough fall of cumulative realized P&L, in USDC
    pub max_drawdown: Decimal,
}

impl fmt::Display for AgentPerformance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Closed Trades:  {}", self.total_trades)?;
        writeln!(f, "Winning:        {}", self.winning_trades)?;
        writeln!(f, "Losing:         {}", self.losing_trades)?;
        writeln!(f, "Win Rate:       {:.1}%", self.win_rate)?;
        writeln!(f, "Net P&L:        ${:.2}", self.net_pnl)?;
        writeln!(f, "Gross Profit:   ${:.2}", self.gross_profit)?;
        writeln!(f, "Gross Loss:     ${:.2}", self.gross_loss)?;
        writeln!(f, "Avg Win:        ${:.2}", self.avg_win)?;
        writeln!(f, "Avg Loss:       ${:.2}", self.avg_loss)?;
        writeln!(f, "Profit Factor:  {:.2}", self.profit_factor)?;
        writeln!(f, "P&L Std Dev:    {:.2}", self.pnl_std_dev)?;
        write!(f, "Max Drawdown:   ${:.2}", self.max_drawdown)
    }
}

/// Granularity tag of a stored snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Hourly,
    Daily,
    Weekly,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Hourly => "hourly",
            SnapshotKind::Daily => "daily",
            SnapshotKind::Weekly => "weekly",
        }
    }
}

impl FromStr for SnapshotKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(SnapshotKind::Hourly),
            "daily" => Ok(SnapshotKind::Daily),
            "weekly" => Ok(SnapshotKind::Weekly),
            other => Err(format!("unknown snapshot kind '{}'", other)),
        }
    }
}

/// Point-in-time performance of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub agent_id: AgentId,
    pub taken_at: DateTime<Utc>,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub net_pnl: Decimal,

    /// Percent (0 to 100)
    pub win_rate: f64,
    pub kind: SnapshotKind,
}

impl PerformanceSnapshot {
    pub fn from_performance(
        agent_id: AgentId,
        performance: &AgentPerformance,
        taken_at: DateTime<Utc>,
        kind: SnapshotKind,
    ) -> Self {
        Self {
            agent_id,
            taken_at,
            total_trades: performance.total_trades,
            winning_trades: performance.winning_trades,
            net_pnl: performance.net_pnl,
            win_rate: performance.win_rate,
            kind,
        }
    }
}

/// Look-back period for snapshot history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryPeriod {
    Day,
    Week,
    Month,
    Quarter,
    Year,
    Max,
}

impl HistoryPeriod {
    /// Start of the period ending at `now`; `None` for unbounded.
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let span = match self {
            HistoryPeriod::Day => Duration::hours(24),
            HistoryPeriod::Week => Duration::weeks(1),
            HistoryPeriod::Month => Duration::days(30),
            HistoryPeriod::Quarter => Duration::days(90),
            HistoryPeriod::Year => Duration::days(365),
            HistoryPeriod::Max => return None,
        };
        Some(now - span)
    }
}

impl FromStr for HistoryPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "24h" | "1d" => Ok(HistoryPeriod::Day),
            "1w" => Ok(HistoryPeriod::Week),
            "1m" => Ok(HistoryPeriod::Month),
            "3m" => Ok(HistoryPeriod::Quarter),
            "1y" => Ok(HistoryPeriod::Year),
            "max" | "all" => Ok(HistoryPeriod::Max),
            other => Err(format!(
                "unknown period '{}' (expected 24h, 1w, 1m, 3m, 1y or max)",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_period_bounds() {
        let now = Utc::now();
        assert_eq!(HistoryPeriod::Day.since(now), Some(now - Duration::hours(24)));
        assert_eq!(HistoryPeriod::Quarter.since(now), Some(now - Duration::days(90)));
        assert_eq!(HistoryPeriod::Max.since(now), None);
    }

    #[test]
    fn test_history_period_parse() {
        assert_eq!("24h".parse::<HistoryPeriod>().unwrap(), HistoryPeriod::Day);
        assert_eq!("3M".parse::<HistoryPeriod>().unwrap(), HistoryPeriod::Quarter);
        assert!("2w".parse::<HistoryPeriod>().is_err());
    }
}
