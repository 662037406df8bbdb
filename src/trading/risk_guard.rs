//! Sizing and acceptance policy for mirrored trades.
//!
//! [`RiskGuard::evaluate`] is a pure function of the agent's limits, its
//! trailing realized losses and the source trade size. Stop-loss is a
//! separate check run against every open position each cycle.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use crate::models::{ClosedTrade, OpenPosition, RiskLimits, TradeStatus};

/// Why a trade intent was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    BelowMinimum,
    DailyLossLimit,
    /// Sizing the source amount overflowed
    OutOfRange,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::BelowMinimum => write!(f, "below-minimum"),
            RejectReason::DailyLossLimit => write!(f, "daily-loss-limit"),
            RejectReason::OutOfRange => write!(f, "out-of-range"),
        }
    }
}

/// Outcome of evaluating one trade intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskDecision {
    /// Mirror with this USDC amount (possibly clamped)
    Accept(Decimal),
    Reject(RejectReason),
}

/// Realized losses inside the trailing 24h window.
#[derive(Debug, Clone, Default)]
pub struct RiskState {
    /// (closed_at, loss) with loss > 0, oldest first
    losses: VecDeque<(DateTime<Utc>, Decimal)>,
}

impl RiskState {
    pub fn window() -> Duration {
        Duration::hours(24)
    }

    /// Rebuild from closed trades; cancelled trades and gains don't count.
    pub fn from_closed(trades: &[ClosedTrade], now: DateTime<Utc>) -> Self {
        let mut entries: Vec<(DateTime<Utc>, Decimal)> = trades
            .iter()
            .filter(|t| t.status == TradeStatus::Closed && t.realized_pnl < Decimal::ZERO)
            .map(|t| (t.closed_at, -t.realized_pnl))
            .collect();
        entries.sort_by_key(|(at, _)| *at);

        let mut state = Self {
            losses: entries.into(),
        };
        state.expire(now);
        state
    }

    /// Add a trade closed just now; gains are ignored.
    pub fn record(&mut self, closed_at: DateTime<Utc>, realized_pnl: Decimal) {
        if realized_pnl >= Decimal::ZERO {
            return;
        }
        let entry = (closed_at, -realized_pnl);
        let at = self.losses.partition_point(|(t, _)| *t <= closed_at);
        self.losses.insert(at, entry);
    }

    /// Drop losses that fell out of `(now - 24h, now]`.
    pub fn expire(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Self::window();
        while let Some((at, _)) = self.losses.front() {
            if *at <= cutoff {
                self.losses.pop_front();
            } else {
                break;
            }
        }
    }

    /// Sum of realized losses inside the window ending at `now`.
    pub fn trailing_loss(&self, now: DateTime<Utc>) -> Decimal {
        let cutoff = now - Self::window();
        self.losses
            .iter()
            .filter(|(at, _)| *at > cutoff && *at <= now)
            .map(|(_, loss)| *loss)
            .sum()
    }

    /// Whether the limit blocks new opens at `now`. A zero limit never blocks.
    pub fn limit_reached(&self, limits: &RiskLimits, now: DateTime<Utc>) -> bool {
        !limits.max_daily_loss.is_zero() && self.trailing_loss(now) >= limits.max_daily_loss
    }
}

/// Stateless evaluator of the sizing and acceptance policy.
pub struct RiskGuard;

impl RiskGuard {
    /// Size a source trade and decide whether to mirror it.
    ///
    /// Steps, in order: scale by copy ratio, reject below minimum, clamp to
    /// maximum, reject while the trailing daily loss is at its limit.
    pub fn evaluate(
        limits: &RiskLimits,
        state: &RiskState,
        source_amount: Decimal,
        now: DateTime<Utc>,
    ) -> RiskDecision {
        // 1. Size
        let Some(sized) = source_amount.checked_mul(limits.copy_ratio) else {
            return RiskDecision::Reject(RejectReason::OutOfRange);
        };

        // 2. Minimum
        if sized < limits.min_trade_value {
            return RiskDecision::Reject(RejectReason::BelowMinimum);
        }

        // 3. Maximum (resize, don't reject)
        let sized = sized.min(limits.max_trade_value);

        // 4. Daily loss
        if state.limit_reached(limits, now) {
            return RiskDecision::Reject(RejectReason::DailyLossLimit);
        }

        RiskDecision::Accept(sized)
    }

    /// Whether an open position must be force-closed at `current_price`.
    ///
    /// A zero stop-loss percentage disables the check.
    pub fn stop_loss_triggered(
        limits: &RiskLimits,
        position: &OpenPosition,
        current_price: Decimal,
    ) -> bool {
        if limits.stop_loss_percentage.is_zero() || position.entry_price.is_zero() {
            return false;
        }
        position
            .loss_pct_at(current_price)
            .is_some_and(|pct| pct >= limits.stop_loss_percentage)
    }
}
