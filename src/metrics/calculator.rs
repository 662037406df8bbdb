//! Calculator for agent performance: win rate, profit factor, drawdown, dispersion.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::{AgentPerformance, ClosedTrade, TradeStatus};

/// Computes [`AgentPerformance`] from closed trades.
pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// Aggregate closed trades in the order given (oldest first).
    ///
    /// Cancelled trades are ignored.
    pub fn calculate(trades: &[ClosedTrade]) -> AgentPerformance {
        let closed: Vec<&ClosedTrade> = trades
            .iter()
            .filter(|t| t.status == TradeStatus::Closed)
            .collect();

        let mut perf = AgentPerformance::default();
        if closed.is_empty() {
            return perf;
        }

        perf.total_trades = closed.len() as u32;
        perf.total_volume = closed.iter().map(|t| t.position.amount).sum();

        let pnls: Vec<Decimal> = closed.iter().map(|t| t.realized_pnl).collect();
        Self::calculate_pnl_metrics(&mut perf, &pnls);
        Self::calculate_drawdown(&mut perf, &pnls);
        Self::calculate_dispersion(&mut perf, &pnls);

        perf
    }

    fn calculate_pnl_metrics(perf: &mut AgentPerformance, pnls: &[Decimal]) {
        let wins: Vec<Decimal> = pnls.iter().copied().filter(|p| *p > Decimal::ZERO).collect();
        let losses: Vec<Decimal> = pnls.iter().copied().filter(|p| *p < Decimal::ZERO).collect();

        perf.winning_trades = wins.len() as u32;
        perf.losing_trades = losses.len() as u32;
        perf.gross_profit = wins.iter().copied().sum();
        perf.gross_loss = losses.iter().map(|l| l.abs()).sum();
        perf.net_pnl = pnls.iter().copied().sum();

        perf.win_rate = wins.len() as f64 / pnls.len() as f64 * 100.0;

        if !wins.is_empty() {
            perf.avg_win = perf.gross_profit / Decimal::from(wins.len() as u32);
        }
        if !losses.is_empty() {
            perf.avg_loss = perf.gross_loss / Decimal::from(losses.len() as u32);
        }

        if perf.gross_loss > Decimal::ZERO {
            perf.profit_factor = perf.gross_profit.to_f64().unwrap_or(0.0)
                / perf.gross_loss.to_f64().unwrap_or(1.0);
        }
    }

    /// Peak-to-trough fall of the cumulative P&L curve, starting from zero.
    fn calculate_drawdown(perf: &mut AgentPerformance, pnls: &[Decimal]) {
        let mut equity = Decimal::ZERO;
        let mut peak = Decimal::ZERO;
        let mut max_dd = Decimal::ZERO;

        for pnl in pnls {
            equity += pnl;
            if equity > peak {
                peak = equity;
            }
            let dd = peak - equity;
            if dd > max_dd {
                max_dd = dd;
            }
        }

        perf.max_drawdown = max_dd;
    }

    fn calculate_dispersion(perf: &mut AgentPerformance, pnls: &[Decimal]) {
        if pnls.len() < 2 {
            return;
        }

        let values: Vec<f64> = pnls.iter().filter_map(|p| p.to_f64()).collect();
        let std_dev = values.std_dev();
        if std_dev.is_finite() {
            perf.pnl_std_dev = std_dev;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentId, CloseReason, OpenPosition};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn closed(pnl: Decimal, status: TradeStatus) -> ClosedTrade {
        ClosedTrade {
            position: OpenPosition {
                trade_id: "t".to_string(),
                agent_id: AgentId::from("agt_test"),
                source_trade_ref: "s".to_string(),
                order_ref: "o".to_string(),
                market_id: "m".to_string(),
                outcome: "Yes".to_string(),
                label: "Market".to_string(),
                entry_price: dec!(0.5),
                amount: dec!(100),
                opened_at: Utc::now(),
                simulated: true,
            },
            exit_price: dec!(0.5),
            closed_at: Utc::now(),
            realized_pnl: pnl,
            status,
            reason: CloseReason::SourceClosed,
        }
    }

    #[test]
    fn test_empty_history() {
        let perf = PerformanceCalculator::calculate(&[]);
        assert_eq!(perf.total_trades, 0);
        assert_eq!(perf.net_pnl, Decimal::ZERO);
        assert_eq!(perf.win_rate, 0.0);
    }

    #[test]
    fn test_win_loss_statistics() {
        let trades = vec![
            closed(dec!(100), TradeStatus::Closed),
            closed(dec!(-50), TradeStatus::Closed),
            closed(dec!(75), TradeStatus::Closed),
            closed(dec!(-25), TradeStatus::Closed),
        ];

        let perf = PerformanceCalculator::calculate(&trades);

        assert_eq!(perf.total_trades, 4);
        assert_eq!(perf.winning_trades, 2);
        assert_eq!(perf.losing_trades, 2);
        assert_eq!(perf.win_rate, 50.0);
        assert_eq!(perf.gross_profit, dec!(175));
        assert_eq!(perf.gross_loss, dec!(75));
        assert_eq!(perf.net_pnl, dec!(100));
        assert_eq!(perf.avg_win, dec!(87.5));
        assert_eq!(perf.avg_loss, dec!(37.5));
        assert!((perf.profit_factor - 175.0 / 75.0).abs() < 1e-9);
        assert!(perf.pnl_std_dev > 0.0);
    }

    #[test]
    fn test_drawdown_from_peak() {
        let trades = vec![
            closed(dec!(100), TradeStatus::Closed),
            closed(dec!(-30), TradeStatus::Closed),
            closed(dec!(-40), TradeStatus::Closed),
            closed(dec!(50), TradeStatus::Closed),
        ];

        let perf = PerformanceCalculator::calculate(&trades);
        assert_eq!(perf.max_drawdown, dec!(70));
    }

    #[test]
    fn test_cancelled_trades_ignored() {
        let trades = vec![
            closed(dec!(10), TradeStatus::Closed),
            closed(Decimal::ZERO, TradeStatus::Cancelled),
        ];

        let perf = PerformanceCalculator::calculate(&trades);
        assert_eq!(perf.total_trades, 1);
        assert_eq!(perf.win_rate, 100.0);
    }
}
