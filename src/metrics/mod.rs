//! Performance metrics over closed trades.

mod calculator;

pub use calculator::PerformanceCalculator;
