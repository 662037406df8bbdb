//! Data models for agents, source activity, mirrored trades and performance.

mod activity;
mod agent;
mod metrics;
mod trade;

pub use activity::{ActivityEvent, ActivityKind, FeedCursor, MarketInfo};
pub use agent::{
    AgentConfig, AgentFilter, AgentId, AgentKind, AgentMode, AgentUpdate, PaperWallet, RiskLimits,
    DEFAULT_PAPER_BALANCE,
};
pub use metrics::{AgentPerformance, HistoryPeriod, PerformanceSnapshot, SnapshotKind};
pub use trade::{CloseReason, ClosedTrade, OpenPosition, TradeStatus};
