//! Normalized source activity and the per-agent feed cursor.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Whether a source event opens or closes a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Open,
    Close,
}

/// One source-side trade event observed on the activity feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Stable identifier of this event
    pub event_id: String,

    /// Source trade this event opens, or the one it closes when known
    pub source_trade_ref: String,

    pub kind: ActivityKind,
    pub market_id: String,
    pub outcome: String,

    /// Notional in USDC
    pub amount: Decimal,

    /// Execution price (0..1)
    pub price: Decimal,

    /// Human-readable market title, if the feed carried one
    pub label: Option<String>,

    pub occurred_at: DateTime<Utc>,
}

impl ActivityEvent {
    /// Cursor position of this event.
    pub fn position(&self) -> FeedCursor {
        FeedCursor {
            occurred_at: self.occurred_at,
            event_id: self.event_id.clone(),
        }
    }

    pub fn is_after(&self, cursor: &FeedCursor) -> bool {
        (&self.occurred_at, self.event_id.as_str())
            > (&cursor.occurred_at, cursor.event_id.as_str())
    }
}

/// Watermark into an agent's source feed.
///
/// Events are totally ordered by `(occurred_at, event_id)`; field order
/// matters for the derived `Ord`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeedCursor {
    pub occurred_at: DateTime<Utc>,
    pub event_id: String,
}

impl FeedCursor {
    /// Cursor that admits every event at or after `at`.
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            occurred_at: at,
            event_id: String::new(),
        }
    }
}

/// Market metadata used for labels and current prices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketInfo {
    pub market_id: String,
    pub label: Option<String>,

    /// Current price by outcome name
    pub prices: HashMap<String, Decimal>,
}

impl MarketInfo {
    /// Price of an outcome, matched case-insensitively.
    pub fn price_of(&self, outcome: &str) -> Option<Decimal> {
        self.prices.get(outcome).copied().or_else(|| {
            self.prices
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(outcome))
                .map(|(_, price)| *price)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn event(id: &str, secs: i64) -> ActivityEvent {
        ActivityEvent {
            event_id: id.to_string(),
            source_trade_ref: id.to_string(),
            kind: ActivityKind::Open,
            market_id: "0xm".to_string(),
            outcome: "Yes".to_string(),
            amount: dec!(100),
            price: dec!(0.5),
            label: None,
            occurred_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_cursor_ordering_breaks_ties_by_id() {
        let cursor = event("b", 100).position();

        assert!(!event("a", 100).is_after(&cursor));
        assert!(!event("b", 100).is_after(&cursor));
        assert!(event("c", 100).is_after(&cursor));
        assert!(event("a", 101).is_after(&cursor));
        assert!(!event("z", 99).is_after(&cursor));
    }

    #[test]
    fn test_cursor_at_admits_same_instant() {
        let cursor = FeedCursor::at(Utc.timestamp_opt(100, 0).unwrap());
        assert!(event("a", 100).is_after(&cursor));
        assert!(!event("a", 99).is_after(&cursor));
    }

    #[test]
    fn test_price_lookup_case_insensitive() {
        let mut info = MarketInfo::default();
        info.prices.insert("Yes".to_string(), dec!(0.44));
        assert_eq!(info.price_of("yes"), Some(dec!(0.44)));
        assert_eq!(info.price_of("No"), None);
    }
}
