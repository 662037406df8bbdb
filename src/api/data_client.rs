//! Polymarket HTTP transport for activity and market metadata.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::models::{ActivityEvent, ActivityKind, MarketInfo};

use super::feed_client::FeedTransport;
use super::types::*;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the Polymarket data and market endpoints (read-only).
pub struct DataClient {
    client: Client,
    data_base_url: String,
    clob_base_url: String,
}

impl DataClient {
    /// Create a client against the given data and market API base URLs.
    pub fn with_base_urls(data_base_url: String, clob_base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            data_base_url: data_base_url.trim_end_matches('/').to_string(),
            clob_base_url: clob_base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, TransportError> {
        debug!(url = %url, "GET");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(classify_request_error)?;

        let response = check_status(response).await?;

        response
            .json()
            .await
            .map_err(|e| TransportError::Transient(format!("undecodable response: {}", e)))
    }
}

/// Map a non-success response to a transport error; pass successes through.
pub(crate) async fn check_status(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();

    Err(classify_status(status, retry_after, &body))
}

pub(crate) fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> TransportError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        TransportError::RateLimited { retry_after }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        TransportError::Transient(format!("{} - {}", status, body))
    } else {
        TransportError::Fatal(format!("{} - {}", status, body))
    }
}

pub(crate) fn classify_request_error(err: reqwest::Error) -> TransportError {
    match err.status() {
        Some(status) => classify_status(status, None, &err.to_string()),
        // Timeouts, refused connections, resets, broken bodies
        None => TransportError::Transient(err.to_string()),
    }
}

/// Normalize one activity row; `None` for activity that is not a position change.
fn to_event(item: ActivityResponse) -> Option<ActivityEvent> {
    let kind = match (
        item.activity_type.to_uppercase().as_str(),
        item.side.to_uppercase().as_str(),
    ) {
        ("TRADE", "BUY") => ActivityKind::Open,
        ("TRADE", "SELL") => ActivityKind::Close,
        ("REDEEM", _) => ActivityKind::Close,
        (other, side) => {
            debug!(activity = other, side = side, "Ignoring activity");
            return None;
        }
    };

    let occurred_at: DateTime<Utc> = Utc.timestamp_opt(item.timestamp, 0).single()?;

    let event_id = if item.transaction_hash.is_empty() {
        format!(
            "{}_{}_{}_{}",
            item.timestamp, item.condition_id, item.outcome, item.side
        )
    } else {
        format!("{}_{}_{}", item.transaction_hash, item.asset, item.side)
    };

    let amount = if item.usdc_size > Decimal::ZERO {
        item.usdc_size
    } else {
        item.size * item.price
    };

    // Redemptions carry no price; the payout per share is the exit value
    let price = if item.price > Decimal::ZERO || item.size.is_zero() {
        item.price
    } else {
        item.usdc_size / item.size
    };

    let label = if item.title.trim().is_empty() {
        None
    } else {
        Some(item.title)
    };

    Some(ActivityEvent {
        source_trade_ref: event_id.clone(),
        event_id,
        kind,
        market_id: item.condition_id,
        outcome: item.outcome,
        amount,
        price,
        label,
        occurred_at,
    })
}

fn to_market_info(market: MarketResponse) -> MarketInfo {
    let closed = market.closed;
    let prices: HashMap<String, Decimal> = market
        .tokens
        .into_iter()
        .map(|t| {
            // A resolved market settles at 1 for the winner and 0 otherwise
            let price = match t.winner {
                Some(true) if closed => Decimal::ONE,
                Some(false) if closed => Decimal::ZERO,
                _ => t.price,
            };
            (t.outcome, price)
        })
        .collect();

    MarketInfo {
        market_id: market.condition_id,
        label: if market.question.trim().is_empty() {
            None
        } else {
            Some(market.question)
        },
        prices,
    }
}

#[async_trait]
impl FeedTransport for DataClient {
    async fn activity(
        &self,
        participant: &str,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ActivityEvent>, TransportError> {
        let url = format!(
            "{}/activity?user={}&start={}&limit={}&sortBy=TIMESTAMP&sortDirection=ASC",
            self.data_base_url,
            participant,
            since.timestamp().max(0),
            limit.min(500)
        );

        let items: Vec<ActivityResponse> = self.get_json(&url).await?;

        let events = items
            .into_iter()
            .filter(|item| {
                let ours = item.proxy_wallet.is_empty()
                    || item.proxy_wallet.eq_ignore_ascii_case(participant);
                if !ours {
                    warn!(wallet = %item.proxy_wallet, "Activity for another wallet");
                }
                ours
            })
            .filter_map(to_event)
            .collect();

        Ok(events)
    }

    async fn market_info(&self, market_id: &str) -> Result<MarketInfo, TransportError> {
        let url = format!("{}/markets/{}", self.clob_base_url, market_id);
        let market: MarketResponse = self.get_json(&url).await?;
        Ok(to_market_info(market))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn activity(kind: &str, side: &str) -> ActivityResponse {
        ActivityResponse {
            activity_type: kind.to_string(),
            proxy_wallet: "0xabc".to_string(),
            condition_id: "0xmarket".to_string(),
            asset: "123".to_string(),
            size: dec!(200),
            usdc_size: dec!(100),
            price: dec!(0.5),
            timestamp: 1_700_000_000,
            transaction_hash: "0xtx".to_string(),
            side: side.to_string(),
            outcome: "Yes".to_string(),
            title: "Will it rain?".to_string(),
        }
    }

    #[test]
    fn test_buy_is_open() {
        let event = to_event(activity("TRADE", "BUY")).unwrap();
        assert_eq!(event.kind, ActivityKind::Open);
        assert_eq!(event.event_id, "0xtx_123_BUY");
        assert_eq!(event.source_trade_ref, event.event_id);
        assert_eq!(event.amount, dec!(100));
        assert_eq!(event.label.as_deref(), Some("Will it rain?"));
    }

    #[test]
    fn test_sell_and_redeem_are_closes() {
        assert_eq!(to_event(activity("TRADE", "SELL")).unwrap().kind, ActivityKind::Close);

        let mut redeem = activity("REDEEM", "");
        redeem.price = Decimal::ZERO;
        redeem.usdc_size = dec!(200);
        let event = to_event(redeem).unwrap();
        assert_eq!(event.kind, ActivityKind::Close);
        assert_eq!(event.price, dec!(1));
    }

    #[test]
    fn test_other_activity_ignored() {
        assert!(to_event(activity("SPLIT", "")).is_none());
        assert!(to_event(activity("REWARD", "")).is_none());
    }

    #[test]
    fn test_missing_usdc_size_uses_notional() {
        let mut item = activity("TRADE", "BUY");
        item.usdc_size = Decimal::ZERO;
        assert_eq!(to_event(item).unwrap().amount, dec!(100));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3)), ""),
            TransportError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(3)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, ""),
            TransportError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None, ""),
            TransportError::Fatal(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None, "invalid user"),
            TransportError::Fatal(_)
        ));
    }

    #[test]
    fn test_resolved_market_prices() {
        let market = MarketResponse {
            condition_id: "0xm".to_string(),
            question: "Will it rain?".to_string(),
            tokens: vec![
                TokenResponse {
                    outcome: "Yes".to_string(),
                    price: dec!(0.97),
                    winner: Some(true),
                },
                TokenResponse {
                    outcome: "No".to_string(),
                    price: dec!(0.03),
                    winner: Some(false),
                },
            ],
            closed: true,
        };

        let info = to_market_info(market);
        assert_eq!(info.price_of("Yes"), Some(Decimal::ONE));
        assert_eq!(info.price_of("No"), Some(Decimal::ZERO));
        assert_eq!(info.label.as_deref(), Some("Will it rain?"));
    }
}
