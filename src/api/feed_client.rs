//! Rate-limited access to source activity and market metadata.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{FeedError, TransportError};
use crate::models::{ActivityEvent, FeedCursor, MarketInfo};

use super::gate::RequestGate;

/// Raw upstream calls, one request each, with errors already classified.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    /// Activity of `participant` at or after `since`, oldest first.
    async fn activity(
        &self,
        participant: &str,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ActivityEvent>, TransportError>;

    async fn market_info(&self, market_id: &str) -> Result<MarketInfo, TransportError>;
}

/// What agents see of the upstream feed.
#[async_trait]
pub trait ActivityFeed: Send + Sync {
    /// Events strictly after `since`, ordered by `(occurred_at, event_id)`.
    async fn fetch_activity(
        &self,
        participant: &str,
        since: &FeedCursor,
    ) -> Result<Vec<ActivityEvent>, FeedError>;

    async fn fetch_market_info(&self, market_id: &str) -> Result<MarketInfo, FeedError>;
}

/// Feed client shared by every agent; all calls go through one [`RequestGate`].
pub struct RateLimitedFeedClient<T> {
    transport: T,
    gate: Arc<RequestGate>,
    max_attempts: u32,
    page_size: u32,
}

impl<T: FeedTransport> RateLimitedFeedClient<T> {
    pub fn new(transport: T, gate: Arc<RequestGate>, max_attempts: u32, page_size: u32) -> Self {
        Self {
            transport,
            gate,
            max_attempts: max_attempts.max(1),
            page_size,
        }
    }

    /// Run one logical request with gate admission and bounded retries.
    ///
    /// Throttling is backed off on the shared gate so every caller slows
    /// down; transient failures back off locally for this request only.
    async fn call<R, F, Fut>(&self, what: &str, mut op: F) -> Result<R, FeedError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<R, TransportError>> + Send,
        R: Send,
    {
        let mut local_backoff = self.gate.policy().backoff();
        let mut last_reason = String::new();

        for attempt in 1..=self.max_attempts {
            self.gate.acquire().await;

            match op().await {
                Ok(value) => {
                    self.gate.on_success().await;
                    return Ok(value);
                }
                Err(TransportError::RateLimited { retry_after }) => {
                    self.gate.on_throttled(retry_after).await;
                    last_reason = "rate limited".to_string();
                }
                Err(TransportError::Transient(reason)) => {
                    if attempt < self.max_attempts {
                        let delay = local_backoff
                            .next_backoff()
                            .unwrap_or(self.gate.policy().backoff_cap);
                        warn!(
                            request = what,
                            attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %reason,
                            "Transient upstream failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_reason = reason;
                }
                Err(TransportError::Fatal(reason)) => {
                    debug!(request = what, error = %reason, "Upstream rejected request");
                    return Err(FeedError::QueryFailed(reason));
                }
            }
        }

        Err(FeedError::Unavailable {
            attempts: self.max_attempts,
            reason: last_reason,
        })
    }
}

#[async_trait]
impl<T: FeedTransport> ActivityFeed for RateLimitedFeedClient<T> {
    async fn fetch_activity(
        &self,
        participant: &str,
        since: &FeedCursor,
    ) -> Result<Vec<ActivityEvent>, FeedError> {
        let mut events = self
            .call("activity", move || {
                self.transport
                    .activity(participant, since.occurred_at, self.page_size)
            })
            .await?;

        events.retain(|e| e.is_after(since));
        events.sort_by(|a, b| {
            a.occurred_at
                .cmp(&b.occurred_at)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        events.dedup_by(|a, b| a.event_id == b.event_id);

        debug!(
            participant = participant,
            count = events.len(),
            "Fetched activity"
        );
        Ok(events)
    }

    async fn fetch_market_info(&self, market_id: &str) -> Result<MarketInfo, FeedError> {
        self.call("market", move || self.transport.market_info(market_id))
            .await
    }
}
