//! Order routing: simulated fills or live submission through the shared gate.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::error::{OrderError, TransportError};
use crate::models::AgentId;

use super::data_client::{check_status, classify_request_error};
use super::gate::RequestGate;
use super::types::{OrderRequest, OrderResponse, OrderSide};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A filled (or accepted) order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFill {
    pub order_ref: String,
    pub price: Decimal,
    pub simulated: bool,
}

/// Order to buy into or sell out of an outcome.
#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub market_id: String,
    pub outcome: String,
    pub side: OrderSide,
    /// USDC notional
    pub amount: Decimal,
    /// Reference price the order is sized against
    pub price: Decimal,
    /// Idempotency key; resubmitting the same key never doubles a position
    pub client_ref: String,
}

impl OrderIntent {
    /// Stable key for the order mirroring `source_trade_ref` on `side`.
    ///
    /// Derived, not random, so an order resubmitted after a lost
    /// acknowledgement or a failed store write carries the same key.
    pub fn client_ref_for(agent_id: &AgentId, source_trade_ref: &str, side: OrderSide) -> String {
        let name = format!("{}:{}:{:?}", agent_id, source_trade_ref, side);
        uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }
}

/// Where mirrored orders are sent.
#[async_trait]
pub trait OrderRouter: Send + Sync {
    async fn submit(&self, intent: &OrderIntent) -> Result<OrderFill, OrderError>;
}

/// Fills every order immediately at its reference price.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedRouter;

#[async_trait]
impl OrderRouter for SimulatedRouter {
    async fn submit(&self, intent: &OrderIntent) -> Result<OrderFill, OrderError> {
        let order_ref = format!("sim-{}", uuid::Uuid::new_v4().simple());
        debug!(
            order = %order_ref,
            market = %intent.market_id,
            side = ?intent.side,
            amount = %intent.amount,
            "Simulated fill"
        );
        Ok(OrderFill {
            order_ref,
            price: intent.price,
            simulated: true,
        })
    }
}

/// Submits market orders to the order API.
///
/// One attempt per call; retries are left to the next poll cycle, which
/// resubmits under the same `client_ref`.
pub struct HttpOrderRouter {
    client: Client,
    base_url: String,
    api_key: String,
    gate: Arc<RequestGate>,
}

impl HttpOrderRouter {
    pub fn new(base_url: String, api_key: String, gate: Arc<RequestGate>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            gate,
        })
    }
}

#[async_trait]
impl OrderRouter for HttpOrderRouter {
    async fn submit(&self, intent: &OrderIntent) -> Result<OrderFill, OrderError> {
        let body = OrderRequest {
            market_id: intent.market_id.clone(),
            outcome: intent.outcome.clone(),
            side: intent.side,
            amount: intent.amount,
            price: intent.price,
            client_ref: intent.client_ref.clone(),
        };

        self.gate.acquire().await;

        let sent = self
            .client
            .post(format!("{}/orders", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_request_error);

        let response = match sent {
            Ok(response) => check_status(response).await,
            Err(e) => Err(e),
        };

        let response = match response {
            Ok(response) => response,
            Err(TransportError::RateLimited { retry_after }) => {
                self.gate.on_throttled(retry_after).await;
                return Err(OrderError::Unavailable("rate limited".to_string()));
            }
            Err(TransportError::Transient(reason)) => return Err(OrderError::Unavailable(reason)),
            Err(TransportError::Fatal(reason)) => return Err(OrderError::Rejected(reason)),
        };
        self.gate.on_success().await;

        let ack: OrderResponse = response
            .json()
            .await
            .map_err(|e| OrderError::Unavailable(format!("undecodable order response: {}", e)))?;

        if !ack.success {
            return Err(OrderError::Rejected(ack.error_msg));
        }

        let order_ref = ack.order_id.unwrap_or_else(|| intent.client_ref.clone());
        info!(
            order = %order_ref,
            market = %intent.market_id,
            side = ?intent.side,
            amount = %intent.amount,
            "Order accepted"
        );

        Ok(OrderFill {
            order_ref,
            price: ack.price.unwrap_or(intent.price),
            simulated: false,
        })
    }
}
