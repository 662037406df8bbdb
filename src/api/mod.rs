//! Polymarket API access: shared request gate, feed client, order routing.

mod data_client;
mod feed_client;
mod gate;
mod order_client;
mod types;

pub use data_client::DataClient;
pub use feed_client::{ActivityFeed, RateLimitedFeedClient};
pub use gate::{GatePolicy, RequestGate};
pub use order_client::{HttpOrderRouter, OrderFill, OrderIntent, OrderRouter, SimulatedRouter};
pub use types::OrderSide;
