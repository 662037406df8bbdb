//! Wire types for the Polymarket data, market and order endpoints.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Activity response from /activity endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityResponse {
    #[serde(rename = "type")]
    pub activity_type: String,
    #[serde(default)]
    pub proxy_wallet: String,
    #[serde(default)]
    pub condition_id: String,
    #[serde(default)]
    pub asset: String,
    #[serde(default)]
    pub size: Decimal,
    #[serde(default)]
    pub usdc_size: Decimal,
    #[serde(default)]
    pub price: Decimal,
    pub timestamp: i64,
    #[serde(default)]
    pub transaction_hash: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub title: String,
}

/// Market response from the CLOB /markets/{condition_id} endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketResponse {
    pub condition_id: String,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub tokens: Vec<TokenResponse>,
    #[serde(default)]
    pub closed: bool,
}

/// Token (outcome) entry of a market.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub outcome: String,
    #[serde(default)]
    pub price: Decimal,
    pub winner: Option<bool>,
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Market order submission body for POST /orders.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub market_id: String,
    pub outcome: String,
    pub side: OrderSide,
    /// USDC notional
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    pub client_ref: String,
}

/// Response from order placement.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    #[serde(alias = "order_id")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default, alias = "error_msg")]
    pub error_msg: String,
    #[serde(default)]
    pub price: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_activity_response_parse() {
        let body = r#"[{
            "type": "TRADE",
            "proxyWallet": "0xabc",
            "conditionId": "0xmarket",
            "asset": "123",
            "size": 200,
            "usdcSize": 100,
            "price": 0.5,
            "timestamp": 1700000000,
            "transactionHash": "0xtx",
            "side": "BUY",
            "outcome": "Yes",
            "title": "Will it rain?"
        }]"#;

        let items: Vec<ActivityResponse> = serde_json::from_str(body).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].activity_type, "TRADE");
        assert_eq!(items[0].usdc_size, dec!(100));
        assert_eq!(items[0].price, dec!(0.5));
        assert_eq!(items[0].title, "Will it rain?");
    }

    #[test]
    fn test_order_request_amounts_as_strings() {
        let req = OrderRequest {
            market_id: "0xm".to_string(),
            outcome: "Yes".to_string(),
            side: OrderSide::Buy,
            amount: dec!(250),
            price: dec!(0.42),
            client_ref: "r1".to_string(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["amount"], "250");
        assert_eq!(json["price"], "0.42");
        assert_eq!(json["side"], "BUY");
    }
}
