//! Alpaca trading API client
//!
//! Thin REST client over the v2 orders endpoints. Quantities and prices go
//! over the wire as strings to avoid float truncation; every request carries
//! the configured network timeout.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::BrokerConfig;
use crate::domain::{OrderStatus, Side, TradeRequest};
use crate::error::{ArenaError, Result};

use super::{BrokerClient, BrokerKind, BrokerOrder};

const DEFAULT_PAPER_URL: &str = "https://paper-api.alpaca.markets";

const KEY_HEADER: &str = "APCA-API-KEY-ID";
const SECRET_HEADER: &str = "APCA-API-SECRET-KEY";

pub struct AlpacaBroker {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

/// Order submission payload for POST /v2/orders.
#[derive(Debug, Serialize)]
struct OrderPayload {
    symbol: String,
    qty: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    time_in_force: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<String>,
    client_order_id: String,
}

/// Order as returned by the venue.
#[derive(Debug, Deserialize)]
struct ApiOrder {
    id: String,
    client_order_id: Option<String>,
    symbol: String,
    qty: String,
    filled_qty: Option<String>,
    side: String,
    status: String,
    filled_avg_price: Option<String>,
    limit_price: Option<String>,
    submitted_at: Option<DateTime<Utc>>,
    filled_at: Option<DateTime<Utc>>,
}

impl AlpacaBroker {
    pub fn new(config: &BrokerConfig, api_key: String, api_secret: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_PAPER_URL.to_string()),
            api_key,
            api_secret,
        })
    }

    /// Build a client from `ALPACA_API_KEY`/`ALPACA_API_SECRET`, or `None`
    /// when credentials are absent.
    pub fn from_env(config: &BrokerConfig) -> Result<Option<Self>> {
        let key = std::env::var("ALPACA_API_KEY").ok();
        let secret = std::env::var("ALPACA_API_SECRET").ok();
        match (key, secret) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                Ok(Some(Self::new(config, key, secret)?))
            }
            _ => Ok(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_status(raw: &str) -> OrderStatus {
        match raw {
            "new" | "accepted" | "pending_new" | "accepted_for_bidding" | "held"
            | "pending_replace" => OrderStatus::New,
            "partially_filled" => OrderStatus::PartiallyFilled,
            "filled" => OrderStatus::Filled,
            "canceled" | "pending_cancel" | "done_for_day" | "stopped" | "replaced" => {
                OrderStatus::Cancelled
            }
            "rejected" => OrderStatus::Rejected,
            "expired" => OrderStatus::Expired,
            _ => OrderStatus::New,
        }
    }

    fn parse_decimal(raw: &Option<String>) -> Option<Decimal> {
        raw.as_deref().and_then(|s| s.parse().ok())
    }

    fn convert(order: ApiOrder) -> Result<BrokerOrder> {
        let qty: Decimal = order
            .qty
            .parse()
            .map_err(|_| ArenaError::BrokerQuery(format!("unparseable qty '{}'", order.qty)))?;
        let side = match order.side.as_str() {
            "buy" => Side::Buy,
            "sell" => Side::Sell,
            other => {
                return Err(ArenaError::BrokerQuery(format!("unknown side '{other}'")));
            }
        };
        Ok(BrokerOrder {
            id: order.id,
            client_order_id: order.client_order_id,
            symbol: order.symbol,
            side,
            qty,
            filled_qty: Self::parse_decimal(&order.filled_qty).unwrap_or(Decimal::ZERO),
            filled_avg_price: Self::parse_decimal(&order.filled_avg_price),
            status: Self::map_status(&order.status),
            limit_price: Self::parse_decimal(&order.limit_price),
            submitted_at: order.submitted_at.unwrap_or_else(Utc::now),
            filled_at: order.filled_at,
        })
    }

    async fn submit(&self, payload: &OrderPayload) -> Result<BrokerOrder> {
        let response = self
            .http
            .post(format!("{}/v2/orders", self.base_url))
            .header(KEY_HEADER, &self.api_key)
            .header(SECRET_HEADER, &self.api_secret)
            .json(payload)
            .send()
            .await
            .map_err(|e| ArenaError::BrokerSubmission(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ArenaError::BrokerSubmission(format!(
                "order submit returned {status}: {body}"
            )));
        }

        let order: ApiOrder = response
            .json()
            .await
            .map_err(|e| ArenaError::BrokerSubmission(e.to_string()))?;
        Self::convert(order)
    }

    fn payload(request: &TradeRequest, limit_price: Option<Decimal>) -> OrderPayload {
        OrderPayload {
            symbol: request.symbol.clone(),
            qty: request.quantity.to_string(),
            side: request.side.to_string(),
            order_type: if limit_price.is_some() {
                "limit".to_string()
            } else {
                "market".to_string()
            },
            time_in_force: request.time_in_force.to_string(),
            limit_price: limit_price.map(|p| p.to_string()),
            client_order_id: request.client_order_id.clone(),
        }
    }
}

#[async_trait]
impl BrokerClient for AlpacaBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Alpaca
    }

    async fn submit_market_order(&self, request: &TradeRequest) -> Result<BrokerOrder> {
        self.submit(&Self::payload(request, None)).await
    }

    async fn submit_limit_order(&self, request: &TradeRequest) -> Result<BrokerOrder> {
        self.submit(&Self::payload(request, Some(request.price))).await
    }

    async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrder> {
        let response = self
            .http
            .get(format!("{}/v2/orders/{}", self.base_url, broker_order_id))
            .header(KEY_HEADER, &self.api_key)
            .header(SECRET_HEADER, &self.api_secret)
            .send()
            .await
            .map_err(|e| ArenaError::BrokerQuery(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ArenaError::OrderNotFound(broker_order_id.to_string()));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ArenaError::BrokerQuery(format!(
                "order query returned {status}: {body}"
            )));
        }

        let order: ApiOrder = response
            .json()
            .await
            .map_err(|e| ArenaError::BrokerQuery(e.to_string()))?;
        Self::convert(order)
    }

    async fn list_open_orders(&self) -> Result<Vec<BrokerOrder>> {
        let response = self
            .http
            .get(format!("{}/v2/orders?status=open&limit=500", self.base_url))
            .header(KEY_HEADER, &self.api_key)
            .header(SECRET_HEADER, &self.api_secret)
            .send()
            .await
            .map_err(|e| ArenaError::BrokerQuery(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ArenaError::BrokerQuery(format!(
                "open-orders query returned {status}: {body}"
            )));
        }

        let orders: Vec<ApiOrder> = response
            .json()
            .await
            .map_err(|e| ArenaError::BrokerQuery(e.to_string()))?;
        orders.into_iter().map(Self::convert).collect()
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<bool> {
        let response = self
            .http
            .delete(format!("{}/v2/orders/{}", self.base_url, broker_order_id))
            .header(KEY_HEADER, &self.api_key)
            .header(SECRET_HEADER, &self.api_secret)
            .send()
            .await
            .map_err(|e| ArenaError::BrokerSubmission(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            // Already in a terminal state on the venue side
            StatusCode::UNPROCESSABLE_ENTITY => Ok(false),
            StatusCode::NOT_FOUND => Err(ArenaError::OrderNotFound(broker_order_id.to_string())),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ArenaError::BrokerSubmission(format!(
                    "order cancel returned {status}: {body}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_venue_statuses() {
        assert_eq!(AlpacaBroker::map_status("new"), OrderStatus::New);
        assert_eq!(AlpacaBroker::map_status("accepted"), OrderStatus::New);
        assert_eq!(
            AlpacaBroker::map_status("partially_filled"),
            OrderStatus::PartiallyFilled
        );
        assert_eq!(AlpacaBroker::map_status("filled"), OrderStatus::Filled);
        assert_eq!(AlpacaBroker::map_status("canceled"), OrderStatus::Cancelled);
        assert_eq!(AlpacaBroker::map_status("rejected"), OrderStatus::Rejected);
        assert_eq!(AlpacaBroker::map_status("expired"), OrderStatus::Expired);
        // Unknown statuses stay open so reconciliation keeps watching them
        assert_eq!(AlpacaBroker::map_status("calculated"), OrderStatus::New);
    }

    #[test]
    fn converts_api_order() {
        let api = ApiOrder {
            id: "abc".to_string(),
            client_order_id: Some("t1-123".to_string()),
            symbol: "AAPL".to_string(),
            qty: "10".to_string(),
            filled_qty: Some("4".to_string()),
            side: "buy".to_string(),
            status: "partially_filled".to_string(),
            filled_avg_price: Some("150.05".to_string()),
            limit_price: None,
            submitted_at: Some(Utc::now()),
            filled_at: None,
        };
        let order = AlpacaBroker::convert(api).expect("order should convert");
        assert_eq!(order.qty, Decimal::from(10));
        assert_eq!(order.filled_qty, Decimal::from(4));
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled_avg_price, Some("150.05".parse().unwrap()));
    }
}
