//! Local simulator broker
//!
//! Accepts every order and, by default, instantly "fills" it at the requested
//! price. Used when no venue credentials are configured, and by tests, where
//! [`SimBroker::resting`] keeps limit orders open so fills can be scripted
//! with [`SimBroker::set_fill`] / [`SimBroker::set_status`].

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::{OrderStatus, OrderType, TradeRequest};
use crate::error::{ArenaError, Result};

use super::{BrokerClient, BrokerKind, BrokerOrder};

pub struct SimBroker {
    /// When false, limit orders rest as `New` until scripted
    instant_fill: bool,
    orders: Mutex<HashMap<String, BrokerOrder>>,
}

impl SimBroker {
    pub fn new() -> Self {
        Self {
            instant_fill: true,
            orders: Mutex::new(HashMap::new()),
        }
    }

    /// Simulator variant whose limit orders rest on the (imaginary) book.
    pub fn resting() -> Self {
        Self {
            instant_fill: false,
            orders: Mutex::new(HashMap::new()),
        }
    }

    fn accept(&self, request: &TradeRequest, fill_now: bool) -> BrokerOrder {
        let filled = fill_now;
        let order = BrokerOrder {
            id: Uuid::new_v4().to_string(),
            client_order_id: Some(request.client_order_id.clone()),
            symbol: request.symbol.clone(),
            side: request.side,
            qty: request.quantity,
            filled_qty: if filled { request.quantity } else { Decimal::ZERO },
            filled_avg_price: filled.then_some(request.price),
            status: if filled {
                OrderStatus::Filled
            } else {
                OrderStatus::New
            },
            limit_price: matches!(request.order_type, OrderType::Limit).then_some(request.price),
            submitted_at: Utc::now(),
            filled_at: filled.then(Utc::now),
        };
        self.orders
            .lock()
            .expect("sim broker lock poisoned")
            .insert(order.id.clone(), order.clone());
        order
    }

    /// Script a (partial) fill onto a resting order.
    pub fn set_fill(&self, broker_order_id: &str, filled_qty: Decimal, avg_price: Decimal) {
        let mut orders = self.orders.lock().expect("sim broker lock poisoned");
        if let Some(order) = orders.get_mut(broker_order_id) {
            order.filled_qty = filled_qty;
            order.filled_avg_price = Some(avg_price);
            if filled_qty >= order.qty {
                order.status = OrderStatus::Filled;
                order.filled_at = Some(Utc::now());
            } else if filled_qty > Decimal::ZERO {
                order.status = OrderStatus::PartiallyFilled;
            }
        }
    }

    /// Force a status onto a resting order (e.g. rejected/expired).
    pub fn set_status(&self, broker_order_id: &str, status: OrderStatus) {
        let mut orders = self.orders.lock().expect("sim broker lock poisoned");
        if let Some(order) = orders.get_mut(broker_order_id) {
            order.status = status;
        }
    }
}

impl Default for SimBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerClient for SimBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Sim
    }

    async fn submit_market_order(&self, request: &TradeRequest) -> Result<BrokerOrder> {
        // Market orders always fill; there is no book to rest on
        Ok(self.accept(request, true))
    }

    async fn submit_limit_order(&self, request: &TradeRequest) -> Result<BrokerOrder> {
        Ok(self.accept(request, self.instant_fill))
    }

    async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrder> {
        self.orders
            .lock()
            .expect("sim broker lock poisoned")
            .get(broker_order_id)
            .cloned()
            .ok_or_else(|| ArenaError::OrderNotFound(broker_order_id.to_string()))
    }

    async fn list_open_orders(&self) -> Result<Vec<BrokerOrder>> {
        Ok(self
            .orders
            .lock()
            .expect("sim broker lock poisoned")
            .values()
            .filter(|o| o.status.is_open())
            .cloned()
            .collect())
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<bool> {
        let mut orders = self.orders.lock().expect("sim broker lock poisoned");
        match orders.get_mut(broker_order_id) {
            Some(order) if order.status.is_open() => {
                order.status = OrderStatus::Cancelled;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(ArenaError::OrderNotFound(broker_order_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Side, StrategySignal, TenantId, TimeInForce};
    use rust_decimal_macros::dec;

    fn limit_request() -> TradeRequest {
        let signal = StrategySignal::limit("AAPL", Side::Buy, dec!(10), dec!(145), TimeInForce::Gtc);
        TradeRequest::from_signal(&TenantId::from("t1"), &signal, Utc::now())
    }

    #[tokio::test]
    async fn instant_mode_fills_at_requested_price() {
        let broker = SimBroker::new();
        let order = broker
            .submit_limit_order(&limit_request())
            .await
            .expect("submit should succeed");
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_avg_price, Some(dec!(145)));
    }

    #[tokio::test]
    async fn resting_mode_keeps_limit_orders_open() {
        let broker = SimBroker::resting();
        let order = broker
            .submit_limit_order(&limit_request())
            .await
            .expect("submit should succeed");
        assert_eq!(order.status, OrderStatus::New);

        let open = broker.list_open_orders().await.expect("list should succeed");
        assert_eq!(open.len(), 1);

        broker.set_fill(&order.id, dec!(10), dec!(144.90));
        let updated = broker.get_order(&order.id).await.expect("order exists");
        assert_eq!(updated.status, OrderStatus::Filled);
        assert_eq!(updated.filled_avg_price, Some(dec!(144.90)));
    }

    #[tokio::test]
    async fn cancel_only_succeeds_while_open() {
        let broker = SimBroker::resting();
        let order = broker
            .submit_limit_order(&limit_request())
            .await
            .expect("submit should succeed");

        assert!(broker.cancel_order(&order.id).await.expect("cancel works"));
        assert!(!broker.cancel_order(&order.id).await.expect("second cancel is a no-op"));
        assert!(broker.cancel_order("missing").await.is_err());
    }
}
