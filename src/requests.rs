//! Order requests: validated inputs to `Exchange::create_order`

use rust_decimal::Decimal;

use crate::errors::{ExchangeError, ExchangeResult};
use crate::math;
use crate::orders::{Order, OrderType};
use crate::types::{OrderOperation, Pair, PairInfo};

/// A not-yet-accepted order. Use the per-variant constructors; validation
/// runs when the request reaches the exchange.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub operation: OrderOperation,
    pub pair: Pair,
    pub amount: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
}

impl OrderRequest {
    pub fn market(operation: OrderOperation, pair: Pair, amount: Decimal) -> Self {
        OrderRequest {
            operation,
            pair,
            amount,
            order_type: OrderType::Market,
            limit_price: None,
            stop_price: None,
        }
    }

    pub fn limit(
        operation: OrderOperation,
        pair: Pair,
        amount: Decimal,
        limit_price: Decimal,
    ) -> Self {
        OrderRequest {
            operation,
            pair,
            amount,
            order_type: OrderType::Limit,
            limit_price: Some(limit_price),
            stop_price: None,
        }
    }

    pub fn stop(
        operation: OrderOperation,
        pair: Pair,
        amount: Decimal,
        stop_price: Decimal,
    ) -> Self {
        OrderRequest {
            operation,
            pair,
            amount,
            order_type: OrderType::Stop,
            limit_price: None,
            stop_price: Some(stop_price),
        }
    }

    pub fn stop_limit(
        operation: OrderOperation,
        pair: Pair,
        amount: Decimal,
        stop_price: Decimal,
        limit_price: Decimal,
    ) -> Self {
        OrderRequest {
            operation,
            pair,
            amount,
            order_type: OrderType::StopLimit,
            limit_price: Some(limit_price),
            stop_price: Some(stop_price),
        }
    }

    /// Checks the amount and prices against the pair's precision settings.
    pub fn validate(&self, pair_info: &PairInfo) -> ExchangeResult<()> {
        if self.amount <= Decimal::ZERO {
            return Err(ExchangeError::Validation(format!(
                "amount {} must be greater than zero",
                self.amount
            )));
        }
        if !math::conforms_to_precision(self.amount, pair_info.base_precision) {
            return Err(ExchangeError::Validation(format!(
                "amount {} has more than {} decimals",
                self.amount, pair_info.base_precision
            )));
        }
        for (name, price) in [
            ("limit price", self.limit_price),
            ("stop price", self.stop_price),
        ] {
            let Some(price) = price else { continue };
            if price <= Decimal::ZERO {
                return Err(ExchangeError::Validation(format!(
                    "{} {} must be greater than zero",
                    name, price
                )));
            }
            if !math::conforms_to_precision(price, pair_info.quote_precision) {
                return Err(ExchangeError::Validation(format!(
                    "{} {} has more than {} decimals",
                    name, price, pair_info.quote_precision
                )));
            }
        }
        Ok(())
    }

    /// Price used for pre-acceptance balance estimation. Market orders have
    /// none and fall back to the last traded price.
    pub fn estimated_fill_price(&self) -> Option<Decimal> {
        match self.order_type {
            OrderType::Market => None,
            OrderType::Limit => self.limit_price,
            OrderType::Stop | OrderType::StopLimit => self.stop_price,
        }
    }

    pub(crate) fn create_order(&self, id: String) -> Order {
        Order::new(
            id,
            self.operation,
            self.pair.clone(),
            self.amount,
            self.order_type,
            self.limit_price,
            self.stop_price,
        )
    }
}
