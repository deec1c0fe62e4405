//! User-visible exchange errors

use rust_decimal::Decimal;
use thiserror::Error;

use crate::orders::OrderState;
use crate::types::Symbol;

/// Errors surfaced to callers of the exchange API. Exchange state is
/// unchanged whenever one of these is returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    /// Malformed order request
    #[error("invalid order: {0}")]
    Validation(String),

    /// Not enough available balance to accept an order
    #[error("not enough {symbol} available, {required} required and {available} available")]
    InsufficientBalance {
        symbol: Symbol,
        required: Decimal,
        available: Decimal,
    },

    /// Unknown order id
    #[error("order {0} not found")]
    OrderNotFound(String),

    /// The order is not in a state that allows the operation
    #[error("order {id} is in {state} state and can't be canceled")]
    OrderNotOpen { id: String, state: OrderState },
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;
