//! Order model: state machine, per-variant fill derivation, and the index of
//! every order the exchange has seen

use std::collections::HashMap;
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::liquidity::LiquidityStrategy;
use crate::math;
use crate::types::{BalanceUpdates, Bar, OrderOperation, Pair, Symbol};

/// Order lifecycle state. Transitions out of `Open` are one-shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Open,
    Completed,
    Canceled,
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderState::Open => write!(f, "open"),
            OrderState::Completed => write!(f, "completed"),
            OrderState::Canceled => write!(f, "canceled"),
        }
    }
}

/// Order variant. Determines how fills derive from a bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Fills at the bar open, plus slippage.
    Market,

    /// Fills when the bar range reaches the limit price, at the limit price
    /// or better.
    Limit,

    /// Latches when the bar range crosses the stop price, then fills like a
    /// market order.
    Stop,

    /// Latches like a stop, then fills like a limit order.
    StopLimit,
}

/// An accepted exchange order.
///
/// Orders accumulate fills across bars. `amount_filled` only grows, and the
/// state leaves `Open` exactly once.
#[derive(Debug, Clone)]
pub struct Order {
    id: String,
    operation: OrderOperation,
    pair: Pair,
    amount: Decimal,
    order_type: OrderType,
    limit_price: Option<Decimal>,
    stop_price: Option<Decimal>,
    triggered: bool,
    state: OrderState,
    amount_filled: Decimal,
    quote_amount_filled: Decimal,
    fees: HashMap<Symbol, Decimal>,
}

impl Order {
    pub(crate) fn new(
        id: String,
        operation: OrderOperation,
        pair: Pair,
        amount: Decimal,
        order_type: OrderType,
        limit_price: Option<Decimal>,
        stop_price: Option<Decimal>,
    ) -> Self {
        Order {
            id,
            operation,
            pair,
            amount,
            order_type,
            limit_price,
            stop_price,
            triggered: false,
            state: OrderState::Open,
            amount_filled: Decimal::ZERO,
            quote_amount_filled: Decimal::ZERO,
            fees: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn operation(&self) -> OrderOperation {
        self.operation
    }

    pub fn pair(&self) -> &Pair {
        &self.pair
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn amount_filled(&self) -> Decimal {
        self.amount_filled
    }

    pub fn amount_remaining(&self) -> Decimal {
        self.amount - self.amount_filled
    }

    pub fn order_type(&self) -> OrderType {
        self.order_type
    }

    pub fn state(&self) -> OrderState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == OrderState::Open
    }

    /// Fees paid so far, as positive amounts per symbol.
    pub fn fees(&self) -> &HashMap<Symbol, Decimal> {
        &self.fees
    }

    /// Average fill price, `None` while nothing has filled.
    pub fn fill_price(&self) -> Option<Decimal> {
        if self.amount_filled.is_zero() {
            None
        } else {
            Some(self.quote_amount_filled / self.amount_filled)
        }
    }

    /// Derives the unrounded, pre-fee balance effect of one bar's worth of
    /// fill: the base symbol signed positive for buys and negative for
    /// sells, the quote symbol with the opposite sign. Empty when the bar
    /// admits no fill.
    ///
    /// The order state never changes here; stop variants may latch their
    /// trigger flag.
    pub fn get_balance_updates(
        &mut self,
        bar: &Bar,
        liquidity: &dyn LiquidityStrategy,
    ) -> BalanceUpdates {
        match self.order_type {
            OrderType::Market => self.market_updates(bar.open, liquidity),
            OrderType::Limit => {
                let limit_price = self.limit_price.expect("limit order without a limit price");
                self.limit_updates(limit_price, bar, liquidity)
            }
            OrderType::Stop => {
                let stop_price = self.stop_price.expect("stop order without a stop price");
                if !self.triggered {
                    if !self.stop_reached(stop_price, bar) {
                        return BalanceUpdates::new();
                    }
                    self.triggered = true;
                    // Worst-of at the trigger instant.
                    let price = match self.operation {
                        OrderOperation::Buy => bar.open.max(stop_price),
                        OrderOperation::Sell => bar.open.min(stop_price),
                    };
                    return self.market_updates(price, liquidity);
                }
                self.market_updates(bar.open, liquidity)
            }
            OrderType::StopLimit => {
                let stop_price = self.stop_price.expect("stop limit order without a stop price");
                let limit_price = self
                    .limit_price
                    .expect("stop limit order without a limit price");
                if !self.triggered {
                    if !self.stop_reached(stop_price, bar) {
                        return BalanceUpdates::new();
                    }
                    self.triggered = true;
                }
                self.limit_updates(limit_price, bar, liquidity)
            }
        }
    }

    /// Records one fill: `balance_updates` is the rounded base/quote flow
    /// and `fees` the rounded charges for it.
    pub fn add_fill(&mut self, balance_updates: &BalanceUpdates, fees: &BalanceUpdates) {
        let base = balance_updates
            .get(&self.pair.base_symbol)
            .copied()
            .unwrap_or(Decimal::ZERO);
        assert!(!base.is_zero(), "fill without a base amount");
        self.amount_filled += base.abs();
        assert!(
            self.amount_filled <= self.amount,
            "order {} filled beyond its amount",
            self.id
        );
        if let Some(quote) = balance_updates.get(&self.pair.quote_symbol) {
            self.quote_amount_filled += quote.abs();
        }
        for (symbol, amount) in fees {
            assert!(amount.is_sign_negative(), "fees are charges");
            *self.fees.entry(symbol.clone()).or_insert(Decimal::ZERO) -= amount;
        }
        if self.amount_filled == self.amount {
            self.state = OrderState::Completed;
        }
    }

    /// Called when a bar produced no viable fill. Market orders can't rest
    /// in the book, so they cancel; other variants stay open for later bars.
    pub fn not_filled(&mut self) {
        if self.order_type == OrderType::Market {
            self.state = OrderState::Canceled;
        }
    }

    pub fn cancel(&mut self) {
        assert!(self.is_open(), "only open orders can be canceled");
        self.state = OrderState::Canceled;
    }

    pub fn get_order_info(&self) -> OrderInfo {
        OrderInfo {
            id: self.id.clone(),
            operation: self.operation,
            pair: self.pair.clone(),
            order_type: self.order_type,
            state: self.state,
            amount: self.amount,
            amount_filled: self.amount_filled,
            amount_remaining: self.amount_remaining(),
            quote_amount_filled: self.quote_amount_filled,
            fill_price: self.fill_price(),
            limit_price: self.limit_price,
            stop_price: self.stop_price,
            fees: self.fees.clone(),
        }
    }

    fn stop_reached(&self, stop_price: Decimal, bar: &Bar) -> bool {
        match self.operation {
            OrderOperation::Buy => bar.high >= stop_price,
            OrderOperation::Sell => bar.low <= stop_price,
        }
    }

    /// Market-style fill at `reference_price` plus slippage.
    fn market_updates(
        &self,
        reference_price: Decimal,
        liquidity: &dyn LiquidityStrategy,
    ) -> BalanceUpdates {
        let amount = self.amount_remaining().min(liquidity.available_liquidity());
        if amount <= Decimal::ZERO {
            return BalanceUpdates::new();
        }
        let impact = liquidity.calculate_price_impact(amount);
        let price = match self.operation {
            OrderOperation::Buy => reference_price * (Decimal::ONE + impact),
            OrderOperation::Sell => reference_price * (Decimal::ONE - impact),
        };
        if price <= Decimal::ZERO {
            return BalanceUpdates::new();
        }
        self.updates_for(amount, price)
    }

    /// Limit-style fill: only when the bar range reaches the limit price,
    /// at the better of the limit price and the open, slipped but never
    /// beyond the limit.
    fn limit_updates(
        &self,
        limit_price: Decimal,
        bar: &Bar,
        liquidity: &dyn LiquidityStrategy,
    ) -> BalanceUpdates {
        match self.operation {
            OrderOperation::Buy if bar.low > limit_price => return BalanceUpdates::new(),
            OrderOperation::Sell if bar.high < limit_price => return BalanceUpdates::new(),
            _ => {}
        }
        let amount = self.amount_remaining().min(liquidity.available_liquidity());
        if amount <= Decimal::ZERO {
            return BalanceUpdates::new();
        }
        let impact = liquidity.calculate_price_impact(amount);
        let price = match self.operation {
            OrderOperation::Buy => {
                (limit_price.min(bar.open) * (Decimal::ONE + impact)).min(limit_price)
            }
            OrderOperation::Sell => {
                (limit_price.max(bar.open) * (Decimal::ONE - impact)).max(limit_price)
            }
        };
        self.updates_for(amount, price)
    }

    fn updates_for(&self, amount: Decimal, price: Decimal) -> BalanceUpdates {
        let sign = math::base_sign(self.operation);
        BalanceUpdates::from([
            (self.pair.base_symbol.clone(), amount * sign),
            (self.pair.quote_symbol.clone(), amount * price * -sign),
        ])
    }
}

/// Point-in-time snapshot of an order, safe to hand to strategy code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderInfo {
    pub id: String,
    pub operation: OrderOperation,
    pub pair: Pair,
    pub order_type: OrderType,
    pub state: OrderState,
    pub amount: Decimal,
    pub amount_filled: Decimal,
    pub amount_remaining: Decimal,
    /// Absolute quote amount traded so far.
    pub quote_amount_filled: Decimal,
    pub fill_price: Option<Decimal>,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub fees: HashMap<Symbol, Decimal>,
}

/// Reduced open-order view returned by `Exchange::get_open_orders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub id: String,
    pub operation: OrderOperation,
    pub pair: Pair,
    pub amount: Decimal,
    pub amount_filled: Decimal,
}

const REINDEX_EVERY: usize = 50;

/// Insertion-ordered store of every order ever accepted, with an amortized
/// view of the ones still open. The open list keeps closed orders around
/// between rebuilds; they are skipped on iteration and dropped from the list
/// every `REINDEX_EVERY` iterations.
#[derive(Default)]
pub struct OrderIndex {
    orders: HashMap<String, Order>,
    open_orders: Vec<String>,
    reindex_counter: usize,
}

impl OrderIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_order(&mut self, order: Order) {
        assert!(
            !self.orders.contains_key(order.id()),
            "duplicate order id {}",
            order.id()
        );
        if order.is_open() {
            self.open_orders.push(order.id().to_string());
        }
        self.orders.insert(order.id().to_string(), order);
    }

    pub fn get_order(&self, id: &str) -> Option<&Order> {
        self.orders.get(id)
    }

    pub fn get_order_mut(&mut self, id: &str) -> Option<&mut Order> {
        self.orders.get_mut(id)
    }

    /// Ids of the currently open orders, in insertion order.
    pub fn open_order_ids(&mut self) -> Vec<String> {
        self.reindex_counter += 1;
        if self.reindex_counter % REINDEX_EVERY == 0 {
            let orders = &self.orders;
            self.open_orders
                .retain(|id| orders.get(id).is_some_and(Order::is_open));
        }
        self.open_orders
            .iter()
            .filter(|id| self.orders.get(*id).is_some_and(Order::is_open))
            .cloned()
            .collect()
    }

    #[cfg(test)]
    fn open_list_len(&self) -> usize {
        self.open_orders.len()
    }
}
