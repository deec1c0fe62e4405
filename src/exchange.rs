//! The simulated exchange: order acceptance, balance holds, and the per-bar
//! matching loop
//!
//! On each bar the exchange caches the last price, matches every open order
//! for the bar's pair against the liquidity strategy, and only then forwards
//! the bar to strategy subscribers. Orders created while handling bar `t`
//! are first matched at bar `t + 1`, which keeps strategies free of
//! look-ahead bias.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::balances::AccountBalances;
use crate::dispatcher::{
    BarEvent, EventDispatcher, EventHandler, EventSource, FifoQueueEventSource,
};
use crate::errors::{ExchangeError, ExchangeResult};
use crate::fees::{FeeStrategy, NoFee};
use crate::liquidity::{LiquidityStrategy, LiquidityStrategyFactory, VolumeShareImpact};
use crate::math;
use crate::orders::{OpenOrder, Order, OrderIndex, OrderInfo};
use crate::requests::OrderRequest;
use crate::types::{BalanceUpdates, Bar, OrderOperation, Pair, PairInfo, Symbol};

/// Available and total (available plus on hold) funds for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub available: Decimal,
    pub total: Decimal,
}

/// Returned by the `create_*_order` entry points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedOrder {
    pub id: String,
}

/// Returned by `cancel_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanceledOrder {
    pub id: String,
}

/// The forwarding queue for one pair plus its dispatcher-facing wrapper, so
/// repeated subscriptions attach to the same source.
struct PairEventSource {
    queue: FifoQueueEventSource,
    source: Rc<RefCell<dyn EventSource>>,
}

struct ExchangeState {
    dispatcher: EventDispatcher,
    balances: AccountBalances,
    liquidity_strategy_factory: LiquidityStrategyFactory,
    liquidity_strategies: HashMap<Pair, Box<dyn LiquidityStrategy>>,
    fee_strategy: Box<dyn FeeStrategy>,
    orders: OrderIndex,
    bar_event_sources: HashMap<Pair, PairEventSource>,
    pairs_info: HashMap<Pair, PairInfo>,
    default_pair_info: PairInfo,
    last_bars: HashMap<Pair, Bar>,
    bid_ask_spread: Decimal,
}

/// A deterministic backtesting exchange.
///
/// Cloning returns a handle to the same exchange, so strategy callbacks can
/// keep one while the dispatcher delivers bars to another. All state lives
/// on one thread; every entry point completes atomically.
#[derive(Clone)]
pub struct Exchange {
    state: Rc<RefCell<ExchangeState>>,
}

impl Exchange {
    pub fn new(dispatcher: &EventDispatcher, initial_balances: HashMap<Symbol, Decimal>) -> Self {
        Exchange {
            state: Rc::new(RefCell::new(ExchangeState {
                dispatcher: dispatcher.clone(),
                balances: AccountBalances::new(initial_balances),
                liquidity_strategy_factory: Box::new(|| Box::new(VolumeShareImpact::default())),
                liquidity_strategies: HashMap::new(),
                fee_strategy: Box::new(NoFee),
                orders: OrderIndex::new(),
                bar_event_sources: HashMap::new(),
                pairs_info: HashMap::new(),
                default_pair_info: PairInfo::new(0, 2),
                last_bars: HashMap::new(),
                bid_ask_spread: dec!(0.5),
            })),
        }
    }

    pub fn with_liquidity_strategy_factory(self, factory: LiquidityStrategyFactory) -> Self {
        self.state.borrow_mut().liquidity_strategy_factory = factory;
        self
    }

    pub fn with_fee_strategy(self, fee_strategy: Box<dyn FeeStrategy>) -> Self {
        self.state.borrow_mut().fee_strategy = fee_strategy;
        self
    }

    pub fn with_default_pair_info(self, pair_info: PairInfo) -> Self {
        self.state.borrow_mut().default_pair_info = pair_info;
        self
    }

    /// Bid/ask spread around the last close, in percent.
    pub fn with_bid_ask_spread(self, spread_pct: Decimal) -> Self {
        self.state.borrow_mut().bid_ask_spread = spread_pct;
        self
    }

    pub fn get_balance(&self, symbol: &Symbol) -> Balance {
        let state = self.state.borrow();
        let available = state.balances.get_available_balance(symbol);
        let hold = state.balances.get_balance_on_hold(symbol);
        Balance {
            available,
            total: available + hold,
        }
    }

    /// Balances for every symbol with funds, available or on hold.
    pub fn get_balances(&self) -> HashMap<Symbol, Balance> {
        let state = self.state.borrow();
        let mut ret = HashMap::new();
        for symbol in state.balances.get_symbols() {
            let available = state.balances.get_available_balance(&symbol);
            let hold = state.balances.get_balance_on_hold(&symbol);
            if !available.is_zero() || !hold.is_zero() {
                ret.insert(
                    symbol,
                    Balance {
                        available,
                        total: available + hold,
                    },
                );
            }
        }
        ret
    }

    /// Synthetic bid/ask around the last close, `(None, None)` before the
    /// first bar for the pair.
    pub fn get_bid_ask(&self, pair: &Pair) -> (Option<Decimal>, Option<Decimal>) {
        let state = self.state.borrow();
        let Some(last_price) = state.last_bars.get(pair).map(|bar| bar.close) else {
            return (None, None);
        };
        let pair_info = state.pair_info(pair);
        let half_spread = math::truncate_decimal(
            last_price * state.bid_ask_spread / dec!(100) / dec!(2),
            pair_info.quote_precision,
        );
        (Some(last_price - half_spread), Some(last_price + half_spread))
    }

    /// Places an order request: validates it, reserves the required
    /// balances, and adds the order to the index. The order is first matched
    /// on the next bar for its pair.
    pub fn create_order(&self, order_request: OrderRequest) -> ExchangeResult<CreatedOrder> {
        let state = &mut *self.state.borrow_mut();

        let pair_info = state.pair_info(&order_request.pair);
        order_request.validate(&pair_info)?;

        let required_balances = state.estimate_required_balances(&order_request);
        state.check_available_balance(&required_balances)?;

        let order = order_request.create_order(new_order_id());
        let created = CreatedOrder {
            id: order.id().to_string(),
        };
        debug!(
            "Order accepted: id={} {} {} {}",
            created.id,
            order.operation(),
            order.amount(),
            order.pair()
        );
        state.balances.order_accepted(&order, &required_balances);
        state.orders.add_order(order);
        Ok(created)
    }

    pub fn create_market_order(
        &self,
        operation: OrderOperation,
        pair: Pair,
        amount: Decimal,
    ) -> ExchangeResult<CreatedOrder> {
        self.create_order(OrderRequest::market(operation, pair, amount))
    }

    pub fn create_limit_order(
        &self,
        operation: OrderOperation,
        pair: Pair,
        amount: Decimal,
        limit_price: Decimal,
    ) -> ExchangeResult<CreatedOrder> {
        self.create_order(OrderRequest::limit(operation, pair, amount, limit_price))
    }

    pub fn create_stop_order(
        &self,
        operation: OrderOperation,
        pair: Pair,
        amount: Decimal,
        stop_price: Decimal,
    ) -> ExchangeResult<CreatedOrder> {
        self.create_order(OrderRequest::stop(operation, pair, amount, stop_price))
    }

    pub fn create_stop_limit_order(
        &self,
        operation: OrderOperation,
        pair: Pair,
        amount: Decimal,
        stop_price: Decimal,
        limit_price: Decimal,
    ) -> ExchangeResult<CreatedOrder> {
        self.create_order(OrderRequest::stop_limit(
            operation,
            pair,
            amount,
            stop_price,
            limit_price,
        ))
    }

    /// Cancels an open order and releases its hold.
    pub fn cancel_order(&self, order_id: &str) -> ExchangeResult<CanceledOrder> {
        let state = &mut *self.state.borrow_mut();
        let ExchangeState {
            orders, balances, ..
        } = state;
        let order = orders
            .get_order_mut(order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))?;
        if !order.is_open() {
            return Err(ExchangeError::OrderNotOpen {
                id: order_id.to_string(),
                state: order.state(),
            });
        }
        order.cancel();
        balances.order_updated(order, &BalanceUpdates::new());
        Ok(CanceledOrder {
            id: order_id.to_string(),
        })
    }

    pub fn get_order_info(&self, order_id: &str) -> ExchangeResult<OrderInfo> {
        self.state
            .borrow()
            .orders
            .get_order(order_id)
            .map(Order::get_order_info)
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))
    }

    /// Open orders in insertion order, optionally restricted to one pair.
    pub fn get_open_orders(&self, pair: Option<&Pair>) -> Vec<OpenOrder> {
        let state = &mut *self.state.borrow_mut();
        state
            .orders
            .open_order_ids()
            .iter()
            .filter_map(|id| state.orders.get_order(id))
            .filter(|order| pair.map_or(true, |pair| order.pair() == pair))
            .map(|order| OpenOrder {
                id: order.id().to_string(),
                operation: order.operation(),
                pair: order.pair().clone(),
                amount: order.amount(),
                amount_filled: order.amount_filled(),
            })
            .collect()
    }

    pub fn get_pair_info(&self, pair: &Pair) -> PairInfo {
        self.state.borrow().pair_info(pair)
    }

    pub fn set_pair_info(&self, pair: Pair, pair_info: PairInfo) {
        self.state.borrow_mut().pairs_info.insert(pair, pair_info);
    }

    /// Subscribes the exchange to a source of historical bars.
    pub fn add_bar_source<S: EventSource + 'static>(&self, source: S) {
        let dispatcher = self.state.borrow().dispatcher.clone();
        let exchange = self.clone();
        dispatcher.subscribe(
            Rc::new(RefCell::new(source)),
            Box::new(move |event| {
                exchange.on_bar_event(event);
                Ok(())
            }),
        );
    }

    /// Registers a handler for bars of `pair`, delivered after the exchange
    /// has processed them.
    pub fn subscribe_to_bar_events(&self, pair: Pair, handler: EventHandler) {
        let (dispatcher, source) = {
            let state = &mut *self.state.borrow_mut();
            let entry = state.bar_event_sources.entry(pair).or_insert_with(|| {
                let queue = FifoQueueEventSource::new();
                let source: Rc<RefCell<dyn EventSource>> = Rc::new(RefCell::new(queue.clone()));
                PairEventSource { queue, source }
            });
            (state.dispatcher.clone(), entry.source.clone())
        };
        dispatcher.subscribe(source, handler);
    }

    fn on_bar_event(&self, event: &BarEvent) {
        let state = &mut *self.state.borrow_mut();
        state
            .last_bars
            .insert(event.bar.pair.clone(), event.bar.clone());
        state.process_orders(event);
        // Forward the bar to the pair's subscribers, if any.
        if let Some(entry) = state.bar_event_sources.get(&event.bar.pair) {
            entry.queue.push(event.clone());
        }
    }
}

impl ExchangeState {
    fn pair_info(&self, pair: &Pair) -> PairInfo {
        self.pairs_info
            .get(pair)
            .copied()
            .unwrap_or(self.default_pair_info)
    }

    fn process_orders(&mut self, event: &BarEvent) {
        let ExchangeState {
            balances,
            liquidity_strategy_factory,
            liquidity_strategies,
            fee_strategy,
            orders,
            pairs_info,
            default_pair_info,
            ..
        } = self;
        let pair = &event.bar.pair;
        let liquidity = liquidity_strategies
            .entry(pair.clone())
            .or_insert_with(|| liquidity_strategy_factory());
        liquidity.on_bar(&event.bar);
        let pair_info = pairs_info.get(pair).copied().unwrap_or(*default_pair_info);

        for order_id in orders.open_order_ids() {
            let order = orders
                .get_order_mut(&order_id)
                .expect("indexed order must exist");
            if order.pair() != pair {
                continue;
            }
            process_order(
                order,
                &event.bar,
                &pair_info,
                liquidity.as_mut(),
                fee_strategy.as_ref(),
                balances,
            );
        }
    }

    /// Expected balance updates for a request, computed like a fill would
    /// be, reduced to the amounts the account must part with.
    fn estimate_required_balances(&self, order_request: &OrderRequest) -> BalanceUpdates {
        let pair_info = self.pair_info(&order_request.pair);
        let base_sign = math::base_sign(order_request.operation);

        let mut estimated = BalanceUpdates::new();
        estimated.insert(
            order_request.pair.base_symbol.clone(),
            order_request.amount * base_sign,
        );
        let estimated_fill_price = order_request
            .estimated_fill_price()
            .or_else(|| self.last_bars.get(&order_request.pair).map(|bar| bar.close));
        if let Some(price) = estimated_fill_price {
            estimated.insert(
                order_request.pair.quote_symbol.clone(),
                order_request.amount * price * -base_sign,
            );
        }
        let mut estimated = round_balance_updates(estimated, &order_request.pair, &pair_info);

        // Fees can only be estimated once both sides of the trade are.
        if estimated.len() == 2 {
            let order = order_request.create_order("temporary".to_string());
            let fees = self.fee_strategy.calculate_fees(&order, &estimated);
            let fees = round_fees(fees, &order_request.pair, &pair_info);
            estimated = math::add_amounts(&estimated, &fees);
        }

        estimated
            .into_iter()
            .filter(|(_, amount)| *amount < Decimal::ZERO)
            .map(|(symbol, amount)| (symbol, -amount))
            .collect()
    }

    fn check_available_balance(&self, required_balances: &BalanceUpdates) -> ExchangeResult<()> {
        for (symbol, required) in required_balances {
            assert!(
                *required > Decimal::ZERO,
                "invalid required balance {} for {}",
                required,
                symbol
            );
            let available = self.balances.get_available_balance(symbol);
            if available < *required {
                return Err(ExchangeError::InsufficientBalance {
                    symbol: symbol.clone(),
                    required: *required,
                    available,
                });
            }
        }
        Ok(())
    }
}

/// Matches one open order against one bar and commits the result.
fn process_order(
    order: &mut Order,
    bar: &Bar,
    pair_info: &PairInfo,
    liquidity: &mut dyn LiquidityStrategy,
    fee_strategy: &dyn FeeStrategy,
    balances: &mut AccountBalances,
) {
    let prev_state = order.state();
    let balance_updates = order.get_balance_updates(bar, &*liquidity);
    assert!(
        order.state() == prev_state,
        "order state changed inside get_balance_updates"
    );

    // Nothing to fill on this bar.
    if balance_updates.is_empty() {
        return order_not_filled(order, balances);
    }

    // Base and quote amounts must both be present, with opposite signs.
    let base_sign = math::base_sign(order.operation());
    assert_amount_sign(&balance_updates, &order.pair().base_symbol, base_sign);
    assert_amount_sign(&balance_updates, &order.pair().quote_symbol, -base_sign);

    let balance_updates = round_balance_updates(balance_updates, order.pair(), pair_info);
    debug!(
        "Processing order {}: balance updates {:?}",
        order.id(),
        balance_updates
    );
    if !balance_updates.contains_key(&order.pair().base_symbol)
        || !balance_updates.contains_key(&order.pair().quote_symbol)
    {
        return order_not_filled(order, balances);
    }

    let fees = fee_strategy.calculate_fees(order, &balance_updates);
    let fees = round_fees(fees, order.pair(), pair_info);
    let final_updates = math::remove_empty_amounts(math::add_amounts(&balance_updates, &fees));

    // Affordability: the post-update balance per symbol, counting this
    // order's own hold, must stay non-negative.
    for (symbol, update) in &final_updates {
        let available = balances.get_available_balance(symbol)
            + balances.get_balance_on_hold_for_order(order.id(), symbol);
        if available + update < Decimal::ZERO {
            debug!(
                "Balance short processing order {}: {} {}",
                order.id(),
                symbol,
                available + update
            );
            return order_not_filled(order, balances);
        }
    }

    let base_amount = balance_updates[&order.pair().base_symbol].abs();
    liquidity.take_liquidity(base_amount);
    order.add_fill(&balance_updates, &fees);
    balances.order_updated(order, &final_updates);
    debug!(
        "Order {} updated: state={} amount_filled={}",
        order.id(),
        order.state(),
        order.amount_filled()
    );
}

fn order_not_filled(order: &mut Order, balances: &mut AccountBalances) {
    order.not_filled();
    // Release any pending hold if the order is no longer open.
    if !order.is_open() {
        balances.order_updated(order, &BalanceUpdates::new());
        debug!("Order {} not filled, now {}", order.id(), order.state());
    }
}

fn assert_amount_sign(balance_updates: &BalanceUpdates, symbol: &Symbol, sign: Decimal) {
    let amount = balance_updates.get(symbol);
    let amount = *amount.unwrap_or_else(|| panic!("{} is missing from the balance updates", symbol));
    assert!(!amount.is_zero(), "{} amount is zero", symbol);
    assert!(
        (amount > Decimal::ZERO) == (sign > Decimal::ZERO),
        "{} sign is wrong, it should be {}",
        symbol,
        sign
    );
}

/// Truncates the base amount so a fill never exceeds the available
/// liquidity, rounds the quote amount half-even, and drops entries that
/// vanished.
fn round_balance_updates(
    mut balance_updates: BalanceUpdates,
    pair: &Pair,
    pair_info: &PairInfo,
) -> BalanceUpdates {
    if let Some(base_amount) = balance_updates.get_mut(&pair.base_symbol) {
        *base_amount = math::truncate_decimal(*base_amount, pair_info.base_precision);
    }
    if let Some(quote_amount) = balance_updates.get_mut(&pair.quote_symbol) {
        *quote_amount = math::round_decimal(*quote_amount, pair_info.quote_precision);
    }
    math::remove_empty_amounts(balance_updates)
}

/// Rounds fees away from zero at the pair's precision. A fee in a symbol
/// other than base/quote has no known precision and is left untouched.
fn round_fees(mut fees: BalanceUpdates, pair: &Pair, pair_info: &PairInfo) -> BalanceUpdates {
    for (symbol, amount) in fees.iter_mut() {
        let precision = if *symbol == pair.base_symbol {
            Some(pair_info.base_precision)
        } else if *symbol == pair.quote_symbol {
            Some(pair_info.quote_precision)
        } else {
            None
        };
        if let Some(precision) = precision {
            *amount = math::round_decimal_up(*amount, precision);
        }
    }
    math::remove_empty_amounts(fees)
}

/// 128 random bits as a 32-char lowercase hex string.
fn new_order_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc_usdt() -> Pair {
        Pair::new(Symbol::new("BTC"), Symbol::new("USDT"))
    }

    fn exchange_with(initial: &[(&str, Decimal)]) -> Exchange {
        let dispatcher = EventDispatcher::new();
        let initial_balances = initial
            .iter()
            .map(|(symbol, amount)| (Symbol::new(*symbol), *amount))
            .collect();
        Exchange::new(&dispatcher, initial_balances).with_default_pair_info(PairInfo::new(8, 2))
    }

    #[test]
    fn test_order_ids_are_128_bit_hex() {
        let id = new_order_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_order_id(), new_order_id());
    }

    #[test]
    fn test_create_limit_order_places_hold() {
        let exchange = exchange_with(&[("USDT", dec!(10000))]);
        exchange
            .create_limit_order(OrderOperation::Buy, btc_usdt(), dec!(1), dec!(50))
            .unwrap();

        let balance = exchange.get_balance(&Symbol::new("USDT"));
        assert_eq!(balance.available, dec!(9950));
        assert_eq!(balance.total, dec!(10000));
    }

    #[test]
    fn test_create_order_insufficient_balance() {
        let exchange = exchange_with(&[("USDT", dec!(100))]);
        let err = exchange
            .create_limit_order(OrderOperation::Buy, btc_usdt(), dec!(10), dec!(50))
            .unwrap_err();

        assert_eq!(
            err,
            ExchangeError::InsufficientBalance {
                symbol: Symbol::new("USDT"),
                required: dec!(500),
                available: dec!(100),
            }
        );
        // Nothing was accepted.
        assert!(exchange.get_open_orders(None).is_empty());
        assert_eq!(exchange.get_balance(&Symbol::new("USDT")).available, dec!(100));
    }

    #[test]
    fn test_sell_requires_base_balance() {
        let exchange = exchange_with(&[("USDT", dec!(10000))]);
        let err = exchange
            .create_limit_order(OrderOperation::Sell, btc_usdt(), dec!(1), dec!(50))
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientBalance { symbol, .. } if symbol == Symbol::new("BTC")));
    }

    #[test]
    fn test_market_buy_without_last_price_holds_nothing_on_quote() {
        // No bar seen: the quote requirement can't be estimated, so only the
        // base side (nothing, for a buy) is held.
        let exchange = exchange_with(&[("USDT", dec!(10000))]);
        exchange
            .create_market_order(OrderOperation::Buy, btc_usdt(), dec!(1))
            .unwrap();
        assert_eq!(exchange.get_balance(&Symbol::new("USDT")).available, dec!(10000));
    }

    #[test]
    fn test_cancel_order_errors() {
        let exchange = exchange_with(&[("USDT", dec!(10000))]);
        assert!(matches!(
            exchange.cancel_order("missing"),
            Err(ExchangeError::OrderNotFound(_))
        ));

        let created = exchange
            .create_limit_order(OrderOperation::Buy, btc_usdt(), dec!(1), dec!(50))
            .unwrap();
        exchange.cancel_order(&created.id).unwrap();
        assert!(matches!(
            exchange.cancel_order(&created.id),
            Err(ExchangeError::OrderNotOpen { .. })
        ));
    }

    #[test]
    fn test_get_bid_ask_without_bars() {
        let exchange = exchange_with(&[("USDT", dec!(10000))]);
        assert_eq!(exchange.get_bid_ask(&btc_usdt()), (None, None));
    }

    #[test]
    fn test_pair_info_defaults_and_overrides() {
        let exchange = exchange_with(&[("USDT", dec!(10000))]);
        assert_eq!(exchange.get_pair_info(&btc_usdt()), PairInfo::new(8, 2));

        exchange.set_pair_info(btc_usdt(), PairInfo::new(4, 1));
        assert_eq!(exchange.get_pair_info(&btc_usdt()), PairInfo::new(4, 1));
    }

    #[test]
    fn test_required_balance_estimation_includes_fees() {
        let dispatcher = EventDispatcher::new();
        let exchange = Exchange::new(
            &dispatcher,
            HashMap::from([(Symbol::new("USDT"), dec!(100.20))]),
        )
        .with_default_pair_info(PairInfo::new(8, 2))
        .with_fee_strategy(Box::new(crate::fees::PercentageFee::new(dec!(0.25))));

        // 1 BTC at 100 plus the 0.25% fee requires 100.25.
        let err = exchange
            .create_limit_order(OrderOperation::Buy, btc_usdt(), dec!(1), dec!(100))
            .unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::InsufficientBalance { required, .. } if required == dec!(100.25)
        ));
    }
}
