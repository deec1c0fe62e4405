//! Account balance ledger: available funds plus per-order holds
//!
//! Symbols are independent; amounts never aggregate across symbols. Every
//! amount stays non-negative at rest.

use std::collections::{HashMap, HashSet};

use rust_decimal::Decimal;

use crate::orders::Order;
use crate::types::{BalanceUpdates, Symbol};

/// Tracks available funds per symbol and the amounts reserved against open
/// orders.
#[derive(Debug, Default)]
pub struct AccountBalances {
    available: HashMap<Symbol, Decimal>,
    holds: HashMap<String, HashMap<Symbol, Decimal>>,
}

impl AccountBalances {
    pub fn new(initial: HashMap<Symbol, Decimal>) -> Self {
        for (symbol, amount) in &initial {
            assert!(
                *amount >= Decimal::ZERO,
                "negative initial balance {} for {}",
                amount,
                symbol
            );
        }
        AccountBalances {
            available: initial,
            holds: HashMap::new(),
        }
    }

    pub fn get_available_balance(&self, symbol: &Symbol) -> Decimal {
        self.available.get(symbol).copied().unwrap_or(Decimal::ZERO)
    }

    /// Total amount held for `symbol` across all orders.
    pub fn get_balance_on_hold(&self, symbol: &Symbol) -> Decimal {
        self.holds
            .values()
            .filter_map(|holds| holds.get(symbol))
            .sum()
    }

    pub fn get_balance_on_hold_for_order(&self, order_id: &str, symbol: &Symbol) -> Decimal {
        self.holds
            .get(order_id)
            .and_then(|holds| holds.get(symbol))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Symbols with any balance, available or held.
    pub fn get_symbols(&self) -> Vec<Symbol> {
        let mut symbols: HashSet<Symbol> = self.available.keys().cloned().collect();
        for holds in self.holds.values() {
            symbols.extend(holds.keys().cloned());
        }
        symbols.into_iter().collect()
    }

    /// Moves the required amounts from available funds into holds for a newly
    /// accepted order. The exchange verifies availability first; a shortfall
    /// here is a programming error.
    pub fn order_accepted(&mut self, order: &Order, required: &BalanceUpdates) {
        for (symbol, amount) in required {
            assert!(
                *amount > Decimal::ZERO,
                "invalid required amount {} for {}",
                amount,
                symbol
            );
            let available = self.available.entry(symbol.clone()).or_insert(Decimal::ZERO);
            assert!(
                *available >= *amount,
                "hold of {} {} exceeds available {}",
                amount,
                symbol,
                available
            );
            *available -= amount;
            *self
                .holds
                .entry(order.id().to_string())
                .or_default()
                .entry(symbol.clone())
                .or_insert(Decimal::ZERO) += amount;
        }
    }

    /// Applies a signed balance update for an order. Negative components
    /// consume the order's hold first and fall through to available funds;
    /// positive components credit available funds. When the order is no
    /// longer open, any remaining hold is released back to available.
    pub fn order_updated(&mut self, order: &Order, updates: &BalanceUpdates) {
        for (symbol, amount) in updates {
            if *amount >= Decimal::ZERO {
                *self.available.entry(symbol.clone()).or_insert(Decimal::ZERO) += amount;
                continue;
            }
            let mut debit = -*amount;
            if let Some(hold) = self
                .holds
                .get_mut(order.id())
                .and_then(|holds| holds.get_mut(symbol))
            {
                let taken = debit.min(*hold);
                *hold -= taken;
                debit -= taken;
            }
            if debit > Decimal::ZERO {
                let available = self.available.entry(symbol.clone()).or_insert(Decimal::ZERO);
                assert!(
                    *available >= debit,
                    "update of {} {} for order {} drives the balance below zero",
                    amount,
                    symbol,
                    order.id()
                );
                *available -= debit;
            }
        }

        if !order.is_open() {
            if let Some(holds) = self.holds.remove(order.id()) {
                for (symbol, amount) in holds {
                    *self.available.entry(symbol).or_insert(Decimal::ZERO) += amount;
                }
            }
        }
    }
}
