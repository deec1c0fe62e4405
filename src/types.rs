//! Core data types used across the simulated exchange

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// An asset identifier, e.g. "BTC" or "USDT"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Symbol(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol(s.to_string())
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Symbol(s)
    }
}

/// A trading pair: base and quote symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pair {
    pub base_symbol: Symbol,
    pub quote_symbol: Symbol,
}

impl Pair {
    pub fn new(base_symbol: impl Into<Symbol>, quote_symbol: impl Into<Symbol>) -> Self {
        Pair {
            base_symbol: base_symbol.into(),
            quote_symbol: quote_symbol.into(),
        }
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base_symbol, self.quote_symbol)
    }
}

/// Decimal precision settings for a trading pair. Base amounts carry at most
/// `base_precision` decimals, quote amounts at most `quote_precision`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairInfo {
    pub base_precision: u32,
    pub quote_precision: u32,
}

impl PairInfo {
    pub fn new(base_precision: u32, quote_precision: u32) -> Self {
        PairInfo {
            base_precision,
            quote_precision,
        }
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderOperation {
    Buy,
    Sell,
}

impl fmt::Display for OrderOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderOperation::Buy => write!(f, "BUY"),
            OrderOperation::Sell => write!(f, "SELL"),
        }
    }
}

/// OHLCV bar for one pair over one interval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub pair: Pair,
    pub datetime: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Signed per-symbol balance deltas. Positive amounts credit the account,
/// negative amounts are charged against it.
pub type BalanceUpdates = HashMap<Symbol, Decimal>;
