//! Fee models

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::orders::Order;
use crate::types::BalanceUpdates;

/// Computes the fees an order pays on a fill.
///
/// Called once per fill with the rounded balance updates, and once at
/// submission time against estimated updates. The returned map holds
/// negative deltas, one per charged symbol, so fees combine with balance
/// updates by plain addition.
pub trait FeeStrategy {
    fn calculate_fees(&self, order: &Order, balance_updates: &BalanceUpdates) -> BalanceUpdates;
}

/// Charges nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFee;

impl FeeStrategy for NoFee {
    fn calculate_fees(&self, _order: &Order, _balance_updates: &BalanceUpdates) -> BalanceUpdates {
        BalanceUpdates::new()
    }
}

/// Charges a percentage of the traded quote amount, in the quote symbol.
#[derive(Debug, Clone, Copy)]
pub struct PercentageFee {
    percentage: Decimal,
}

impl PercentageFee {
    pub fn new(percentage: Decimal) -> Self {
        assert!(
            percentage >= Decimal::ZERO && percentage < dec!(100),
            "fee percentage out of range"
        );
        PercentageFee { percentage }
    }
}

impl FeeStrategy for PercentageFee {
    fn calculate_fees(&self, order: &Order, balance_updates: &BalanceUpdates) -> BalanceUpdates {
        let mut fees = BalanceUpdates::new();
        if let Some(quote_amount) = balance_updates.get(&order.pair().quote_symbol) {
            let fee = quote_amount.abs() * self.percentage / dec!(100);
            if !fee.is_zero() {
                fees.insert(order.pair().quote_symbol.clone(), -fee);
            }
        }
        fees
    }
}
