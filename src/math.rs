//! Decimal rounding and balance-update arithmetic
//!
//! The exchange rounds asymmetrically: base amounts are truncated toward
//! zero, quote amounts use banker's rounding, and fees round away from zero.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::types::{BalanceUpdates, OrderOperation};

/// Truncate toward zero at the given number of decimal places.
pub fn truncate_decimal(value: Decimal, precision: u32) -> Decimal {
    value.round_dp_with_strategy(precision, RoundingStrategy::ToZero)
}

/// Round half-to-even at the given number of decimal places.
pub fn round_decimal(value: Decimal, precision: u32) -> Decimal {
    value.round_dp_with_strategy(precision, RoundingStrategy::MidpointNearestEven)
}

/// Round away from zero at the given number of decimal places.
pub fn round_decimal_up(value: Decimal, precision: u32) -> Decimal {
    value.round_dp_with_strategy(precision, RoundingStrategy::AwayFromZero)
}

/// True when `value` carries no more than `precision` decimals.
pub fn conforms_to_precision(value: Decimal, precision: u32) -> bool {
    truncate_decimal(value, precision) == value
}

/// The sign of the base-symbol flow: +1 for buys, -1 for sells.
pub fn base_sign(operation: OrderOperation) -> Decimal {
    match operation {
        OrderOperation::Buy => Decimal::ONE,
        OrderOperation::Sell => -Decimal::ONE,
    }
}

/// Merge two update maps, summing amounts per symbol.
pub fn add_amounts(lhs: &BalanceUpdates, rhs: &BalanceUpdates) -> BalanceUpdates {
    let mut ret = lhs.clone();
    for (symbol, amount) in rhs {
        *ret.entry(symbol.clone()).or_insert(Decimal::ZERO) += amount;
    }
    ret
}

/// Drop zero entries.
pub fn remove_empty_amounts(amounts: BalanceUpdates) -> BalanceUpdates {
    amounts
        .into_iter()
        .filter(|(_, amount)| !amount.is_zero())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Symbol;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    #[test]
    fn test_truncate_decimal() {
        assert_eq!(truncate_decimal(dec!(1.119), 2), dec!(1.11));
        assert_eq!(truncate_decimal(dec!(-1.119), 2), dec!(-1.11));
        assert_eq!(truncate_decimal(dec!(1.5), 0), dec!(1));
        assert_eq!(truncate_decimal(dec!(1.1), 4), dec!(1.1));
    }

    #[test]
    fn test_round_decimal_half_even() {
        assert_eq!(round_decimal(dec!(0.125), 2), dec!(0.12));
        assert_eq!(round_decimal(dec!(0.135), 2), dec!(0.14));
        assert_eq!(round_decimal(dec!(0.126), 2), dec!(0.13));
        assert_eq!(round_decimal(dec!(-0.125), 2), dec!(-0.12));
    }

    #[test]
    fn test_round_decimal_up_is_away_from_zero() {
        assert_eq!(round_decimal_up(dec!(0.001), 2), dec!(0.01));
        assert_eq!(round_decimal_up(dec!(-0.001), 2), dec!(-0.01));
        assert_eq!(round_decimal_up(dec!(0.01), 2), dec!(0.01));
    }

    #[test]
    fn test_conforms_to_precision() {
        assert!(conforms_to_precision(dec!(1.25), 2));
        assert!(conforms_to_precision(dec!(3), 0));
        assert!(!conforms_to_precision(dec!(1.251), 2));
        assert!(!conforms_to_precision(dec!(0.5), 0));
    }

    #[test]
    fn test_add_amounts() {
        let lhs = HashMap::from([
            (Symbol::new("BTC"), dec!(1)),
            (Symbol::new("USDT"), dec!(-100)),
        ]);
        let rhs = HashMap::from([
            (Symbol::new("USDT"), dec!(-0.5)),
            (Symbol::new("ETH"), dec!(2)),
        ]);

        let sum = add_amounts(&lhs, &rhs);
        assert_eq!(sum[&Symbol::new("BTC")], dec!(1));
        assert_eq!(sum[&Symbol::new("USDT")], dec!(-100.5));
        assert_eq!(sum[&Symbol::new("ETH")], dec!(2));
    }

    #[test]
    fn test_remove_empty_amounts() {
        let amounts = HashMap::from([
            (Symbol::new("BTC"), dec!(0)),
            (Symbol::new("USDT"), dec!(0.00)),
            (Symbol::new("ETH"), dec!(1)),
        ]);

        let cleaned = remove_empty_amounts(amounts);
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[&Symbol::new("ETH")], dec!(1));
    }
}
