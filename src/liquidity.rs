//! Liquidity models: how much of a bar's volume an order can consume, and at
//! what slippage

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::types::Bar;

/// Per-pair, per-bar liquidity model.
///
/// `calculate_price_impact` returns the fractional slippage the next
/// `amount` base units would incur, monotonic non-decreasing in `amount`.
/// Buys pay `price * (1 + impact)`, sells receive `price * (1 - impact)`.
pub trait LiquidityStrategy {
    /// Resets the liquidity available for a new bar.
    fn on_bar(&mut self, bar: &Bar);

    /// Base units still fillable on the current bar.
    fn available_liquidity(&self) -> Decimal;

    /// Slippage for taking `amount` base units next. `amount` must not
    /// exceed `available_liquidity`.
    fn calculate_price_impact(&self, amount: Decimal) -> Decimal;

    /// Consumes liquidity. `amount` must not exceed `available_liquidity`.
    fn take_liquidity(&mut self, amount: Decimal);
}

/// Builds a fresh liquidity strategy for each pair the exchange sees.
pub type LiquidityStrategyFactory = Box<dyn Fn() -> Box<dyn LiquidityStrategy>>;

/// Caps fills at a share of each bar's volume and charges a price impact
/// that grows quadratically with the share consumed, reaching
/// `price_impact_pct` when the full share is taken.
#[derive(Debug, Clone)]
pub struct VolumeShareImpact {
    volume_limit_pct: Decimal,
    price_impact_pct: Decimal,
    total: Decimal,
    used: Decimal,
}

impl VolumeShareImpact {
    pub fn new(volume_limit_pct: Decimal, price_impact_pct: Decimal) -> Self {
        assert!(
            volume_limit_pct >= Decimal::ZERO && volume_limit_pct <= dec!(100),
            "volume limit must be a percentage"
        );
        assert!(
            price_impact_pct >= Decimal::ZERO,
            "price impact must be non-negative"
        );
        VolumeShareImpact {
            volume_limit_pct,
            price_impact_pct,
            total: Decimal::ZERO,
            used: Decimal::ZERO,
        }
    }
}

impl Default for VolumeShareImpact {
    fn default() -> Self {
        VolumeShareImpact::new(dec!(25), dec!(10))
    }
}

impl LiquidityStrategy for VolumeShareImpact {
    fn on_bar(&mut self, bar: &Bar) {
        self.total = bar.volume * self.volume_limit_pct / dec!(100);
        self.used = Decimal::ZERO;
    }

    fn available_liquidity(&self) -> Decimal {
        self.total - self.used
    }

    fn calculate_price_impact(&self, amount: Decimal) -> Decimal {
        assert!(
            amount <= self.available_liquidity(),
            "price impact requested for {} with only {} available",
            amount,
            self.available_liquidity()
        );
        if self.total.is_zero() {
            return Decimal::ZERO;
        }
        let volume_share = (self.used + amount) / self.total;
        volume_share * volume_share * self.price_impact_pct / dec!(100)
    }

    fn take_liquidity(&mut self, amount: Decimal) {
        assert!(
            amount >= Decimal::ZERO && amount <= self.available_liquidity(),
            "can't take {} with only {} available",
            amount,
            self.available_liquidity()
        );
        self.used += amount;
    }
}
