//! Monetary scalar types and tick/lot-aligned rendering.
//!
//! Prices and volumes are `rust_decimal::Decimal` rather than floats, per
//! the "float arithmetic for money" redesign: fixed-point decimal avoids
//! the binary-rounding surprises that plague `f64` notionals while still
//! rendering exactly to the venue's expected string form.

use rust_decimal::{Decimal, RoundingStrategy};

/// Price represented as a Decimal for precision.
pub type Price = Decimal;

/// Volume represented as a Decimal for precision.
pub type Volume = Decimal;

/// Side of a limit order, used to pick the rounding direction for price
/// rendering: buys floor toward the book, sells ceil away from it, so a
/// resting order never crosses the tick it was meant to sit behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundSide {
    Buy,
    Sell,
}

/// Align `volume` down to the nearest multiple of `step`.
///
/// `floor(value / step) * step`, per §4.7. Returns `Decimal::ZERO` if
/// `step` is zero or negative.
#[must_use]
pub fn align_volume(volume: Volume, step: Decimal) -> Volume {
    if step <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (volume / step).floor() * step
}

/// Align `price` to `tick` for a limit order on `side`, with a small
/// epsilon nudge to defeat the rounding artifacts `Decimal` division can
/// still leave at the boundary (e.g. `0.1 / 0.1` landing a hair under 1).
#[must_use]
pub fn align_price(price: Price, tick: Decimal, side: RoundSide) -> Price {
    if tick <= Decimal::ZERO {
        return price;
    }
    const EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 12);
    let units = price / tick;
    let aligned_units = match side {
        RoundSide::Buy => (units + EPSILON).floor(),
        RoundSide::Sell => (units - EPSILON).ceil(),
    };
    aligned_units * tick
}

/// Render `value` as a plain decimal string truncated to `precision`
/// fractional digits, the format venues expect in REST payloads.
#[must_use]
pub fn render(value: Decimal, precision: u32) -> String {
    value
        .round_dp_with_strategy(precision, RoundingStrategy::ToZero)
        .normalize()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn price_and_volume_are_decimal() {
        let price: Price = dec!(1.50);
        let volume: Volume = dec!(100.0);
        assert_eq!(price + volume, dec!(101.50));
    }

    #[test]
    fn align_volume_floors_to_step() {
        assert_eq!(align_volume(dec!(1.2345), dec!(0.001)), dec!(1.234));
        assert_eq!(align_volume(dec!(1.0), dec!(0.1)), dec!(1.0));
    }

    #[test]
    fn align_price_buy_floors_sell_ceils() {
        let tick = dec!(0.5);
        assert_eq!(align_price(dec!(10.7), tick, RoundSide::Buy), dec!(10.5));
        assert_eq!(align_price(dec!(10.3), tick, RoundSide::Sell), dec!(10.5));
    }

    #[test]
    fn render_truncates_without_rounding_up() {
        assert_eq!(render(dec!(1.23999), 3), "1.239");
    }
}
