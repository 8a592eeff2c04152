//! Futures position tracking: entry-price averaging, margin sizing and
//! realized PnL across side flips (§3, §4.5).

use rust_decimal::Decimal;

use super::ids::Asset;
use super::money::{Price, Volume};
use super::order::OrderSide;

/// A tracked perpetual-futures position. Deleted by the owning Account
/// once `volume` reaches zero (§3 invariant).
#[derive(Debug, Clone)]
pub struct Position {
    pub underlying: Asset,
    pub side: OrderSide,
    pub volume: Volume,
    pub entry_price: Price,
    pub margin_requirement: Decimal,
}

/// Outcome of applying a fill to a (possibly absent) position: the new
/// position state plus any collateral the fill should realize.
pub struct PositionUpdate {
    pub position: Option<Position>,
    pub realized_pnl: Decimal,
    pub margin_delta: Decimal,
}

impl Position {
    /// Open a new position from a fill that had no prior exposure.
    #[must_use]
    pub fn open(underlying: Asset, side: OrderSide, volume: Volume, price: Price, leverage: Decimal) -> Self {
        let margin_requirement = (volume * price) / leverage;
        Self {
            underlying,
            side,
            volume,
            entry_price: price,
            margin_requirement,
        }
    }

    /// Signed volume: positive for long, negative for short, matching
    /// the `side ∈ {-1,+1}` convention in §3.
    #[must_use]
    pub fn signed_volume(&self) -> Decimal {
        self.volume * Decimal::from(self.side.sign())
    }

    /// Apply a fill of `fill_side`/`fill_volume`@`fill_price` to `existing`
    /// (absent when this fill opens a fresh position), returning the
    /// resulting position plus realized PnL and the margin delta to move
    /// into/out of free collateral.
    ///
    /// Implements the same-side averaging, opposite-side PnL realization
    /// (with margin re-scaling while partially flipped) and zero-crossing
    /// re-anchor rules from §4.5.
    #[must_use]
    pub fn apply_fill(
        existing: Option<&Self>,
        underlying: &Asset,
        fill_side: OrderSide,
        fill_volume: Volume,
        fill_price: Price,
        leverage: Decimal,
    ) -> PositionUpdate {
        let Some(existing) = existing else {
            let opened = Self::open(underlying.clone(), fill_side, fill_volume, fill_price, leverage);
            let margin = opened.margin_requirement;
            return PositionUpdate {
                position: Some(opened),
                realized_pnl: Decimal::ZERO,
                margin_delta: margin,
            };
        };

        if fill_side == existing.side {
            // Same side: entry price becomes the volume-weighted average;
            // margin grows by this fill's own notional/leverage.
            let total_volume = existing.volume + fill_volume;
            let weighted = existing.entry_price * existing.volume + fill_price * fill_volume;
            let new_entry = weighted / total_volume;
            let added_margin = (fill_volume * fill_price) / leverage;
            let updated = Self {
                underlying: underlying.clone(),
                side: existing.side,
                volume: total_volume,
                entry_price: new_entry,
                margin_requirement: existing.margin_requirement + added_margin,
            };
            return PositionUpdate {
                position: Some(updated),
                realized_pnl: Decimal::ZERO,
                margin_delta: added_margin,
            };
        }

        // Opposite side: realize PnL on the overlap, then handle the
        // remainder depending on whether it fully, partially or never
        // crosses through zero.
        let closing_sign = Decimal::from(existing.side.sign());
        let overlap = fill_volume.min(existing.volume);
        let realized_pnl = closing_sign * (fill_price - existing.entry_price) * overlap;

        let net_volume = existing.volume - fill_volume;
        if net_volume == Decimal::ZERO {
            // Fully closed: release all margin, no position remains.
            return PositionUpdate {
                position: None,
                realized_pnl,
                margin_delta: -existing.margin_requirement,
            };
        }

        if net_volume > Decimal::ZERO {
            // Still on the original side, just smaller: margin scales
            // down proportionally to the remaining fraction.
            let fraction = net_volume / existing.volume;
            let new_margin = existing.margin_requirement * fraction;
            let updated = Self {
                underlying: underlying.clone(),
                side: existing.side,
                volume: net_volume,
                entry_price: existing.entry_price,
                margin_requirement: new_margin,
            };
            return PositionUpdate {
                position: Some(updated),
                realized_pnl,
                margin_delta: new_margin - existing.margin_requirement,
            };
        }

        // Crossed through zero: flip side, re-anchor entry price to the
        // crossing fill, and size margin to the new (smaller) exposure.
        let flipped_volume = -net_volume;
        let new_margin = (flipped_volume * fill_price) / leverage;
        let updated = Self {
            underlying: underlying.clone(),
            side: existing.side.opposite(),
            volume: flipped_volume,
            entry_price: fill_price,
            margin_requirement: new_margin,
        };
        PositionUpdate {
            position: Some(updated),
            realized_pnl,
            margin_delta: new_margin - existing.margin_requirement,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn opening_fill_creates_position_with_margin() {
        let update = Position::apply_fill(None, &Asset::new("BTC"), OrderSide::Buy, dec!(1), dec!(100), dec!(10));
        let pos = update.position.unwrap();
        assert_eq!(pos.volume, dec!(1));
        assert_eq!(pos.margin_requirement, dec!(10));
        assert_eq!(update.realized_pnl, dec!(0));
    }

    #[test]
    fn same_side_fill_averages_entry_price() {
        let existing = Position::open(Asset::new("BTC"), OrderSide::Buy, dec!(1), dec!(100), dec!(10));
        let update = Position::apply_fill(Some(&existing), &Asset::new("BTC"), OrderSide::Buy, dec!(1), dec!(200), dec!(10));
        let pos = update.position.unwrap();
        assert_eq!(pos.volume, dec!(2));
        assert_eq!(pos.entry_price, dec!(150));
    }

    #[test]
    fn opposite_side_fill_realizes_pnl_and_shrinks() {
        let existing = Position::open(Asset::new("BTC"), OrderSide::Buy, dec!(2), dec!(100), dec!(10));
        let update = Position::apply_fill(Some(&existing), &Asset::new("BTC"), OrderSide::Sell, dec!(1), dec!(110), dec!(10));
        assert_eq!(update.realized_pnl, dec!(10));
        let pos = update.position.unwrap();
        assert_eq!(pos.volume, dec!(1));
        assert_eq!(pos.side, OrderSide::Buy);
    }

    #[test]
    fn crossing_fill_flips_side_and_reanchors() {
        let existing = Position::open(Asset::new("BTC"), OrderSide::Buy, dec!(1), dec!(100), dec!(10));
        let update = Position::apply_fill(Some(&existing), &Asset::new("BTC"), OrderSide::Sell, dec!(3), dec!(110), dec!(10));
        assert_eq!(update.realized_pnl, dec!(10));
        let pos = update.position.unwrap();
        assert_eq!(pos.side, OrderSide::Sell);
        assert_eq!(pos.volume, dec!(2));
        assert_eq!(pos.entry_price, dec!(110));
    }

    #[test]
    fn exact_close_removes_position() {
        let existing = Position::open(Asset::new("BTC"), OrderSide::Buy, dec!(1), dec!(100), dec!(10));
        let update = Position::apply_fill(Some(&existing), &Asset::new("BTC"), OrderSide::Sell, dec!(1), dec!(105), dec!(10));
        assert!(update.position.is_none());
        assert_eq!(update.realized_pnl, dec!(5));
        assert_eq!(update.margin_delta, -dec!(10));
    }
}
