//! Market metadata: the immutable per-symbol filters a venue publishes
//! via its exchange-info endpoint.

use rust_decimal::Decimal;

use super::ids::Asset;
use super::money::{align_price, align_volume, render, RoundSide};

/// Spot markets trade base against quote; perpetuals trade an underlying
/// against a synthetic "PERP" quote and carry no settlement date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketKind {
    Spot,
    Future,
}

/// Immutable market metadata, created at `connect()` and destroyed on
/// venue close (§3). Two markets are the same pair iff their base/quote
/// match; `venue_symbol` is purely the wire-format name.
#[derive(Debug, Clone)]
pub struct Market {
    kind: MarketKind,
    base: Asset,
    quote: Asset,
    venue_symbol: String,
    price_increment: Decimal,
    size_increment: Decimal,
    min_provide_size: Decimal,
    min_quote_volume: Decimal,
    base_precision: u32,
    quote_precision: u32,
}

impl Market {
    /// Construct a spot market for `base`/`quote`.
    #[allow(clippy::too_many_arguments)]
    pub fn spot(
        base: impl Into<Asset>,
        quote: impl Into<Asset>,
        venue_symbol: impl Into<String>,
        price_increment: Decimal,
        size_increment: Decimal,
        min_provide_size: Decimal,
        min_quote_volume: Decimal,
        base_precision: u32,
        quote_precision: u32,
    ) -> Self {
        Self {
            kind: MarketKind::Spot,
            base: base.into(),
            quote: quote.into(),
            venue_symbol: venue_symbol.into(),
            price_increment,
            size_increment,
            min_provide_size,
            min_quote_volume,
            base_precision,
            quote_precision,
        }
    }

    /// Construct a perpetual future on `underlying`, quoted in USDT and
    /// identified as `(underlying, "PERP")` per the glossary.
    #[allow(clippy::too_many_arguments)]
    pub fn perpetual(
        underlying: impl Into<Asset>,
        venue_symbol: impl Into<String>,
        price_increment: Decimal,
        size_increment: Decimal,
        min_provide_size: Decimal,
        min_quote_volume: Decimal,
        base_precision: u32,
        quote_precision: u32,
    ) -> Self {
        Self {
            kind: MarketKind::Future,
            base: underlying.into(),
            quote: Asset::new("PERP"),
            venue_symbol: venue_symbol.into(),
            price_increment,
            size_increment,
            min_provide_size,
            min_quote_volume,
            base_precision,
            quote_precision,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> MarketKind {
        self.kind
    }

    #[must_use]
    pub const fn base(&self) -> &Asset {
        &self.base
    }

    #[must_use]
    pub const fn quote(&self) -> &Asset {
        &self.quote
    }

    #[must_use]
    pub fn venue_symbol(&self) -> &str {
        &self.venue_symbol
    }

    #[must_use]
    pub const fn price_increment(&self) -> Decimal {
        self.price_increment
    }

    #[must_use]
    pub const fn size_increment(&self) -> Decimal {
        self.size_increment
    }

    #[must_use]
    pub const fn min_provide_size(&self) -> Decimal {
        self.min_provide_size
    }

    #[must_use]
    pub const fn min_quote_volume(&self) -> Decimal {
        self.min_quote_volume
    }

    /// `(base, quote)` pair, the key identity used across Account and
    /// Rebalancer lookups.
    #[must_use]
    pub fn pair(&self) -> (Asset, Asset) {
        (self.base.clone(), self.quote.clone())
    }

    /// Floor `volume` to this market's size increment.
    #[must_use]
    pub fn align_volume(&self, volume: Decimal) -> Decimal {
        align_volume(volume, self.size_increment)
    }

    /// Align `price` to this market's tick for a limit order on `side`.
    #[must_use]
    pub fn align_price(&self, price: Decimal, side: RoundSide) -> Decimal {
        align_price(price, self.price_increment, side)
    }

    /// Render a volume string at base precision for REST payloads.
    #[must_use]
    pub fn render_volume(&self, volume: Decimal) -> String {
        render(volume, self.base_precision)
    }

    /// Render a price string at quote precision for REST payloads.
    #[must_use]
    pub fn render_price(&self, price: Decimal) -> String {
        render(price, self.quote_precision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc_usdt() -> Market {
        Market::spot("BTC", "USDT", "BTCUSDT", dec!(0.01), dec!(0.0001), dec!(0.0001), dec!(10), 6, 2)
    }

    #[test]
    fn pair_identifies_base_quote() {
        let m = btc_usdt();
        assert_eq!(m.pair(), (Asset::new("BTC"), Asset::new("USDT")));
    }

    #[test]
    fn perpetual_quotes_against_perp() {
        let m = Market::perpetual("BTC", "BTC-PERP", dec!(0.5), dec!(0.001), dec!(0.001), dec!(10), 6, 1);
        assert_eq!(m.quote(), &Asset::new("PERP"));
        assert_eq!(m.kind(), MarketKind::Future);
    }

    #[test]
    fn render_volume_truncates_to_base_precision() {
        let m = btc_usdt();
        assert_eq!(m.render_volume(dec!(1.23456789)), "1.234567");
    }
}
