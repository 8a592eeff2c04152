//! Builders for domain primitives used across tests.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::domain::market::Market;
use crate::signer::Keys;

/// A `BTC`/`USDT` spot market with permissive filters.
#[must_use]
pub fn spot_market(base: &str, quote: &str, venue_symbol: &str) -> Market {
    Market::spot(base, quote, venue_symbol, dec!(0.01), dec!(0.0001), dec!(0.0001), dec!(10), 8, 8)
}

/// A perpetual future on `underlying` with permissive filters.
#[must_use]
pub fn perpetual_market(underlying: &str, venue_symbol: &str) -> Market {
    Market::perpetual(underlying, venue_symbol, dec!(0.01), dec!(0.001), dec!(0.001), dec!(10), 8, 8)
}

/// Deterministic, obviously-fake credentials for signing tests.
#[must_use]
pub fn keys() -> Keys {
    Keys { api_key: "test-key".to_string(), secret: "test-secret".to_string(), subaccount: None }
}

#[must_use]
pub fn dec(value: &str) -> Decimal {
    value.parse().expect("valid decimal literal")
}
