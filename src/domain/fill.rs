//! Fill (trade execution) value type.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::ids::{Asset, FillId, OrderId};
use super::money::{Price, Volume};
use super::order::OrderSide;

/// An immutable trade execution against one of the account's orders.
///
/// Appended to the owning [`super::order::Order`]'s `fills` map; never
/// mutated after construction (§3).
#[derive(Debug, Clone)]
pub struct Fill {
    pub id: FillId,
    pub order_id: OrderId,
    pub time: DateTime<Utc>,
    pub venue_symbol: String,
    pub side: OrderSide,
    pub volume: Volume,
    pub price: Price,
    pub fees: HashMap<Asset, Decimal>,
}

impl Fill {
    /// Notional value of this fill (`volume * price`).
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.volume * self.price
    }
}
