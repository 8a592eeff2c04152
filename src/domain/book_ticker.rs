//! Best-of-book snapshot, updated from a venue's ticker stream.

use chrono::{DateTime, Utc};

use super::money::{Price, Volume};

/// A read-only top-of-book snapshot. Consumers that need a coherent bid
/// and ask together should read a published `BookTicker` rather than the
/// live ladder, which only promises eventual consistency (§5).
#[derive(Debug, Clone, Copy)]
pub struct BookTicker {
    pub bid_price: Price,
    pub bid_volume: Volume,
    pub ask_price: Price,
    pub ask_volume: Volume,
    pub time: DateTime<Utc>,
}

impl BookTicker {
    #[must_use]
    pub fn mid_price(&self) -> Price {
        (self.bid_price + self.ask_price) / Price::from(2)
    }
}
