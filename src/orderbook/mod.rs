//! Live order-book reconstruction: merges a REST snapshot with a
//! WebSocket delta stream into a consistent bid/ask ladder (§3, §4.3).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// One inbound update: either an incremental delta or (when `initial`)
/// a full snapshot that replaces the ladder outright.
#[derive(Debug, Clone)]
pub struct BookUpdate {
    pub time: i64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    pub initial: bool,
    pub checksum: Option<i64>,
}

/// A bid or ask ladder: price -> volume, with bids ordered descending
/// and asks ascending for O(1) best-of-book access.
#[derive(Debug, Default, Clone)]
struct Ladder {
    levels: BTreeMap<Decimal, Decimal>,
}

impl Ladder {
    fn apply(&mut self, price: Decimal, volume: Decimal) {
        if volume == Decimal::ZERO {
            self.levels.remove(&price);
        } else {
            self.levels.insert(price, volume);
        }
    }

    fn replace(&mut self, levels: impl IntoIterator<Item = (Decimal, Decimal)>) {
        self.levels = levels
            .into_iter()
            .filter(|(_, v)| *v != Decimal::ZERO)
            .collect();
    }
}

/// Per-market live order book. Exclusively owned by the venue adapter
/// that created it and reachable only behind its own async mutex, so
/// `apply` is the single serialized write entrypoint callers (the
/// adapter's `ws_parse` task, and the snapshot fetch during subscribe)
/// share (§5).
pub struct OrderBook {
    venue_symbol: String,
    bids: Ladder,
    asks: Ladder,
    last_update_time: i64,
    initialized: bool,
    pending: Vec<BookUpdate>,
    update_notify: Notify,
    init_notify: Notify,
}

impl OrderBook {
    /// Create a new, uninitialized book.
    #[must_use]
    pub fn new(venue_symbol: impl Into<String>) -> Self {
        Self {
            venue_symbol: venue_symbol.into(),
            bids: Ladder::default(),
            asks: Ladder::default(),
            last_update_time: i64::MIN,
            initialized: false,
            pending: Vec::new(),
            update_notify: Notify::new(),
            init_notify: Notify::new(),
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[must_use]
    pub const fn last_update_time(&self) -> i64 {
        self.last_update_time
    }

    /// Wait until the book has consumed its initializing snapshot.
    pub async fn wait_initialized(&self) {
        if self.initialized {
            return;
        }
        self.init_notify.notified().await;
    }

    /// Wait until the next "update" event fires.
    pub async fn wait_update(&self) {
        self.update_notify.notified().await;
    }

    /// Apply one update per the protocol in §4.3.
    pub fn apply(&mut self, update: BookUpdate) -> Result<()> {
        if !update.initial && update.time < self.last_update_time {
            debug!(venue_symbol = %self.venue_symbol, time = update.time, "dropping stale update");
            return Ok(());
        }

        if !self.initialized && !update.initial {
            self.pending.push(update);
            return Ok(());
        }

        if update.initial {
            self.bids.replace(update.bids.iter().copied());
            self.asks.replace(update.asks.iter().copied());
            self.last_update_time = update.time;

            let snapshot_time = update.time;
            let mut buffered = std::mem::take(&mut self.pending);
            buffered.sort_by_key(|u| u.time);
            for buffered_update in buffered {
                if buffered_update.time > snapshot_time {
                    self.apply_delta(&buffered_update);
                }
            }

            self.initialized = true;
            self.init_notify.notify_waiters();
            self.update_notify.notify_waiters();
            return Ok(());
        }

        self.apply_delta(&update);
        self.update_notify.notify_waiters();
        Ok(())
    }

    fn apply_delta(&mut self, update: &BookUpdate) {
        for (price, volume) in &update.bids {
            self.bids.apply(*price, *volume);
        }
        for (price, volume) in &update.asks {
            self.asks.apply(*price, *volume);
        }
        self.last_update_time = update.time;
    }

    #[must_use]
    pub fn bids(&self) -> impl Iterator<Item = (Decimal, Decimal)> + '_ {
        self.bids.levels.iter().rev().map(|(p, v)| (*p, *v))
    }

    #[must_use]
    pub fn asks(&self) -> impl Iterator<Item = (Decimal, Decimal)> + '_ {
        self.asks.levels.iter().map(|(p, v)| (*p, *v))
    }

    fn best_bid(&self) -> Option<(Decimal, Decimal)> {
        self.bids.levels.iter().next_back().map(|(p, v)| (*p, *v))
    }

    fn best_ask(&self) -> Option<(Decimal, Decimal)> {
        self.asks.levels.iter().next().map(|(p, v)| (*p, *v))
    }

    /// `(max(bids) + min(asks)) / 2`; errors if either side is empty.
    pub fn mid_price(&self) -> Result<Decimal> {
        let (bid, _) = self
            .best_bid()
            .ok_or_else(|| Error::NotInitialized(self.venue_symbol.clone()))?;
        let (ask, _) = self
            .best_ask()
            .ok_or_else(|| Error::NotInitialized(self.venue_symbol.clone()))?;
        Ok((bid + ask) / Decimal::from(2))
    }

    /// Walk asks ascending, consuming `volume`; returns the VWAP paid. If
    /// the book is exhausted first, returns the VWAP of what could be
    /// consumed along with the shortfall.
    pub fn market_buy_price(&self, volume: Decimal) -> Result<VwapResult> {
        Self::walk(self.asks(), volume)
    }

    /// Symmetric over bids descending.
    pub fn market_sell_price(&self, volume: Decimal) -> Result<VwapResult> {
        Self::walk(self.bids(), volume)
    }

    /// Walk asks ascending until cumulative notional reaches `quote_volume`.
    pub fn market_buy_price_quote_volume(&self, quote_volume: Decimal) -> Result<VwapResult> {
        Self::walk_by_notional(self.asks(), quote_volume)
    }

    /// Symmetric over bids descending.
    pub fn market_sell_price_quote_volume(&self, quote_volume: Decimal) -> Result<VwapResult> {
        Self::walk_by_notional(self.bids(), quote_volume)
    }

    fn walk(levels: impl Iterator<Item = (Decimal, Decimal)>, mut remaining: Decimal) -> Result<VwapResult> {
        let mut filled = Decimal::ZERO;
        let mut notional = Decimal::ZERO;
        let mut first_price = None;

        for (price, level_volume) in levels {
            if first_price.is_none() {
                first_price = Some(price);
            }
            if remaining <= Decimal::ZERO {
                break;
            }
            let take = remaining.min(level_volume);
            filled += take;
            notional += take * price;
            remaining -= take;
        }

        let Some(first_price) = first_price else {
            return Err(Error::NotInitialized("book has no levels".into()));
        };

        if filled == Decimal::ZERO {
            return Ok(VwapResult { vwap: first_price, filled, partial: remaining > Decimal::ZERO });
        }

        Ok(VwapResult {
            vwap: notional / filled,
            filled,
            partial: remaining > Decimal::ZERO,
        })
    }

    fn walk_by_notional(levels: impl Iterator<Item = (Decimal, Decimal)>, target_notional: Decimal) -> Result<VwapResult> {
        let mut filled = Decimal::ZERO;
        let mut notional = Decimal::ZERO;
        let mut first_price = None;

        for (price, level_volume) in levels {
            if first_price.is_none() {
                first_price = Some(price);
            }
            if notional >= target_notional {
                break;
            }
            let level_notional = level_volume * price;
            let needed_notional = target_notional - notional;
            if level_notional <= needed_notional {
                filled += level_volume;
                notional += level_notional;
            } else {
                let take = needed_notional / price;
                filled += take;
                notional += needed_notional;
            }
        }

        let Some(first_price) = first_price else {
            return Err(Error::NotInitialized("book has no levels".into()));
        };

        if filled == Decimal::ZERO {
            return Ok(VwapResult { vwap: first_price, filled, partial: notional < target_notional });
        }

        Ok(VwapResult {
            vwap: notional / filled,
            filled,
            partial: notional < target_notional,
        })
    }

    /// Fold the top `depth` levels into a stable string and compare
    /// against a venue-supplied CRC32 checksum. A mismatch is logged as
    /// non-fatal; the caller is expected to discard and resubscribe.
    #[must_use]
    pub fn checksum_matches(&self, depth: usize, expected: i64) -> bool {
        let mut buf = String::new();
        for (price, volume) in self.bids().take(depth) {
            buf.push_str(&price.normalize().to_string());
            buf.push(':');
            buf.push_str(&volume.normalize().to_string());
            buf.push(':');
        }
        for (price, volume) in self.asks().take(depth) {
            buf.push_str(&price.normalize().to_string());
            buf.push(':');
            buf.push_str(&volume.normalize().to_string());
            buf.push(':');
        }
        let actual = crc32fast::hash(buf.as_bytes()) as i64;
        if actual != expected {
            warn!(venue_symbol = %self.venue_symbol, actual, expected, "order book checksum mismatch");
            return false;
        }
        true
    }

    #[must_use]
    pub fn as_of(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Result of walking the book to fill a target volume or notional.
#[derive(Debug, Clone, Copy)]
pub struct VwapResult {
    pub vwap: Decimal,
    pub filled: Decimal,
    pub partial: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot(time: i64, bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)]) -> BookUpdate {
        BookUpdate {
            time,
            bids: bids.to_vec(),
            asks: asks.to_vec(),
            initial: true,
            checksum: None,
        }
    }

    fn delta(time: i64, bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)]) -> BookUpdate {
        BookUpdate {
            time,
            bids: bids.to_vec(),
            asks: asks.to_vec(),
            initial: false,
            checksum: None,
        }
    }

    #[test]
    fn out_of_order_deltas_before_snapshot_are_resolved_by_time() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply(delta(7, &[(dec!(99), dec!(1))], &[])).unwrap();
        book.apply(delta(5, &[(dec!(50), dec!(1))], &[])).unwrap();
        book.apply(snapshot(6, &[(dec!(100), dec!(1))], &[(dec!(101), dec!(2))])).unwrap();

        assert!(book.is_initialized());
        let bids: Vec<_> = book.bids().collect();
        let asks: Vec<_> = book.asks().collect();
        assert_eq!(bids, vec![(dec!(99), dec!(1)), (dec!(100), dec!(1))]);
        assert_eq!(asks, vec![(dec!(101), dec!(2))]);
    }

    #[test]
    fn zero_volume_delta_removes_level() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply(snapshot(1, &[(dec!(100), dec!(1))], &[(dec!(101), dec!(1))])).unwrap();
        book.apply(delta(2, &[(dec!(100), dec!(0))], &[])).unwrap();
        assert_eq!(book.bids().collect::<Vec<_>>(), vec![]);
    }

    #[test]
    fn stale_update_is_dropped() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply(snapshot(10, &[(dec!(100), dec!(1))], &[(dec!(101), dec!(1))])).unwrap();
        book.apply(delta(9, &[(dec!(200), dec!(5))], &[])).unwrap();
        assert_eq!(book.bids().collect::<Vec<_>>(), vec![(dec!(100), dec!(1))]);
    }

    #[test]
    fn mid_price_requires_both_sides() {
        let mut book = OrderBook::new("BTCUSDT");
        assert!(book.mid_price().is_err());
        book.apply(snapshot(1, &[(dec!(100), dec!(1))], &[(dec!(102), dec!(1))])).unwrap();
        assert_eq!(book.mid_price().unwrap(), dec!(101));
    }

    #[test]
    fn market_buy_zero_returns_best_ask() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply(snapshot(1, &[(dec!(100), dec!(1))], &[(dec!(102), dec!(1))])).unwrap();
        let result = book.market_buy_price(Decimal::ZERO).unwrap();
        assert_eq!(result.vwap, dec!(102));
        assert_eq!(result.filled, Decimal::ZERO);
    }

    #[test]
    fn market_buy_vwap_across_levels() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply(snapshot(1, &[], &[(dec!(100), dec!(1)), (dec!(110), dec!(1))])).unwrap();
        let result = book.market_buy_price(dec!(1.5)).unwrap();
        assert_eq!(result.filled, dec!(1.5));
        assert_eq!(result.vwap, (dec!(100) + dec!(55)) / dec!(1.5));
        assert!(!result.partial);
    }

    #[test]
    fn market_buy_partial_when_book_exhausted() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply(snapshot(1, &[], &[(dec!(100), dec!(1))])).unwrap();
        let result = book.market_buy_price(dec!(5)).unwrap();
        assert_eq!(result.filled, dec!(1));
        assert!(result.partial);
    }
}
