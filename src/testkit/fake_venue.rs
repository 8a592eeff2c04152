//! An in-memory [`VenueAdapter`] for exercising [`crate::account::Account`]
//! and [`crate::rebalancer::Rebalancer`] without a real exchange.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::domain::ids::{Asset, FillId, OrderId};
use crate::domain::market::Market;
use crate::domain::money::{Price, Volume};
use crate::domain::order::OrderSide;
use crate::error::{Error, Result};
use crate::signer::Keys;
use crate::venue::{Candle, UserUpdate, VenueAdapter};

#[derive(Debug, Clone)]
pub struct RecordedOrder {
    pub id: OrderId,
    pub venue_symbol: String,
    pub side: OrderSide,
    pub price: Option<Price>,
    pub volume: Volume,
}

pub struct FakeVenueAdapter {
    markets: RwLock<Vec<Market>>,
    mid_prices: Mutex<HashMap<String, Decimal>>,
    balances: Mutex<HashMap<Asset, Decimal>>,
    orders: Mutex<Vec<RecordedOrder>>,
    next_id: AtomicU64,
    user_tx: mpsc::Sender<UserUpdate>,
    user_rx: Mutex<Option<mpsc::Receiver<UserUpdate>>>,
}

impl FakeVenueAdapter {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (user_tx, user_rx) = mpsc::channel(256);
        Arc::new(Self {
            markets: RwLock::new(Vec::new()),
            mid_prices: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
            orders: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            user_tx,
            user_rx: Mutex::new(Some(user_rx)),
        })
    }

    pub fn add_market(&self, market: Market) {
        self.markets.write().push(market);
    }

    pub fn set_mid_price(&self, venue_symbol: &str, price: Decimal) {
        self.mid_prices.lock().insert(venue_symbol.to_string(), price);
    }

    pub fn set_balance(&self, asset: &Asset, amount: Decimal) {
        self.balances.lock().insert(asset.clone(), amount);
    }

    /// Push a `UserUpdate` as if it arrived from the venue's private
    /// stream, for driving `Account` ingest in tests.
    pub async fn push_update(&self, update: UserUpdate) {
        let _ = self.user_tx.send(update).await;
    }

    pub fn recorded_orders(&self) -> Vec<RecordedOrder> {
        self.orders.lock().clone()
    }

    fn next_order_id(&self) -> OrderId {
        OrderId::new(format!("fake-{}", self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    fn record(&self, id: OrderId, venue_symbol: &str, side: OrderSide, price: Option<Price>, volume: Volume) -> OrderId {
        self.orders.lock().push(RecordedOrder { id: id.clone(), venue_symbol: venue_symbol.to_string(), side, price, volume });
        id
    }
}

#[async_trait]
impl VenueAdapter for FakeVenueAdapter {
    fn venue_name(&self) -> &str {
        "fake"
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn markets(&self) -> Vec<Market> {
        self.markets.read().clone()
    }

    fn market(&self, venue_symbol: &str) -> Option<Market> {
        self.markets.read().iter().find(|m| m.venue_symbol() == venue_symbol).cloned()
    }

    async fn subscribe_to_order_books(&self, _venue_symbols: &[String]) -> Result<()> {
        Ok(())
    }

    async fn unsubscribe(&self, _venue_symbols: &[String]) -> Result<()> {
        Ok(())
    }

    async fn subscribe_to_user_data(&self, _keys: Keys) -> Result<()> {
        Ok(())
    }

    fn user_updates(&self) -> mpsc::Receiver<UserUpdate> {
        self.user_rx.lock().take().expect("user_updates called more than once")
    }

    async fn market_order(&self, _keys: &Keys, venue_symbol: &str, side: OrderSide, volume: Volume) -> Result<OrderId> {
        let id = self.next_order_id();
        Ok(self.record(id, venue_symbol, side, None, volume))
    }

    async fn market_order_quote(&self, _keys: &Keys, venue_symbol: &str, side: OrderSide, quote_volume: Volume) -> Result<OrderId> {
        let id = self.next_order_id();
        Ok(self.record(id, venue_symbol, side, None, quote_volume))
    }

    async fn limit_order(&self, _keys: &Keys, venue_symbol: &str, side: OrderSide, price: Price, volume: Volume) -> Result<OrderId> {
        let id = self.next_order_id();
        Ok(self.record(id, venue_symbol, side, Some(price), volume))
    }

    async fn cancel_order(&self, _keys: &Keys, _venue_symbol: &str, id: &OrderId) -> Result<()> {
        let mut orders = self.orders.lock();
        if let Some(pos) = orders.iter().position(|o| &o.id == id) {
            orders.remove(pos);
            Ok(())
        } else {
            Err(Error::OrderClosed(id.to_string()))
        }
    }

    async fn cancel_all_orders(&self, _keys: &Keys, venue_symbol: &str) -> Result<()> {
        self.orders.lock().retain(|o| o.venue_symbol != venue_symbol);
        Ok(())
    }

    async fn get_open_orders(&self, _keys: &Keys, venue_symbol: &str) -> Result<Vec<OrderId>> {
        Ok(self.orders.lock().iter().filter(|o| o.venue_symbol == venue_symbol).map(|o| o.id.clone()).collect())
    }

    async fn get_account_balances(&self, _keys: &Keys) -> Result<HashMap<Asset, Volume>> {
        Ok(self.balances.lock().clone())
    }

    async fn get_fills(&self, _keys: &Keys, _venue_symbol: &str) -> Result<Vec<FillId>> {
        Ok(Vec::new())
    }

    async fn get_candles(&self, _venue_symbol: &str, _start: DateTime<Utc>, _end: DateTime<Utc>, _resolution_secs: u32) -> Result<Vec<Candle>> {
        Ok(Vec::new())
    }

    async fn mid_price(&self, venue_symbol: &str) -> Result<Price> {
        self.mid_prices.lock().get(venue_symbol).copied().ok_or_else(|| Error::NotInitialized(venue_symbol.to_string()))
    }
}

