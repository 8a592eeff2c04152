//! Venue adapter capability set (§4.4): one adapter per venue kind,
//! signing requests, mapping symbols, parsing WebSocket frames into
//! typed events, and translating generic order intents into venue API
//! calls.

pub(crate) mod common;
pub mod binance_futures;
pub mod binance_spot;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::domain::ids::{Asset, FillId, OrderId};
use crate::domain::market::Market;
use crate::domain::money::{Price, Volume};
use crate::domain::order::{OrderRequest, OrderSide, OrderStatus};
use crate::error::Result;
use crate::orderbook::OrderBook;
use crate::signer::Keys;

pub use binance_futures::BinanceFuturesAdapter;
pub use binance_spot::BinanceSpotAdapter;

/// An authoritative event the Account's single ingest task consumes.
/// Adapters push these; nothing else mutates Account state (§3, §4.5).
#[derive(Debug, Clone)]
pub enum UserUpdate {
    OrderUpdate {
        id: OrderId,
        venue_symbol: String,
        side: OrderSide,
        price: Option<Price>,
        volume: Volume,
        filled_volume: Volume,
        status: OrderStatus,
        time: DateTime<Utc>,
    },
    FillUpdate {
        fill_id: FillId,
        order_id: OrderId,
        venue_symbol: String,
        side: OrderSide,
        volume: Volume,
        price: Price,
        fees: HashMap<Asset, rust_decimal::Decimal>,
        time: DateTime<Utc>,
    },
    AuthCompleted,
}

/// Candle resolution for `get_candles`.
#[derive(Debug, Clone, Copy)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Volume,
}

/// The capability set every venue (spot or perp) must implement.
/// Collapses the "BinanceSpot/BinanceFutures/FTX variants" dynamic
/// dispatch named in the redesign flags into one trait.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn venue_name(&self) -> &str;

    /// Fetch `exchange_info`, populate markets, register rate-limit
    /// windows.
    async fn connect(&self) -> Result<()>;

    /// Idempotent teardown: releases the transport and cancels
    /// background tasks.
    async fn close(&self) -> Result<()>;

    fn markets(&self) -> Vec<Market>;

    fn market(&self, venue_symbol: &str) -> Option<Market>;

    /// Create queues and order books, send a batched SUBSCRIBE, fetch
    /// REST snapshots, and wait on each book's initialization event.
    async fn subscribe_to_order_books(&self, venue_symbols: &[String]) -> Result<()>;

    async fn unsubscribe(&self, venue_symbols: &[String]) -> Result<()>;

    /// Open the private user-event stream (listen-key or signed-WS
    /// login, depending on venue); completion is signalled via
    /// `UserUpdate::AuthCompleted`.
    async fn subscribe_to_user_data(&self, keys: Keys) -> Result<()>;

    /// Receiver for authoritative user events, consumed by the Account.
    fn user_updates(&self) -> mpsc::Receiver<UserUpdate>;

    async fn market_order(&self, keys: &Keys, venue_symbol: &str, side: OrderSide, volume: Volume) -> Result<OrderId>;

    async fn market_order_quote(&self, keys: &Keys, venue_symbol: &str, side: OrderSide, quote_volume: Volume) -> Result<OrderId>;

    async fn limit_order(&self, keys: &Keys, venue_symbol: &str, side: OrderSide, price: Price, volume: Volume) -> Result<OrderId>;

    async fn cancel_order(&self, keys: &Keys, venue_symbol: &str, id: &OrderId) -> Result<()>;

    async fn cancel_all_orders(&self, keys: &Keys, venue_symbol: &str) -> Result<()>;

    async fn get_open_orders(&self, keys: &Keys, venue_symbol: &str) -> Result<Vec<OrderId>>;

    async fn get_account_balances(&self, keys: &Keys) -> Result<HashMap<Asset, Volume>>;

    async fn get_fills(&self, keys: &Keys, venue_symbol: &str) -> Result<Vec<FillId>>;

    async fn get_candles(&self, venue_symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>, resolution_secs: u32) -> Result<Vec<Candle>>;

    /// Current mid price of a subscribed order book; `Error::NotInitialized`
    /// if the book hasn't consumed its snapshot yet.
    async fn mid_price(&self, venue_symbol: &str) -> Result<Price>;
}

/// Submit `request` by dispatching to the appropriate typed
/// `VenueAdapter` method; kept as a free function so call sites don't
/// need to match on `OrderRequest` themselves.
pub async fn submit(adapter: &Arc<dyn VenueAdapter>, keys: &Keys, venue_symbol: &str, request: OrderRequest) -> Result<OrderId> {
    match request {
        OrderRequest::Market { side, volume } => adapter.market_order(keys, venue_symbol, side, volume).await,
        OrderRequest::MarketQuote { side, quote_volume } => {
            adapter.market_order_quote(keys, venue_symbol, side, quote_volume).await
        }
        OrderRequest::Limit { side, price, volume } => adapter.limit_order(keys, venue_symbol, side, price, volume).await,
    }
}

/// Shared state every concrete adapter wraps around its [`crate::transport::Transport`]
/// and [`crate::ratelimit::RateScheduler`]: the live order books keyed by
/// venue symbol.
pub(crate) struct BookRegistry {
    books: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<OrderBook>>>>,
}

impl BookRegistry {
    pub(crate) fn new() -> Self {
        Self {
            books: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, venue_symbol: String, book: Arc<tokio::sync::Mutex<OrderBook>>) {
        self.books.lock().insert(venue_symbol, book);
    }

    pub(crate) fn remove(&self, venue_symbol: &str) {
        self.books.lock().remove(venue_symbol);
    }

    pub(crate) fn get(&self, venue_symbol: &str) -> Option<Arc<tokio::sync::Mutex<OrderBook>>> {
        self.books.lock().get(venue_symbol).cloned()
    }
}
