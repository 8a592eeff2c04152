//! Shared plumbing reused by both the spot and futures adapters: market
//! registry, order-book subscription, and the `ws_parse` dispatch table
//! from §4.4. Each concrete adapter owns one `VenueCore` and layers its
//! own signing scheme and REST endpoint shapes on top.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::ids::{Asset, FillId, OrderId};
use crate::domain::market::Market;
use crate::domain::order::{OrderSide, OrderStatus};
use crate::error::{Error, Result};
use crate::orderbook::{BookUpdate, OrderBook};
use crate::ratelimit::RateScheduler;
use crate::signer::{Keys, Signer};
use crate::transport::Transport;
use crate::venue::{BookRegistry, UserUpdate};

pub struct VenueCore {
    pub venue: String,
    pub transport: Arc<Transport>,
    pub scheduler: Arc<RateScheduler>,
    pub signer: Arc<dyn Signer>,
    pub markets: parking_lot::RwLock<HashMap<String, Market>>,
    pub books: BookRegistry,
    pub user_tx: AsyncMutex<mpsc::Sender<UserUpdate>>,
    pub user_rx: AsyncMutex<Option<mpsc::Receiver<UserUpdate>>>,
    pub router: AsyncMutex<Option<JoinHandle<()>>>,
}

impl VenueCore {
    #[must_use]
    pub fn new(venue: impl Into<String>, transport: Arc<Transport>, signer: Arc<dyn Signer>) -> Self {
        let venue = venue.into();
        let scheduler = Arc::new(RateScheduler::new(venue.clone()));
        let (tx, rx) = mpsc::channel(4096);
        Self {
            venue,
            transport,
            scheduler,
            signer,
            markets: parking_lot::RwLock::new(HashMap::new()),
            books: BookRegistry::new(),
            user_tx: AsyncMutex::new(tx),
            user_rx: AsyncMutex::new(Some(rx)),
            router: AsyncMutex::new(None),
        }
    }

    pub fn take_user_updates(&self) -> mpsc::Receiver<UserUpdate> {
        self.user_rx
            .try_lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .unwrap_or_else(|| mpsc::channel(1).1)
    }

    pub fn set_markets(&self, markets: Vec<Market>) {
        let mut guard = self.markets.write();
        guard.clear();
        for market in markets {
            guard.insert(market.venue_symbol().to_string(), market);
        }
    }

    pub fn market(&self, venue_symbol: &str) -> Option<Market> {
        self.markets.read().get(venue_symbol).cloned()
    }

    pub fn all_markets(&self) -> Vec<Market> {
        self.markets.read().values().cloned().collect()
    }

    /// Spawn the single `ws_parse` task that consumes transport frames
    /// and dispatches on `(channel, type)`, per §4.4's routing table.
    pub fn spawn_router(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let frame = {
                    let mut inbound = this.transport.ws_inbound().await;
                    inbound.recv().await
                };
                let Some(frame) = frame else {
                    break;
                };
                this.route_frame(frame.payload).await;
            }
        });
        if let Ok(mut guard) = self.router.try_lock() {
            *guard = Some(handle);
        }
    }

    async fn route_frame(&self, payload: Value) {
        let channel = payload.get("channel").and_then(Value::as_str).unwrap_or_default();
        let msg_type = payload.get("type").and_then(Value::as_str).unwrap_or_default();

        match (channel, msg_type) {
            ("depth", "delta") => self.route_depth(&payload, false).await,
            ("depth", "snapshot") | ("depth", "partial") => self.route_depth(&payload, true).await,
            ("orders", "update") | ("trades", "update") => self.route_user_update(&payload).await,
            ("", "heartbeat") | ("", "pong") | ("", "subscribed") => {
                if msg_type == "subscribed" && payload.get("auth").is_some() {
                    let tx = self.user_tx.lock().await;
                    let _ = tx.send(UserUpdate::AuthCompleted).await;
                }
                debug!(venue = %self.venue, msg_type, "acknowledged control frame");
            }
            _ => warn!(venue = %self.venue, channel, msg_type, "unrecognized frame, discarding"),
        }
    }

    async fn route_depth(&self, payload: &Value, initial: bool) {
        let Some(symbol) = payload.get("symbol").and_then(Value::as_str) else {
            return;
        };
        let Some(book) = self.books.get(symbol) else {
            return;
        };
        let update = match parse_book_update(payload, initial) {
            Ok(update) => update,
            Err(err) => {
                warn!(venue = %self.venue, %symbol, %err, "malformed depth payload, book will resubscribe");
                self.books.remove(symbol);
                return;
            }
        };
        let mut book = book.lock().await;
        if let Err(err) = book.apply(update) {
            warn!(%err, "failed to apply book update");
        }
    }

    async fn route_user_update(&self, payload: &Value) {
        let updates = match parse_user_update(payload) {
            Ok(updates) => updates,
            Err(err) => {
                warn!(venue = %self.venue, %err, "unparseable user event, discarding");
                return;
            }
        };
        let tx = self.user_tx.lock().await;
        for update in updates {
            let _ = tx.send(update).await;
        }
    }

    /// Create order books for `venue_symbols`, send a batched SUBSCRIBE,
    /// fetch REST snapshots in parallel and wait on each book's
    /// initialization event.
    pub async fn subscribe_to_order_books(self: &Arc<Self>, venue_symbols: &[String], snapshot_endpoint: &str) -> Result<()> {
        let mut books = Vec::new();
        for symbol in venue_symbols {
            if self.market(symbol).is_none() {
                return Err(Error::UnknownMarket(symbol.clone()));
            }
            let book = Arc::new(AsyncMutex::new(OrderBook::new(symbol.clone())));
            self.books.insert(symbol.clone(), Arc::clone(&book));
            books.push((symbol.clone(), book));
        }

        self.transport
            .ws_send(serde_json::json!({"method": "SUBSCRIBE", "params": venue_symbols}))
            .await?;

        let mut snapshot_futures = Vec::new();
        for (symbol, book) in &books {
            let endpoint = format!("{snapshot_endpoint}?symbol={symbol}&limit=100");
            let transport = Arc::clone(&self.transport);
            let symbol = symbol.clone();
            let book = Arc::clone(book);
            snapshot_futures.push(tokio::spawn(async move {
                let response = transport.get(&endpoint, &[], &[]).await?;
                let update = parse_snapshot(&response)?;
                book.lock().await.apply(update)?;
                Ok::<(), Error>(())
            }));
        }
        for future in snapshot_futures {
            future.await.map_err(|err| Error::Transport {
                venue: self.venue.clone(),
                source: anyhow::anyhow!(err),
            })??;
        }

        for (symbol, book) in &books {
            let poll_initialized = async {
                loop {
                    if book.lock().await.is_initialized() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            };
            tokio::time::timeout(Duration::from_secs(10), poll_initialized)
                .await
                .map_err(|_| Error::NotInitialized(symbol.clone()))?;
        }

        info!(venue = %self.venue, count = venue_symbols.len(), "order books initialized");
        Ok(())
    }

    pub fn unsubscribe(&self, venue_symbols: &[String]) {
        for symbol in venue_symbols {
            self.books.remove(symbol);
        }
    }

    pub async fn mid_price(&self, venue_symbol: &str) -> Result<Decimal> {
        let book = self.books.get(venue_symbol).ok_or_else(|| Error::NotInitialized(venue_symbol.to_string()))?;
        let result = book.lock().await.mid_price();
        result
    }
}

fn parse_levels(value: &Value) -> Result<Vec<(Decimal, Decimal)>> {
    let Some(array) = value.as_array() else {
        return Ok(Vec::new());
    };
    let mut levels = Vec::with_capacity(array.len());
    for level in array {
        let pair = level.as_array().ok_or_else(|| Error::InvariantViolation("level is not an array".into()))?;
        let price: Decimal = pair
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvariantViolation("missing price".into()))?
            .parse()
            .map_err(|_| Error::InvariantViolation("unparseable price".into()))?;
        let volume: Decimal = pair
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvariantViolation("missing volume".into()))?
            .parse()
            .map_err(|_| Error::InvariantViolation("unparseable volume".into()))?;
        levels.push((price, volume));
    }
    Ok(levels)
}

fn parse_book_update(payload: &Value, initial: bool) -> Result<BookUpdate> {
    let data = payload.get("data").unwrap_or(payload);
    let time = data.get("u").and_then(Value::as_i64).unwrap_or_else(|| Utc::now().timestamp_millis());
    Ok(BookUpdate {
        time,
        bids: parse_levels(data.get("b").or_else(|| data.get("bids")).unwrap_or(&Value::Null))?,
        asks: parse_levels(data.get("a").or_else(|| data.get("asks")).unwrap_or(&Value::Null))?,
        initial,
        checksum: data.get("checksum").and_then(Value::as_i64),
    })
}

fn parse_snapshot(response: &Value) -> Result<BookUpdate> {
    let time = response.get("lastUpdateId").and_then(Value::as_i64).unwrap_or(0);
    Ok(BookUpdate {
        time,
        bids: parse_levels(response.get("bids").unwrap_or(&Value::Null))?,
        asks: parse_levels(response.get("asks").unwrap_or(&Value::Null))?,
        initial: true,
        checksum: None,
    })
}

fn parse_user_update(payload: &Value) -> Result<Vec<UserUpdate>> {
    let event = payload
        .get("e")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvariantViolation("missing event type".into()))?;

    let side = match payload.get("S").and_then(Value::as_str) {
        Some("BUY") => OrderSide::Buy,
        _ => OrderSide::Sell,
    };

    match event {
        "executionReport" => {
            let status = match payload.get("X").and_then(Value::as_str) {
                Some("NEW") => OrderStatus::New,
                Some("PARTIALLY_FILLED") => OrderStatus::Open,
                Some("CANCELED" | "FILLED" | "EXPIRED" | "REJECTED") => OrderStatus::Closed,
                _ => OrderStatus::New,
            };
            let order_id = payload
                .get("i")
                .map(|v| OrderId::new(v.to_string()))
                .ok_or_else(|| Error::InvariantViolation("missing order id".into()))?;
            let volume: Decimal = decimal_field(payload, "q")?;
            let filled_volume: Decimal = decimal_field(payload, "z").unwrap_or(Decimal::ZERO);
            let price = decimal_field(payload, "p").ok();
            let venue_symbol = payload.get("s").and_then(Value::as_str).unwrap_or_default().to_string();

            let order_update = UserUpdate::OrderUpdate {
                id: order_id.clone(),
                venue_symbol: venue_symbol.clone(),
                side,
                price,
                volume,
                filled_volume,
                status,
                time: Utc::now(),
            };

            // A TRADE execution report ("l" != "0") carries both a fill and
            // the order's resulting status (e.g. FILLED) in the same frame.
            if payload.get("l").and_then(|v| v.as_str()).map(|s| s != "0").unwrap_or(false) {
                let fill_volume = decimal_field(payload, "l")?;
                let fill_price = decimal_field(payload, "L")?;
                let fee_asset = payload.get("N").and_then(Value::as_str).map(Asset::new);
                let fee_amount = decimal_field(payload, "n").unwrap_or(Decimal::ZERO);
                let mut fees = HashMap::new();
                if let Some(asset) = fee_asset {
                    fees.insert(asset, fee_amount);
                }
                let fill_update = UserUpdate::FillUpdate {
                    fill_id: FillId::new(payload.get("t").map(|v| v.to_string()).unwrap_or_default()),
                    order_id,
                    venue_symbol,
                    side,
                    volume: fill_volume,
                    price: fill_price,
                    fees,
                    time: Utc::now(),
                };
                return Ok(vec![order_update, fill_update]);
            }

            Ok(vec![order_update])
        }
        other => Err(Error::InvariantViolation(format!("unsupported user event {other}"))),
    }
}

fn decimal_field(payload: &Value, key: &str) -> Result<Decimal> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvariantViolation(format!("missing field {key}")))?
        .parse()
        .map_err(|_| Error::InvariantViolation(format!("unparseable field {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_levels_reads_price_volume_pairs() {
        let value = serde_json::json!([["100.0", "1.5"], ["101.0", "2.0"]]);
        let levels = parse_levels(&value).unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].0, Decimal::new(1000, 1));
    }

    #[test]
    fn parse_user_update_distinguishes_order_and_fill() {
        let order_only = serde_json::json!({
            "e": "executionReport", "s": "BTCUSDT", "S": "BUY", "o": "LIMIT",
            "X": "NEW", "i": 42, "q": "1.0", "z": "0.0", "p": "100.0", "l": "0"
        });
        let updates = parse_user_update(&order_only).unwrap();
        assert_eq!(updates.len(), 1);
        assert!(matches!(updates[0], UserUpdate::OrderUpdate { .. }));
    }

    #[test]
    fn filled_trade_report_emits_both_order_and_fill_updates() {
        let with_fill = serde_json::json!({
            "e": "executionReport", "s": "BTCUSDT", "S": "BUY", "o": "MARKET",
            "X": "FILLED", "i": 42, "q": "1.0", "z": "1.0", "p": "0.0",
            "l": "1.0", "L": "100.0", "N": "BTC", "n": "0.001", "t": 7
        });
        let updates = parse_user_update(&with_fill).unwrap();
        assert_eq!(updates.len(), 2);
        match &updates[0] {
            UserUpdate::OrderUpdate { status, .. } => assert_eq!(*status, OrderStatus::Closed),
            other => panic!("expected OrderUpdate first, got {other:?}"),
        }
        assert!(matches!(updates[1], UserUpdate::FillUpdate { .. }));
    }
}
