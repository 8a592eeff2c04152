//! Account state machine (§4.5): the authoritative local model of one
//! user's holdings and open orders for one venue, maintained by a
//! single ingest task over `user_updates` so nothing else mutates
//! balances, positions or orders directly.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::fill::Fill;
use crate::domain::ids::{Asset, FillId, OrderId};
use crate::domain::market::{Market, MarketKind};
use crate::domain::money::{Price, Volume};
use crate::domain::order::{Order, OrderSide, OrderStatus, OrderType};
use crate::domain::position::Position;
use crate::error::{Error, Result};
use crate::signer::Keys;
use crate::venue::{UserUpdate, VenueAdapter};

const REFRESH_SILENCE: Duration = Duration::from_secs(300);

/// A point-in-time copy of the account's holdings, safe to read without
/// holding the ingest task's lock for longer than the copy itself.
#[derive(Debug, Clone, Default)]
pub struct AccountSnapshot {
    pub balance: HashMap<Asset, Decimal>,
    pub available: HashMap<Asset, Decimal>,
    pub positions: HashMap<Asset, Position>,
    pub open_orders: HashSet<OrderId>,
}

struct AccountState {
    balance: HashMap<Asset, Decimal>,
    available: HashMap<Asset, Decimal>,
    positions: HashMap<Asset, Position>,
    orders: HashMap<OrderId, Order>,
    open_orders: HashSet<OrderId>,
    unhandled_fills: HashMap<OrderId, Vec<Fill>>,
}

impl AccountState {
    fn new() -> Self {
        Self {
            balance: HashMap::new(),
            available: HashMap::new(),
            positions: HashMap::new(),
            orders: HashMap::new(),
            open_orders: HashSet::new(),
            unhandled_fills: HashMap::new(),
        }
    }
}

/// One user's holdings and open orders against one venue adapter.
/// Created at login; torn down on context exit via [`Account::shutdown`].
pub struct Account {
    venue: Arc<dyn VenueAdapter>,
    keys: Keys,
    leverage: Decimal,
    collateral_asset: Asset,
    state: Mutex<AccountState>,
    ingest: Mutex<Option<JoinHandle<()>>>,
}

impl Account {
    #[must_use]
    pub fn new(venue: Arc<dyn VenueAdapter>, keys: Keys, leverage: Decimal, collateral_asset: Asset) -> Arc<Self> {
        Arc::new(Self {
            venue,
            keys,
            leverage,
            collateral_asset,
            state: Mutex::new(AccountState::new()),
            ingest: Mutex::new(None),
        })
    }

    /// Spawn the single ingest task consuming `user_updates`. Also
    /// drives the 5-minute periodic REST refresh on silence.
    pub async fn start(self: &Arc<Self>) {
        let mut updates = self.venue.user_updates();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = updates.recv() => {
                        match update {
                            Some(update) => this.handle_update(update).await,
                            None => break,
                        }
                    }
                    () = tokio::time::sleep(REFRESH_SILENCE) => {
                        this.refresh().await;
                    }
                }
            }
        });
        *self.ingest.lock().await = Some(handle);
    }

    /// Cancel and await the ingest task; pending events are discarded.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.ingest.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    async fn handle_update(&self, update: UserUpdate) {
        match update {
            UserUpdate::OrderUpdate { id, venue_symbol, side, price, volume, filled_volume, status, .. } => {
                self.handle_order_update(id, venue_symbol, side, price, volume, filled_volume, status).await;
            }
            UserUpdate::FillUpdate { fill_id, order_id, venue_symbol, side, volume, price, fees, time } => {
                self.handle_fill_update(fill_id, order_id, venue_symbol, side, volume, price, fees, time).await;
            }
            UserUpdate::AuthCompleted => {
                info!(venue = self.venue.venue_name(), "user data stream authenticated");
            }
        }
    }

    async fn handle_order_update(
        &self,
        id: OrderId,
        venue_symbol: String,
        side: OrderSide,
        price: Option<Price>,
        volume: Volume,
        filled_volume: Volume,
        status: OrderStatus,
    ) {
        let mut state = self.state.lock().await;
        let order_type = if price.is_some() { OrderType::Limit } else { OrderType::Market };

        if let Some(order) = state.orders.get_mut(&id) {
            if status == OrderStatus::Closed {
                order.volume = filled_volume;
            } else {
                order.volume = volume;
            }
            order.filled_volume = filled_volume;
            order.status = status;
            if price.is_some() {
                order.price = price;
            }
            if status == OrderStatus::Closed && order.recorded_fills() >= order.filled_volume {
                state.open_orders.remove(&id);
            } else if order.is_open() {
                state.open_orders.insert(id.clone());
            }
        } else {
            let fills = state
                .unhandled_fills
                .remove(&id)
                .map(|pending| pending.into_iter().map(|f| (f.id.clone(), f)).collect())
                .unwrap_or_default();
            let order = Order {
                id: id.clone(),
                venue_symbol,
                side,
                order_type,
                price,
                volume,
                filled_volume,
                status,
                fills,
            };
            if order.is_open() {
                state.open_orders.insert(id.clone());
            }
            state.orders.insert(id, order);
        }

        self.recompute_available(&mut state).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_fill_update(
        &self,
        fill_id: FillId,
        order_id: OrderId,
        venue_symbol: String,
        side: OrderSide,
        volume: Volume,
        price: Price,
        fees: HashMap<Asset, Decimal>,
        time: chrono::DateTime<chrono::Utc>,
    ) {
        let mut state = self.state.lock().await;

        if !state.orders.contains_key(&order_id) {
            state.unhandled_fills.entry(order_id.clone()).or_default().push(Fill {
                id: fill_id,
                order_id,
                time,
                venue_symbol,
                side,
                volume,
                price,
                fees,
            });
            return;
        }

        if state.orders[&order_id].fills.contains_key(&fill_id) {
            debug!(%fill_id, "duplicate fill suppressed");
            return;
        }

        let Some(market) = self.venue.market(&venue_symbol) else {
            warn!(%venue_symbol, "fill for market with no local metadata, triggering recovery");
            drop(state);
            self.recover(&venue_symbol).await;
            return;
        };

        match market.kind() {
            MarketKind::Spot => {
                let sign = Decimal::from(side.sign());
                *state.balance.entry(market.base().clone()).or_insert(Decimal::ZERO) += sign * volume;
                *state.balance.entry(market.quote().clone()).or_insert(Decimal::ZERO) -= sign * volume * price;
            }
            MarketKind::Future => {
                let underlying = market.base().clone();
                let existing = state.positions.get(&underlying).cloned();
                let update = Position::apply_fill(existing.as_ref(), &underlying, side, volume, price, self.leverage);
                match update.position {
                    Some(position) => {
                        state.positions.insert(underlying, position);
                    }
                    None => {
                        state.positions.remove(&underlying);
                    }
                }
                *state.balance.entry(self.collateral_asset.clone()).or_insert(Decimal::ZERO) += update.realized_pnl;
            }
        }

        for (asset, amount) in &fees {
            *state.balance.entry(asset.clone()).or_insert(Decimal::ZERO) -= *amount;
        }

        let fill = Fill {
            id: fill_id.clone(),
            order_id: order_id.clone(),
            time,
            venue_symbol,
            side,
            volume,
            price,
            fees,
        };
        if let Some(order) = state.orders.get_mut(&order_id) {
            order.fills.insert(fill_id, fill);
            if order.remaining_volume() <= Decimal::ZERO && order.status == OrderStatus::Closed {
                state.open_orders.remove(&order_id);
            }
        }

        self.recompute_available(&mut state).await;
    }

    /// `available = balance - (open limit-order reservations) - (open
    /// futures-position margin)`, recomputed from scratch on every
    /// mutation rather than tracked incrementally (§4.5).
    async fn recompute_available(&self, state: &mut AccountState) {
        let mut available = state.balance.clone();

        for position in state.positions.values() {
            *available.entry(self.collateral_asset.clone()).or_insert(Decimal::ZERO) -= position.margin_requirement;
        }

        for id in &state.open_orders {
            let Some(order) = state.orders.get(id) else { continue };
            let Some(market) = self.venue.market(&order.venue_symbol) else { continue };
            let position = if market.kind() == MarketKind::Future {
                state.positions.get(market.base())
            } else {
                None
            };
            if let Some((asset, amount)) = reservation_for(order, &market, self.leverage, &self.collateral_asset, position) {
                *available.entry(asset).or_insert(Decimal::ZERO) -= amount;
            }
        }

        state.available = available;
    }

    /// Submit a market order and synthesize its `order_update` locally
    /// so the Account learns of it before the next user-event tick.
    pub async fn market_order(&self, venue_symbol: &str, side: OrderSide, volume: Volume) -> Result<OrderId> {
        let id = self.venue.market_order(&self.keys, venue_symbol, side, volume).await?;
        self.synthesize_new_order(id.clone(), venue_symbol, side, None, volume).await;
        Ok(id)
    }

    pub async fn market_order_quote(&self, venue_symbol: &str, side: OrderSide, quote_volume: Volume) -> Result<OrderId> {
        let id = self.venue.market_order_quote(&self.keys, venue_symbol, side, quote_volume).await?;
        self.synthesize_new_order(id.clone(), venue_symbol, side, None, Decimal::ZERO).await;
        Ok(id)
    }

    pub async fn limit_order(&self, venue_symbol: &str, side: OrderSide, price: Price, volume: Volume) -> Result<OrderId> {
        let id = self.venue.limit_order(&self.keys, venue_symbol, side, price, volume).await?;
        self.synthesize_new_order(id.clone(), venue_symbol, side, Some(price), volume).await;
        Ok(id)
    }

    async fn synthesize_new_order(&self, id: OrderId, venue_symbol: &str, side: OrderSide, price: Option<Price>, volume: Volume) {
        let mut state = self.state.lock().await;
        if state.orders.contains_key(&id) {
            return;
        }
        let order_type = if price.is_some() { OrderType::Limit } else { OrderType::Market };
        let fills = state
            .unhandled_fills
            .remove(&id)
            .map(|pending| pending.into_iter().map(|f| (f.id.clone(), f)).collect())
            .unwrap_or_default();
        let order = Order {
            id: id.clone(),
            venue_symbol: venue_symbol.to_string(),
            side,
            order_type,
            price,
            volume,
            filled_volume: Decimal::ZERO,
            status: OrderStatus::New,
            fills,
        };
        state.open_orders.insert(id.clone());
        state.orders.insert(id, order);
        self.recompute_available(&mut state).await;
    }

    /// Request cancellation: marks the order `requested_cancellation`
    /// locally, dispatches the venue delete, and treats `ORDER_CLOSED`
    /// as success. A second cancel on an already-requested order
    /// re-fetches fills as a recovery path.
    pub async fn cancel_order(&self, venue_symbol: &str, id: &OrderId) -> Result<()> {
        let already_requested = {
            let mut state = self.state.lock().await;
            let already = state.orders.get(id).is_some_and(|o| o.status == OrderStatus::RequestedCancellation);
            if let Some(order) = state.orders.get_mut(id) {
                order.status = OrderStatus::RequestedCancellation;
            }
            already
        };

        if already_requested {
            if let Err(err) = self.venue.get_fills(&self.keys, venue_symbol).await {
                warn!(%err, %venue_symbol, "recovery fill re-fetch failed on double cancel");
            }
        }

        match self.venue.cancel_order(&self.keys, venue_symbol, id).await {
            Ok(()) => Ok(()),
            Err(Error::OrderClosed(_)) => {
                let mut state = self.state.lock().await;
                state.open_orders.remove(id);
                if let Some(order) = state.orders.get_mut(id) {
                    order.status = OrderStatus::Closed;
                }
                self.recompute_available(&mut state).await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn cancel_all_orders(&self, venue_symbol: &str) -> Result<()> {
        self.venue.cancel_all_orders(&self.keys, venue_symbol).await
    }

    /// Refresh balances and open orders from REST; logs divergence from
    /// local state but does not overwrite it (§4.5 periodic refresh).
    pub async fn refresh(&self) {
        match self.venue.get_account_balances(&self.keys).await {
            Ok(remote) => self.log_balance_divergence(&remote).await,
            Err(err) => warn!(%err, "periodic balance refresh failed"),
        }

        let symbols: HashSet<String> = {
            let state = self.state.lock().await;
            state.orders.values().map(|o| o.venue_symbol.clone()).collect()
        };
        for symbol in symbols {
            match self.venue.get_open_orders(&self.keys, &symbol).await {
                Ok(remote_open) => self.log_open_order_divergence(&symbol, &remote_open).await,
                Err(err) => warn!(%err, %symbol, "periodic open-order refresh failed"),
            }
        }
    }

    async fn log_balance_divergence(&self, remote: &HashMap<Asset, Decimal>) {
        let state = self.state.lock().await;
        for (asset, remote_amount) in remote {
            let local_amount = state.balance.get(asset).copied().unwrap_or(Decimal::ZERO);
            if local_amount != *remote_amount {
                warn!(%asset, %local_amount, %remote_amount, "balance diverged from venue, keeping local as authoritative");
            }
        }
    }

    async fn log_open_order_divergence(&self, venue_symbol: &str, remote_open: &[OrderId]) {
        let state = self.state.lock().await;
        let remote_set: HashSet<&OrderId> = remote_open.iter().collect();
        for id in &state.open_orders {
            if state.orders.get(id).is_some_and(|o| o.venue_symbol == venue_symbol) && !remote_set.contains(id) {
                warn!(%venue_symbol, %id, "order open locally but not at venue");
            }
        }
    }

    /// On parse exception: log, refresh open orders, re-request fills
    /// for every known open order id (§4.5 order-book & fills guard).
    async fn recover(&self, venue_symbol: &str) {
        match self.venue.get_open_orders(&self.keys, venue_symbol).await {
            Ok(open) => info!(%venue_symbol, count = open.len(), "recovered open orders from venue"),
            Err(err) => warn!(%err, %venue_symbol, "recovery open-order fetch failed"),
        }
        if let Err(err) = self.venue.get_fills(&self.keys, venue_symbol).await {
            warn!(%err, %venue_symbol, "recovery fill re-fetch failed");
        }
    }

    pub async fn snapshot(&self) -> AccountSnapshot {
        let state = self.state.lock().await;
        AccountSnapshot {
            balance: state.balance.clone(),
            available: state.available.clone(),
            positions: state.positions.clone(),
            open_orders: state.open_orders.clone(),
        }
    }

    pub async fn get_order(&self, id: &OrderId) -> Option<Order> {
        self.state.lock().await.orders.get(id).cloned()
    }

    pub async fn get_available(&self, asset: &Asset) -> Decimal {
        self.state.lock().await.available.get(asset).copied().unwrap_or(Decimal::ZERO)
    }
}

/// Pure reservation rule, kept free of `Account`'s lock so it can be
/// unit-tested without a runtime: limit orders reserve quote (buy) or
/// base (sell) on spot, and margin on futures only when the order would
/// increase (not reduce) the existing position.
fn reservation_for(
    order: &Order,
    market: &Market,
    leverage: Decimal,
    collateral_asset: &Asset,
    position: Option<&Position>,
) -> Option<(Asset, Decimal)> {
    if order.order_type != OrderType::Limit {
        return None;
    }
    let remaining = order.remaining_volume();
    if remaining <= Decimal::ZERO {
        return None;
    }
    let price = order.price?;

    match market.kind() {
        MarketKind::Spot => match order.side {
            OrderSide::Buy => Some((market.quote().clone(), remaining * price)),
            OrderSide::Sell => Some((market.base().clone(), remaining)),
        },
        MarketKind::Future => {
            let increases_position = position.map_or(true, |p| p.side == order.side);
            if !increases_position {
                return None;
            }
            Some((collateral_asset.clone(), (remaining * price) / leverage))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap as Map;

    fn spot_market() -> Market {
        Market::spot("BTC", "USDT", "BTCUSDT", dec!(0.01), dec!(0.0001), dec!(0.0001), dec!(10), 6, 2)
    }

    fn limit_order(side: OrderSide, price: Decimal, volume: Decimal) -> Order {
        Order {
            id: OrderId::new("1"),
            venue_symbol: "BTCUSDT".to_string(),
            side,
            order_type: OrderType::Limit,
            price: Some(price),
            volume,
            filled_volume: Decimal::ZERO,
            status: OrderStatus::Open,
            fills: Map::new(),
        }
    }

    #[test]
    fn spot_buy_reserves_quote_notional() {
        let order = limit_order(OrderSide::Buy, dec!(100), dec!(2));
        let reservation = reservation_for(&order, &spot_market(), dec!(1), &Asset::new("USDT"), None);
        assert_eq!(reservation, Some((Asset::new("USDT"), dec!(200))));
    }

    #[test]
    fn spot_sell_reserves_base_volume() {
        let order = limit_order(OrderSide::Sell, dec!(100), dec!(2));
        let reservation = reservation_for(&order, &spot_market(), dec!(1), &Asset::new("USDT"), None);
        assert_eq!(reservation, Some((Asset::new("BTC"), dec!(2))));
    }

    #[test]
    fn market_orders_reserve_nothing() {
        let mut order = limit_order(OrderSide::Buy, dec!(100), dec!(2));
        order.order_type = OrderType::Market;
        assert_eq!(reservation_for(&order, &spot_market(), dec!(1), &Asset::new("USDT"), None), None);
    }

    #[test]
    fn futures_reducing_order_reserves_nothing() {
        let perp = Market::perpetual("BTC", "BTC-PERP", dec!(0.5), dec!(0.001), dec!(0.001), dec!(10), 6, 1);
        let position = Position::open(Asset::new("BTC"), OrderSide::Buy, dec!(5), dec!(100), dec!(10));
        let order = limit_order(OrderSide::Sell, dec!(100), dec!(2));
        assert_eq!(reservation_for(&order, &perp, dec!(10), &Asset::new("USDT"), Some(&position)), None);
    }

    #[test]
    fn futures_increasing_order_reserves_margin() {
        let perp = Market::perpetual("BTC", "BTC-PERP", dec!(0.5), dec!(0.001), dec!(0.001), dec!(10), 6, 1);
        let position = Position::open(Asset::new("BTC"), OrderSide::Buy, dec!(5), dec!(100), dec!(10));
        let order = limit_order(OrderSide::Buy, dec!(100), dec!(2));
        let reservation = reservation_for(&order, &perp, dec!(10), &Asset::new("USDT"), Some(&position));
        assert_eq!(reservation, Some((Asset::new("USDT"), dec!(20))));
    }
}
