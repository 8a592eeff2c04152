//! Portfolio rebalancer (§4.6): computes a target vs. current weighted
//! portfolio and drives the Account to trade toward it, either with
//! immediate market orders or a re-pegging limit-order loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::domain::ids::{Asset, OrderId};
use crate::domain::market::Market;
use crate::domain::order::{Order, OrderSide};
use crate::error::{Error, Result};
use crate::venue::VenueAdapter;

const FILL_POLL_INTERVAL: Duration = Duration::from_millis(100);
const FILL_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const REPEG_INTERVAL: Duration = Duration::from_secs(1);

/// One tradable direction on a venue market: trading `base` for `quote`
/// on `venue_symbol`. Two of these exist per market, one per direction,
/// built during [`Rebalancer::prepare`].
#[derive(Debug, Clone)]
pub struct TradingSale {
    pub venue_symbol: String,
    pub base: Asset,
    pub quote: Asset,
    pub market: Market,
}

struct Route<'a> {
    sale: &'a TradingSale,
    direct: bool,
}

impl Route<'_> {
    fn order_quantity(&self, asset_volume: Decimal, price: Decimal) -> Decimal {
        if self.direct {
            asset_volume
        } else {
            asset_volume * price
        }
    }

    fn sell_side(&self) -> OrderSide {
        if self.direct { OrderSide::Sell } else { OrderSide::Buy }
    }

    fn buy_side(&self) -> OrderSide {
        if self.direct { OrderSide::Buy } else { OrderSide::Sell }
    }

    fn meets_minimum(&self, asset_volume: Decimal, price: Decimal) -> bool {
        let base_quantity = self.order_quantity(asset_volume, price);
        let quote_notional = if self.direct { asset_volume * price } else { asset_volume };
        base_quantity >= self.sale.market.min_provide_size() && quote_notional >= self.sale.market.min_quote_volume()
    }
}

struct TradePlan {
    venue_symbol: String,
    side: OrderSide,
    volume: Decimal,
}

/// Rescale arbitrary positive target weights to sum to one. Non-positive
/// or all-zero input normalizes to an empty map (nothing to target).
fn normalize_weights(target: &HashMap<Asset, Decimal>) -> HashMap<Asset, Decimal> {
    let total_weight: Decimal = target.values().sum();
    if total_weight <= Decimal::ZERO {
        return HashMap::new();
    }
    target.iter().map(|(a, w)| (a.clone(), w / total_weight)).collect()
}

/// Scale factor applied to every buy notional so their sum never exceeds
/// the quote balance actually available after sells have settled.
fn buy_clamp_ratio(total_buy_notional: Decimal, available_quote: Decimal) -> Decimal {
    if total_buy_notional > available_quote && total_buy_notional > Decimal::ZERO {
        available_quote / total_buy_notional
    } else {
        Decimal::ONE
    }
}

/// Computes and executes trades moving an account's holdings toward a
/// target weighted portfolio.
pub struct Rebalancer {
    account: Arc<Account>,
    venue: Arc<dyn VenueAdapter>,
    sales: Vec<TradingSale>,
    default_base: Asset,
    backup_base: Asset,
}

impl Rebalancer {
    /// Intersect `candidates` with the venue's trading markets, subscribe
    /// to their order books and wait for initialization (§4.6
    /// Preparation).
    pub async fn prepare(
        account: Arc<Account>,
        venue: Arc<dyn VenueAdapter>,
        candidates: &[Asset],
        default_base: Asset,
        backup_base: Asset,
    ) -> Result<Self> {
        let candidate_set: HashSet<&Asset> = candidates.iter().collect();
        let mut sales = Vec::new();
        let mut venue_symbols = Vec::new();
        for market in venue.markets() {
            let (base, quote) = market.pair();
            if candidate_set.contains(&base) && candidate_set.contains(&quote) {
                venue_symbols.push(market.venue_symbol().to_string());
                sales.push(TradingSale {
                    venue_symbol: market.venue_symbol().to_string(),
                    base,
                    quote,
                    market,
                });
            }
        }

        if !venue_symbols.is_empty() {
            venue.subscribe_to_order_books(&venue_symbols).await?;
        }

        Ok(Self { account, venue, sales, default_base, backup_base })
    }

    #[must_use]
    pub fn get_trading_markets(&self) -> Vec<Market> {
        self.sales.iter().map(|s| s.market.clone()).collect()
    }

    fn find_route(&self, asset: &Asset, quote: &Asset) -> Option<Route<'_>> {
        if let Some(sale) = self.sales.iter().find(|s| &s.base == asset && &s.quote == quote) {
            return Some(Route { sale, direct: true });
        }
        if let Some(sale) = self.sales.iter().find(|s| &s.base == quote && &s.quote == asset) {
            return Some(Route { sale, direct: false });
        }
        None
    }

    async fn pair_mid(&self, base: &Asset, quote: &Asset) -> Option<Decimal> {
        let sale = self.sales.iter().find(|s| &s.base == base && &s.quote == quote)?;
        self.venue.mid_price(&sale.venue_symbol).await.ok()
    }

    async fn direct_or_inverse(&self, asset: &Asset, quote: &Asset) -> Option<Decimal> {
        if let Some(price) = self.pair_mid(asset, quote).await {
            return Some(price);
        }
        if let Some(price) = self.pair_mid(quote, asset).await {
            if price > Decimal::ZERO {
                return Some(Decimal::ONE / price);
            }
        }
        None
    }

    async fn two_hop_price(&self, asset: &Asset, quote: &Asset, hops: &[Asset]) -> Option<Decimal> {
        let mut samples = Vec::new();
        for hop in hops {
            if hop == asset || hop == quote {
                continue;
            }
            if let (Some(leg1), Some(leg2)) = (
                Box::pin(self.direct_or_inverse(asset, hop)).await,
                Box::pin(self.direct_or_inverse(hop, quote)).await,
            ) {
                samples.push(leg1 * leg2);
            }
        }
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<Decimal>() / Decimal::from(samples.len()))
    }

    /// Resolve each of `assets` to a price in `quote`: direct mid, then
    /// inverse mid, then the mean of two-hop paths through assets
    /// currently held in the account (§4.6 Pricing).
    pub async fn prices(&self, assets: &[Asset], quote: &Asset) -> HashMap<Asset, Decimal> {
        let snapshot = self.account.snapshot().await;
        let held: Vec<Asset> = snapshot.balance.keys().cloned().collect();

        let mut out = HashMap::new();
        for asset in assets {
            if asset == quote {
                out.insert(asset.clone(), Decimal::ONE);
                continue;
            }
            if let Some(price) = self.direct_or_inverse(asset, quote).await {
                out.insert(asset.clone(), price);
            } else if let Some(price) = self.two_hop_price(asset, quote, &held).await {
                out.insert(asset.clone(), price);
            } else {
                warn!(%asset, %quote, "no route to price asset");
            }
        }
        out
    }

    /// Per-asset `(balance * price)` normalized to unit sum.
    pub async fn weighted_portfolio(&self, quote: &Asset) -> HashMap<Asset, Decimal> {
        let snapshot = self.account.snapshot().await;
        let assets: Vec<Asset> = snapshot.balance.keys().cloned().collect();
        let prices = self.prices(&assets, quote).await;

        let mut values = HashMap::new();
        let mut total = Decimal::ZERO;
        for (asset, balance) in &snapshot.balance {
            let Some(price) = prices.get(asset) else { continue };
            let value = balance * price;
            if value > Decimal::ZERO {
                values.insert(asset.clone(), value);
                total += value;
            }
        }
        if total <= Decimal::ZERO {
            return HashMap::new();
        }
        values.into_iter().map(|(asset, value)| (asset, value / total)).collect()
    }

    async fn compute_plan(&self, target: &HashMap<Asset, Decimal>, quote: &Asset) -> Result<(Decimal, HashMap<Asset, Decimal>, HashMap<Asset, Decimal>)> {
        let normalized = normalize_weights(target);
        if normalized.is_empty() {
            return Ok((Decimal::ZERO, HashMap::new(), HashMap::new()));
        }

        let current = self.weighted_portfolio(quote).await;
        let snapshot = self.account.snapshot().await;

        let assets: Vec<Asset> = normalized
            .keys()
            .chain(current.keys())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let prices = self.prices(&assets, quote).await;

        let total_value: Decimal = snapshot
            .balance
            .iter()
            .filter_map(|(asset, balance)| prices.get(asset).map(|price| balance * price))
            .sum();

        let mut deltas = HashMap::new();
        for asset in &assets {
            let target_weight = normalized.get(asset).copied().unwrap_or(Decimal::ZERO);
            let current_weight = current.get(asset).copied().unwrap_or(Decimal::ZERO);
            deltas.insert(asset.clone(), target_weight - current_weight);
        }
        Ok((total_value, deltas, prices))
    }

    fn sell_plans(&self, total_value: Decimal, deltas: &HashMap<Asset, Decimal>, prices: &HashMap<Asset, Decimal>, quote: &Asset) -> Vec<(TradePlan, Decimal)> {
        let mut plans = Vec::new();
        for (asset, delta) in deltas {
            if *delta >= Decimal::ZERO || asset == quote {
                continue;
            }
            let Some(&price) = prices.get(asset) else { continue };
            if price <= Decimal::ZERO {
                continue;
            }
            let Some(route) = self.find_route(asset, quote) else {
                warn!(%asset, %quote, "no sell route, below-min residual carried as zero delta");
                continue;
            };
            let notional = -(*delta) * total_value;
            let asset_volume = notional / price;
            if !route.meets_minimum(asset_volume, price) {
                debug!(%asset, "sell volume below minimum, carried as zero delta");
                continue;
            }
            plans.push((
                TradePlan {
                    venue_symbol: route.sale.venue_symbol.clone(),
                    side: route.sell_side(),
                    volume: route.order_quantity(asset_volume, price),
                },
                price,
            ));
        }
        plans
    }

    fn buy_plans(&self, total_value: Decimal, deltas: &HashMap<Asset, Decimal>, prices: &HashMap<Asset, Decimal>, quote: &Asset, available_quote: Decimal) -> Vec<TradePlan> {
        let mut notionals = HashMap::new();
        let mut total_buy_notional = Decimal::ZERO;
        for (asset, delta) in deltas {
            if *delta <= Decimal::ZERO || asset == quote {
                continue;
            }
            let notional = *delta * total_value;
            notionals.insert(asset.clone(), notional);
            total_buy_notional += notional;
        }

        let clamp_ratio = buy_clamp_ratio(total_buy_notional, available_quote);

        let mut plans = Vec::new();
        for (asset, notional) in notionals {
            let Some(&price) = prices.get(&asset) else { continue };
            if price <= Decimal::ZERO {
                continue;
            }
            let Some(route) = self.find_route(&asset, quote) else {
                warn!(%asset, %quote, "no buy route, below-min residual carried as zero delta");
                continue;
            };
            let clamped_notional = notional * clamp_ratio;
            let asset_volume = clamped_notional / price;
            if !route.meets_minimum(asset_volume, price) {
                debug!(%asset, "buy volume below minimum, carried as zero delta");
                continue;
            }
            plans.push(TradePlan {
                venue_symbol: route.sale.venue_symbol.clone(),
                side: route.buy_side(),
                volume: route.order_quantity(asset_volume, price),
            });
        }
        plans
    }

    /// Immediate market-order variant of §4.6 `trade_to_portfolio`: net
    /// sells first and await their fills, then clamp and submit buys.
    pub async fn trade_to_portfolio(&self, target: &HashMap<Asset, Decimal>, quote: &Asset) -> Result<()> {
        let (total_value, deltas, prices) = self.compute_plan(target, quote).await?;
        if total_value <= Decimal::ZERO {
            info!("rebalance skipped: account has no priceable value");
            return Ok(());
        }

        let sell_plans = self.sell_plans(total_value, &deltas, &prices, quote);
        let mut sell_handles = Vec::new();
        for (plan, _price) in sell_plans {
            let account = Arc::clone(&self.account);
            sell_handles.push(tokio::spawn(async move { submit_and_await(&account, &plan).await }));
        }
        for handle in sell_handles {
            match handle.await {
                Ok(Err(err)) => warn!(%err, "rebalance sell failed"),
                Err(err) => warn!(%err, "rebalance sell task panicked"),
                Ok(Ok(_)) => {}
            }
        }

        let available_quote = self.account.get_available(quote).await;
        let buy_plans = self.buy_plans(total_value, &deltas, &prices, quote, available_quote);
        let mut buy_handles = Vec::new();
        for plan in buy_plans {
            let account = Arc::clone(&self.account);
            buy_handles.push(tokio::spawn(async move { submit_and_await(&account, &plan).await }));
        }
        for handle in buy_handles {
            match handle.await {
                Ok(Err(err)) => warn!(%err, "rebalance buy failed"),
                Err(err) => warn!(%err, "rebalance buy task panicked"),
                Ok(Ok(_)) => {}
            }
        }

        Ok(())
    }

    /// Limit-order variant: place best-price limit orders, re-peg toward
    /// mid every ~1s but never beyond `max_slippage` from the initial
    /// mid, cancelling anything still open after `timeout`.
    pub async fn trade_to_portfolio_limit(&self, target: &HashMap<Asset, Decimal>, quote: &Asset, max_slippage: Decimal, timeout: Duration) -> Result<()> {
        let (total_value, deltas, prices) = self.compute_plan(target, quote).await?;
        if total_value <= Decimal::ZERO {
            info!("rebalance skipped: account has no priceable value");
            return Ok(());
        }

        let sell_plans = self.sell_plans(total_value, &deltas, &prices, quote);
        let mut handles = Vec::new();
        for (plan, _price) in sell_plans {
            let account = Arc::clone(&self.account);
            let venue = Arc::clone(&self.venue);
            handles.push(tokio::spawn(async move { repeg_until_done(&account, &venue, plan, max_slippage, timeout).await }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        let available_quote = self.account.get_available(quote).await;
        let buy_plans = self.buy_plans(total_value, &deltas, &prices, quote, available_quote);
        let mut handles = Vec::new();
        for plan in buy_plans {
            let account = Arc::clone(&self.account);
            let venue = Arc::clone(&self.venue);
            handles.push(tokio::spawn(async move { repeg_until_done(&account, &venue, plan, max_slippage, timeout).await }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        Ok(())
    }
}

async fn submit_and_await(account: &Arc<Account>, plan: &TradePlan) -> Result<Order> {
    let id = account.market_order(&plan.venue_symbol, plan.side, plan.volume).await?;
    await_terminal(account, &id, FILL_WAIT_TIMEOUT).await
}

async fn await_terminal(account: &Arc<Account>, id: &OrderId, timeout: Duration) -> Result<Order> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(order) = account.get_order(id).await {
            if order.is_terminal() {
                return Ok(order);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::InvariantViolation(format!("order {id} did not terminate before timeout")));
        }
        tokio::time::sleep(FILL_POLL_INTERVAL).await;
    }
}

async fn repeg_until_done(account: &Arc<Account>, venue: &Arc<dyn VenueAdapter>, plan: TradePlan, max_slippage: Decimal, timeout: Duration) {
    let Ok(initial_mid) = venue.mid_price(&plan.venue_symbol).await else {
        warn!(venue_symbol = %plan.venue_symbol, "no mid price available, skipping limit order");
        return;
    };

    let mut current_id = match account.limit_order(&plan.venue_symbol, plan.side, initial_mid, plan.volume).await {
        Ok(id) => id,
        Err(err) => {
            warn!(%err, venue_symbol = %plan.venue_symbol, "initial limit order failed");
            return;
        }
    };

    let deadline = tokio::time::Instant::now() + timeout;
    let mut ticker = tokio::time::interval(REPEG_INTERVAL);
    loop {
        ticker.tick().await;
        if tokio::time::Instant::now() >= deadline {
            if let Err(err) = account.cancel_order(&plan.venue_symbol, &current_id).await {
                warn!(%err, %current_id, "timeout cancel failed");
            }
            return;
        }

        let Some(order) = account.get_order(&current_id).await else { return };
        if order.is_terminal() {
            return;
        }

        let Ok(mid) = venue.mid_price(&plan.venue_symbol).await else { continue };
        let bound = match plan.side {
            OrderSide::Buy => initial_mid * (Decimal::ONE + max_slippage),
            OrderSide::Sell => initial_mid * (Decimal::ONE - max_slippage),
        };
        let reprice_target = match plan.side {
            OrderSide::Buy => mid.min(bound),
            OrderSide::Sell => mid.max(bound),
        };

        if let Err(err) = account.cancel_order(&plan.venue_symbol, &current_id).await {
            warn!(%err, %current_id, "repeg cancel failed");
        }
        match account.limit_order(&plan.venue_symbol, plan.side, reprice_target, order.remaining_volume()).await {
            Ok(id) => current_id = id,
            Err(err) => {
                warn!(%err, venue_symbol = %plan.venue_symbol, "repeg replacement order failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sale(base: &str, quote: &str, venue_symbol: &str) -> TradingSale {
        TradingSale {
            venue_symbol: venue_symbol.to_string(),
            base: Asset::new(base),
            quote: Asset::new(quote),
            market: Market::spot(base, quote, venue_symbol, dec!(0.01), dec!(0.0001), dec!(0.0001), dec!(10), 6, 2),
        }
    }

    #[test]
    fn route_order_quantity_differs_by_direction() {
        let s = sale("BTC", "USDT", "BTCUSDT");
        let direct = Route { sale: &s, direct: true };
        let reverse = Route { sale: &s, direct: false };
        assert_eq!(direct.order_quantity(dec!(2), dec!(100)), dec!(2));
        assert_eq!(reverse.order_quantity(dec!(2), dec!(100)), dec!(200));
    }

    #[test]
    fn route_sides_flip_with_direction() {
        let s = sale("BTC", "USDT", "BTCUSDT");
        let direct = Route { sale: &s, direct: true };
        let reverse = Route { sale: &s, direct: false };
        assert_eq!(direct.sell_side(), OrderSide::Sell);
        assert_eq!(reverse.sell_side(), OrderSide::Buy);
        assert_eq!(direct.buy_side(), OrderSide::Buy);
        assert_eq!(reverse.buy_side(), OrderSide::Sell);
    }

    #[test]
    fn meets_minimum_checks_both_lot_and_notional_floor() {
        let s = sale("BTC", "USDT", "BTCUSDT");
        let route = Route { sale: &s, direct: true };
        assert!(!route.meets_minimum(dec!(0.00001), dec!(100)));
        assert!(route.meets_minimum(dec!(1), dec!(100)));
    }
}

#[cfg(test)]
mod weight_properties {
    use super::*;
    use proptest::prelude::*;

    fn arbitrary_weights() -> impl Strategy<Value = Vec<i64>> {
        prop::collection::vec(1i64..1_000_000, 1..6)
    }

    proptest! {
        // Any set of strictly positive target weights normalizes to a
        // set that sums to one, within Decimal's rounding tolerance.
        #[test]
        fn normalize_weights_sums_to_one(raw in arbitrary_weights()) {
            let target: HashMap<Asset, Decimal> = raw
                .into_iter()
                .enumerate()
                .map(|(i, w)| (Asset::new(format!("A{i}")), Decimal::new(w, 2)))
                .collect();
            let normalized = normalize_weights(&target);
            let total: Decimal = normalized.values().sum();
            prop_assert!((total - Decimal::ONE).abs() < Decimal::new(1, 9));
        }

        // The clamp ratio never scales buy notional past what's available,
        // and never scales it up (ratio is at most one).
        #[test]
        fn buy_clamp_ratio_never_overspends_available_quote(
            total_buy in 0i64..1_000_000,
            available in 0i64..1_000_000,
        ) {
            let total_buy_notional = Decimal::new(total_buy, 2);
            let available_quote = Decimal::new(available, 2);
            let ratio = buy_clamp_ratio(total_buy_notional, available_quote);
            prop_assert!(ratio <= Decimal::ONE);
            prop_assert!(ratio * total_buy_notional <= available_quote);
        }
    }
}
