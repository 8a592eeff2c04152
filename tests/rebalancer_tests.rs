use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use rust_decimal_macros::dec;

use vertex_trader::account::Account;
use vertex_trader::domain::ids::{Asset, FillId, OrderId};
use vertex_trader::domain::order::{OrderSide, OrderStatus};
use vertex_trader::rebalancer::Rebalancer;
use vertex_trader::testkit::domain::{keys, spot_market};
use vertex_trader::testkit::fake_venue::FakeVenueAdapter;
use vertex_trader::venue::UserUpdate;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

async fn fund(venue: &FakeVenueAdapter, asset: &str, quote_symbol: &str, volume: rust_decimal::Decimal, price: rust_decimal::Decimal) {
    venue
        .push_update(UserUpdate::OrderUpdate {
            id: OrderId::new(format!("seed-{asset}")),
            venue_symbol: quote_symbol.to_string(),
            side: OrderSide::Buy,
            price: None,
            volume,
            filled_volume: dec!(0),
            status: OrderStatus::Open,
            time: Utc::now(),
        })
        .await;
    settle().await;
    venue
        .push_update(UserUpdate::FillUpdate {
            fill_id: FillId::new(format!("seed-fill-{asset}")),
            order_id: OrderId::new(format!("seed-{asset}")),
            venue_symbol: quote_symbol.to_string(),
            side: OrderSide::Buy,
            volume,
            price,
            fees: HashMap::new(),
            time: Utc::now(),
        })
        .await;
    settle().await;
    }

#[tokio::test]
async fn prices_resolves_direct_and_inverse_mid() {
    let venue = FakeVenueAdapter::new();
    venue.add_market(spot_market("BTC", "USDT", "BTCUSDT"));
    venue.add_market(spot_market("USDT", "ETH", "ETHUSDT_INV"));
    venue.set_mid_price("BTCUSDT", dec!(50000));
    venue.set_mid_price("ETHUSDT_INV", dec!(0.0005));

    let account = Account::new(venue.clone(), keys(), dec!(1), Asset::new("USDT"));
    let rebalancer = Rebalancer::prepare(account, venue, &[Asset::new("BTC"), Asset::new("USDT"), Asset::new("ETH")], Asset::new("BTC"), Asset::new("BNB"))
        .await
        .unwrap();

    let prices = rebalancer.prices(&[Asset::new("BTC"), Asset::new("ETH")], &Asset::new("USDT")).await;
    assert_eq!(prices.get(&Asset::new("BTC")).copied(), Some(dec!(50000)));
    // ETHUSDT_INV pairs (USDT, ETH) so pricing ETH in USDT must invert the mid.
    assert_eq!(prices.get(&Asset::new("ETH")).copied(), Some(dec!(1) / dec!(0.0005)));
}

#[tokio::test]
async fn prices_falls_back_to_two_hop_through_held_asset() {
    let venue = FakeVenueAdapter::new();
    venue.add_market(spot_market("BTC", "USDT", "BTCUSDT"));
    venue.add_market(spot_market("ETH", "BTC", "ETHBTC"));
    venue.set_mid_price("BTCUSDT", dec!(50000));
    venue.set_mid_price("ETHBTC", dec!(0.05));

    let account = Account::new(venue.clone(), keys(), dec!(1), Asset::new("USDT"));
    account.start().await;
    fund(&venue, "BTC", "BTCUSDT", dec!(1), dec!(50000)).await;

    let rebalancer = Rebalancer::prepare(account, venue, &[Asset::new("BTC"), Asset::new("ETH"), Asset::new("USDT")], Asset::new("BTC"), Asset::new("BNB"))
        .await
        .unwrap();

    let prices = rebalancer.prices(&[Asset::new("ETH")], &Asset::new("USDT")).await;
    // ETH has no direct/inverse USDT market; route through held BTC: 0.05 * 50000 = 2500.
    assert_eq!(prices.get(&Asset::new("ETH")).copied(), Some(dec!(2500)));
}

#[tokio::test]
async fn weighted_portfolio_normalizes_to_unit_sum() {
    let venue = FakeVenueAdapter::new();
    venue.add_market(spot_market("BTC", "USDT", "BTCUSDT"));
    venue.set_mid_price("BTCUSDT", dec!(50000));

    let account = Account::new(venue.clone(), keys(), dec!(1), Asset::new("USDT"));
    account.start().await;
    fund(&venue, "BTC", "BTCUSDT", dec!(1), dec!(50000)).await;

    let rebalancer = Rebalancer::prepare(account, venue, &[Asset::new("BTC"), Asset::new("USDT")], Asset::new("BTC"), Asset::new("BNB"))
        .await
        .unwrap();

    let weights = rebalancer.weighted_portfolio(&Asset::new("USDT")).await;
    let total: rust_decimal::Decimal = weights.values().sum();
    assert_eq!(total, dec!(1));
    assert_eq!(weights.get(&Asset::new("BTC")).copied(), Some(dec!(1)));
}
