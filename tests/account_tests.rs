use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use rust_decimal_macros::dec;

use vertex_trader::account::Account;
use vertex_trader::domain::ids::{Asset, FillId, OrderId};
use vertex_trader::domain::order::{OrderSide, OrderStatus};
use vertex_trader::testkit::domain::{keys, spot_market};
use vertex_trader::testkit::fake_venue::FakeVenueAdapter;
use vertex_trader::venue::UserUpdate;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn fill_updates_spot_balance_both_legs() {
    let venue = FakeVenueAdapter::new();
    venue.add_market(spot_market("BTC", "USDT", "BTCUSDT"));

    let account = Account::new(venue.clone(), keys(), dec!(1), Asset::new("USDT"));
    account.start().await;

    venue
        .push_update(UserUpdate::OrderUpdate {
            id: OrderId::new("o1"),
            venue_symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            price: None,
            volume: dec!(1),
            filled_volume: dec!(0),
            status: OrderStatus::Open,
            time: Utc::now(),
        })
        .await;
    settle().await;

    venue
        .push_update(UserUpdate::FillUpdate {
            fill_id: FillId::new("f1"),
            order_id: OrderId::new("o1"),
            venue_symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            volume: dec!(1),
            price: dec!(100),
            fees: HashMap::new(),
            time: Utc::now(),
        })
        .await;
    settle().await;

    let snapshot = account.snapshot().await;
    assert_eq!(snapshot.balance.get(&Asset::new("BTC")).copied(), Some(dec!(1)));
    assert_eq!(snapshot.balance.get(&Asset::new("USDT")).copied(), Some(dec!(-100)));

    account.shutdown().await;
}

#[tokio::test]
async fn fill_arriving_before_order_update_is_replayed() {
    let venue = FakeVenueAdapter::new();
    venue.add_market(spot_market("BTC", "USDT", "BTCUSDT"));

    let account = Account::new(venue.clone(), keys(), dec!(1), Asset::new("USDT"));
    account.start().await;

    venue
        .push_update(UserUpdate::FillUpdate {
            fill_id: FillId::new("f1"),
            order_id: OrderId::new("o1"),
            venue_symbol: "BTCUSDT".to_string(),
            side: OrderSide::Sell,
            volume: dec!(0.5),
            price: dec!(200),
            fees: HashMap::new(),
            time: Utc::now(),
        })
        .await;
    settle().await;

    venue
        .push_update(UserUpdate::OrderUpdate {
            id: OrderId::new("o1"),
            venue_symbol: "BTCUSDT".to_string(),
            side: OrderSide::Sell,
            price: None,
            volume: dec!(0.5),
            filled_volume: dec!(0.5),
            status: OrderStatus::Closed,
            time: Utc::now(),
        })
        .await;
    settle().await;

    let order = account.get_order(&OrderId::new("o1")).await.expect("order known after replay");
    assert!(order.is_terminal());
    assert_eq!(order.recorded_fills(), dec!(0.5));

    account.shutdown().await;
}

#[tokio::test]
async fn limit_buy_reserves_quote_until_filled() {
    let venue = FakeVenueAdapter::new();
    venue.add_market(spot_market("BTC", "USDT", "BTCUSDT"));

    let account = Account::new(venue.clone(), keys(), dec!(1), Asset::new("USDT"));
    account.start().await;

    let id = account.limit_order("BTCUSDT", OrderSide::Buy, dec!(100), dec!(2)).await.unwrap();
    settle().await;

    let available = account.get_available(&Asset::new("USDT")).await;
    assert_eq!(available, dec!(-200));

    venue
        .push_update(UserUpdate::OrderUpdate {
            id: id.clone(),
            venue_symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            price: Some(dec!(100)),
            volume: dec!(2),
            filled_volume: dec!(2),
            status: OrderStatus::Closed,
            time: Utc::now(),
        })
        .await;
    settle().await;

    venue
        .push_update(UserUpdate::FillUpdate {
            fill_id: FillId::new("f1"),
            order_id: id,
            venue_symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            volume: dec!(2),
            price: dec!(100),
            fees: HashMap::new(),
            time: Utc::now(),
        })
        .await;
    settle().await;

    let available_after_fill = account.get_available(&Asset::new("USDT")).await;
    assert_eq!(available_after_fill, dec!(-200));
    let snapshot = account.snapshot().await;
    assert!(!snapshot.open_orders.contains(&OrderId::new("fake-1")));

    account.shutdown().await;
}

#[tokio::test]
async fn cancelling_an_already_closed_order_is_treated_as_success() {
    let venue = FakeVenueAdapter::new();
    venue.add_market(spot_market("BTC", "USDT", "BTCUSDT"));

    let account = Account::new(venue.clone(), keys(), dec!(1), Asset::new("USDT"));
    account.start().await;

    let id = account.limit_order("BTCUSDT", OrderSide::Sell, dec!(100), dec!(1)).await.unwrap();
    settle().await;

    // The fake venue only knows orders it still has recorded; cancelling
    // once removes it, so the account's own RequestedCancellation marker
    // absorbs a second cancel rather than surfacing ORDER_CLOSED.
    account.cancel_order("BTCUSDT", &id).await.unwrap();
    account.cancel_order("BTCUSDT", &id).await.unwrap();

    account.shutdown().await;
}
