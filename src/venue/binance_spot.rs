//! Binance-shaped spot adapter: scheme-1 query signing, base-asset and
//! quote-notional market orders, exchange-info-driven market registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;

use crate::domain::ids::{Asset, FillId, OrderId};
use crate::domain::market::Market;
use crate::domain::money::{Price, Volume};
use crate::domain::order::OrderSide;
use crate::error::{Error, Result};
use crate::ratelimit::Window;
use crate::signer::{HmacQuerySigner, Keys, Signer};
use crate::transport::Transport;
use crate::venue::common::VenueCore;
use crate::venue::{Candle, UserUpdate, VenueAdapter};

const DEPTH_ENDPOINT: &str = "/api/v3/depth";
const ORDER_ENDPOINT: &str = "/api/v3/order";
const OPEN_ORDERS_ENDPOINT: &str = "/api/v3/openOrders";
const ACCOUNT_ENDPOINT: &str = "/api/v3/account";
const MY_TRADES_ENDPOINT: &str = "/api/v3/myTrades";
const KLINES_ENDPOINT: &str = "/api/v3/klines";
const EXCHANGE_INFO_ENDPOINT: &str = "/api/v3/exchangeInfo";

/// Spot order book + order execution against a Binance-shaped venue.
pub struct BinanceSpotAdapter {
    core: Arc<VenueCore>,
}

impl BinanceSpotAdapter {
    #[must_use]
    pub fn new(base_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        let transport = Transport::new("binance-spot", base_url, ws_url);
        let core = Arc::new(VenueCore::new("binance-spot", transport, Arc::new(HmacQuerySigner)));
        Self { core }
    }

    fn signed_headers(&self, keys: &Keys, method: &str, path: &str, params: &[(String, String)]) -> (Vec<(String, String)>, Vec<(String, String)>) {
        let timestamp = Utc::now().timestamp_millis();
        self.core.signer.sign(keys, method, path, params, timestamp)
    }
}

#[async_trait]
impl VenueAdapter for BinanceSpotAdapter {
    fn venue_name(&self) -> &str {
        "binance-spot"
    }

    async fn connect(&self) -> Result<()> {
        self.core.transport.connect().await?;
        self.core.scheduler.register("requests", Window { window: Duration::from_secs(60), limit: 1200 }).await;
        self.core.scheduler.register("orders", Window { window: Duration::from_secs(10), limit: 50 }).await;

        let info = self.core.transport.get(EXCHANGE_INFO_ENDPOINT, &[], &[]).await?;
        let markets = parse_exchange_info(&info)?;
        self.core.set_markets(markets);
        self.core.spawn_router();

        info!(venue = self.venue_name(), "connected");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.core.transport.close().await;
        Ok(())
    }

    fn markets(&self) -> Vec<Market> {
        self.core.all_markets()
    }

    fn market(&self, venue_symbol: &str) -> Option<Market> {
        self.core.market(venue_symbol)
    }

    async fn subscribe_to_order_books(&self, venue_symbols: &[String]) -> Result<()> {
        self.core.subscribe_to_order_books(venue_symbols, DEPTH_ENDPOINT).await
    }

    async fn unsubscribe(&self, venue_symbols: &[String]) -> Result<()> {
        self.core.unsubscribe(venue_symbols);
        Ok(())
    }

    async fn subscribe_to_user_data(&self, keys: Keys) -> Result<()> {
        let (params, headers) = self.signed_headers(&keys, "POST", "/api/v3/userDataStream", &[]);
        let header_refs: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let param_refs: Vec<(&str, &str)> = params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        self.core.transport.post("/api/v3/userDataStream", &param_refs, &header_refs).await?;

        self.core
            .transport
            .ws_send(serde_json::json!({"method": "SUBSCRIBE", "params": ["userData"]}))
            .await?;
        Ok(())
    }

    fn user_updates(&self) -> mpsc::Receiver<UserUpdate> {
        self.core.take_user_updates()
    }

    async fn market_order(&self, keys: &Keys, venue_symbol: &str, side: OrderSide, volume: Volume) -> Result<OrderId> {
        let market = self.market(venue_symbol).ok_or_else(|| Error::UnknownMarket(venue_symbol.to_string()))?;
        let aligned = market.align_volume(volume);
        let params = vec![
            ("symbol".to_string(), venue_symbol.to_string()),
            ("side".to_string(), side_str(side).to_string()),
            ("type".to_string(), "MARKET".to_string()),
            ("quantity".to_string(), market.render_volume(aligned)),
        ];
        self.submit_order(keys, &params).await
    }

    async fn market_order_quote(&self, keys: &Keys, venue_symbol: &str, side: OrderSide, quote_volume: Volume) -> Result<OrderId> {
        let params = vec![
            ("symbol".to_string(), venue_symbol.to_string()),
            ("side".to_string(), side_str(side).to_string()),
            ("type".to_string(), "MARKET".to_string()),
            ("quoteOrderQty".to_string(), quote_volume.normalize().to_string()),
        ];
        self.submit_order(keys, &params).await
    }

    async fn limit_order(&self, keys: &Keys, venue_symbol: &str, side: OrderSide, price: Price, volume: Volume) -> Result<OrderId> {
        let market = self.market(venue_symbol).ok_or_else(|| Error::UnknownMarket(venue_symbol.to_string()))?;
        let round_side = match side {
            OrderSide::Buy => crate::domain::money::RoundSide::Buy,
            OrderSide::Sell => crate::domain::money::RoundSide::Sell,
        };
        let aligned_price = market.align_price(price, round_side);
        let aligned_volume = market.align_volume(volume);
        let params = vec![
            ("symbol".to_string(), venue_symbol.to_string()),
            ("side".to_string(), side_str(side).to_string()),
            ("type".to_string(), "LIMIT".to_string()),
            ("timeInForce".to_string(), "GTC".to_string()),
            ("price".to_string(), market.render_price(aligned_price)),
            ("quantity".to_string(), market.render_volume(aligned_volume)),
        ];
        self.submit_order(keys, &params).await
    }

    async fn cancel_order(&self, keys: &Keys, venue_symbol: &str, id: &OrderId) -> Result<()> {
        let params = vec![
            ("symbol".to_string(), venue_symbol.to_string()),
            ("orderId".to_string(), id.as_str().to_string()),
        ];
        let (signed, headers) = self.signed_headers(keys, "DELETE", ORDER_ENDPOINT, &params);
        let header_refs: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let param_refs: Vec<(&str, &str)> = signed.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

        let mut weights = HashMap::new();
        weights.insert("requests".to_string(), 1);
        self.core.scheduler.admit(&weights).await?;

        match self.core.transport.delete(ORDER_ENDPOINT, &param_refs, &header_refs).await {
            Ok(_) => Ok(()),
            Err(Error::HttpStatus { status: 400, .. }) => Err(Error::OrderClosed(id.to_string())),
            Err(err) => Err(err),
        }
    }

    async fn cancel_all_orders(&self, keys: &Keys, venue_symbol: &str) -> Result<()> {
        let params = vec![("symbol".to_string(), venue_symbol.to_string())];
        let (signed, headers) = self.signed_headers(keys, "DELETE", "/api/v3/openOrders", &params);
        let header_refs: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let param_refs: Vec<(&str, &str)> = signed.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

        let mut weights = HashMap::new();
        weights.insert("requests".to_string(), 1);
        self.core.scheduler.admit(&weights).await?;

        self.core.transport.delete("/api/v3/openOrders", &param_refs, &header_refs).await?;
        Ok(())
    }

    async fn get_open_orders(&self, keys: &Keys, venue_symbol: &str) -> Result<Vec<OrderId>> {
        let params = vec![("symbol".to_string(), venue_symbol.to_string())];
        let (signed, headers) = self.signed_headers(keys, "GET", OPEN_ORDERS_ENDPOINT, &params);
        let header_refs: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let param_refs: Vec<(&str, &str)> = signed.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

        let mut weights = HashMap::new();
        weights.insert("requests".to_string(), 3);
        self.core.scheduler.admit(&weights).await?;

        let response = self.core.transport.get(OPEN_ORDERS_ENDPOINT, &param_refs, &header_refs).await?;
        let ids = response
            .as_array()
            .ok_or_else(|| Error::InvariantViolation("openOrders response not an array".into()))?
            .iter()
            .filter_map(|entry| entry.get("orderId").map(|v| OrderId::new(v.to_string())))
            .collect();
        Ok(ids)
    }

    async fn get_account_balances(&self, keys: &Keys) -> Result<HashMap<Asset, Volume>> {
        let (signed, headers) = self.signed_headers(keys, "GET", ACCOUNT_ENDPOINT, &[]);
        let header_refs: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let param_refs: Vec<(&str, &str)> = signed.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

        let mut weights = HashMap::new();
        weights.insert("requests".to_string(), 10);
        self.core.scheduler.admit(&weights).await?;

        let response = self.core.transport.get(ACCOUNT_ENDPOINT, &param_refs, &header_refs).await?;
        let balances = response
            .get("balances")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::InvariantViolation("account response missing balances".into()))?;

        let mut out = HashMap::new();
        for entry in balances {
            let Some(asset) = entry.get("asset").and_then(Value::as_str) else {
                continue;
            };
            let free: Decimal = entry
                .get("free")
                .and_then(Value::as_str)
                .unwrap_or("0")
                .parse()
                .unwrap_or(Decimal::ZERO);
            if free > Decimal::ZERO {
                out.insert(Asset::new(asset), free);
            }
        }
        Ok(out)
    }

    async fn get_fills(&self, keys: &Keys, venue_symbol: &str) -> Result<Vec<FillId>> {
        let params = vec![("symbol".to_string(), venue_symbol.to_string())];
        let (signed, headers) = self.signed_headers(keys, "GET", MY_TRADES_ENDPOINT, &params);
        let header_refs: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let param_refs: Vec<(&str, &str)> = signed.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

        let mut weights = HashMap::new();
        weights.insert("requests".to_string(), 10);
        self.core.scheduler.admit(&weights).await?;

        let response = self.core.transport.get(MY_TRADES_ENDPOINT, &param_refs, &header_refs).await?;
        let ids = response
            .as_array()
            .ok_or_else(|| Error::InvariantViolation("myTrades response not an array".into()))?
            .iter()
            .filter_map(|entry| entry.get("id").map(|v| FillId::new(v.to_string())))
            .collect();
        Ok(ids)
    }

    async fn get_candles(&self, venue_symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>, resolution_secs: u32) -> Result<Vec<Candle>> {
        let interval = interval_for(resolution_secs);
        let start_ms = start.timestamp_millis().to_string();
        let end_ms = end.timestamp_millis().to_string();
        let full_params: Vec<(&str, &str)> = vec![
            ("symbol", venue_symbol),
            ("interval", interval),
            ("startTime", start_ms.as_str()),
            ("endTime", end_ms.as_str()),
        ];

        let mut weights = HashMap::new();
        weights.insert("requests".to_string(), 2);
        self.core.scheduler.admit(&weights).await?;

        let response = self.core.transport.get(KLINES_ENDPOINT, &full_params, &[]).await?;
        let rows = response.as_array().ok_or_else(|| Error::InvariantViolation("klines response not an array".into()))?;
        rows.iter().map(parse_candle).collect()
    }

    async fn mid_price(&self, venue_symbol: &str) -> Result<Price> {
        self.core.mid_price(venue_symbol).await
    }
}

impl BinanceSpotAdapter {
    async fn submit_order(&self, keys: &Keys, params: &[(String, String)]) -> Result<OrderId> {
        let (signed, headers) = self.signed_headers(keys, "POST", ORDER_ENDPOINT, params);
        let header_refs: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let param_refs: Vec<(&str, &str)> = signed.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

        let mut weights = HashMap::new();
        weights.insert("orders".to_string(), 1);
        weights.insert("requests".to_string(), 1);
        self.core.scheduler.admit(&weights).await?;

        let response = self.core.transport.post(ORDER_ENDPOINT, &param_refs, &header_refs).await?;
        let order_id = response
            .get("orderId")
            .ok_or_else(|| Error::OrderPlacementError {
                venue: self.venue_name().to_string(),
                reason: "response missing orderId".to_string(),
            })?;
        Ok(OrderId::new(order_id.to_string()))
    }
}

fn side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

fn interval_for(resolution_secs: u32) -> &'static str {
    match resolution_secs {
        0..=60 => "1m",
        61..=300 => "5m",
        301..=900 => "15m",
        901..=3600 => "1h",
        3601..=14400 => "4h",
        _ => "1d",
    }
}

fn parse_candle(row: &Value) -> Result<Candle> {
    let array = row.as_array().ok_or_else(|| Error::InvariantViolation("candle row not an array".into()))?;
    let get_decimal = |idx: usize| -> Result<Decimal> {
        array
            .get(idx)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvariantViolation("missing candle field".into()))?
            .parse()
            .map_err(|_| Error::InvariantViolation("unparseable candle field".into()))
    };
    let open_time_ms = array.first().and_then(Value::as_i64).unwrap_or(0);
    Ok(Candle {
        open_time: DateTime::from_timestamp_millis(open_time_ms).unwrap_or_default(),
        open: get_decimal(1)?,
        high: get_decimal(2)?,
        low: get_decimal(3)?,
        close: get_decimal(4)?,
        volume: get_decimal(5)?,
    })
}

fn parse_exchange_info(info: &Value) -> Result<Vec<Market>> {
    let symbols = info
        .get("symbols")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::InvariantViolation("exchangeInfo missing symbols".into()))?;

    let mut markets = Vec::with_capacity(symbols.len());
    for entry in symbols {
        if entry.get("status").and_then(Value::as_str) != Some("TRADING") {
            continue;
        }
        let Some(venue_symbol) = entry.get("symbol").and_then(Value::as_str) else {
            continue;
        };
        let Some(base) = entry.get("baseAsset").and_then(Value::as_str) else {
            continue;
        };
        let Some(quote) = entry.get("quoteAsset").and_then(Value::as_str) else {
            continue;
        };
        let base_precision = entry.get("baseAssetPrecision").and_then(Value::as_u64).unwrap_or(8) as u32;
        let quote_precision = entry.get("quoteAssetPrecision").and_then(Value::as_u64).unwrap_or(8) as u32;

        let filters = entry.get("filters").and_then(Value::as_array).cloned().unwrap_or_default();
        let price_increment = filter_decimal(&filters, "PRICE_FILTER", "tickSize").unwrap_or(Decimal::new(1, 8));
        let size_increment = filter_decimal(&filters, "LOT_SIZE", "stepSize").unwrap_or(Decimal::new(1, 8));
        let min_provide_size = filter_decimal(&filters, "LOT_SIZE", "minQty").unwrap_or(Decimal::ZERO);
        let min_quote_volume = filter_decimal(&filters, "MIN_NOTIONAL", "minNotional")
            .or_else(|| filter_decimal(&filters, "NOTIONAL", "minNotional"))
            .unwrap_or(Decimal::ZERO);

        markets.push(Market::spot(
            base,
            quote,
            venue_symbol,
            price_increment,
            size_increment,
            min_provide_size,
            min_quote_volume,
            base_precision,
            quote_precision,
        ));
    }
    Ok(markets)
}

fn filter_decimal(filters: &[Value], filter_type: &str, field: &str) -> Option<Decimal> {
    filters
        .iter()
        .find(|f| f.get("filterType").and_then(Value::as_str) == Some(filter_type))
        .and_then(|f| f.get(field))
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_for_buckets_resolution() {
        assert_eq!(interval_for(30), "1m");
        assert_eq!(interval_for(3600), "1h");
        assert_eq!(interval_for(86400), "1d");
    }

    #[test]
    fn parse_exchange_info_skips_non_trading_symbols() {
        let info = serde_json::json!({
            "symbols": [
                {"symbol": "BTCUSDT", "status": "TRADING", "baseAsset": "BTC", "quoteAsset": "USDT",
                 "baseAssetPrecision": 8, "quoteAssetPrecision": 8, "filters": []},
                {"symbol": "DEADUSDT", "status": "BREAK", "baseAsset": "DEAD", "quoteAsset": "USDT",
                 "baseAssetPrecision": 8, "quoteAssetPrecision": 8, "filters": []},
            ]
        });
        let markets = parse_exchange_info(&info).unwrap();
        assert_eq!(markets.len(), 1);
        assert_eq!(markets[0].venue_symbol(), "BTCUSDT");
    }
}
