//! Command-line interface definitions (§6 inbound command surface).

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;

/// vertex-trader - client-side multi-venue trading engine and portfolio rebalancer.
#[derive(Parser, Debug)]
#[command(name = "vertex-trader")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Override log level (debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a venue and print its trading markets.
    Connect(VenueArgs),

    /// Subscribe to order books and print the live mid price until
    /// interrupted.
    Subscribe(SubscribeArgs),

    /// Print account balances (`balance` and `available`).
    Balances(VenueArgs),

    /// Submit a market order.
    MarketOrder(MarketOrderArgs),

    /// Submit a limit order.
    LimitOrder(LimitOrderArgs),

    /// Cancel an open order.
    Cancel(CancelArgs),

    /// Drive the account's holdings toward a target weighted portfolio.
    Rebalance(RebalanceArgs),
}

#[derive(Parser, Debug)]
pub struct VenueArgs {
    /// Venue name, matching a `[[venues]]` entry in the config file.
    pub venue: String,
}

#[derive(Parser, Debug)]
pub struct SubscribeArgs {
    pub venue: String,

    /// Venue symbols to subscribe to, e.g. BTCUSDT ETHUSDT.
    #[arg(required = true)]
    pub symbols: Vec<String>,
}

#[derive(Parser, Debug)]
pub struct MarketOrderArgs {
    pub venue: String,
    pub symbol: String,
    #[arg(value_enum)]
    pub side: CliOrderSide,
    /// Base-asset volume. Mutually exclusive with `--quote-volume`.
    #[arg(long)]
    pub volume: Option<Decimal>,
    /// Quote-asset notional. Mutually exclusive with `--volume`.
    #[arg(long)]
    pub quote_volume: Option<Decimal>,
}

#[derive(Parser, Debug)]
pub struct LimitOrderArgs {
    pub venue: String,
    pub symbol: String,
    #[arg(value_enum)]
    pub side: CliOrderSide,
    pub price: Decimal,
    pub volume: Decimal,
}

#[derive(Parser, Debug)]
pub struct CancelArgs {
    pub venue: String,
    pub symbol: String,
    pub order_id: String,
}

#[derive(Parser, Debug)]
pub struct RebalanceArgs {
    pub venue: String,

    /// Target weights as `ASSET=WEIGHT` pairs; normalized before trading.
    #[arg(required = true)]
    pub weights: Vec<String>,

    /// Use re-pegging limit orders instead of immediate market orders.
    #[arg(long)]
    pub limit: bool,
}

impl RebalanceArgs {
    /// Parse `ASSET=WEIGHT` pairs into a weight map.
    pub fn parsed_weights(&self) -> Result<HashMap<String, Decimal>, String> {
        let mut weights = HashMap::new();
        for entry in &self.weights {
            let (asset, weight) = entry
                .split_once('=')
                .ok_or_else(|| format!("invalid weight '{entry}', expected ASSET=WEIGHT"))?;
            let weight: Decimal = weight.parse().map_err(|_| format!("invalid weight value in '{entry}'"))?;
            weights.insert(asset.to_string(), weight);
        }
        Ok(weights)
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum CliOrderSide {
    Buy,
    Sell,
}

impl From<CliOrderSide> for vertex_trader::domain::OrderSide {
    fn from(side: CliOrderSide) -> Self {
        match side {
            CliOrderSide::Buy => Self::Buy,
            CliOrderSide::Sell => Self::Sell,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_weight_pairs() {
        let args = RebalanceArgs { venue: "binance".to_string(), weights: vec!["BTC=0.6".to_string(), "ETH=0.4".to_string()], limit: false };
        let weights = args.parsed_weights().unwrap();
        assert_eq!(weights.get("BTC").copied(), Some(Decimal::new(6, 1)));
        assert_eq!(weights.get("ETH").copied(), Some(Decimal::new(4, 1)));
    }

    #[test]
    fn rejects_malformed_weight_pair() {
        let args = RebalanceArgs { venue: "binance".to_string(), weights: vec!["BTC".to_string()], limit: false };
        assert!(args.parsed_weights().is_err());
    }
}
