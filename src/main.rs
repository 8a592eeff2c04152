mod cli;

use std::sync::Arc;

use clap::Parser;
use rust_decimal::Decimal;
use tokio::signal;
use tracing::{error, info, warn};

use cli::{Cli, Commands};
use vertex_trader::account::Account;
use vertex_trader::config::{Config, VenueConfig, VenueKind};
use vertex_trader::domain::ids::Asset;
use vertex_trader::error::{Error, Result};
use vertex_trader::rebalancer::Rebalancer;
use vertex_trader::venue::{BinanceFuturesAdapter, BinanceSpotAdapter, VenueAdapter};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    config.init_logging();

    info!("vertex-trader starting");

    tokio::select! {
        result = run(cli.command, config) => {
            if let Err(e) = result {
                error!(error = %e, "fatal error");
                std::process::exit(1);
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    info!("vertex-trader stopped");
}

fn build_adapter(venue: &VenueConfig) -> Arc<dyn VenueAdapter> {
    match venue.kind {
        VenueKind::BinanceSpot => Arc::new(BinanceSpotAdapter::new(venue.base_url.clone(), venue.ws_url.clone())),
        VenueKind::BinanceFutures => Arc::new(BinanceFuturesAdapter::new(venue.base_url.clone(), venue.ws_url.clone(), venue.leverage)),
    }
}

fn find_venue<'a>(config: &'a Config, name: &str) -> Result<&'a VenueConfig> {
    config.venue(name).ok_or_else(|| Error::Config(format!("no venue named '{name}' in config")))
}

async fn connected_account(config: &Config, name: &str) -> Result<(Arc<dyn VenueAdapter>, Arc<Account>)> {
    let venue_config = find_venue(config, name)?;
    let keys = venue_config.keys().cloned().ok_or_else(|| Error::Config(format!("no credentials loaded for venue '{name}'")))?;
    let adapter = build_adapter(venue_config);
    adapter.connect().await?;
    adapter.subscribe_to_user_data(keys.clone()).await?;

    let leverage = Decimal::from(venue_config.leverage);
    let collateral_asset = Asset::new(venue_config.collateral_asset.clone());
    let account = Account::new(Arc::clone(&adapter), keys, leverage, collateral_asset);
    account.start().await;
    Ok((adapter, account))
}

async fn run(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Connect(args) => {
            let venue_config = find_venue(&config, &args.venue)?;
            let adapter = build_adapter(venue_config);
            adapter.connect().await?;
            for market in adapter.markets() {
                info!(base = %market.base(), quote = %market.quote(), venue_symbol = market.venue_symbol(), "market");
            }
            adapter.close().await?;
        }
        Commands::Subscribe(args) => {
            let venue_config = find_venue(&config, &args.venue)?;
            let adapter = build_adapter(venue_config);
            adapter.connect().await?;
            adapter.subscribe_to_order_books(&args.symbols).await?;
            loop {
                for symbol in &args.symbols {
                    match adapter.mid_price(symbol).await {
                        Ok(price) => info!(%symbol, %price, "mid price"),
                        Err(err) => warn!(%symbol, %err, "mid price unavailable"),
                    }
                }
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        }
        Commands::Balances(args) => {
            let (_adapter, account) = connected_account(&config, &args.venue).await?;
            let snapshot = account.snapshot().await;
            for (asset, amount) in &snapshot.balance {
                let available = snapshot.available.get(asset).copied().unwrap_or_default();
                info!(%asset, balance = %amount, %available, "balance");
            }
        }
        Commands::MarketOrder(args) => {
            let (_adapter, account) = connected_account(&config, &args.venue).await?;
            let side = args.side.into();
            let id = match (args.volume, args.quote_volume) {
                (Some(volume), None) => account.market_order(&args.symbol, side, volume).await?,
                (None, Some(quote_volume)) => account.market_order_quote(&args.symbol, side, quote_volume).await?,
                _ => return Err(Error::Config("exactly one of --volume or --quote-volume is required".to_string())),
            };
            info!(%id, "market order submitted");
        }
        Commands::LimitOrder(args) => {
            let (_adapter, account) = connected_account(&config, &args.venue).await?;
            let id = account.limit_order(&args.symbol, args.side.into(), args.price, args.volume).await?;
            info!(%id, "limit order submitted");
        }
        Commands::Cancel(args) => {
            let (_adapter, account) = connected_account(&config, &args.venue).await?;
            let order_id = args.order_id.clone().into();
            account.cancel_order(&args.symbol, &order_id).await?;
            info!(order_id = %args.order_id, "order cancelled");
        }
        Commands::Rebalance(args) => {
            let weights = args.parsed_weights().map_err(Error::Config)?;
            let (adapter, account) = connected_account(&config, &args.venue).await?;
            let quote = Asset::new(config.rebalancer.quote_asset.clone());
            let default_base = Asset::new(config.rebalancer.default_base.clone());
            let backup_base = Asset::new(config.rebalancer.backup_base.clone());
            // prepare() only keeps markets whose both legs are candidates.
            let mut candidates: Vec<Asset> = weights.keys().map(Asset::new).collect();
            for extra in [&quote, &default_base, &backup_base] {
                if !candidates.contains(extra) {
                    candidates.push(extra.clone());
                }
            }
            let rebalancer = Rebalancer::prepare(Arc::clone(&account), adapter, &candidates, default_base, backup_base).await?;
            let target: std::collections::HashMap<Asset, Decimal> = weights.into_iter().map(|(k, v)| (Asset::new(k), v)).collect();
            if args.limit {
                let timeout = std::time::Duration::from_secs(config.rebalancer.timeout_secs);
                rebalancer.trade_to_portfolio_limit(&target, &quote, config.rebalancer.max_slippage, timeout).await?;
            } else {
                rebalancer.trade_to_portfolio(&target, &quote).await?;
            }
            info!("rebalance complete");
        }
    }
    Ok(())
}
