//! Application configuration: a TOML file for non-secret settings, with
//! per-venue API credentials loaded from the environment (never from the
//! file itself).

use std::path::Path;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Error, Result};
use crate::signer::Keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueKind {
    BinanceSpot,
    BinanceFutures,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    /// Short handle used for CLI selection and the `{NAME}_API_KEY` /
    /// `{NAME}_API_SECRET` environment variable prefix.
    pub name: String,
    pub kind: VenueKind,
    pub base_url: String,
    pub ws_url: String,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default = "default_collateral_asset")]
    pub collateral_asset: String,
    #[serde(skip)]
    pub credentials: Option<Keys>,
}

fn default_leverage() -> u32 {
    1
}

fn default_collateral_asset() -> String {
    "USDT".to_string()
}

impl VenueConfig {
    fn env_prefix(&self) -> String {
        self.name.to_uppercase().replace('-', "_")
    }

    /// Load `{NAME}_API_KEY` / `{NAME}_API_SECRET` / `{NAME}_SUBACCOUNT`
    /// from the environment; fails if either required variable is
    /// missing, so a misconfigured venue never connects with empty keys.
    fn load_credentials(&mut self) -> Result<()> {
        let prefix = self.env_prefix();
        let api_key = std::env::var(format!("{prefix}_API_KEY"))
            .map_err(|_| Error::Config(format!("missing {prefix}_API_KEY")))?;
        let secret = std::env::var(format!("{prefix}_API_SECRET"))
            .map_err(|_| Error::Config(format!("missing {prefix}_API_SECRET")))?;
        let subaccount = std::env::var(format!("{prefix}_SUBACCOUNT")).ok();
        self.credentials = Some(Keys { api_key, secret, subaccount });
        Ok(())
    }

    #[must_use]
    pub fn keys(&self) -> Option<&Keys> {
        self.credentials.as_ref()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RebalancerConfig {
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    #[serde(default = "default_base_asset")]
    pub default_base: String,
    #[serde(default = "default_backup_base")]
    pub backup_base: String,
    #[serde(default = "default_max_slippage")]
    pub max_slippage: Decimal,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_base_asset() -> String {
    "BTC".to_string()
}

fn default_backup_base() -> String {
    "BNB".to_string()
}

fn default_max_slippage() -> Decimal {
    dec!(0.005)
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        Self {
            quote_asset: default_quote_asset(),
            default_base: default_base_asset(),
            backup_base: default_backup_base(),
            max_slippage: default_max_slippage(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub venues: Vec<VenueConfig>,
    #[serde(default)]
    pub rebalancer: RebalancerConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Config(format!("failed to read config file: {e}")))?;

        let mut config: Self = toml::from_str(&content).map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;

        for venue in &mut config.venues {
            venue.load_credentials()?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.venues.is_empty() {
            return Err(Error::Config("at least one venue must be configured".to_string()));
        }
        let mut names: Vec<&str> = self.venues.iter().map(|v| v.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(Error::Config("venue names must be unique".to_string()));
        }
        if self.rebalancer.max_slippage < Decimal::ZERO || self.rebalancer.max_slippage >= Decimal::ONE {
            return Err(Error::Config("rebalancer.max_slippage must be in [0, 1)".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn venue(&self, name: &str) -> Option<&VenueConfig> {
        self.venues.iter().find(|v| v.name == name)
    }

    pub fn init_logging(&self) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.logging.level));
        match self.logging.format.as_str() {
            "json" => {
                fmt().json().with_env_filter(filter).init();
            }
            _ => {
                fmt().with_env_filter(filter).init();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn venue(name: &str) -> VenueConfig {
        VenueConfig {
            name: name.to_string(),
            kind: VenueKind::BinanceSpot,
            base_url: "https://api.example.com".to_string(),
            ws_url: "wss://ws.example.com".to_string(),
            leverage: 1,
            collateral_asset: "USDT".to_string(),
            credentials: None,
        }
    }

    #[test]
    fn rejects_empty_venue_list() {
        let config = Config { logging: LoggingConfig::default(), venues: vec![], rebalancer: RebalancerConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_venue_names() {
        let config = Config {
            logging: LoggingConfig::default(),
            venues: vec![venue("binance"), venue("binance")],
            rebalancer: RebalancerConfig::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_slippage() {
        let mut rebalancer = RebalancerConfig::default();
        rebalancer.max_slippage = dec!(1.5);
        let config = Config { logging: LoggingConfig::default(), venues: vec![venue("binance")], rebalancer };
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_single_unique_venue() {
        let config = Config { logging: LoggingConfig::default(), venues: vec![venue("binance")], rebalancer: RebalancerConfig::default() };
        assert!(config.validate().is_ok());
    }
}
