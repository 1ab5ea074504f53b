use std::{net::Ipv4Addr, str::FromStr, time::Duration};

use clap::{Parser, command};
use serde::Deserialize;
use services::types::ChainVariant;
use storage::DbConfig;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub eth: Eth,
    pub app: App,
}

impl Config {
    pub fn validate(&self) -> crate::errors::Result<()> {
        if self.eth.sender_keys.is_empty() {
            return Err(crate::errors::Error::Other(
                "at least one sender key must be configured".to_string(),
            ));
        }

        if self.eth.default_gas_price_wei > self.eth.max_gas_price_wei {
            return Err(crate::errors::Error::Other(
                "default gas price must not exceed the max gas price".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Eth {
    /// URL to an Ethereum JSON-RPC endpoint.
    #[serde(deserialize_with = "parse_url")]
    pub rpc: Url,
    /// Chain id of the network the node is on.
    pub chain_id: u64,
    /// Chain flavour, relevant for send-error semantics.
    #[serde(default)]
    pub chain_variant: ChainVariant,
    /// Comma-separated hex private keys of the sender accounts.
    #[serde(deserialize_with = "parse_comma_separated")]
    pub sender_keys: Vec<String>,
    /// Hard ceiling for fee bumps, in wei.
    pub max_gas_price_wei: u64,
    /// Expected prevailing gas price, in wei. Diagnostic only.
    pub default_gas_price_wei: u64,
    /// Broadcast EIP-1559 transactions instead of legacy ones.
    pub dynamic_fees: bool,
    /// Reconcile stored nonces against the chain on startup.
    pub nonce_auto_sync: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct App {
    /// Port used by the started server
    pub port: u16,
    /// IPv4 address on which the server will listen for connections
    pub host: Ipv4Addr,
    /// Postgres database configuration
    pub db: DbConfig,
    /// How long a sender worker waits between queue scans when no insert
    /// notification arrives. Applied with jitter.
    #[serde(deserialize_with = "human_readable_duration")]
    pub fallback_poll_interval: Duration,
    /// Maximum number of unconfirmed transactions per sender before the
    /// worker throttles. 0 disables throttling.
    pub max_in_flight_per_sender: u32,
}

impl Config {
    pub fn broadcaster_config(&self) -> services::BroadcasterConfig {
        services::BroadcasterConfig {
            chain_id: self.eth.chain_id,
            chain_variant: self.eth.chain_variant,
            max_in_flight_per_sender: self.app.max_in_flight_per_sender,
            fallback_poll_interval: self.app.fallback_poll_interval,
            dynamic_fees_enabled: self.eth.dynamic_fees,
            max_gas_price: self.eth.max_gas_price_wei as u128,
            default_gas_price: self.eth.default_gas_price_wei as u128,
            nonce_auto_sync: self.eth.nonce_auto_sync,
        }
    }
}

fn parse_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let url_str: String = Deserialize::deserialize(deserializer)?;
    Url::from_str(&url_str).map_err(|e| {
        let msg = format!("Failed to parse URL '{url_str}': {e};");
        serde::de::Error::custom(msg)
    })
}

fn parse_comma_separated<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: String = Deserialize::deserialize(deserializer)?;
    Ok(raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_owned)
        .collect())
}

fn human_readable_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let duration_str: String = Deserialize::deserialize(deserializer)?;
    humantime::parse_duration(&duration_str).map_err(|e| {
        let msg = format!("Failed to parse duration '{duration_str}': {e};");
        serde::de::Error::custom(msg)
    })
}

#[derive(Debug, Clone)]
pub struct Internal {
    pub eth_errors_before_unhealthy: usize,
}

impl Default for Internal {
    fn default() -> Self {
        Self {
            eth_errors_before_unhealthy: 3,
        }
    }
}

#[derive(Parser)]
#[command(name = "tx-broadcaster", version, about, propagate_version = true)]
struct Cli {}

pub fn parse() -> crate::errors::Result<Config> {
    let _ = Cli::parse();

    let config = config::Config::builder()
        .add_source(config::Environment::with_prefix("BROADCASTER").separator("__"))
        .build()?;

    Ok(config.try_deserialize()?)
}
