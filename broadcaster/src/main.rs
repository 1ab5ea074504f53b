#![deny(unused_crate_dependencies)]
mod api;
mod config;
mod errors;
mod setup;

use api::launch_api_server;
use errors::{Result, WithContext};
use metrics::Registry;

pub type L1 = eth::HttpClient;
pub type Database = storage::Postgres;
pub type Broadcaster =
    services::Broadcaster<Database, L1, eth::FeeEstimator, eth::AttemptSigner, clock::SystemClock>;

#[tokio::main]
async fn main() -> Result<()> {
    setup::logger();

    let config = config::parse().with_context(|| "failed to parse config")?;
    config
        .validate()
        .with_context(|| "config validation failed")?;

    let metrics_registry = Registry::default();

    let storage = setup::storage(&config)
        .await
        .with_context(|| "failed to connect to database")?;

    let internal_config = config::Internal::default();

    let (broadcaster, eth_health_check) = setup::broadcaster(
        &config,
        &internal_config,
        &metrics_registry,
        storage.clone(),
    )
    .await
    .with_context(|| "could not start broadcaster")?;

    launch_api_server(&config, metrics_registry, eth_health_check)
        .await
        .with_context(|| "api server")?;

    setup::shut_down(broadcaster, storage).await
}
