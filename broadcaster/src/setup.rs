use std::sync::Arc;

use clock::SystemClock;
use eth::PrivateKeySigner;
use metrics::{HealthChecker, RegistersMetrics, Registry};
use services::broadcaster::port::{checker::NoopCheckerFactory, storage::Storage};
use storage::{Postgres, TxInsertListener};
use tracing::info;

use crate::{
    Broadcaster, Database,
    config::{Config, Internal},
    errors::{Error, Result},
};

pub fn logger() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_level(true)
        .with_line_number(true)
        .json()
        .init();
}

pub async fn storage(config: &Config) -> Result<Postgres> {
    let postgres = Postgres::connect(&config.app.db).await?;
    postgres.migrate().await?;

    Ok(postgres)
}

pub async fn broadcaster(
    config: &Config,
    internal_config: &Internal,
    registry: &Registry,
    db: Database,
) -> Result<(Broadcaster, HealthChecker)> {
    let client = eth::HttpClient::new(
        config.eth.rpc.clone(),
        internal_config.eth_errors_before_unhealthy,
    );
    let eth_health_check = client.connection_health_checker();

    let keys = config
        .eth
        .sender_keys
        .iter()
        .map(|raw| {
            raw.parse::<PrivateKeySigner>()
                .map_err(|e| Error::Other(format!("invalid sender key: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;
    let signer = eth::AttemptSigner::new(keys, config.eth.chain_id);
    let senders = signer.addresses();

    for sender in &senders {
        db.ensure_key_state(*sender, config.eth.chain_id).await?;
    }

    let estimator = eth::FeeEstimator::new(client.clone(), config.eth.max_gas_price_wei as u128);
    let subscriber = Arc::new(TxInsertListener::new(db.clone()));

    let mut broadcaster = services::Broadcaster::new(
        db,
        client,
        estimator,
        signer,
        SystemClock,
        Arc::new(NoopCheckerFactory),
        None,
        subscriber,
        senders.clone(),
        config.broadcaster_config(),
    );
    broadcaster.register_metrics(registry);
    broadcaster.start().await?;

    info!(senders = senders.len(), "broadcaster started");
    Ok((broadcaster, eth_health_check))
}

pub async fn shut_down(broadcaster: Broadcaster, storage: Postgres) -> Result<()> {
    broadcaster.shut_down().await;
    storage.close().await;
    Ok(())
}
