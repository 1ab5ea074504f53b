use alloy::{
    network::Ethereum,
    providers::{Provider, RootProvider, utils::Eip1559Estimation},
    rpc::client::RpcClient,
    transports::{RpcError, TransportErrorKind},
};
use metrics::{ConnectionHealthTracker, HealthChecker};
use services::{
    broadcaster::port::node,
    types::{Address, Attempt, SendError, SendErrorKind, Tx},
};
use url::Url;

/// JSON-RPC client for the remote node.
///
/// Submission is best-effort: a definite node response gets classified
/// for the broadcaster to dispatch on, while transport failures surface
/// as unclassified (transient) errors and count against connection
/// health.
#[derive(Clone)]
pub struct HttpClient {
    provider: RootProvider<Ethereum>,
    health_tracker: ConnectionHealthTracker,
}

impl HttpClient {
    pub fn new(url: Url, unhealthy_after_n_errors: usize) -> Self {
        let rpc = RpcClient::new_http(url);
        Self {
            provider: RootProvider::new(rpc),
            health_tracker: ConnectionHealthTracker::new(unhealthy_after_n_errors),
        }
    }

    pub fn connection_health_checker(&self) -> HealthChecker {
        self.health_tracker.tracker()
    }

    fn note_outcome(&self, error: Option<&RpcError<TransportErrorKind>>) {
        // an error response still means the node was reachable
        match error {
            Some(RpcError::Transport(_)) => self.health_tracker.note_failure(),
            _ => self.health_tracker.note_success(),
        }
    }

    pub(crate) async fn gas_price(&self) -> services::Result<u128> {
        let result = self.provider.get_gas_price().await;
        self.note_outcome(result.as_ref().err());
        result.map_err(|e| services::Error::Network(e.to_string()))
    }

    pub(crate) async fn eip1559_fees(&self) -> services::Result<Eip1559Estimation> {
        let result = self.provider.estimate_eip1559_fees().await;
        self.note_outcome(result.as_ref().err());
        result.map_err(|e| services::Error::Network(e.to_string()))
    }
}

#[async_trait::async_trait]
impl node::Api for HttpClient {
    async fn send_transaction(
        &self,
        _tx: &Tx,
        attempt: &Attempt,
    ) -> std::result::Result<(), SendError> {
        let result = self
            .provider
            .send_raw_transaction(&attempt.signed_payload)
            .await;
        self.note_outcome(result.as_ref().err());

        match result {
            Ok(_) => Ok(()),
            Err(RpcError::ErrorResp(payload)) => Err(SendError::classify(payload.message)),
            Err(other) => Err(SendError::new(SendErrorKind::Unclassified, other.to_string())),
        }
    }

    async fn pending_nonce(&self, address: Address) -> services::Result<u64> {
        let result = self.provider.get_transaction_count(address).pending().await;
        self.note_outcome(result.as_ref().err());
        result.map_err(|e| services::Error::Network(e.to_string()))
    }
}
