use std::sync::{Arc, Mutex};

use services::{
    broadcaster::port::fees::{DynamicFeeEstimate, Estimator, LegacyFee},
    types::DynamicFee,
};

use crate::HttpClient;

/// Node-quoted fee estimates with doubling bumps.
///
/// Initial quotes are clamped to `max_gas_price`; bumps are not, so the
/// broadcaster's ceiling check is what terminates a bump war. The legacy
/// quote is cached between transactions and refreshed on demand when a
/// node rejects it.
#[derive(Clone)]
pub struct FeeEstimator {
    client: HttpClient,
    max_gas_price: u128,
    cached_gas_price: Arc<Mutex<Option<u128>>>,
}

impl FeeEstimator {
    pub fn new(client: HttpClient, max_gas_price: u128) -> Self {
        Self {
            client,
            max_gas_price,
            cached_gas_price: Arc::new(Mutex::new(None)),
        }
    }

    async fn quoted_gas_price(&self, force_refetch: bool) -> services::Result<u128> {
        if !force_refetch {
            if let Some(cached) = *self.cached_gas_price.lock().unwrap() {
                return Ok(cached);
            }
        }

        let fresh = self.client.gas_price().await?;
        *self.cached_gas_price.lock().unwrap() = Some(fresh);
        Ok(fresh)
    }
}

#[async_trait::async_trait]
impl Estimator for FeeEstimator {
    async fn legacy(
        &self,
        _payload: &[u8],
        gas_limit: u64,
        force_refetch: bool,
    ) -> services::Result<LegacyFee> {
        let quoted = self.quoted_gas_price(force_refetch).await?;

        Ok(LegacyFee {
            gas_price: quoted.min(self.max_gas_price),
            gas_limit,
        })
    }

    async fn dynamic(&self, gas_limit: u64) -> services::Result<DynamicFeeEstimate> {
        let estimation = self.client.eip1559_fees().await?;

        Ok(DynamicFeeEstimate {
            fee: DynamicFee {
                tip_cap: estimation.max_priority_fee_per_gas.min(self.max_gas_price),
                fee_cap: estimation.max_fee_per_gas.min(self.max_gas_price),
            },
            gas_limit,
        })
    }

    async fn bump_legacy(
        &self,
        previous_gas_price: u128,
        gas_limit: u64,
    ) -> services::Result<LegacyFee> {
        let fresh = self.client.gas_price().await?;

        Ok(LegacyFee {
            gas_price: fresh.max(previous_gas_price.saturating_mul(2)),
            gas_limit,
        })
    }

    async fn bump_dynamic(
        &self,
        previous: DynamicFee,
        gas_limit: u64,
    ) -> services::Result<DynamicFeeEstimate> {
        let estimation = self.client.eip1559_fees().await?;

        Ok(DynamicFeeEstimate {
            fee: DynamicFee {
                tip_cap: estimation
                    .max_priority_fee_per_gas
                    .max(previous.tip_cap.saturating_mul(2)),
                fee_cap: estimation
                    .max_fee_per_gas
                    .max(previous.fee_cap.saturating_mul(2)),
            },
            gas_limit,
        })
    }
}
