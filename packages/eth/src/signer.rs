use std::collections::HashMap;

use alloy::{
    consensus::{SignableTransaction, TxEip1559, TxEnvelope, TxLegacy},
    eips::eip2718::Encodable2718,
    network::TxSignerSync,
    primitives::TxKind,
    signers::local::PrivateKeySigner,
};
use services::{
    broadcaster::port::signer::{Api, SignedAttempt},
    types::{Address, Fee, Tx},
};

/// Signs attempts with locally held keys, one per sender address.
#[derive(Clone)]
pub struct AttemptSigner {
    signers: HashMap<Address, PrivateKeySigner>,
    chain_id: u64,
}

impl AttemptSigner {
    pub fn new(keys: impl IntoIterator<Item = PrivateKeySigner>, chain_id: u64) -> Self {
        let signers = keys.into_iter().map(|key| (key.address(), key)).collect();
        Self { signers, chain_id }
    }

    pub fn addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<_> = self.signers.keys().copied().collect();
        addresses.sort();
        addresses
    }
}

#[async_trait::async_trait]
impl Api for AttemptSigner {
    async fn sign_attempt(
        &self,
        tx: &Tx,
        nonce: i64,
        fee: Fee,
        gas_limit: u64,
    ) -> services::Result<SignedAttempt> {
        let signer = self.signers.get(&tx.from_address).ok_or_else(|| {
            services::Error::Other(format!("no key available for sender {}", tx.from_address))
        })?;

        let (hash, payload) = match fee {
            Fee::Legacy { gas_price } => {
                let mut inner = TxLegacy {
                    chain_id: Some(self.chain_id),
                    nonce: nonce as u64,
                    gas_price,
                    gas_limit,
                    to: TxKind::Call(tx.to_address),
                    value: tx.value,
                    input: tx.encoded_payload.clone().into(),
                };
                let signature = signer
                    .sign_transaction_sync(&mut inner)
                    .map_err(|e| services::Error::Other(format!("failed to sign: {e}")))?;
                let signed = inner.into_signed(signature);
                (*signed.hash(), TxEnvelope::from(signed).encoded_2718())
            }
            Fee::Dynamic(dynamic) => {
                let mut inner = TxEip1559 {
                    chain_id: self.chain_id,
                    nonce: nonce as u64,
                    gas_limit,
                    max_fee_per_gas: dynamic.fee_cap,
                    max_priority_fee_per_gas: dynamic.tip_cap,
                    to: TxKind::Call(tx.to_address),
                    value: tx.value,
                    access_list: Default::default(),
                    input: tx.encoded_payload.clone().into(),
                };
                let signature = signer
                    .sign_transaction_sync(&mut inner)
                    .map_err(|e| services::Error::Other(format!("failed to sign: {e}")))?;
                let signed = inner.into_signed(signature);
                (*signed.hash(), TxEnvelope::from(signed).encoded_2718())
            }
        };

        Ok(SignedAttempt { hash, payload })
    }
}

#[cfg(test)]
mod tests {
    use alloy::eips::eip2718::Decodable2718;
    use services::types::{CheckerSpec, DynamicFee, TxState, U256, Utc};

    use super::*;

    fn given_tx(from: Address) -> Tx {
        Tx {
            id: 1,
            from_address: from,
            to_address: Address::repeat_byte(0xBB),
            chain_id: 31337,
            nonce: Some(7),
            encoded_payload: vec![0xCA, 0xFE],
            gas_limit: 21_000,
            value: U256::from(1_000u64),
            state: TxState::InProgress,
            error: None,
            broadcast_at: None,
            initial_broadcast_at: None,
            created_at: Utc::now(),
            checker_spec: CheckerSpec::none(),
            pipeline_task_run_id: None,
            subject: None,
        }
    }

    #[tokio::test]
    async fn signs_a_legacy_attempt_that_decodes_back() {
        // given
        let key = PrivateKeySigner::random();
        let tx = given_tx(key.address());
        let signer = AttemptSigner::new([key], 31337);

        // when
        let signed = signer
            .sign_attempt(
                &tx,
                7,
                Fee::Legacy {
                    gas_price: 20_000_000_000,
                },
                21_000,
            )
            .await
            .unwrap();

        // then
        let envelope = TxEnvelope::decode_2718(&mut signed.payload.as_slice()).unwrap();
        assert_eq!(*envelope.tx_hash(), signed.hash);
        assert!(envelope.is_legacy());
    }

    #[tokio::test]
    async fn signs_a_dynamic_fee_attempt() {
        // given
        let key = PrivateKeySigner::random();
        let tx = given_tx(key.address());
        let signer = AttemptSigner::new([key], 31337);

        // when
        let signed = signer
            .sign_attempt(
                &tx,
                7,
                Fee::Dynamic(DynamicFee {
                    tip_cap: 2_000_000_000,
                    fee_cap: 20_000_000_000,
                }),
                21_000,
            )
            .await
            .unwrap();

        // then
        let envelope = TxEnvelope::decode_2718(&mut signed.payload.as_slice()).unwrap();
        assert_eq!(*envelope.tx_hash(), signed.hash);
        assert!(envelope.is_eip1559());
    }

    #[tokio::test]
    async fn refuses_to_sign_for_an_unknown_sender() {
        // given
        let key = PrivateKeySigner::random();
        let tx = given_tx(Address::repeat_byte(0xDD));
        let signer = AttemptSigner::new([key], 31337);

        // when
        let result = signer
            .sign_attempt(&tx, 7, Fee::Legacy { gas_price: 1 }, 21_000)
            .await;

        // then
        let err = result.unwrap_err();
        assert!(err.to_string().contains("no key available"));
    }
}
