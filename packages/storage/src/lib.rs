#![deny(unused_crate_dependencies)]
mod error;
mod listener;
mod mappings;
mod postgres;

use services::{
    broadcaster::port::storage::{Result, Storage},
    types::{Address, Attempt, Tx},
};

pub use listener::{TX_INSERT_CHANNEL, TxInsertListener};
pub use postgres::{DbConfig, Finalizer, Postgres};

#[async_trait::async_trait]
impl Storage for Postgres {
    async fn insert_unstarted(&self, tx: Tx) -> Result<Tx> {
        Ok(self._insert_unstarted(tx).await?)
    }

    async fn get_in_progress(&self, address: Address) -> Result<Option<(Tx, Attempt)>> {
        Ok(self._get_in_progress(address).await?)
    }

    async fn next_unstarted(&self, address: Address, chain_id: u64) -> Result<Option<Tx>> {
        Ok(self._next_unstarted(address, chain_id).await?)
    }

    async fn count_unconfirmed(&self, address: Address, chain_id: u64) -> Result<usize> {
        Ok(self
            ._count_in_state(address, chain_id, services::types::TxState::Unconfirmed)
            .await?)
    }

    async fn count_unstarted(&self, address: Address, chain_id: u64) -> Result<usize> {
        Ok(self
            ._count_in_state(address, chain_id, services::types::TxState::Unstarted)
            .await?)
    }

    async fn persist_in_progress(&self, tx: &mut Tx, attempt: &mut Attempt) -> Result<()> {
        Ok(self._persist_in_progress(tx, attempt).await?)
    }

    async fn persist_broadcast(&self, tx: &mut Tx, attempt: &mut Attempt) -> Result<()> {
        Ok(self._persist_broadcast(tx, attempt, Vec::new()).await?)
    }

    async fn persist_fatal(&self, tx: &mut Tx) -> Result<()> {
        Ok(self._persist_fatal(tx).await?)
    }

    async fn persist_replacement_attempt(&self, old: &Attempt, new: &mut Attempt) -> Result<()> {
        Ok(self._persist_replacement_attempt(old, new).await?)
    }

    async fn next_nonce(&self, address: Address, chain_id: u64) -> Result<i64> {
        Ok(self._next_nonce(address, chain_id).await?)
    }

    async fn ensure_key_state(&self, address: Address, chain_id: u64) -> Result<()> {
        Ok(self._ensure_key_state(address, chain_id).await?)
    }

    async fn fast_forward_nonce(&self, address: Address, chain_id: u64, nonce: i64) -> Result<()> {
        Ok(self._fast_forward_nonce(address, chain_id, nonce).await?)
    }
}

impl Postgres {
    /// [`Storage::persist_broadcast`] with extra work committed inside
    /// the same database transaction.
    pub async fn persist_broadcast_with(
        &self,
        tx: &mut Tx,
        attempt: &mut Attempt,
        finalizers: Vec<Finalizer>,
    ) -> Result<()> {
        Ok(self._persist_broadcast(tx, attempt, finalizers).await?)
    }
}
