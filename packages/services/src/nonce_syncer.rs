use tracing::info;

use crate::{
    Result,
    broadcaster::port::{node, storage::Storage},
    types::Address,
};

/// Reconciles stored nonce counters against the chain at startup.
///
/// Covers the case where transactions were sent outside this process
/// (an operator's wallet, a previous deployment) and the chain is ahead
/// of our counter. The counter is only ever fast-forwarded; a chain that
/// appears *behind* is left alone, since our unconfirmed transactions
/// legitimately occupy those nonces.
pub struct NonceSyncer<Db, Node> {
    storage: Db,
    node: Node,
}

impl<Db, Node> NonceSyncer<Db, Node> {
    pub fn new(storage: Db, node: Node) -> Self {
        Self { storage, node }
    }
}

impl<Db, Node> NonceSyncer<Db, Node>
where
    Db: Storage,
    Node: node::Api,
{
    pub async fn sync_all(&self, senders: &[Address], chain_id: u64) -> Result<()> {
        for address in senders {
            self.sync(*address, chain_id).await?;
        }
        Ok(())
    }

    async fn sync(&self, address: Address, chain_id: u64) -> Result<()> {
        let chain_nonce = self.node.pending_nonce(address).await? as i64;
        let local_nonce = self.storage.next_nonce(address, chain_id).await?;

        if chain_nonce > local_nonce {
            info!(
                %address,
                local_nonce,
                chain_nonce,
                "local nonce is behind the chain, fast-forwarding"
            );
            self.storage
                .fast_forward_nonce(address, chain_id, chain_nonce)
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broadcaster::port::node::MockApi, test_utils::InMemoryStorage};

    #[tokio::test]
    async fn fast_forwards_a_lagging_counter() {
        // given
        let address = Address::repeat_byte(0xAA);
        let storage = InMemoryStorage::default();
        storage.seed_key(address, 1, 3);

        let mut node = MockApi::new();
        node.expect_pending_nonce().returning(|_| Ok(7));

        let syncer = NonceSyncer::new(storage.clone(), node);

        // when
        syncer.sync_all(&[address], 1).await.unwrap();

        // then
        assert_eq!(storage.key_nonce(address, 1), Some(7));
    }

    #[tokio::test]
    async fn never_rewinds_the_counter() {
        // given
        let address = Address::repeat_byte(0xAA);
        let storage = InMemoryStorage::default();
        storage.seed_key(address, 1, 10);

        let mut node = MockApi::new();
        node.expect_pending_nonce().returning(|_| Ok(4));

        let syncer = NonceSyncer::new(storage.clone(), node);

        // when
        syncer.sync_all(&[address], 1).await.unwrap();

        // then
        assert_eq!(storage.key_nonce(address, 1), Some(10));
    }

    #[tokio::test]
    async fn missing_key_state_row_is_an_error() {
        // given
        let address = Address::repeat_byte(0xAA);
        let storage = InMemoryStorage::default();

        let mut node = MockApi::new();
        node.expect_pending_nonce().returning(|_| Ok(4));

        let syncer = NonceSyncer::new(storage, node);

        // when
        let result = syncer.sync_all(&[address], 1).await;

        // then
        assert!(matches!(result, Err(crate::Error::InvariantViolation(_))));
    }
}
