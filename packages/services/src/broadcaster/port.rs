use crate::types::{DateTime, Utc};

pub mod storage {
    use crate::types::{Address, Attempt, Tx};

    #[derive(Debug, thiserror::Error)]
    pub enum Error {
        #[error("database error: {0}")]
        Database(String),
        #[error("could not convert to/from domain/db type: {0}")]
        Conversion(String),
        #[error("invariant violation: {0}")]
        InvariantViolation(String),
        /// The queue row was deleted out from under us (cascading delete
        /// race); callers drop the transaction silently.
        #[error("transaction removed")]
        TxRemoved,
    }

    pub type Result<T> = std::result::Result<T, Error>;

    #[async_trait::async_trait]
    pub trait Storage: Send + Sync {
        /// Creates a new queue row in `unstarted`. Returns the stored row
        /// with its assigned id.
        async fn insert_unstarted(&self, tx: Tx) -> Result<Tx>;

        /// The sender's single leftover `in_progress` transaction, with
        /// its single `in_progress` attempt. More than one row, or an
        /// attempt in any other shape, is an invariant violation.
        async fn get_in_progress(&self, address: Address) -> Result<Option<(Tx, Attempt)>>;

        /// Earliest unstarted transaction for the sender, ordered by
        /// `(value ASC, created_at ASC, id ASC)` so an insufficient-funds
        /// block lands on the smallest transaction first.
        async fn next_unstarted(&self, address: Address, chain_id: u64) -> Result<Option<Tx>>;

        async fn count_unconfirmed(&self, address: Address, chain_id: u64) -> Result<usize>;
        async fn count_unstarted(&self, address: Address, chain_id: u64) -> Result<usize>;

        /// Inserts the attempt and promotes the transaction to
        /// `in_progress` with its nonce, in one database transaction.
        /// Returns [`Error::TxRemoved`] if the queue row vanished.
        async fn persist_in_progress(&self, tx: &mut Tx, attempt: &mut Attempt) -> Result<()>;

        /// One database transaction: compare-and-swap increment of the
        /// nonce counter from `tx.nonce`, transaction to `unconfirmed`,
        /// attempt to `broadcast`. A counter that drifted aborts the
        /// whole transaction with an invariant violation.
        async fn persist_broadcast(&self, tx: &mut Tx, attempt: &mut Attempt) -> Result<()>;

        /// Deletes all attempts and parks the transaction in
        /// `fatal_error` with nonce and broadcast timestamps cleared.
        async fn persist_fatal(&self, tx: &mut Tx) -> Result<()>;

        /// Swaps `old` for `new`, both `in_progress`, in one database
        /// transaction. Only valid before the nonce was ever incremented.
        async fn persist_replacement_attempt(&self, old: &Attempt, new: &mut Attempt)
            -> Result<()>;

        /// Current counter value. A missing row is an invariant
        /// violation, not an empty result.
        async fn next_nonce(&self, address: Address, chain_id: u64) -> Result<i64>;

        /// Creates the counter row at zero if the sender has none.
        async fn ensure_key_state(&self, address: Address, chain_id: u64) -> Result<()>;

        /// Advances the counter to `nonce` if it lags behind; never
        /// rewinds it.
        async fn fast_forward_nonce(
            &self,
            address: Address,
            chain_id: u64,
            nonce: i64,
        ) -> Result<()>;
    }
}

pub mod node {
    use std::sync::Arc;

    use crate::types::{Address, Attempt, SendError, Tx};

    #[cfg_attr(any(test, feature = "test-helpers"), mockall::automock)]
    #[async_trait::async_trait]
    pub trait Api: Send + Sync {
        /// Best-effort submission of a signed attempt. The returned error
        /// is already classified; the broadcaster dispatches on it.
        async fn send_transaction(
            &self,
            tx: &Tx,
            attempt: &Attempt,
        ) -> std::result::Result<(), SendError>;

        /// The chain's pending transaction count for the address, used by
        /// the nonce-sync bootstrap.
        async fn pending_nonce(&self, address: Address) -> crate::Result<u64>;
    }

    #[async_trait::async_trait]
    impl<T: Api + ?Sized> Api for Arc<T> {
        async fn send_transaction(
            &self,
            tx: &Tx,
            attempt: &Attempt,
        ) -> std::result::Result<(), SendError> {
            (**self).send_transaction(tx, attempt).await
        }

        async fn pending_nonce(&self, address: Address) -> crate::Result<u64> {
            (**self).pending_nonce(address).await
        }
    }
}

pub mod fees {
    use crate::types::DynamicFee;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LegacyFee {
        pub gas_price: u128,
        pub gas_limit: u64,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DynamicFeeEstimate {
        pub fee: DynamicFee,
        pub gas_limit: u64,
    }

    #[cfg_attr(any(test, feature = "test-helpers"), mockall::automock)]
    #[async_trait::async_trait]
    pub trait Estimator: Send + Sync {
        /// `force_refetch` bypasses any cached estimate; used when an
        /// Optimism-family node rejected the previous quote.
        async fn legacy(
            &self,
            payload: &[u8],
            gas_limit: u64,
            force_refetch: bool,
        ) -> crate::Result<LegacyFee>;

        async fn dynamic(&self, gas_limit: u64) -> crate::Result<DynamicFeeEstimate>;

        async fn bump_legacy(
            &self,
            previous_gas_price: u128,
            gas_limit: u64,
        ) -> crate::Result<LegacyFee>;

        async fn bump_dynamic(
            &self,
            previous: DynamicFee,
            gas_limit: u64,
        ) -> crate::Result<DynamicFeeEstimate>;
    }

    #[async_trait::async_trait]
    impl<T: Estimator + ?Sized> Estimator for std::sync::Arc<T> {
        async fn legacy(
            &self,
            payload: &[u8],
            gas_limit: u64,
            force_refetch: bool,
        ) -> crate::Result<LegacyFee> {
            (**self).legacy(payload, gas_limit, force_refetch).await
        }

        async fn dynamic(&self, gas_limit: u64) -> crate::Result<DynamicFeeEstimate> {
            (**self).dynamic(gas_limit).await
        }

        async fn bump_legacy(
            &self,
            previous_gas_price: u128,
            gas_limit: u64,
        ) -> crate::Result<LegacyFee> {
            (**self).bump_legacy(previous_gas_price, gas_limit).await
        }

        async fn bump_dynamic(
            &self,
            previous: DynamicFee,
            gas_limit: u64,
        ) -> crate::Result<DynamicFeeEstimate> {
            (**self).bump_dynamic(previous, gas_limit).await
        }
    }
}

pub mod signer {
    use crate::types::{B256, Fee, Tx};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SignedAttempt {
        pub hash: B256,
        pub payload: Vec<u8>,
    }

    #[cfg_attr(any(test, feature = "test-helpers"), mockall::automock)]
    #[async_trait::async_trait]
    pub trait Api: Send + Sync {
        async fn sign_attempt(
            &self,
            tx: &Tx,
            nonce: i64,
            fee: Fee,
            gas_limit: u64,
        ) -> crate::Result<SignedAttempt>;
    }

    #[async_trait::async_trait]
    impl<T: Api + ?Sized> Api for std::sync::Arc<T> {
        async fn sign_attempt(
            &self,
            tx: &Tx,
            nonce: i64,
            fee: Fee,
            gas_limit: u64,
        ) -> crate::Result<SignedAttempt> {
            (**self).sign_attempt(tx, nonce, fee, gas_limit).await
        }
    }
}

pub mod checker {
    use crate::types::{Attempt, CheckerSpec, Tx};

    /// Domain-specific predicate run immediately before submission.
    ///
    /// An error refuses the submission and fatally errors the
    /// transaction; checkers swallow and log anything they cannot decide
    /// on, erring on the side of submitting.
    #[async_trait::async_trait]
    pub trait TransmitChecker: Send + Sync {
        async fn check(&self, tx: &Tx, attempt: &Attempt) -> crate::Result<()>;
    }

    pub trait TransmitCheckerFactory: Send + Sync {
        fn build(&self, spec: &CheckerSpec) -> crate::Result<Box<dyn TransmitChecker>>;
    }

    pub struct NoopChecker;

    #[async_trait::async_trait]
    impl TransmitChecker for NoopChecker {
        async fn check(&self, _tx: &Tx, _attempt: &Attempt) -> crate::Result<()> {
            Ok(())
        }
    }

    /// Factory for deployments that configure no pre-submit checks: an
    /// empty spec builds the no-op checker, anything else is rejected.
    pub struct NoopCheckerFactory;

    impl TransmitCheckerFactory for NoopCheckerFactory {
        fn build(&self, spec: &CheckerSpec) -> crate::Result<Box<dyn TransmitChecker>> {
            match spec.as_deref() {
                None | Some("") => Ok(Box::new(NoopChecker)),
                Some(kind) => Err(crate::Error::Other(format!(
                    "unrecognised transmit checker kind: {kind}"
                ))),
            }
        }
    }
}

pub mod callback {
    #[derive(Debug, thiserror::Error)]
    pub enum CallbackError {
        /// The upstream run is gone or already resumed; callers swallow
        /// this.
        #[error("callback target missing")]
        NotFound,
        #[error("{0}")]
        Other(String),
    }

    /// Notifies the upstream workflow engine that its transaction
    /// terminated fatally.
    #[async_trait::async_trait]
    pub trait ResumeCallback: Send + Sync {
        async fn resume(
            &self,
            task_run_id: i64,
            error: &str,
        ) -> std::result::Result<(), CallbackError>;
    }
}

pub mod bus {
    use futures::stream::BoxStream;

    /// Insert-notification bus. Events carry the hex-encoded sender
    /// address of a freshly queued transaction.
    #[async_trait::async_trait]
    pub trait Subscriber: Send + Sync {
        async fn subscribe(&self) -> crate::Result<BoxStream<'static, String>>;
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

impl<T: Clock + ?Sized> Clock for std::sync::Arc<T> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}
