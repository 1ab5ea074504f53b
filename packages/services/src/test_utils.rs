use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use futures::{StreamExt, stream::BoxStream};
use tokio::sync::mpsc;

use crate::{
    Error, Result,
    broadcaster::port::{
        bus,
        callback::{CallbackError, ResumeCallback},
        checker::{TransmitChecker, TransmitCheckerFactory},
        storage::{Error as StorageError, Result as StorageResult, Storage},
    },
    types::{Address, Attempt, AttemptState, CheckerSpec, Tx, TxState},
};

/// Pinnable clock for deterministic broadcast timestamps.
#[derive(Default, Clone)]
pub(crate) struct TestClock {
    epoch_millis: Arc<std::sync::atomic::AtomicI64>,
}

impl TestClock {
    pub(crate) fn set_time(&self, new_time: crate::types::DateTime<crate::types::Utc>) {
        self.epoch_millis.store(
            new_time.timestamp_millis(),
            std::sync::atomic::Ordering::Relaxed,
        )
    }
}

impl crate::broadcaster::port::Clock for TestClock {
    fn now(&self) -> crate::types::DateTime<crate::types::Utc> {
        crate::types::DateTime::from_timestamp_millis(
            self.epoch_millis.load(std::sync::atomic::Ordering::Relaxed),
        )
        .expect("DateTime<Utc> to be in range")
    }
}

pub(crate) mod builders {
    use chrono::TimeZone;

    use crate::types::{
        Address, Attempt, AttemptState, B256, CheckerSpec, DateTime, Tx, TxState, TxType, U256,
        Utc,
    };

    pub(crate) fn address(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    pub(crate) fn created_at(offset_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + offset_secs, 0).unwrap()
    }

    pub(crate) fn unstarted_tx() -> Tx {
        Tx {
            id: 0,
            from_address: address(0xAA),
            to_address: address(0xBB),
            chain_id: 1,
            nonce: None,
            encoded_payload: vec![0xCA, 0xFE],
            gas_limit: 21_000,
            value: U256::ZERO,
            state: TxState::Unstarted,
            error: None,
            broadcast_at: None,
            initial_broadcast_at: None,
            created_at: created_at(0),
            checker_spec: CheckerSpec::none(),
            pipeline_task_run_id: None,
            subject: None,
        }
    }

    pub(crate) fn legacy_attempt(tx_id: i64) -> Attempt {
        Attempt {
            id: 0,
            tx_id,
            state: AttemptState::InProgress,
            hash: B256::repeat_byte(0x42),
            tx_type: TxType::Legacy,
            signed_payload: vec![0xBE, 0xEF],
            gas_price: Some(20_000_000_000),
            gas_tip_cap: None,
            gas_fee_cap: None,
        }
    }
}

/// Storage double implementing the full port semantics in memory:
/// state-constrained updates, the nonce compare-and-swap, cascading
/// attempt deletion and the queue-removal race.
#[derive(Clone, Default)]
pub(crate) struct InMemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    txs: BTreeMap<i64, Tx>,
    attempts: BTreeMap<i64, Attempt>,
    keys: HashMap<(Address, u64), i64>,
    next_tx_id: i64,
    next_attempt_id: i64,
    remove_next_picked: bool,
}

impl InMemoryStorage {
    pub(crate) fn seed_key(&self, address: Address, chain_id: u64, next_nonce: i64) {
        self.inner
            .lock()
            .unwrap()
            .keys
            .insert((address, chain_id), next_nonce);
    }

    pub(crate) fn seed_tx(&self, mut tx: Tx) -> Tx {
        let mut inner = self.inner.lock().unwrap();
        inner.next_tx_id += 1;
        tx.id = inner.next_tx_id;
        inner.txs.insert(tx.id, tx.clone());
        tx
    }

    pub(crate) fn seed_attempt(&self, mut attempt: Attempt) -> Attempt {
        let mut inner = self.inner.lock().unwrap();
        inner.next_attempt_id += 1;
        attempt.id = inner.next_attempt_id;
        inner.attempts.insert(attempt.id, attempt.clone());
        attempt
    }

    /// The next `next_unstarted` pick is deleted underneath the caller,
    /// reproducing the cascading-delete race.
    pub(crate) fn remove_next_picked(&self) {
        self.inner.lock().unwrap().remove_next_picked = true;
    }

    pub(crate) fn tx(&self, id: i64) -> Option<Tx> {
        self.inner.lock().unwrap().txs.get(&id).cloned()
    }

    pub(crate) fn attempts_for(&self, tx_id: i64) -> Vec<Attempt> {
        self.inner
            .lock()
            .unwrap()
            .attempts
            .values()
            .filter(|a| a.tx_id == tx_id)
            .cloned()
            .collect()
    }

    pub(crate) fn key_nonce(&self, address: Address, chain_id: u64) -> Option<i64> {
        self.inner
            .lock()
            .unwrap()
            .keys
            .get(&(address, chain_id))
            .copied()
    }
}

#[async_trait::async_trait]
impl Storage for InMemoryStorage {
    async fn insert_unstarted(&self, mut tx: Tx) -> StorageResult<Tx> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_tx_id += 1;
        tx.id = inner.next_tx_id;
        tx.state = TxState::Unstarted;
        inner.txs.insert(tx.id, tx.clone());
        Ok(tx)
    }

    async fn get_in_progress(&self, address: Address) -> StorageResult<Option<(Tx, Attempt)>> {
        let inner = self.inner.lock().unwrap();

        let in_progress: Vec<_> = inner
            .txs
            .values()
            .filter(|tx| tx.from_address == address && tx.state == TxState::InProgress)
            .cloned()
            .collect();

        let tx = match in_progress.as_slice() {
            [] => return Ok(None),
            [tx] => tx.clone(),
            _ => {
                return Err(StorageError::InvariantViolation(format!(
                    "expected at most one in_progress transaction for {address}, found {}",
                    in_progress.len()
                )));
            }
        };

        let attempts: Vec<_> = inner
            .attempts
            .values()
            .filter(|a| a.tx_id == tx.id)
            .cloned()
            .collect();

        match attempts.as_slice() {
            [attempt] if attempt.state == AttemptState::InProgress => {
                Ok(Some((tx, attempt.clone())))
            }
            _ => Err(StorageError::InvariantViolation(format!(
                "expected in_progress transaction {} to have exactly one unsent attempt; \
                 the database is in an inconsistent state and this sender cannot continue \
                 until the problem is resolved",
                tx.id
            ))),
        }
    }

    async fn next_unstarted(&self, address: Address, chain_id: u64) -> StorageResult<Option<Tx>> {
        let mut inner = self.inner.lock().unwrap();

        let mut candidates: Vec<_> = inner
            .txs
            .values()
            .filter(|tx| {
                tx.from_address == address
                    && tx.chain_id == chain_id
                    && tx.state == TxState::Unstarted
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            (a.value, a.created_at, a.id).cmp(&(b.value, b.created_at, b.id))
        });

        let picked = candidates.into_iter().next();
        if let Some(tx) = &picked {
            if inner.remove_next_picked {
                inner.remove_next_picked = false;
                inner.txs.remove(&tx.id);
            }
        }
        Ok(picked)
    }

    async fn count_unconfirmed(&self, address: Address, chain_id: u64) -> StorageResult<usize> {
        Ok(self.count_in_state(address, chain_id, TxState::Unconfirmed))
    }

    async fn count_unstarted(&self, address: Address, chain_id: u64) -> StorageResult<usize> {
        Ok(self.count_in_state(address, chain_id, TxState::Unstarted))
    }

    async fn persist_in_progress(&self, tx: &mut Tx, attempt: &mut Attempt) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();

        let Some(stored) = inner.txs.get(&tx.id) else {
            return Err(StorageError::TxRemoved);
        };
        if stored.state != TxState::Unstarted {
            return Err(StorageError::InvariantViolation(format!(
                "can only transition to in_progress from unstarted, transaction {} is {}",
                tx.id, stored.state
            )));
        }
        if attempt.state != AttemptState::InProgress {
            return Err(StorageError::InvariantViolation(
                "attempt state must be in_progress".to_string(),
            ));
        }

        inner.next_attempt_id += 1;
        attempt.id = inner.next_attempt_id;
        attempt.tx_id = tx.id;
        inner.attempts.insert(attempt.id, attempt.clone());
        inner.txs.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn persist_broadcast(&self, tx: &mut Tx, attempt: &mut Attempt) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();

        let expected = tx.nonce.ok_or_else(|| {
            StorageError::InvariantViolation(format!("transaction {} has no nonce", tx.id))
        })?;

        match inner.txs.get(&tx.id) {
            Some(stored) if stored.state == TxState::InProgress => {}
            _ => {
                return Err(StorageError::InvariantViolation(format!(
                    "transaction {} is not in_progress",
                    tx.id
                )));
            }
        }

        let counter = inner
            .keys
            .get_mut(&(tx.from_address, tx.chain_id))
            .filter(|n| **n == expected)
            .ok_or_else(|| {
                StorageError::InvariantViolation(
                    "could not increment nonce because no rows matched; either the key is \
                     missing or the nonce has been modified by an external process"
                        .to_string(),
                )
            })?;
        *counter = expected + 1;

        inner.txs.insert(tx.id, tx.clone());
        inner.attempts.insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn persist_fatal(&self, tx: &mut Tx) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();

        match inner.txs.get(&tx.id) {
            Some(stored) if stored.state == TxState::InProgress => {}
            _ => {
                return Err(StorageError::InvariantViolation(format!(
                    "transaction {} is not in_progress",
                    tx.id
                )));
            }
        }

        inner.attempts.retain(|_, a| a.tx_id != tx.id);
        inner.txs.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn persist_replacement_attempt(
        &self,
        old: &Attempt,
        new: &mut Attempt,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();

        match inner.attempts.get(&old.id) {
            Some(stored) if stored.state == AttemptState::InProgress => {}
            _ => {
                return Err(StorageError::InvariantViolation(format!(
                    "attempt {} is not replaceable",
                    old.id
                )));
            }
        }

        inner.attempts.remove(&old.id);
        inner.next_attempt_id += 1;
        new.id = inner.next_attempt_id;
        inner.attempts.insert(new.id, new.clone());
        Ok(())
    }

    async fn next_nonce(&self, address: Address, chain_id: u64) -> StorageResult<i64> {
        self.inner
            .lock()
            .unwrap()
            .keys
            .get(&(address, chain_id))
            .copied()
            .ok_or_else(|| {
                StorageError::InvariantViolation(format!(
                    "no key state row for address {address} on chain {chain_id}"
                ))
            })
    }

    async fn ensure_key_state(&self, address: Address, chain_id: u64) -> StorageResult<()> {
        self.inner
            .lock()
            .unwrap()
            .keys
            .entry((address, chain_id))
            .or_insert(0);
        Ok(())
    }

    async fn fast_forward_nonce(
        &self,
        address: Address,
        chain_id: u64,
        nonce: i64,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let counter = inner.keys.get_mut(&(address, chain_id)).ok_or_else(|| {
            StorageError::InvariantViolation(format!(
                "no key state row for address {address} on chain {chain_id}"
            ))
        })?;
        if *counter < nonce {
            *counter = nonce;
        }
        Ok(())
    }
}

impl InMemoryStorage {
    fn count_in_state(&self, address: Address, chain_id: u64, state: TxState) -> usize {
        self.inner
            .lock()
            .unwrap()
            .txs
            .values()
            .filter(|tx| {
                tx.from_address == address && tx.chain_id == chain_id && tx.state == state
            })
            .count()
    }
}

/// Bus double fed from a plain channel.
pub(crate) struct ChannelSubscriber {
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl ChannelSubscriber {
    pub(crate) fn new() -> (Self, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait::async_trait]
impl bus::Subscriber for ChannelSubscriber {
    async fn subscribe(&self) -> Result<BoxStream<'static, String>> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Other("already subscribed".to_string()))?;

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }
}

pub(crate) enum CallbackResponse {
    Ok,
    NotFound,
    Failure(String),
}

/// Resume-callback double recording every invocation.
pub(crate) struct RecordingCallback {
    pub(crate) calls: Mutex<Vec<(i64, String)>>,
    response: CallbackResponse,
}

impl RecordingCallback {
    pub(crate) fn responding_with(response: CallbackResponse) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            response,
        })
    }
}

#[async_trait::async_trait]
impl ResumeCallback for RecordingCallback {
    async fn resume(
        &self,
        task_run_id: i64,
        error: &str,
    ) -> std::result::Result<(), CallbackError> {
        self.calls
            .lock()
            .unwrap()
            .push((task_run_id, error.to_string()));
        match &self.response {
            CallbackResponse::Ok => Ok(()),
            CallbackResponse::NotFound => Err(CallbackError::NotFound),
            CallbackResponse::Failure(e) => Err(CallbackError::Other(e.clone())),
        }
    }
}

pub(crate) struct RefusingChecker(pub(crate) String);

#[async_trait::async_trait]
impl TransmitChecker for RefusingChecker {
    async fn check(&self, _tx: &Tx, _attempt: &Attempt) -> Result<()> {
        Err(Error::Other(self.0.clone()))
    }
}

pub(crate) struct RefusingCheckerFactory(pub(crate) String);

impl TransmitCheckerFactory for RefusingCheckerFactory {
    fn build(&self, _spec: &CheckerSpec) -> Result<Box<dyn TransmitChecker>> {
        Ok(Box::new(RefusingChecker(self.0.clone())))
    }
}

pub(crate) struct HangingChecker;

#[async_trait::async_trait]
impl TransmitChecker for HangingChecker {
    async fn check(&self, _tx: &Tx, _attempt: &Attempt) -> Result<()> {
        futures::future::pending().await
    }
}

pub(crate) struct HangingCheckerFactory;

impl TransmitCheckerFactory for HangingCheckerFactory {
    fn build(&self, _spec: &CheckerSpec) -> Result<Box<dyn TransmitChecker>> {
        Ok(Box::new(HangingChecker))
    }
}
