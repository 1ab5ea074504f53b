use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::{StreamExt, stream::BoxStream};
use metrics::{
    RegistersMetrics,
    prometheus::{IntCounter, Opts, core::Collector},
};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::port::{
    Clock, bus,
    callback::{CallbackError, ResumeCallback},
    checker::TransmitCheckerFactory,
    fees, node, signer,
    storage::{self, Storage},
};
use crate::{
    Error, Result, state,
    types::{
        Address, Attempt, AttemptState, ChainVariant, DateTime, Fee, SendError, Tx, TxState,
        TxType, Utc,
    },
    util::with_jitter,
};

/// How often a throttled worker rechecks the unconfirmed queue.
pub const IN_FLIGHT_RECHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum time spent on the transmit check before sending anyway.
pub const TRANSMIT_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct Config {
    pub chain_id: u64,
    pub chain_variant: ChainVariant,
    /// 0 disables throttling.
    pub max_in_flight_per_sender: u32,
    /// Applied with jitter; triggers usually wake workers much earlier.
    pub fallback_poll_interval: Duration,
    pub dynamic_fees_enabled: bool,
    /// Ceiling for fee bumps, in wei.
    pub max_gas_price: u128,
    /// Diagnostic only; surfaced in bump logs.
    pub default_gas_price: u128,
    pub nonce_auto_sync: bool,
}

/// Drains the queue of unstarted transactions, one worker per sender.
///
/// Each worker assigns nonces in strictly increasing, gap-free order and
/// materialises at most one in-flight attempt for its sender. This holds
/// only because the supervisor spawns exactly one worker per sender and
/// nothing else in the process writes these rows; running two processes
/// against the same sender is undefined behaviour.
///
/// Broadcasting does not guarantee inclusion. The downstream confirmer
/// watches the chain, bumps fees and captures receipts; this service
/// only guarantees that every transaction leaves `unstarted` towards
/// `unconfirmed` or `fatal_error` with a durable attempt row.
pub struct Broadcaster<Db, Node, Est, Sig, C> {
    storage: Db,
    node: Node,
    estimator: Est,
    signer: Sig,
    clock: C,
    checker_factory: Arc<dyn TransmitCheckerFactory>,
    resume_callback: Option<Arc<dyn ResumeCallback>>,
    subscriber: Arc<dyn bus::Subscriber>,
    senders: Vec<Address>,
    config: Config,
    metrics: Metrics,
    cancel_token: CancellationToken,
    triggers: HashMap<Address, mpsc::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl<Db, Node, Est, Sig, C> Broadcaster<Db, Node, Est, Sig, C>
where
    Db: Storage + Clone + 'static,
    Node: node::Api + Clone + 'static,
    Est: fees::Estimator + Clone + 'static,
    Sig: signer::Api + Clone + 'static,
    C: Clock + Clone + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Db,
        node: Node,
        estimator: Est,
        signer: Sig,
        clock: C,
        checker_factory: Arc<dyn TransmitCheckerFactory>,
        resume_callback: Option<Arc<dyn ResumeCallback>>,
        subscriber: Arc<dyn bus::Subscriber>,
        senders: Vec<Address>,
        config: Config,
    ) -> Self {
        Self {
            storage,
            node,
            estimator,
            signer,
            clock,
            checker_factory,
            resume_callback,
            subscriber,
            senders,
            config,
            metrics: Metrics::default(),
            cancel_token: CancellationToken::new(),
            triggers: HashMap::new(),
            handles: Vec::new(),
        }
    }

    /// Subscribes to insert notifications, optionally syncs nonces
    /// against the chain, and spawns one worker per sender plus the
    /// trigger fan-out task.
    pub async fn start(&mut self) -> Result<()> {
        let events = self.subscriber.subscribe().await?;

        if self.config.nonce_auto_sync {
            let syncer = crate::nonce_syncer::NonceSyncer::new(
                self.storage.clone(),
                self.node.clone(),
            );
            syncer
                .sync_all(&self.senders, self.config.chain_id)
                .await
                .map_err(|e| Error::Other(format!("failed to sync with on-chain nonces: {e}")))?;
        }

        for sender in self.senders.clone() {
            let (trigger_tx, trigger_rx) = mpsc::channel(1);
            self.triggers.insert(sender, trigger_tx);

            let worker = SenderWorker {
                address: sender,
                storage: self.storage.clone(),
                node: self.node.clone(),
                estimator: self.estimator.clone(),
                signer: self.signer.clone(),
                clock: self.clock.clone(),
                checker_factory: Arc::clone(&self.checker_factory),
                resume_callback: self.resume_callback.clone(),
                config: self.config.clone(),
                metrics: self.metrics.clone(),
                cancel: self.cancel_token.child_token(),
            };
            self.handles.push(tokio::spawn(worker.run(trigger_rx)));
        }

        let triggers = self.triggers.clone();
        let cancel = self.cancel_token.child_token();
        self.handles
            .push(tokio::spawn(route_insert_events(events, triggers, cancel)));

        Ok(())
    }

    /// Forces the worker for `address` to rescan the queue before its
    /// next poll. Signals coalesce; an unknown address is ignored.
    pub fn trigger(&self, address: Address) {
        if let Some(trigger) = self.triggers.get(&address) {
            let _ = trigger.try_send(());
        }
    }

    pub async fn shut_down(self) {
        self.cancel_token.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

impl<Db, Node, Est, Sig, C> RegistersMetrics for Broadcaster<Db, Node, Est, Sig, C> {
    fn metrics(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.metrics.txs_broadcast.clone()),
            Box::new(self.metrics.txs_fatally_errored.clone()),
        ]
    }
}

#[derive(Clone)]
struct Metrics {
    txs_broadcast: IntCounter,
    txs_fatally_errored: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        let txs_broadcast = IntCounter::with_opts(Opts::new(
            "txs_broadcast",
            "Number of transactions handed to the remote node and recorded as broadcast.",
        ))
        .expect("txs_broadcast metric to be correctly configured");

        let txs_fatally_errored = IntCounter::with_opts(Opts::new(
            "txs_fatally_errored",
            "Number of transactions that terminated in fatal_error.",
        ))
        .expect("txs_fatally_errored metric to be correctly configured");

        Self {
            txs_broadcast,
            txs_fatally_errored,
        }
    }
}

async fn route_insert_events(
    mut events: BoxStream<'static, String>,
    triggers: HashMap<Address, mpsc::Sender<()>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.next() => {
                let Some(payload) = event else {
                    debug!("insert-notification stream closed, exiting trigger loop");
                    return;
                };
                let Some(address) = parse_hex_address(&payload) else {
                    warn!(%payload, "could not parse insert-notification payload");
                    continue;
                };
                match triggers.get(&address) {
                    // a full channel means a rescan is already owed
                    Some(trigger) => {
                        let _ = trigger.try_send(());
                    }
                    None => warn!(%address, "insert notification for unknown sender"),
                }
            }
        }
    }
}

fn parse_hex_address(payload: &str) -> Option<Address> {
    let trimmed = payload.trim();
    let stripped = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(stripped).ok()?;
    (bytes.len() == Address::len_bytes()).then(|| Address::from_slice(&bytes))
}

/// The only writer for its sender's rows. MUST NOT run concurrently for
/// the same address: that would produce nonce gaps or duplicates.
struct SenderWorker<Db, Node, Est, Sig, C> {
    address: Address,
    storage: Db,
    node: Node,
    estimator: Est,
    signer: Sig,
    clock: C,
    checker_factory: Arc<dyn TransmitCheckerFactory>,
    resume_callback: Option<Arc<dyn ResumeCallback>>,
    config: Config,
    metrics: Metrics,
    cancel: CancellationToken,
}

impl<Db, Node, Est, Sig, C> SenderWorker<Db, Node, Est, Sig, C>
where
    Db: Storage,
    Node: node::Api,
    Est: fees::Estimator,
    Sig: signer::Api,
    C: Clock,
{
    async fn run(self, mut trigger: mpsc::Receiver<()>) {
        loop {
            if let Err(e) = self.process_unstarted().await {
                match &e {
                    Error::InvariantViolation(_) => {
                        error!(address = %self.address, "{e}; operator action required")
                    }
                    _ => error!(address = %self.address, "error in process_unstarted: {e}"),
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                signal = trigger.recv() => {
                    // a transaction was inserted; rescan immediately
                    if signal.is_none() {
                        self.cancel.cancelled().await;
                        break;
                    }
                }
                _ = tokio::time::sleep(with_jitter(self.config.fallback_poll_interval)) => {}
            }
        }

        info!(address = %self.address, "sender worker stopped");
    }

    /// Finishes any transaction left `in_progress` by a previous run,
    /// then keeps picking up unstarted transactions until none remain.
    async fn process_unstarted(&self) -> Result<()> {
        let mut processed = 0u32;

        self.handle_any_in_progress().await?;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let max_in_flight = self.config.max_in_flight_per_sender;
            if max_in_flight > 0 {
                let unconfirmed = self
                    .storage
                    .count_unconfirmed(self.address, self.config.chain_id)
                    .await?;
                if unconfirmed >= max_in_flight as usize {
                    let unstarted = self
                        .storage
                        .count_unstarted(self.address, self.config.chain_id)
                        .await?;
                    warn!(
                        address = %self.address,
                        unconfirmed,
                        unstarted,
                        max_in_flight,
                        "transaction throttling; waiting for in-flight transactions to be confirmed"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(IN_FLIGHT_RECHECK_INTERVAL) => continue,
                    }
                }
            }

            let Some(mut tx) = self.next_unstarted_with_nonce().await? else {
                if processed > 0 {
                    debug!(address = %self.address, processed, "finished processing unstarted transactions");
                }
                return Ok(());
            };
            processed += 1;

            let mut attempt = if self.config.dynamic_fees_enabled {
                let estimate = self.estimator.dynamic(tx.gas_limit).await?;
                self.new_dynamic_fee_attempt(&tx, estimate.fee.tip_cap, estimate.fee.fee_cap, estimate.gas_limit)
                    .await?
            } else {
                let estimate = self
                    .estimator
                    .legacy(&tx.encoded_payload, tx.gas_limit, false)
                    .await?;
                self.new_legacy_attempt(&tx, estimate.gas_price, estimate.gas_limit)
                    .await?
            };

            state::tx_transition(&tx, TxState::InProgress)?;
            tx.state = TxState::InProgress;
            match self.storage.persist_in_progress(&mut tx, &mut attempt).await {
                Err(storage::Error::TxRemoved) => {
                    debug!(tx_id = tx.id, subject = ?tx.subject, "transaction removed while queued, skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
                Ok(()) => {}
            }

            self.handle_in_progress(tx, attempt, self.clock.now())
                .await?;
        }
    }

    /// There can be at most one in-progress transaction per sender,
    /// left over when the previous run died mid-cycle. It may or may
    /// not have reached a node; resubmission is safe either way.
    async fn handle_any_in_progress(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        if let Some((tx, attempt)) = self.storage.get_in_progress(self.address).await? {
            let initial_broadcast_at = tx.initial_broadcast_at.unwrap_or(tx.created_at);
            self.handle_in_progress(tx, attempt, initial_broadcast_at)
                .await?;
        }

        Ok(())
    }

    /// Submits the in-progress attempt and durably records the outcome.
    ///
    /// Fee retries loop here with a replacement attempt; the reference
    /// time is carried through so `initial_broadcast_at` records the
    /// first submission, not the last.
    async fn handle_in_progress(
        &self,
        mut tx: Tx,
        mut attempt: Attempt,
        initial_broadcast_at: DateTime<Utc>,
    ) -> Result<()> {
        loop {
            if tx.state != TxState::InProgress {
                return Err(Error::InvariantViolation(format!(
                    "expected transaction {} to be in_progress, it was {}",
                    tx.id, tx.state
                )));
            }

            let checker = self.checker_factory.build(&tx.checker_spec)?;
            match timeout(TRANSMIT_CHECK_TIMEOUT, checker.check(&tx, &attempt)).await {
                Err(_) => warn!(tx_id = tx.id, "transmit checker timed out, sending anyway"),
                Ok(Err(refusal)) => {
                    warn!(tx_id = tx.id, %refusal, "transmit checker failed, fatally erroring transaction");
                    tx.error = Some(refusal.to_string());
                    return self.save_fatally_errored(tx).await;
                }
                Ok(Ok(())) => {}
            }

            let send_error = self.node.send_transaction(&tx, &attempt).await.err();

            if let Some(err) = &send_error {
                if err.is_too_expensive() {
                    error!(
                        tx_id = tx.id,
                        %err,
                        "transaction fee exceeds the node's configured cap; this is a configuration error"
                    );
                    tx.error = Some(err.to_string());
                    return self.save_fatally_errored(tx).await;
                }
                if err.is_fatal() {
                    error!(tx_id = tx.id, %err, "fatal error sending transaction");
                    tx.error = Some(err.to_string());
                    return self.save_fatally_errored(tx).await;
                }
            }

            tx.broadcast_at = Some(initial_broadcast_at);
            if tx.initial_broadcast_at.is_none() {
                tx.initial_broadcast_at = Some(initial_broadcast_at);
            }

            // Nonce already occupied: a previous run of ours, an external
            // wallet, a node retrying an earlier call, or a sendonly peer
            // got there first. Recording the attempt as broadcast and
            // letting the confirmer resolve the final disposition is
            // correct in every one of those cases; re-assigning the nonce
            // never is.
            let send_error = send_error.filter(|err| {
                if err.assume_success() {
                    debug!(tx_id = tx.id, %err, "nonce already used, assuming success");
                }
                !err.assume_success()
            });

            if let Some(err) = send_error {
                if err.is_terminally_underpriced() {
                    error!(
                        tx_id = tx.id,
                        %err,
                        gas_price = ?attempt.gas_price,
                        gas_tip_cap = ?attempt.gas_tip_cap,
                        gas_fee_cap = ?attempt.gas_fee_cap,
                        max_gas_price = self.config.max_gas_price,
                        default_gas_price = self.config.default_gas_price,
                        "attempt was rejected by the node for being underpriced; will bump and retry. \
                         ACTION REQUIRED: this is a configuration error, consider raising the default gas price"
                    );
                    attempt = self.bumped_replacement(&tx, attempt).await?;
                    continue;
                }

                if err.is_optimism_fee_too_low() || err.is_optimism_fee_too_high() {
                    if self.config.chain_variant.is_optimism_clone() {
                        attempt = self.reestimated_replacement(&tx, attempt, &err).await?;
                        continue;
                    }
                    return Err(Error::Other(format!(
                        "error type only handled for Optimism and clones: {err}"
                    )));
                }

                if err.is_temporarily_underpriced() {
                    // Mempool admission failed for now; assume success and
                    // let the confirmer bump until it gets in.
                    info!(tx_id = tx.id, %err, "transaction temporarily underpriced");
                } else if err.is_insufficient_funds() {
                    error!(
                        address = %tx.from_address,
                        attempt_hash = %attempt.hash,
                        tx_type = attempt.tx_type.as_u8(),
                        %err,
                        "transaction rejected due to insufficient funds. \
                         ACTION REQUIRED: the wallet is out of funds; progress for this sender is blocked until it is topped up"
                    );
                    return Err(Error::InsufficientFunds(err.to_string()));
                } else {
                    // Transient or operator-resolvable; bail out and let
                    // the next poll retry.
                    return Err(Error::Network(format!(
                        "error while sending transaction {}: {err}",
                        tx.id
                    )));
                }
            }

            state::tx_transition(&tx, TxState::Unconfirmed)?;
            state::attempt_transition(&attempt, AttemptState::Broadcast)?;
            tx.state = TxState::Unconfirmed;
            tx.error = None;
            attempt.state = AttemptState::Broadcast;
            self.storage.persist_broadcast(&mut tx, &mut attempt).await?;
            self.metrics.txs_broadcast.inc();
            info!(
                tx_id = tx.id,
                nonce = tx.nonce,
                hash = %attempt.hash,
                "transaction broadcast"
            );
            return Ok(());
        }
    }

    /// Picks the next queued transaction and stamps it with the current
    /// counter value. The counter is only incremented once the attempt
    /// is durably recorded as broadcast.
    async fn next_unstarted_with_nonce(&self) -> Result<Option<Tx>> {
        let Some(mut tx) = self
            .storage
            .next_unstarted(self.address, self.config.chain_id)
            .await?
        else {
            return Ok(None);
        };

        let nonce = self
            .storage
            .next_nonce(self.address, self.config.chain_id)
            .await?;
        tx.nonce = Some(nonce);
        Ok(Some(tx))
    }

    async fn new_legacy_attempt(
        &self,
        tx: &Tx,
        gas_price: u128,
        gas_limit: u64,
    ) -> Result<Attempt> {
        let nonce = assigned_nonce(tx)?;
        let signed = self
            .signer
            .sign_attempt(tx, nonce, Fee::Legacy { gas_price }, gas_limit)
            .await?;

        Ok(Attempt {
            id: 0,
            tx_id: tx.id,
            state: AttemptState::InProgress,
            hash: signed.hash,
            tx_type: TxType::Legacy,
            signed_payload: signed.payload,
            gas_price: Some(gas_price),
            gas_tip_cap: None,
            gas_fee_cap: None,
        })
    }

    async fn new_dynamic_fee_attempt(
        &self,
        tx: &Tx,
        tip_cap: u128,
        fee_cap: u128,
        gas_limit: u64,
    ) -> Result<Attempt> {
        let nonce = assigned_nonce(tx)?;
        let fee = crate::types::DynamicFee { tip_cap, fee_cap };
        let signed = self
            .signer
            .sign_attempt(tx, nonce, Fee::Dynamic(fee), gas_limit)
            .await?;

        Ok(Attempt {
            id: 0,
            tx_id: tx.id,
            state: AttemptState::InProgress,
            hash: signed.hash,
            tx_type: TxType::DynamicFee,
            signed_payload: signed.payload,
            gas_price: None,
            gas_tip_cap: Some(tip_cap),
            gas_fee_cap: Some(fee_cap),
        })
    }

    /// Builds, persists and returns a higher-fee replacement for an
    /// attempt the node rejected as underpriced.
    async fn bumped_replacement(&self, tx: &Tx, attempt: Attempt) -> Result<Attempt> {
        let mut replacement = match attempt.tx_type {
            TxType::Legacy => {
                let previous = attempt.gas_price.ok_or_else(|| {
                    Error::InvariantViolation(format!(
                        "legacy attempt {} is missing its gas price",
                        attempt.id
                    ))
                })?;
                let bumped = self.estimator.bump_legacy(previous, tx.gas_limit).await?;
                if bumped.gas_price == previous || bumped.gas_price >= self.config.max_gas_price {
                    return Err(Error::Other(
                        "hit the gas price bump ceiling, will not bump further; this is a terminal error"
                            .to_string(),
                    ));
                }
                debug!(
                    tx_id = tx.id,
                    old_gas_price = previous,
                    new_gas_price = bumped.gas_price,
                    "bumped legacy gas on initial send"
                );
                self.new_legacy_attempt(tx, bumped.gas_price, bumped.gas_limit)
                    .await?
            }
            TxType::DynamicFee => {
                let previous = attempt.dynamic_fee().ok_or_else(|| {
                    Error::InvariantViolation(format!(
                        "dynamic-fee attempt {} is missing its fee caps",
                        attempt.id
                    ))
                })?;
                let bumped = self.estimator.bump_dynamic(previous, tx.gas_limit).await?;
                let fee = bumped.fee;
                // neither the tip cap nor the fee cap may stall or reach
                // the configured ceiling
                if fee.tip_cap == previous.tip_cap
                    || fee.fee_cap == previous.fee_cap
                    || fee.tip_cap >= self.config.max_gas_price
                    || fee.fee_cap >= self.config.max_gas_price
                {
                    return Err(Error::Other(
                        "hit the gas price bump ceiling, will not bump further; this is a terminal error"
                            .to_string(),
                    ));
                }
                debug!(
                    tx_id = tx.id,
                    old_tip_cap = previous.tip_cap,
                    old_fee_cap = previous.fee_cap,
                    new_tip_cap = fee.tip_cap,
                    new_fee_cap = fee.fee_cap,
                    "bumped dynamic fee on initial send"
                );
                self.new_dynamic_fee_attempt(tx, fee.tip_cap, fee.fee_cap, bumped.gas_limit)
                    .await?
            }
        };

        state::attempt_deletion(&attempt)?;
        self.storage
            .persist_replacement_attempt(&attempt, &mut replacement)
            .await?;
        Ok(replacement)
    }

    /// Optimism-family nodes quote an exact legacy gas price; re-estimate
    /// with a forced refetch instead of bumping blindly.
    async fn reestimated_replacement(
        &self,
        tx: &Tx,
        attempt: Attempt,
        err: &SendError,
    ) -> Result<Attempt> {
        if attempt.tx_type == TxType::DynamicFee {
            return Err(Error::InvariantViolation(format!(
                "re-estimation is not supported for EIP-1559 attempts; node returned: {err}"
            )));
        }

        let estimate = self
            .estimator
            .legacy(&tx.encoded_payload, tx.gas_limit, true)
            .await?;
        warn!(
            tx_id = tx.id,
            %err,
            new_gas_price = estimate.gas_price,
            new_gas_limit = estimate.gas_limit,
            "node rejected transaction due to incorrect fee, re-estimated and will try again"
        );

        let mut replacement = self
            .new_legacy_attempt(tx, estimate.gas_price, estimate.gas_limit)
            .await?;
        state::attempt_deletion(&attempt)?;
        self.storage
            .persist_replacement_attempt(&attempt, &mut replacement)
            .await?;
        Ok(replacement)
    }

    /// The resume notification deliberately runs outside the database
    /// transaction, and before it. Losing the row update after a
    /// delivered notification leaves a benign inconsistency; the
    /// reverse order would double-resume after a crash.
    async fn save_fatally_errored(&self, mut tx: Tx) -> Result<()> {
        state::tx_transition(&tx, TxState::FatalError)?;

        let Some(error) = tx.error.clone() else {
            return Err(Error::InvariantViolation(format!(
                "expected the error field of transaction {} to be set",
                tx.id
            )));
        };

        if let (Some(task_run_id), Some(callback)) =
            (tx.pipeline_task_run_id, self.resume_callback.as_ref())
        {
            let message = format!("fatal error while sending transaction: {error}");
            match callback.resume(task_run_id, &message).await {
                Err(CallbackError::NotFound) => {
                    debug!(tx_id = tx.id, "resume callback missing or already resumed")
                }
                Err(CallbackError::Other(e)) => {
                    return Err(Error::Other(format!("failed to resume pipeline: {e}")));
                }
                Ok(()) => {}
            }
        }

        tx.state = TxState::FatalError;
        tx.nonce = None;
        tx.broadcast_at = None;
        tx.initial_broadcast_at = None;
        self.storage.persist_fatal(&mut tx).await?;
        self.metrics.txs_fatally_errored.inc();
        Ok(())
    }
}

fn assigned_nonce(tx: &Tx) -> Result<i64> {
    tx.nonce.ok_or_else(|| {
        Error::InvariantViolation(format!("transaction {} has no nonce assigned", tx.id))
    })
}
