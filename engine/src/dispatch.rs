//! Dispatch Scheduler
//!
//! Runs logical sends through a bounded attempt loop and sequences batches
//! of sends under one process-wide concurrency limiter:
//! 1. Nonce comes from the request or the allocator
//! 2. Gas price is fixed or quoted, escalated on underpriced rejections
//! 3. Each attempt holds one limiter permit for submit + confirmation wait
//! 4. Failures are classified and retried per the retry policy
//! 5. Terminal outcomes feed the stats and the optional journal channel

use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::{Address, TxHash, U256};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::account::Account;
use crate::client::ChainClient;
use crate::consts::{
    BATCH_SIZE, CONFIRMATION_TIMEOUT_MS, INTER_BATCH_DELAY_MS, LANDED_CHECK_TIMEOUT_MS,
    MAX_CONCURRENT_SENDS, MAX_FUNDING_CONFIRMATIONS,
};
use crate::error::{ChainError, DispatchError};
use crate::gas::GasPricer;
use crate::nonce::NonceAllocator;
use crate::retry::{classify, is_already_known, ErrorKind, RetryDecision, RetryPolicy};
use crate::signer::sign_transfer;
use crate::stats::DispatchStats;
use crate::types::{Batch, DispatchOutcome, DispatchReport, Purpose, Receipt, SendFailure, SendRequest};

/// How the gas price of a send is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasMode {
    /// Node price plus premium, fallback on failure
    Market,
    Fixed(u128),
}

/// How many confirmations an attempt waits for. 0 means submit-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationDepth {
    Fixed(u64),
    /// `min(retry + 1, max)`: deeper waits on later attempts
    Escalating { max: u64 },
}

impl ConfirmationDepth {
    pub fn for_retry(&self, retry: u32) -> u64 {
        match *self {
            ConfirmationDepth::Fixed(depth) => depth,
            ConfirmationDepth::Escalating { max } => (retry as u64 + 1).min(max),
        }
    }
}

/// Batch sequencing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchPolicy {
    /// Batch N+1 starts after batch N resolves
    #[default]
    Sequential,
    /// Up to `max_in_flight` batches at once, all under the same limiter
    BoundedParallel { max_in_flight: usize },
}

/// Per-call send settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub purpose: Purpose,
    pub gas: GasMode,
    pub confirmations: ConfirmationDepth,
    /// Overrides the dispatcher's default retry policy
    pub policy: Option<RetryPolicy>,
}

impl SendOptions {
    pub fn new(purpose: Purpose) -> Self {
        Self {
            purpose,
            gas: GasMode::Market,
            confirmations: ConfirmationDepth::Fixed(1),
            policy: None,
        }
    }

    /// Funding out of the source: elevated fixed gas, deepening confirmations,
    /// linear backoff
    pub fn funding(gas_price: u128) -> Self {
        Self {
            purpose: Purpose::Funding,
            gas: GasMode::Fixed(gas_price),
            confirmations: ConfirmationDepth::Escalating {
                max: MAX_FUNDING_CONFIRMATIONS,
            },
            policy: Some(RetryPolicy::funding()),
        }
    }

    pub fn with_gas(mut self, gas: GasMode) -> Self {
        self.gas = gas;
        self
    }

    pub fn with_confirmations(mut self, confirmations: ConfirmationDepth) -> Self {
        self.confirmations = confirmations;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Process-wide in-flight submission limit
    pub max_concurrent: usize,
    pub batch_size: usize,
    pub inter_batch_delay: Duration,
    pub confirm_timeout: Duration,
    /// Ceiling applied after quoting and escalation
    pub max_gas_price: Option<u128>,
    pub retry: RetryPolicy,
    pub pricer: GasPricer,
    pub batch_policy: BatchPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: MAX_CONCURRENT_SENDS,
            batch_size: BATCH_SIZE,
            inter_batch_delay: Duration::from_millis(INTER_BATCH_DELAY_MS),
            confirm_timeout: Duration::from_millis(CONFIRMATION_TIMEOUT_MS),
            max_gas_price: None,
            retry: RetryPolicy::default(),
            pricer: GasPricer::default(),
            batch_policy: BatchPolicy::Sequential,
        }
    }
}

/// Mutable state carried across the attempts of one logical send
#[derive(Debug, Default)]
struct AttemptState {
    attempt: u32,
    nonce: Option<u64>,
    /// Nonce came from the allocator inside this send
    owns_nonce: bool,
    gas_price: Option<u128>,
    escalate: bool,
    tx_hash: Option<TxHash>,
    /// Every hash that may have reached the node, oldest first
    broadcast: Vec<TxHash>,
}

impl AttemptState {
    fn record_broadcast(&mut self, hash: TxHash) {
        self.tx_hash = Some(hash);
        if !self.broadcast.contains(&hash) {
            self.broadcast.push(hash);
        }
    }
}

#[derive(Debug)]
struct AttemptFailure {
    error: ChainError,
    /// Transaction may have reached the node, so its nonce must not be released
    broadcast: bool,
    /// Skip the retry policy entirely
    abort: bool,
}

impl AttemptFailure {
    fn local(error: ChainError) -> Self {
        Self {
            error,
            broadcast: false,
            abort: false,
        }
    }

    fn broadcast(error: ChainError) -> Self {
        Self {
            error,
            broadcast: true,
            abort: false,
        }
    }
}

pub struct Dispatcher {
    client: Arc<dyn ChainClient>,
    nonces: Arc<NonceAllocator>,
    limiter: Arc<Semaphore>,
    chain_id: u64,
    config: DispatcherConfig,
    stats: Arc<DispatchStats>,
    journal: Option<mpsc::Sender<DispatchOutcome>>,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn ChainClient>, chain_id: u64, config: DispatcherConfig) -> Self {
        Self {
            nonces: Arc::new(NonceAllocator::new(client.clone())),
            limiter: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            client,
            chain_id,
            config,
            stats: Arc::new(DispatchStats::new()),
            journal: None,
        }
    }

    /// Build a dispatcher for whatever chain the client is connected to
    pub async fn connect(
        client: Arc<dyn ChainClient>,
        config: DispatcherConfig,
    ) -> Result<Self, ChainError> {
        let chain_id = client.chain_id().await?;
        info!("[Dispatch] Connected to chain {}", chain_id);
        Ok(Self::new(client, chain_id, config))
    }

    /// Forward every terminal outcome to `journal`
    pub fn with_journal(mut self, journal: mpsc::Sender<DispatchOutcome>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn client(&self) -> &Arc<dyn ChainClient> {
        &self.client
    }

    pub fn nonces(&self) -> &Arc<NonceAllocator> {
        &self.nonces
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Close the limiter; later batches fail fast and pending sends give up
    pub fn close(&self) {
        warn!("[Dispatch] Closing concurrency limiter");
        self.limiter.close();
    }

    pub fn is_closed(&self) -> bool {
        self.limiter.is_closed()
    }

    /// Split `requests` into batches of `batch_size`, assigning nonces by
    /// increment from `start_nonce` in request order
    pub fn prepare_batches(
        requests: Vec<SendRequest>,
        start_nonce: u64,
        batch_size: usize,
    ) -> Vec<Batch> {
        let size = batch_size.max(1);
        let mut batches: Vec<Batch> = Vec::with_capacity(requests.len().div_ceil(size));

        for (i, request) in requests.into_iter().enumerate() {
            let nonce = start_nonce + i as u64;
            if i % size == 0 {
                batches.push(Batch {
                    index: i / size,
                    start_nonce: nonce,
                    requests: Vec::with_capacity(size),
                });
            }
            if let Some(batch) = batches.last_mut() {
                batch.requests.push(request.with_nonce(nonce));
            }
        }

        batches
    }

    /// Run one logical send to a terminal outcome
    pub async fn send(&self, request: SendRequest, options: &SendOptions) -> DispatchOutcome {
        let started = Instant::now();
        self.stats.increment(&self.stats.sends_started);

        let policy = options.policy.unwrap_or(self.config.retry);
        let sender = request.sender_address();
        let mut state = AttemptState {
            nonce: request.nonce,
            ..Default::default()
        };

        let result: Result<Option<Receipt>, SendFailure> = loop {
            state.attempt += 1;
            let retries = state.attempt - 1;
            self.stats.increment(&self.stats.attempts);

            let failure = match self.attempt(&request, options, &mut state, retries).await {
                Ok(receipt) => break Ok(receipt),
                Err(failure) => failure,
            };

            // An earlier broadcast may have been mined while we waited
            if !state.broadcast.is_empty() && classify(&failure.error) == ErrorKind::NonceConflict {
                if let Some(receipt) = self.landed_receipt(&state.broadcast).await {
                    info!(
                        "[Dispatch] {} {} nonce {:?} already landed as {} in block {}",
                        options.purpose, sender, state.nonce, receipt.tx_hash, receipt.block_number
                    );
                    state.tx_hash = Some(receipt.tx_hash);
                    if receipt.success {
                        break Ok(Some(receipt));
                    }
                    break Err(SendFailure {
                        kind: ErrorKind::Reverted,
                        error: ChainError::Reverted(format!(
                            "{} in block {}",
                            receipt.tx_hash, receipt.block_number
                        )),
                    });
                }
            }

            let decision = if failure.abort {
                RetryDecision::GiveUp {
                    kind: classify(&failure.error),
                }
            } else {
                policy.decide(&failure.error, retries)
            };

            match decision {
                RetryDecision::Retry { kind, delay } => {
                    warn!(
                        "[Dispatch] {} {} -> {} nonce {:?} attempt {} failed ({}): {} | retry in {}ms",
                        options.purpose,
                        sender,
                        request.recipient,
                        state.nonce,
                        state.attempt,
                        kind.as_str(),
                        failure.error,
                        delay.as_millis()
                    );
                    match kind {
                        ErrorKind::Underpriced => state.escalate = true,
                        ErrorKind::NonceConflict => {
                            self.stats.increment(&self.stats.nonce_resyncs);
                            if let Err(e) = self.nonces.refresh(sender).await {
                                warn!("[Dispatch] Nonce refresh failed for {}: {}", sender, e);
                            }
                            state.nonce = None;
                            state.owns_nonce = false;
                            state.broadcast.clear();
                        }
                        _ => {}
                    }
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp { kind } => {
                    if !failure.broadcast && state.owns_nonce {
                        if let Some(nonce) = state.nonce {
                            self.nonces.release(sender, nonce).await;
                        }
                    }
                    break Err(SendFailure {
                        kind,
                        error: failure.error,
                    });
                }
            }
        };

        let (receipt, error) = match result {
            Ok(receipt) => (receipt, None),
            Err(failure) => (None, Some(failure)),
        };

        let outcome = DispatchOutcome {
            purpose: options.purpose,
            sender,
            recipient: request.recipient,
            value: request.value,
            nonce: state.nonce,
            tx_hash: state.tx_hash,
            receipt,
            error,
            attempts: state.attempt,
            gas_price: state.gas_price.unwrap_or_default(),
        };

        match &outcome.error {
            None => debug!(
                "[Dispatch] {} {} -> {} ok | nonce {:?} | tx {:?} | {} attempt(s)",
                outcome.purpose, sender, outcome.recipient, outcome.nonce, outcome.tx_hash, outcome.attempts
            ),
            Some(failure) => warn!(
                "[Dispatch] {} {} -> {} failed after {} attempt(s): {}",
                outcome.purpose, sender, outcome.recipient, outcome.attempts, failure
            ),
        }

        self.stats.record_outcome(&outcome, started.elapsed());
        self.record(&outcome);
        outcome
    }

    async fn attempt(
        &self,
        request: &SendRequest,
        options: &SendOptions,
        state: &mut AttemptState,
        retries: u32,
    ) -> Result<Option<Receipt>, AttemptFailure> {
        let sender = request.sender_address();

        let nonce = match state.nonce {
            Some(nonce) => nonce,
            None => {
                let nonce = self
                    .nonces
                    .allocate(sender)
                    .await
                    .map_err(AttemptFailure::local)?;
                state.nonce = Some(nonce);
                state.owns_nonce = true;
                nonce
            }
        };

        let gas_price = self.gas_price_for(options, state).await;

        let signed = sign_transfer(
            &request.sender,
            request.recipient,
            request.value,
            nonce,
            gas_price,
            self.chain_id,
        )
        .map_err(AttemptFailure::local)?;

        let _permit = self.limiter.acquire().await.map_err(|_| AttemptFailure {
            error: ChainError::Cancelled(DispatchError::LimiterClosed.to_string()),
            broadcast: false,
            abort: true,
        })?;

        debug!(
            "[Dispatch] Submitting {} | nonce {} | gas {} | attempt {}",
            signed.hash, nonce, gas_price, state.attempt
        );

        let tx_hash = match self.client.submit(&signed).await {
            Ok(hash) => hash,
            Err(e) if is_already_known(&e) => signed.hash,
            Err(e) => {
                // A network failure leaves it unknown whether the node got the tx
                let broadcast = matches!(e, ChainError::Network(_));
                if broadcast {
                    state.record_broadcast(signed.hash);
                }
                return Err(AttemptFailure {
                    error: e,
                    broadcast,
                    abort: false,
                });
            }
        };
        state.record_broadcast(tx_hash);

        let depth = options.confirmations.for_retry(retries);
        if depth == 0 {
            return Ok(None);
        }

        let receipt = self
            .client
            .wait_confirmed(tx_hash, depth, self.config.confirm_timeout)
            .await
            .map_err(AttemptFailure::broadcast)?;

        if !receipt.success {
            return Err(AttemptFailure::broadcast(ChainError::Reverted(format!(
                "{} in block {}",
                tx_hash, receipt.block_number
            ))));
        }

        Ok(Some(receipt))
    }

    /// Receipt of the most recent of `hashes` that made it into a block
    async fn landed_receipt(&self, hashes: &[TxHash]) -> Option<Receipt> {
        let timeout = Duration::from_millis(LANDED_CHECK_TIMEOUT_MS);
        for hash in hashes.iter().rev() {
            match self.client.wait_confirmed(*hash, 1, timeout).await {
                Ok(receipt) => return Some(receipt),
                Err(e) => debug!("[Dispatch] {} not found on chain: {}", hash, e),
            }
        }
        None
    }

    async fn gas_price_for(&self, options: &SendOptions, state: &mut AttemptState) -> u128 {
        let price = match state.gas_price {
            None => match options.gas {
                GasMode::Fixed(price) => price,
                GasMode::Market => self.config.pricer.market_price(self.client.as_ref()).await,
            },
            Some(previous) if state.escalate => {
                self.stats.increment(&self.stats.gas_escalations);
                self.config.pricer.escalate(previous, state.attempt)
            }
            Some(previous) => previous,
        };
        state.escalate = false;

        let price = match self.config.max_gas_price {
            Some(cap) if price > cap => {
                debug!("[Dispatch] Gas price {} capped at {}", price, cap);
                cap
            }
            _ => price,
        };
        state.gas_price = Some(price);
        price
    }

    fn record(&self, outcome: &DispatchOutcome) {
        let Some(journal) = &self.journal else {
            return;
        };
        match journal.try_send(outcome.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("[Dispatch] Journal channel full, dropping outcome for {}", outcome.sender);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("[Dispatch] Journal channel closed");
            }
        }
    }

    /// Send every request of `batch` concurrently and wait for all of them.
    ///
    /// Individual failures are recorded in their outcomes; only a closed
    /// limiter fails the batch as a whole.
    pub async fn dispatch_batch(
        &self,
        batch: Batch,
        options: &SendOptions,
    ) -> Result<Vec<DispatchOutcome>, DispatchError> {
        if self.limiter.is_closed() {
            self.stats.increment(&self.stats.batches_failed);
            return Err(DispatchError::LimiterClosed);
        }

        let started = Instant::now();
        let index = batch.index;
        info!(
            "[Dispatch] Batch {} | {} {} request(s) | nonces {}..{}",
            index,
            batch.len(),
            options.purpose,
            batch.start_nonce,
            batch.end_nonce()
        );

        let outcomes = join_all(batch.requests.into_iter().map(|r| self.send(r, options))).await;

        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        info!(
            "[Dispatch] Batch {} done | {} ok, {} failed | {}ms",
            index,
            succeeded,
            outcomes.len() - succeeded,
            started.elapsed().as_millis()
        );
        self.stats.increment(&self.stats.batches_completed);

        if !self.config.inter_batch_delay.is_zero() {
            tokio::time::sleep(self.config.inter_batch_delay).await;
        }

        Ok(outcomes)
    }

    /// Dispatch `batches` according to `policy`.
    ///
    /// A failing batch is reported and the remaining batches still run.
    pub async fn dispatch_all(
        &self,
        batches: Vec<Batch>,
        options: &SendOptions,
        policy: BatchPolicy,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();

        let results: Vec<(usize, Result<Vec<DispatchOutcome>, DispatchError>)> = match policy {
            BatchPolicy::Sequential => {
                let mut results = Vec::with_capacity(batches.len());
                for batch in batches {
                    let index = batch.index;
                    results.push((index, self.dispatch_batch(batch, options).await));
                }
                results
            }
            BatchPolicy::BoundedParallel { max_in_flight } => {
                stream::iter(batches)
                    .map(|batch| async move {
                        let index = batch.index;
                        (index, self.dispatch_batch(batch, options).await)
                    })
                    .buffered(max_in_flight.max(1))
                    .collect()
                    .await
            }
        };

        for (index, result) in results {
            match result {
                Ok(outcomes) => report.outcomes.extend(outcomes),
                Err(e) => {
                    error!("[Dispatch] Batch {} failed: {}", index, e);
                    report.batch_errors.push((index, e.to_string()));
                }
            }
        }

        report
    }

    /// Send `transfers` from `source` using one contiguous nonce range
    /// starting at the chain's current count
    pub async fn transfer_to_wallets(
        &self,
        source: Arc<Account>,
        transfers: Vec<(Address, U256)>,
        options: &SendOptions,
    ) -> Result<DispatchReport, DispatchError> {
        if transfers.is_empty() {
            return Ok(DispatchReport::default());
        }

        let started = Instant::now();
        let address = source.address();
        let count = transfers.len();

        self.nonces.refresh(address).await?;
        let start_nonce = self.nonces.reserve(address, count as u64).await?;

        let requests = transfers
            .into_iter()
            .map(|(recipient, value)| SendRequest::new(source.clone(), recipient, value))
            .collect();
        let batches = Self::prepare_batches(requests, start_nonce, self.config.batch_size);

        info!(
            "[Dispatch] Sending {} {} transfer(s) from {} in {} batch(es) | nonces {}..{}",
            count,
            options.purpose,
            address,
            batches.len(),
            start_nonce,
            start_nonce + count as u64
        );

        let report = self
            .dispatch_all(batches, options, self.config.batch_policy)
            .await;

        info!(
            "[Dispatch] Finished {} transfer(s) from {} | {} ok, {} failed, {} batch error(s) | {:.1}s",
            count,
            address,
            report.succeeded(),
            report.failed(),
            report.batch_errors.len(),
            started.elapsed().as_secs_f64()
        );

        Ok(report)
    }
}
