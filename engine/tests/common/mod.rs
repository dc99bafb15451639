#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, TxHash};
use async_trait::async_trait;
use walletflood::{
    Account, AccountRecord, ChainClient, ChainError, DispatcherConfig, PoolStore, Receipt,
    RetryPolicy, SignedTx, StoreError,
};

pub const TEST_CHAIN_ID: u64 = 2370;

// ============================================================================
// Mock chain
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTx {
    pub hash: TxHash,
    pub from: Address,
    pub nonce: u64,
    pub gas_price: u128,
}

#[derive(Debug, Default)]
struct SenderState {
    /// Chain-reported transaction count
    count: u64,
    /// Accepted nonces at or above `count`
    pending: BTreeSet<u64>,
}

#[derive(Debug, Default)]
struct MockState {
    senders: HashMap<Address, SenderState>,
    gas_price: Option<u128>,
    min_gas_price: u128,
    submitted: Vec<SubmittedTx>,
    submit_failures: VecDeque<ChainError>,
    confirm_failures: VecDeque<ChainError>,
    /// Every submit of this (sender, nonce) fails with the error
    poisoned: HashMap<(Address, u64), ChainError>,
    /// The first submit of this (sender, nonce) fails with the error
    poisoned_once: HashMap<(Address, u64), ChainError>,
    /// Returned instead of "already known" when a submitted tx is sent again
    resubmit_error: Option<ChainError>,
    /// Every submit from these senders fails with insufficient funds
    poisoned_senders: HashSet<Address>,
    confirmations_requested: Vec<u64>,
    get_nonce_calls: usize,
    block: u64,
}

/// In-memory chain with scriptable failures
pub struct MockChain {
    state: Mutex<MockState>,
    submit_delay: Duration,
    confirm_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockChain {
    pub fn new() -> Self {
        Self::with_delays(Duration::ZERO, Duration::ZERO)
    }

    pub fn with_delays(submit_delay: Duration, confirm_delay: Duration) -> Self {
        Self {
            state: Mutex::new(MockState {
                gas_price: Some(10_000_000_000),
                block: 100,
                ..Default::default()
            }),
            submit_delay,
            confirm_delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn set_nonce(&self, address: Address, count: u64) {
        let mut state = self.state.lock().unwrap();
        let sender = state.senders.entry(address).or_default();
        sender.count = count;
        sender.pending.retain(|n| *n >= count);
    }

    pub fn nonce_of(&self, address: Address) -> u64 {
        let state = self.state.lock().unwrap();
        state.senders.get(&address).map(|s| s.count).unwrap_or(0)
    }

    pub fn set_gas_price(&self, price: Option<u128>) {
        self.state.lock().unwrap().gas_price = price;
    }

    /// Reject anything priced below `price` as underpriced
    pub fn set_min_gas_price(&self, price: u128) {
        self.state.lock().unwrap().min_gas_price = price;
    }

    pub fn fail_next_submits(&self, errors: Vec<ChainError>) {
        self.state.lock().unwrap().submit_failures.extend(errors);
    }

    pub fn fail_next_confirms(&self, errors: Vec<ChainError>) {
        self.state.lock().unwrap().confirm_failures.extend(errors);
    }

    pub fn poison_nonce(&self, address: Address, nonce: u64, error: ChainError) {
        self.state
            .lock()
            .unwrap()
            .poisoned
            .insert((address, nonce), error);
    }

    pub fn fail_nonce_once(&self, address: Address, nonce: u64, error: ChainError) {
        self.state
            .lock()
            .unwrap()
            .poisoned_once
            .insert((address, nonce), error);
    }

    /// Model a node that has already mined and dropped the tx from its pool
    pub fn set_resubmit_error(&self, error: Option<ChainError>) {
        self.state.lock().unwrap().resubmit_error = error;
    }

    pub fn poison_sender(&self, address: Address) {
        self.state.lock().unwrap().poisoned_senders.insert(address);
    }

    pub fn submitted(&self) -> Vec<SubmittedTx> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn submitted_from(&self, address: Address) -> Vec<SubmittedTx> {
        self.submitted()
            .into_iter()
            .filter(|tx| tx.from == address)
            .collect()
    }

    pub fn confirmations_requested(&self) -> Vec<u64> {
        self.state.lock().unwrap().confirmations_requested.clone()
    }

    pub fn get_nonce_calls(&self) -> usize {
        self.state.lock().unwrap().get_nonce_calls
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn accept(&self, tx: &SignedTx) -> Result<TxHash, ChainError> {
        let mut state = self.state.lock().unwrap();

        if state.submitted.iter().any(|s| s.hash == tx.hash) {
            return Err(state
                .resubmit_error
                .clone()
                .unwrap_or_else(|| ChainError::rpc("already known")));
        }
        if let Some(error) = state.submit_failures.pop_front() {
            return Err(error);
        }
        if let Some(error) = state.poisoned_once.remove(&(tx.from, tx.nonce)) {
            return Err(error);
        }
        if let Some(error) = state.poisoned.get(&(tx.from, tx.nonce)) {
            return Err(error.clone());
        }
        if state.poisoned_senders.contains(&tx.from) {
            return Err(ChainError::rpc("insufficient funds for gas * price + value"));
        }
        if tx.gas_price < state.min_gas_price {
            return Err(ChainError::rpc("transaction underpriced"));
        }

        let sender = state.senders.entry(tx.from).or_default();
        if tx.nonce < sender.count || sender.pending.contains(&tx.nonce) {
            return Err(ChainError::rpc(format!(
                "nonce too low: next nonce {}, tx nonce {}",
                sender.count, tx.nonce
            )));
        }
        sender.pending.insert(tx.nonce);
        while sender.pending.remove(&sender.count) {
            sender.count += 1;
        }

        state.submitted.push(SubmittedTx {
            hash: tx.hash,
            from: tx.from,
            nonce: tx.nonce,
            gas_price: tx.gas_price,
        });
        Ok(tx.hash)
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(TEST_CHAIN_ID)
    }

    async fn get_nonce(&self, address: Address) -> Result<u64, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.get_nonce_calls += 1;
        Ok(state.senders.get(&address).map(|s| s.count).unwrap_or(0))
    }

    async fn get_gas_price(&self) -> Result<u128, ChainError> {
        self.state
            .lock()
            .unwrap()
            .gas_price
            .ok_or_else(|| ChainError::Network("gas price unavailable".to_string()))
    }

    async fn submit(&self, tx: &SignedTx) -> Result<TxHash, ChainError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }
        let result = self.accept(tx);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn wait_confirmed(
        &self,
        tx_hash: TxHash,
        confirmations: u64,
        _timeout: Duration,
    ) -> Result<Receipt, ChainError> {
        if !self.confirm_delay.is_zero() {
            tokio::time::sleep(self.confirm_delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.confirmations_requested.push(confirmations);
        if let Some(error) = state.confirm_failures.pop_front() {
            return Err(error);
        }

        // Only txs below the sender's count are mined; anything behind a gap waits
        let mined = state
            .submitted
            .iter()
            .find(|tx| tx.hash == tx_hash)
            .map(|tx| {
                let count = state.senders.get(&tx.from).map(|s| s.count).unwrap_or(0);
                tx.nonce < count
            })
            .unwrap_or(false);
        if !mined {
            return Err(ChainError::Timeout(format!("{} not mined", tx_hash)));
        }

        state.block += 1;
        Ok(Receipt {
            tx_hash,
            block_number: state.block,
            success: true,
            gas_used: 21_000,
        })
    }
}

// ============================================================================
// Pool store
// ============================================================================

#[derive(Default)]
pub struct MemoryPoolStore {
    records: Mutex<Vec<AccountRecord>>,
    saves: AtomicUsize,
    failing: Mutex<bool>,
}

impl MemoryPoolStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl PoolStore for MemoryPoolStore {
    async fn save(&self, accounts: &[Arc<Account>]) -> Result<(), StoreError> {
        if *self.failing.lock().unwrap() {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        *self.records.lock().unwrap() = accounts.iter().map(|a| a.to_record()).collect();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self) -> Result<Vec<Account>, StoreError> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(Account::from_record)
            .collect()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Dispatcher settings with no inter-batch pause and quick retries
pub fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        inter_batch_delay: Duration::ZERO,
        retry: RetryPolicy::new(3, walletflood::Backoff::Fixed(Duration::from_millis(5))),
        ..DispatcherConfig::default()
    }
}

pub fn funded_source(chain: &MockChain, nonce: u64) -> Arc<Account> {
    let source = Arc::new(Account::random());
    chain.set_nonce(source.address(), nonce);
    source
}
