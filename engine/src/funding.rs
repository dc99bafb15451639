//! Continuous Funding Loop
//!
//! Long-running supervised task that grows the wallet pool, funds new
//! wallets from the source account and then keeps redistributing small
//! amounts between pool members at a randomized target TPS.
//!
//! `Idle -> Generating -> InitialFunding -> Redistributing -> Stopped`
//!
//! Stop is cooperative: it is checked at every per-account boundary and
//! interrupts every sleep, so shutdown waits for at most one in-flight group.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::U256;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::account::{generate_accounts, pick_peer, Account, PoolStore, WalletPool};
use crate::consts::{
    DEFAULT_FUNDING_AMOUNT, DEFAULT_TRANSFER_AMOUNT, FUNDING_BATCH_SIZE, FUNDING_GAS_PRICE,
    GENERATION_BATCH_SIZE, LOOP_ERROR_COOLDOWN_MS, MAX_GROUP_SIZE, MAX_TPS, MAX_WALLETS, MIN_POOL_SIZE,
    MIN_TPS, PERSIST_EVERY, ROUND_PAUSE_MS,
};
use crate::dispatch::{Dispatcher, SendOptions};
use crate::error::{DispatchError, FundingError};
use crate::types::{DispatchOutcome, Purpose, SendRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Generating,
    InitialFunding,
    Redistributing,
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Idle => "Idle",
            LoopState::Generating => "Generating",
            LoopState::InitialFunding => "InitialFunding",
            LoopState::Redistributing => "Redistributing",
            LoopState::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

/// Deployment profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FundingMode {
    /// Build the pool to `min_pool_size`, fund it, then only redistribute
    #[default]
    FundThenRedistribute,
    /// Keep growing and funding one sub-batch before every round
    Interleaved,
}

/// Inclusive wei range; `min == max` means a fixed amount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmountRange {
    pub min: u128,
    pub max: u128,
}

impl AmountRange {
    pub fn fixed(amount: u128) -> Self {
        Self {
            min: amount,
            max: amount,
        }
    }

    pub fn new(min: u128, max: u128) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        if self.min == self.max {
            return U256::from(self.min);
        }
        U256::from(rng.gen_range(self.min..=self.max))
    }
}

#[derive(Debug, Clone)]
pub struct FundingConfig {
    pub mode: FundingMode,
    /// Pool size reached before funding starts
    pub min_pool_size: usize,
    pub max_wallets: usize,
    /// Accounts generated per step
    pub generation_batch: usize,
    pub persist_every: usize,
    pub funding_amount: AmountRange,
    pub funding_gas_price: u128,
    /// Wallets funded concurrently per step
    pub funding_batch_size: usize,
    pub transfer_amount: AmountRange,
    pub min_tps: u32,
    pub max_tps: u32,
    pub max_group_size: u32,
    pub round_pause: Duration,
    pub error_cooldown: Duration,
    /// Stop on its own after this many rounds
    pub max_rounds: Option<u64>,
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            mode: FundingMode::FundThenRedistribute,
            min_pool_size: MIN_POOL_SIZE,
            max_wallets: MAX_WALLETS,
            generation_batch: GENERATION_BATCH_SIZE,
            persist_every: PERSIST_EVERY,
            funding_amount: AmountRange::fixed(DEFAULT_FUNDING_AMOUNT),
            funding_gas_price: FUNDING_GAS_PRICE,
            funding_batch_size: FUNDING_BATCH_SIZE,
            transfer_amount: AmountRange::fixed(DEFAULT_TRANSFER_AMOUNT),
            min_tps: MIN_TPS,
            max_tps: MAX_TPS,
            max_group_size: MAX_GROUP_SIZE,
            round_pause: Duration::from_millis(ROUND_PAUSE_MS),
            error_cooldown: Duration::from_millis(LOOP_ERROR_COOLDOWN_MS),
            max_rounds: None,
        }
    }
}

impl FundingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_tps == 0 || self.min_tps > self.max_tps {
            return Err(format!(
                "invalid TPS window {}..={}",
                self.min_tps, self.max_tps
            ));
        }
        if self.min_pool_size < 2 {
            return Err("min pool size must be at least 2".to_string());
        }
        if self.max_wallets < self.min_pool_size {
            return Err(format!(
                "max wallets ({}) is below the min pool size ({})",
                self.max_wallets, self.min_pool_size
            ));
        }
        if self.generation_batch == 0 || self.funding_batch_size == 0 || self.max_group_size == 0 {
            return Err("batch sizes must be positive".to_string());
        }
        Ok(())
    }

    /// Pool size the initial generation phase aims for
    pub fn initial_target(&self) -> usize {
        self.min_pool_size.min(self.max_wallets)
    }
}

/// Cooperative stop flag with interruptible sleeps
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once stop has been requested
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleep for `duration` unless stopped first. Returns whether stop was
    /// requested.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return self.is_stopped();
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_stopped(),
            _ = self.stopped() => true,
        }
    }
}

/// What the loop did before it stopped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopReport {
    pub generated: usize,
    pub funded: u64,
    pub funding_failed: u64,
    pub rounds: u64,
    pub transfers_ok: u64,
    pub transfers_failed: u64,
    pub loop_errors: u64,
}

pub struct FundingLoop {
    dispatcher: Arc<Dispatcher>,
    pool: Arc<WalletPool>,
    store: Arc<dyn PoolStore>,
    source: Arc<Account>,
    config: FundingConfig,
}

impl FundingLoop {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        pool: Arc<WalletPool>,
        store: Arc<dyn PoolStore>,
        source: Arc<Account>,
        config: FundingConfig,
    ) -> Self {
        Self {
            dispatcher,
            pool,
            store,
            source,
            config,
        }
    }

    /// Start the loop on the runtime and hand back its supervisor
    pub fn spawn(self) -> FundingHandle {
        let stop = StopSignal::new();
        let (state_tx, state_rx) = watch::channel(LoopState::Idle);

        let runner = Runner {
            dispatcher: self.dispatcher,
            pool: self.pool,
            store: self.store,
            source: self.source,
            config: self.config,
            stop: stop.clone(),
            state: state_tx,
            report: LoopReport::default(),
            rng: StdRng::from_entropy(),
            unpersisted: 0,
            started: Instant::now(),
        };
        let task = tokio::spawn(runner.run());

        FundingHandle {
            stop,
            state: state_rx,
            task,
        }
    }
}

/// Supervisor of a spawned [`FundingLoop`]
pub struct FundingHandle {
    stop: StopSignal,
    state: watch::Receiver<LoopState>,
    task: JoinHandle<Result<LoopReport, FundingError>>,
}

impl FundingHandle {
    /// Request a cooperative stop; in-flight sends finish first
    pub fn stop(&self) {
        info!("[Funding] Stop requested");
        self.stop.stop();
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop task to drain
    pub async fn join(self) -> Result<LoopReport, FundingError> {
        self.task
            .await
            .map_err(|e| FundingError::Task(e.to_string()))?
    }
}

struct Runner {
    dispatcher: Arc<Dispatcher>,
    pool: Arc<WalletPool>,
    store: Arc<dyn PoolStore>,
    source: Arc<Account>,
    config: FundingConfig,
    stop: StopSignal,
    state: watch::Sender<LoopState>,
    report: LoopReport,
    rng: StdRng,
    /// Accounts generated since the last successful save
    unpersisted: usize,
    started: Instant,
}

impl Runner {
    async fn run(mut self) -> Result<LoopReport, FundingError> {
        if let Err(reason) = self.config.validate() {
            error!("[Funding] Refusing to start: {}", reason);
            self.set_state(LoopState::Stopped);
            return Err(FundingError::InvalidConfig(reason));
        }

        info!(
            "[Funding] Starting | mode {:?} | source {} | pool {} | target {}",
            self.config.mode,
            self.source.address(),
            self.pool.len().await,
            self.config.initial_target()
        );

        match self.dispatcher.nonces().refresh(self.source.address()).await {
            Ok(nonce) => info!("[Funding] Source nonce {}", nonce),
            Err(e) => warn!("[Funding] Could not fetch source nonce, will seed lazily: {}", e),
        }

        let result = self.drive().await;

        if self.unpersisted > 0 {
            if let Err(e) = self.persist().await {
                error!("[Funding] Failed to persist pool on shutdown: {}", e);
            }
        }

        self.set_state(LoopState::Stopped);
        self.dispatcher
            .stats()
            .log_summary("Funding loop stopped", self.started);
        info!("[Funding] Stopped | {:?}", self.report);

        result.map(|()| self.report)
    }

    async fn drive(&mut self) -> Result<(), FundingError> {
        self.set_state(LoopState::Generating);
        let target = self.config.initial_target();
        while !self.stop.is_stopped() {
            match self.generate_until(target, true).await {
                Ok(()) => break,
                Err(e) => {
                    if self.recover(e).await? {
                        return Ok(());
                    }
                }
            }
        }

        if self.stop.is_stopped() {
            return Ok(());
        }

        self.set_state(LoopState::InitialFunding);
        while !self.stop.is_stopped() {
            match self.fund_pending().await {
                Ok(()) => break,
                Err(e) => {
                    if self.recover(e).await? {
                        return Ok(());
                    }
                }
            }
        }

        if self.stop.is_stopped() {
            return Ok(());
        }

        self.set_state(LoopState::Redistributing);
        while !self.stop.is_stopped() {
            if self.config.mode == FundingMode::Interleaved {
                if let Err(e) = self.grow().await {
                    if self.recover(e).await? {
                        return Ok(());
                    }
                    continue;
                }
            }

            if let Err(e) = self.round().await {
                if self.recover(e).await? {
                    return Ok(());
                }
                continue;
            }

            if let Some(max) = self.config.max_rounds {
                if self.report.rounds >= max {
                    info!("[Funding] Reached {} round(s), stopping", max);
                    self.stop.stop();
                }
            }
        }

        Ok(())
    }

    /// Handle a loop-level error: fatal ones propagate, the rest cool down.
    /// Returns whether stop was requested during the cooldown.
    async fn recover(&mut self, e: FundingError) -> Result<bool, FundingError> {
        if self.dispatcher.is_closed() {
            error!("[Funding] Dispatcher closed, giving up: {}", e);
            return Err(FundingError::Dispatch(DispatchError::LimiterClosed));
        }
        if let FundingError::PoolTooSmall(_) = e {
            error!("[Funding] {}", e);
            return Err(e);
        }

        self.report.loop_errors += 1;
        error!(
            "[Funding] Error in {} phase: {} | cooling down {}ms",
            *self.state.borrow(),
            e,
            self.config.error_cooldown.as_millis()
        );
        Ok(self.stop.sleep(self.config.error_cooldown).await)
    }

    fn set_state(&self, state: LoopState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("[Funding] State {} -> {}", previous, state);
        }
    }

    async fn persist(&mut self) -> Result<(), FundingError> {
        let snapshot = self.pool.snapshot().await;
        self.store.save(&snapshot).await?;
        debug!("[Funding] Persisted {} wallets", snapshot.len());
        self.unpersisted = 0;
        Ok(())
    }

    /// Generate sub-batches until the pool holds `target` accounts.
    /// With `flush`, whatever is still unsaved is persisted at the end.
    async fn generate_until(&mut self, target: usize, flush: bool) -> Result<(), FundingError> {
        let target = target.min(self.config.max_wallets);

        loop {
            if self.stop.is_stopped() {
                return Ok(());
            }
            let len = self.pool.len().await;
            if len >= target {
                break;
            }

            let count = self.config.generation_batch.min(target - len);
            let total = self.pool.extend(generate_accounts(count)).await;
            self.report.generated += count;
            self.unpersisted += count;
            info!("[Funding] Generated {} wallets out of {}", total, target);

            if self.unpersisted >= self.config.persist_every {
                self.persist().await?;
            }
            tokio::task::yield_now().await;
        }

        if flush && self.unpersisted > 0 {
            self.persist().await?;
        }
        Ok(())
    }

    /// Fund every wallet past the funded prefix, one group at a time.
    /// Failed wallets are logged and kept out of redistribution.
    async fn fund_pending(&mut self) -> Result<(), FundingError> {
        let range = self.pool.unfunded_range().await;
        if range.is_empty() {
            return Ok(());
        }

        let accounts = self.pool.snapshot().await;
        let options = SendOptions::funding(self.config.funding_gas_price);
        info!(
            "[Funding] Funding {} wallets ({}..{}) from {}",
            range.len(),
            range.start,
            range.end,
            self.source.address()
        );

        let mut start = range.start;
        while start < range.end {
            let end = (start + self.config.funding_batch_size).min(range.end);

            // A terminal failure in the previous group leaves its nonce unused
            self.dispatcher.nonces().refresh(self.source.address()).await?;

            let mut requests = Vec::with_capacity(end - start);
            for account in &accounts[start..end] {
                if self.stop.is_stopped() {
                    break;
                }
                let value = self.config.funding_amount.sample(&mut self.rng);
                requests.push(SendRequest::new(self.source.clone(), account.address(), value));
            }
            if requests.is_empty() {
                return Ok(());
            }

            let funded_upto = start + requests.len();
            let outcomes = self.send_group(requests, &options).await;
            for (index, outcome) in (start..funded_upto).zip(&outcomes) {
                if outcome.is_success() {
                    self.report.funded += 1;
                    info!(
                        "[Funding] Funded {} with {} wei (gas {}, {} attempt(s))",
                        outcome.recipient, outcome.value, outcome.gas_price, outcome.attempts
                    );
                } else {
                    self.report.funding_failed += 1;
                    self.pool.mark_unfunded(index).await;
                    warn!("[Funding] Skipping unfunded wallet {}", outcome.recipient);
                }
            }
            self.pool.mark_funded_upto(funded_upto);

            if self.stop.is_stopped() {
                return Ok(());
            }
            start = end;
        }

        info!(
            "[Funding] Funding pass done | {} funded, {} failed so far",
            self.report.funded, self.report.funding_failed
        );
        Ok(())
    }

    /// Interleaved mode: add and fund one more sub-batch while under the cap
    async fn grow(&mut self) -> Result<(), FundingError> {
        let len = self.pool.len().await;
        if len >= self.config.max_wallets {
            return Ok(());
        }
        let target = len + self.config.generation_batch;
        self.generate_until(target, false).await?;
        self.fund_pending().await
    }

    /// One redistribution pass over the funded pool
    async fn round(&mut self) -> Result<(), FundingError> {
        let accounts = self.pool.active_accounts().await;
        let funded = accounts.len();
        if funded < 2 {
            return Err(FundingError::PoolTooSmall(funded));
        }

        let tps = self.rng.gen_range(self.config.min_tps..=self.config.max_tps);
        let group = tps.min(self.config.max_group_size) as usize;
        let round = self.report.rounds + 1;
        let options = SendOptions::new(Purpose::Transfer);
        info!(
            "[Funding] Round {} | {} wallets | {} TPS | groups of {}",
            round, funded, tps, group
        );

        let mut start = 0;
        while start < funded {
            let end = (start + group).min(funded);

            let mut requests = Vec::with_capacity(end - start);
            for index in start..end {
                if self.stop.is_stopped() {
                    break;
                }
                let Some(peer) = pick_peer(&mut self.rng, funded, index) else {
                    continue;
                };
                let value = self.config.transfer_amount.sample(&mut self.rng);
                requests.push(SendRequest::new(
                    accounts[index].clone(),
                    accounts[peer].address(),
                    value,
                ));
            }

            let sent = requests.len();
            if sent > 0 {
                for outcome in self.send_group(requests, &options).await {
                    if outcome.is_success() {
                        self.report.transfers_ok += 1;
                    } else {
                        self.report.transfers_failed += 1;
                    }
                }
            }

            if end / 1_000 > start / 1_000 {
                info!("[Funding] Round {} | processed {} transfers at {} TPS", round, end, tps);
            }

            let pacing = Duration::from_secs_f64(sent as f64 / tps as f64);
            if self.stop.sleep(pacing).await {
                info!("[Funding] Round {} interrupted at wallet {}", round, end);
                return Ok(());
            }
            start = end;
        }

        self.report.rounds += 1;
        self.dispatcher
            .stats()
            .log_summary(&format!("Round {}", round), self.started);

        if !self.stop.is_stopped() {
            info!(
                "[Funding] Completed round {}, pausing {}ms",
                round,
                self.config.round_pause.as_millis()
            );
            self.stop.sleep(self.config.round_pause).await;
        }
        Ok(())
    }

    async fn send_group(
        &self,
        requests: Vec<SendRequest>,
        options: &SendOptions,
    ) -> Vec<DispatchOutcome> {
        let dispatcher = &self.dispatcher;
        join_all(requests.into_iter().map(|r| dispatcher.send(r, options))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_range_sampling_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(3);
        let range = AmountRange::new(500, 100);
        assert_eq!(range.min, 100);
        for _ in 0..200 {
            let v = range.sample(&mut rng);
            assert!(v >= U256::from(100u64) && v <= U256::from(500u64));
        }
        assert_eq!(AmountRange::fixed(7).sample(&mut rng), U256::from(7u64));
    }

    #[test]
    fn test_config_validation() {
        assert!(FundingConfig::default().validate().is_ok());

        let mut config = FundingConfig::default();
        config.min_tps = 50;
        config.max_tps = 10;
        assert!(config.validate().is_err());

        let mut config = FundingConfig::default();
        config.min_pool_size = 1;
        assert!(config.validate().is_err());

        let mut config = FundingConfig::default();
        config.max_wallets = 10;
        config.min_pool_size = 20;
        assert!(config.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_interrupts_sleep() {
        let stop = StopSignal::new();
        let waiter = stop.clone();
        let started = tokio::time::Instant::now();

        let task = tokio::spawn(async move { waiter.sleep(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        stop.stop();

        assert!(task.await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(stop.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_sleep_runs_to_completion() {
        let stop = StopSignal::new();
        assert!(!stop.sleep(Duration::from_millis(500)).await);
    }
}
