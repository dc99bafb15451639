//! Core crank logic
//!
//! Wires the RPC client, wallet store and journal into a dispatcher and runs
//! the one-shot commands or the continuous funding loop on top of it.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::{Address, U256};
use rand::Rng;
use sqlx::{Pool, Sqlite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use walletflood::consts::FUNDING_GAS_PRICE;
use walletflood::{
    generate_accounts, AmountRange, ChainClient, ChainError, DispatchError,
    DispatchReport, Dispatcher, FundingError, FundingHandle, FundingLoop, LoopReport, PoolStore,
    Purpose, RetryPolicy, SendOptions, StoreError, WalletPool,
};

use crate::{
    config::{Config, RunArgs},
    db,
    sender::RpcClient,
    wallet_store::JsonPoolStore,
};

/// Outcomes buffered between the dispatcher and the journal task
const JOURNAL_CAPACITY: usize = 10_000;

/// Wallets generated per store write in `generate`
const GENERATE_CHUNK: usize = 1_000;

/// The crank runner
pub struct Crank {
    config: Config,
    dispatcher: Arc<Dispatcher>,
    store: Arc<JsonPoolStore>,
    journal: Option<JoinHandle<u64>>,
}

impl Crank {
    pub async fn new(config: Config) -> Result<Self, CrankError> {
        let client: Arc<dyn ChainClient> = Arc::new(RpcClient::new(config.rpc_url.clone())?);
        let dispatcher_config = config.dispatcher_config()?;

        let chain_id = match config.chain_id {
            Some(id) => id,
            None => client.chain_id().await?,
        };
        info!("Chain id: {}", chain_id);

        let mut dispatcher = Dispatcher::new(client, chain_id, dispatcher_config);

        let journal = match &config.db_path {
            Some(path) => {
                let pool = db::init_db(path).await?;
                info!("Dispatch journal: {}", path.display());
                let (tx, rx) = mpsc::channel(JOURNAL_CAPACITY);
                dispatcher = dispatcher.with_journal(tx);
                Some(tokio::spawn(db::run_journal(pool, rx)))
            }
            None => None,
        };

        let store = Arc::new(JsonPoolStore::new(config.wallet_store.clone()));

        Ok(Self {
            config,
            dispatcher: Arc::new(dispatcher),
            store,
            journal,
        })
    }

    /// Generate `count` wallets and append them to the store
    pub async fn generate(&self, count: usize) -> Result<usize, CrankError> {
        let pool = WalletPool::with_funded(self.store.load().await?);
        let existing = pool.len().await;
        info!("[Generate] {} wallets in store, generating {}", existing, count);

        let mut remaining = count;
        while remaining > 0 {
            let chunk = remaining.min(GENERATE_CHUNK);
            pool.extend(generate_accounts(chunk)).await;
            self.store.save(&pool.snapshot().await).await?;
            remaining -= chunk;
            info!("[Generate] {}/{} generated", count - remaining, count);
        }

        let total = pool.len().await;
        info!("[Generate] Store now holds {} wallets at {}", total, self.store.path().display());
        Ok(total)
    }

    /// Fund every stored wallet from the source with a random amount in `amount`
    pub async fn fund(&self, amount: AmountRange) -> Result<DispatchReport, CrankError> {
        let source = Arc::new(self.config.load_source()?);
        let wallets = self.store.load().await?;
        if wallets.is_empty() {
            warn!("[Fund] Wallet store is empty, nothing to fund");
            return Ok(DispatchReport::default());
        }

        let transfers: Vec<(Address, U256)> = {
            let mut rng = rand::thread_rng();
            wallets
                .iter()
                .map(|wallet| (wallet.address(), amount.sample(&mut rng)))
                .collect()
        };

        info!("[Fund] Funding {} wallets from {}", transfers.len(), source.address());
        let started = Instant::now();
        let report = self
            .dispatcher
            .transfer_to_wallets(source, transfers, &SendOptions::funding(FUNDING_GAS_PRICE))
            .await?;
        self.dispatcher.stats().log_summary("fund", started);

        Ok(report)
    }

    /// Send `count` transfers of `value` from the source to fresh addresses
    pub async fn blast(&self, count: usize, value: u128) -> Result<BlastSummary, CrankError> {
        let source = Arc::new(self.config.load_source()?);

        let transfers: Vec<(Address, U256)> = {
            let mut rng = rand::thread_rng();
            (0..count)
                .map(|_| (Address::from(rng.gen::<[u8; 20]>()), U256::from(value)))
                .collect()
        };

        info!("[Blast] Sending {} transfers from {}", count, source.address());
        let options = SendOptions::new(Purpose::Blast).with_policy(RetryPolicy::blast());
        let started = Instant::now();
        let report = self
            .dispatcher
            .transfer_to_wallets(source, transfers, &options)
            .await?;
        let elapsed = started.elapsed();
        self.dispatcher.stats().log_summary("blast", started);

        Ok(BlastSummary {
            requested: count,
            succeeded: report.succeeded(),
            failed: report.failed(),
            batch_errors: report.batch_errors.len(),
            elapsed,
        })
    }

    /// Start the funding loop; the caller owns stopping and joining it
    pub async fn start_loop(&self, args: &RunArgs) -> Result<FundingHandle, CrankError> {
        let funding_config = args.funding_config()?;
        let source = Arc::new(self.config.load_source()?);

        // Stored wallets were funded by an earlier run
        let pool = if args.resume {
            let accounts = self.store.load().await?;
            info!("[Funding] Resuming with {} stored wallets", accounts.len());
            WalletPool::with_funded(accounts)
        } else {
            WalletPool::new()
        };

        info!(
            "[Funding] Source {} | pool target {} | TPS {}-{} | mode {:?}",
            source.address(),
            funding_config.min_pool_size,
            funding_config.min_tps,
            funding_config.max_tps,
            funding_config.mode
        );

        let store: Arc<dyn PoolStore> = self.store.clone();
        Ok(FundingLoop::new(
            self.dispatcher.clone(),
            Arc::new(pool),
            store,
            source,
            funding_config,
        )
        .spawn())
    }

    /// Wait for the loop to drain and report how it ended
    pub async fn finish_loop(&self, handle: FundingHandle) -> Result<LoopReport, CrankError> {
        let report = handle.join().await?;
        info!(
            "[Funding] Finished | generated {} | funded {} ({} failed) | {} rounds | {} transfers ok, {} failed | {} loop errors",
            report.generated,
            report.funded,
            report.funding_failed,
            report.rounds,
            report.transfers_ok,
            report.transfers_failed,
            report.loop_errors
        );
        Ok(report)
    }

    /// Release the dispatcher and wait for the journal to flush
    pub async fn shutdown(self) {
        let Crank {
            dispatcher,
            journal,
            ..
        } = self;
        dispatcher.close();
        drop(dispatcher);

        if let Some(journal) = journal {
            match journal.await {
                Ok(written) => info!("Journal flushed ({} outcomes)", written),
                Err(e) => warn!("Journal task ended abnormally: {}", e),
            }
        }
    }
}

/// Result of a blast run
#[derive(Debug, Clone)]
pub struct BlastSummary {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub batch_errors: usize,
    pub elapsed: Duration,
}

impl BlastSummary {
    pub fn tps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.succeeded as f64 / secs
    }

    pub fn success_rate(&self) -> f64 {
        if self.requested == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.requested as f64 * 100.0
    }
}

/// Print journal totals for the last `since_secs` seconds
pub async fn print_stats(db_path: &Path, since_secs: u64) -> Result<db::JournalStats, CrankError> {
    let pool: Pool<Sqlite> = db::init_db(db_path).await?;
    let since = db::now_unix() - since_secs as i64;

    let stats = db::get_stats(&pool, since).await?;
    info!("Journal totals for the last {}s:", since_secs);
    info!("  Total:     {}", stats.total_count);
    info!("  Confirmed: {}", stats.confirmed_count);
    info!("  Submitted: {}", stats.submitted_count);
    info!("  Failed:    {}", stats.failed_count);
    info!(
        "  By purpose: funding {} | transfer {} | blast {}",
        stats.funding_count, stats.transfer_count, stats.blast_count
    );
    info!("  Attempts:  {}", stats.total_attempts);

    for (kind, count) in db::get_error_breakdown(&pool, since).await? {
        info!("  {:<22} {}", kind, count);
    }

    Ok(stats)
}

#[derive(Debug, thiserror::Error)]
pub enum CrankError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Wallet store error: {0}")]
    Store(#[from] StoreError),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("Funding loop error: {0}")]
    Funding(#[from] FundingError),
}
