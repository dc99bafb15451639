//! Configuration for the crank program

use std::path::PathBuf;
use std::time::Duration;

use alloy::primitives::utils::parse_ether;
use clap::{Parser, Subcommand};
use walletflood::consts::{
    BATCH_SIZE, CONFIRMATION_TIMEOUT_MS, GENERATION_BATCH_SIZE, GWEI, LOOP_ERROR_COOLDOWN_MS,
    MAX_CONCURRENT_SENDS, MAX_RETRIES, MAX_TPS, MAX_WALLETS, MIN_POOL_SIZE, MIN_TPS,
    PERSIST_EVERY, RETRY_DELAY_MS, ROUND_PAUSE_MS,
};
use walletflood::{
    Account, AmountRange, Backoff, DispatcherConfig, FundingConfig, FundingMode, GasPricer,
    RetryPolicy,
};

use crate::crank::CrankError;

/// Wallet pool generator and transaction load driver for EVM chains
#[derive(Parser, Debug, Clone)]
#[command(name = "walletflood-crank")]
#[command(about = "Generates, funds and churns a pool of EVM wallets", long_about = None)]
pub struct Config {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Command>,

    /// JSON-RPC endpoint
    #[arg(long, env = "RPC_URL")]
    pub rpc_url: String,

    /// Hex private key of the funding source
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    pub private_key: Option<String>,

    /// Chain id for signing (queried from the node when omitted)
    #[arg(long, env = "CHAIN_ID")]
    pub chain_id: Option<u64>,

    /// Wallet pool file
    #[arg(long, env = "WALLET_STORE", default_value = "data/wallets.json")]
    pub wallet_store: PathBuf,

    /// SQLite dispatch journal (disabled when omitted)
    #[arg(long, env = "DATABASE_PATH")]
    pub db_path: Option<PathBuf>,

    /// Maximum in-flight submissions
    #[arg(long, env = "CONCURRENCY", default_value_t = MAX_CONCURRENT_SENDS)]
    pub concurrency: usize,

    /// Requests per dispatch batch
    #[arg(long, env = "BATCH_SIZE", default_value_t = BATCH_SIZE)]
    pub batch_size: usize,

    /// Retries for a retryable failure
    #[arg(long, env = "MAX_RETRIES", default_value_t = MAX_RETRIES)]
    pub max_retries: u32,

    /// Delay between retries in milliseconds
    #[arg(long, env = "RETRY_DELAY_MS", default_value_t = RETRY_DELAY_MS)]
    pub retry_delay_ms: u64,

    /// Confirmation wait ceiling in milliseconds
    #[arg(long, env = "CONFIRM_TIMEOUT_MS", default_value_t = CONFIRMATION_TIMEOUT_MS)]
    pub confirm_timeout_ms: u64,

    /// Gas price used when the node cannot quote one, in gwei
    #[arg(long, env = "GAS_FALLBACK_GWEI", default_value = "3")]
    pub gas_fallback_gwei: u64,

    /// Never bid above this gas price, in gwei
    #[arg(long, env = "MAX_GAS_PRICE_GWEI")]
    pub max_gas_price_gwei: Option<u64>,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Generate, fund and redistribute continuously until interrupted
    Run(RunArgs),
    /// Generate wallets and append them to the wallet store
    Generate {
        /// Number of wallets to generate
        #[arg(long)]
        count: usize,
    },
    /// Fund every stored wallet from the source account
    Fund {
        /// Minimum amount per wallet, in ether
        #[arg(long, default_value = "0.01")]
        min_amount: String,
        /// Maximum amount per wallet, in ether
        #[arg(long, default_value = "0.01")]
        max_amount: String,
    },
    /// Send a burst of transfers from the source to fresh addresses
    Blast {
        /// Number of transfers
        #[arg(long, default_value = "1000")]
        count: usize,
        /// Value per transfer, in ether
        #[arg(long, default_value = "0.0001")]
        amount: String,
    },
    /// Print dispatch journal totals (requires --db-path)
    Stats {
        /// Window to report on, in seconds
        #[arg(long, default_value = "3600")]
        since_secs: u64,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Pool size reached before funding starts
    #[arg(long, env = "MIN_POOL_SIZE", default_value_t = MIN_POOL_SIZE)]
    pub min_pool_size: usize,

    /// Hard ceiling on generated wallets
    #[arg(long, env = "MAX_WALLETS", default_value_t = MAX_WALLETS)]
    pub max_wallets: usize,

    /// Wallets generated per step
    #[arg(long, default_value_t = GENERATION_BATCH_SIZE)]
    pub generation_batch: usize,

    /// Persist the pool every N generated wallets
    #[arg(long, default_value_t = PERSIST_EVERY)]
    pub persist_every: usize,

    /// Initial funding per wallet, in ether
    #[arg(long, env = "FUNDING_AMOUNT", default_value = "0.01")]
    pub funding_amount: String,

    /// Upper bound for a randomized funding amount, in ether
    #[arg(long)]
    pub funding_amount_max: Option<String>,

    /// Gas price for funding transfers, in gwei
    #[arg(long, env = "FUNDING_GAS_GWEI", default_value = "2000")]
    pub funding_gas_gwei: u64,

    /// Minimum redistribution transfer, in ether
    #[arg(long, default_value = "0.0001")]
    pub transfer_amount_min: String,

    /// Maximum redistribution transfer, in ether
    #[arg(long, default_value = "0.0001")]
    pub transfer_amount_max: String,

    #[arg(long, env = "MIN_TPS", default_value_t = MIN_TPS)]
    pub min_tps: u32,

    #[arg(long, env = "MAX_TPS", default_value_t = MAX_TPS)]
    pub max_tps: u32,

    /// Pause between redistribution rounds in milliseconds
    #[arg(long, default_value_t = ROUND_PAUSE_MS)]
    pub round_pause_ms: u64,

    /// Cooldown after a loop error in milliseconds
    #[arg(long, default_value_t = LOOP_ERROR_COOLDOWN_MS)]
    pub cooldown_ms: u64,

    /// Keep generating between redistribution rounds
    #[arg(long)]
    pub interleaved: bool,

    /// Start from the wallets already in the store
    #[arg(long)]
    pub resume: bool,
}

impl Config {
    /// Load the funding source from the configured private key
    pub fn load_source(&self) -> Result<Account, CrankError> {
        let key = self
            .private_key
            .as_deref()
            .ok_or_else(|| CrankError::Config("PRIVATE_KEY is required for this command".to_string()))?;
        Account::from_private_key(key).map_err(|e| CrankError::Config(format!("Invalid private key: {}", e)))
    }

    pub fn dispatcher_config(&self) -> Result<DispatcherConfig, CrankError> {
        if self.concurrency == 0 || self.batch_size == 0 {
            return Err(CrankError::Config(
                "concurrency and batch size must be positive".to_string(),
            ));
        }

        Ok(DispatcherConfig {
            max_concurrent: self.concurrency,
            batch_size: self.batch_size,
            confirm_timeout: Duration::from_millis(self.confirm_timeout_ms),
            max_gas_price: self.max_gas_price_gwei.map(|g| g as u128 * GWEI),
            retry: RetryPolicy::new(
                self.max_retries,
                Backoff::Fixed(Duration::from_millis(self.retry_delay_ms)),
            ),
            pricer: GasPricer::default().with_fallback(self.gas_fallback_gwei as u128 * GWEI),
            ..DispatcherConfig::default()
        })
    }
}

impl RunArgs {
    pub fn funding_config(&self) -> Result<FundingConfig, CrankError> {
        let funding_min = parse_amount(&self.funding_amount)?;
        let funding_amount = match &self.funding_amount_max {
            Some(max) => AmountRange::new(funding_min, parse_amount(max)?),
            None => AmountRange::fixed(funding_min),
        };
        let transfer_amount = AmountRange::new(
            parse_amount(&self.transfer_amount_min)?,
            parse_amount(&self.transfer_amount_max)?,
        );

        let config = FundingConfig {
            mode: if self.interleaved {
                FundingMode::Interleaved
            } else {
                FundingMode::FundThenRedistribute
            },
            min_pool_size: self.min_pool_size,
            max_wallets: self.max_wallets,
            generation_batch: self.generation_batch,
            persist_every: self.persist_every,
            funding_amount,
            funding_gas_price: self.funding_gas_gwei as u128 * GWEI,
            transfer_amount,
            min_tps: self.min_tps,
            max_tps: self.max_tps,
            round_pause: Duration::from_millis(self.round_pause_ms),
            error_cooldown: Duration::from_millis(self.cooldown_ms),
            ..FundingConfig::default()
        };
        config.validate().map_err(CrankError::Config)?;
        Ok(config)
    }
}

/// Parse a decimal ether amount into wei
pub fn parse_amount(value: &str) -> Result<u128, CrankError> {
    let wei = parse_ether(value.trim())
        .map_err(|e| CrankError::Config(format!("Invalid amount '{}': {}", value, e)))?;
    u128::try_from(wei).map_err(|_| CrankError::Config(format!("Amount '{}' is too large", value)))
}
