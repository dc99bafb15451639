/// One gwei in wei.
pub const GWEI: u128 = 1_000_000_000;

/// One ether (or native token unit) in wei.
pub const ETHER: u128 = 1_000_000_000_000_000_000;

/// Gas consumed by a plain value transfer.
pub const TRANSFER_GAS_LIMIT: u64 = 21_000;

// ========================
// Gas pricing
// ========================

/// Premium applied over the node's reported gas price, in percent (110 = +10%).
pub const GAS_PRICE_PREMIUM_PERCENT: u128 = 110;

/// Multiplier applied per underpriced retry, in percent (150 = x1.5).
pub const GAS_ESCALATION_PERCENT: u128 = 150;

/// Price used when the node's gas price cannot be fetched.
pub const FALLBACK_GAS_PRICE: u128 = 3 * GWEI;

/// Fixed price used for funding transfers out of the source account.
pub const FUNDING_GAS_PRICE: u128 = 2_000 * GWEI;

// ========================
// Dispatch
// ========================

/// Maximum simultaneously in-flight submissions, process-wide.
pub const MAX_CONCURRENT_SENDS: usize = 50;

/// Requests per batch.
pub const BATCH_SIZE: usize = 100;

/// Pause inserted after every batch.
pub const INTER_BATCH_DELAY_MS: u64 = 1_000;

/// Upper bound on a single confirmation wait.
pub const CONFIRMATION_TIMEOUT_MS: u64 = 30_000;

/// How long a nonce conflict waits for an earlier broadcast's receipt
/// before the nonce is treated as taken by someone else.
pub const LANDED_CHECK_TIMEOUT_MS: u64 = 5_000;

/// Retries allowed for a retryable failure before it becomes terminal.
pub const MAX_RETRIES: u32 = 3;

/// Delay between attempts for the fixed backoff strategy.
pub const RETRY_DELAY_MS: u64 = 1_000;

/// Deepest confirmation count requested by escalating confirmation waits.
pub const MAX_FUNDING_CONFIRMATIONS: u64 = 3;

// ========================
// Funding loop
// ========================

/// Accounts generated per generation step.
pub const GENERATION_BATCH_SIZE: usize = 50;

/// Pool size at which funding starts.
pub const MIN_POOL_SIZE: usize = 1_000;

/// Hard ceiling on generated accounts.
pub const MAX_WALLETS: usize = 30_000_000;

/// Persist the pool every this many generated accounts.
pub const PERSIST_EVERY: usize = 1_000;

/// Redistribution throughput window.
pub const MIN_TPS: u32 = 1;
pub const MAX_TPS: u32 = 100;

/// Wallets dispatched together inside one pacing group.
pub const MAX_GROUP_SIZE: u32 = 10;

/// Pause between redistribution rounds.
pub const ROUND_PAUSE_MS: u64 = 5_000;

/// Cooldown after an unexpected loop-level error.
pub const LOOP_ERROR_COOLDOWN_MS: u64 = 10_000;

/// Wallets funded concurrently per funding step.
pub const FUNDING_BATCH_SIZE: usize = 10;

/// Initial funding per generated wallet (0.01 native).
pub const DEFAULT_FUNDING_AMOUNT: u128 = ETHER / 100;

/// Value moved by one redistribution transfer (0.0001 native).
pub const DEFAULT_TRANSFER_AMOUNT: u128 = ETHER / 10_000;
