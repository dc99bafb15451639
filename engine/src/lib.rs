pub mod account;
pub mod client;
pub mod consts;
pub mod dispatch;
pub mod error;
pub mod funding;
pub mod gas;
pub mod nonce;
pub mod retry;
pub mod signer;
pub mod stats;
pub mod types;

pub use account::{generate_accounts, pick_peer, Account, AccountRecord, PoolStore, WalletPool};
pub use client::{ChainClient, SignedTx};
pub use dispatch::{BatchPolicy, ConfirmationDepth, Dispatcher, DispatcherConfig, GasMode, SendOptions};
pub use error::{ChainError, DispatchError, FundingError, StoreError};
pub use funding::{
    AmountRange, FundingConfig, FundingHandle, FundingLoop, FundingMode, LoopReport, LoopState,
    StopSignal,
};
pub use gas::GasPricer;
pub use nonce::NonceAllocator;
pub use retry::{classify, Backoff, ErrorKind, RetryDecision, RetryPolicy};
pub use signer::sign_transfer;
pub use stats::DispatchStats;
pub use types::{Batch, DispatchOutcome, DispatchReport, Purpose, Receipt, SendFailure, SendRequest};
