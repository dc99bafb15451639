//! Error types shared by the engine.
//!
//! `ChainError` is what a [`ChainClient`](crate::client::ChainClient) returns;
//! the retry policy classifies it into an [`ErrorKind`](crate::retry::ErrorKind).

/// Failure reported by the chain client or by local signing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainError {
    /// Connection refused/reset, HTTP failure, request timeout
    #[error("Network error: {0}")]
    Network(String),
    /// The node answered with a JSON-RPC error object
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    /// Confirmation wait ran out of time
    #[error("Timeout waiting for confirmation: {0}")]
    Timeout(String),
    /// Unexpected response shape
    #[error("Parse error: {0}")]
    Parse(String),
    /// Building or signing the transaction failed locally
    #[error("Signing error: {0}")]
    Signing(String),
    /// Transaction was mined but the receipt reports failure
    #[error("Transaction reverted: {0}")]
    Reverted(String),
    /// The dispatcher shut down before the attempt could be submitted
    #[error("Send cancelled: {0}")]
    Cancelled(String),
}

impl ChainError {
    /// Convenience for RPC rejections where only the message matters
    pub fn rpc(message: impl Into<String>) -> Self {
        ChainError::Rpc {
            code: -32000,
            message: message.into(),
        }
    }
}

/// Batch-level dispatch failure.
///
/// Per-request failures never surface here; they are recorded in the
/// request's `DispatchOutcome` instead.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Concurrency limiter is closed")]
    LimiterClosed,
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
}

/// Pool persistence failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialize(String),
    #[error("Invalid account record: {0}")]
    InvalidAccount(String),
}

/// Funding loop failure.
#[derive(Debug, thiserror::Error)]
pub enum FundingError {
    #[error("Pool store error: {0}")]
    Store(#[from] StoreError),
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Invalid funding config: {0}")]
    InvalidConfig(String),
    #[error("Pool is too small to redistribute ({0} accounts)")]
    PoolTooSmall(usize),
    #[error("Funding task panicked or was cancelled: {0}")]
    Task(String),
}
