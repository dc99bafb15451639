//! Types passed between the dispatcher, the funding loop and their callers.

use std::fmt;
use std::sync::Arc;

use alloy::primitives::{Address, TxHash, U256};

use crate::account::Account;
use crate::error::ChainError;
use crate::retry::ErrorKind;

/// Why a transfer is being sent. Carried into outcomes for the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    /// Source account funding a pool wallet
    Funding,
    /// Pool wallet sending to another pool wallet
    Transfer,
    /// Source account sending to throwaway addresses
    Blast,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Funding => "funding",
            Purpose::Transfer => "transfer",
            Purpose::Blast => "blast",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transfer intent.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub sender: Arc<Account>,
    pub recipient: Address,
    pub value: U256,
    /// Pre-assigned nonce; `None` allocates one at dispatch time
    pub nonce: Option<u64>,
}

impl SendRequest {
    pub fn new(sender: Arc<Account>, recipient: Address, value: U256) -> Self {
        Self {
            sender,
            recipient,
            value,
            nonce: None,
        }
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn sender_address(&self) -> Address {
        self.sender.address()
    }
}

/// Requests sharing the contiguous nonce range `[start_nonce, start_nonce + len)`.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Position of this batch in its dispatch run (0-based)
    pub index: usize,
    pub start_nonce: u64,
    pub requests: Vec<SendRequest>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// One past the last nonce in this batch
    pub fn end_nonce(&self) -> u64 {
        self.start_nonce + self.requests.len() as u64
    }
}

/// Mined transaction summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub success: bool,
    pub gas_used: u64,
}

/// Terminal failure of a logical send.
#[derive(Debug, Clone)]
pub struct SendFailure {
    pub kind: ErrorKind,
    pub error: ChainError,
}

impl fmt::Display for SendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.error)
    }
}

/// Terminal result of one logical [`SendRequest`].
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub purpose: Purpose,
    pub sender: Address,
    pub recipient: Address,
    pub value: U256,
    /// Nonce used by the last attempt
    pub nonce: Option<u64>,
    /// Hash of the last transaction that reached the node
    pub tx_hash: Option<TxHash>,
    pub receipt: Option<Receipt>,
    pub error: Option<SendFailure>,
    pub attempts: u32,
    /// Gas price of the last attempt
    pub gas_price: u128,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary of a multi-batch dispatch run.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<DispatchOutcome>,
    /// Batches that aborted as a whole, by batch index
    pub batch_errors: Vec<(usize, String)>,
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}
