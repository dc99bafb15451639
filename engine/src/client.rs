//! Chain client capability.
//!
//! Everything the engine needs from a node. All calls are fallible and may be
//! slow; the dispatcher wraps them with the retry policy.

use std::time::Duration;

use alloy::primitives::{Address, Bytes, TxHash};
use async_trait::async_trait;

use crate::error::ChainError;
use crate::types::Receipt;

/// A signed transaction ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub hash: TxHash,
    pub from: Address,
    /// EIP-2718 encoded bytes for `eth_sendRawTransaction`
    pub raw: Bytes,
    pub nonce: u64,
    pub gas_price: u128,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Chain id used for replay-protected signing
    async fn chain_id(&self) -> Result<u64, ChainError>;

    /// Transaction count of `address` at the latest block
    async fn get_nonce(&self, address: Address) -> Result<u64, ChainError>;

    /// Node's current gas price in wei
    async fn get_gas_price(&self) -> Result<u128, ChainError>;

    /// Broadcast a signed transaction
    async fn submit(&self, tx: &SignedTx) -> Result<TxHash, ChainError>;

    /// Wait until `tx_hash` has at least `confirmations` blocks on top of and
    /// including its own, failing with [`ChainError::Timeout`] after `timeout`
    async fn wait_confirmed(
        &self,
        tx_hash: TxHash,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<Receipt, ChainError>;
}
