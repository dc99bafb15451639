//! Accounts and the in-memory wallet pool.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StoreError;

/// A generated key pair. Immutable once created.
#[derive(Clone)]
pub struct Account {
    address: Address,
    signer: PrivateKeySigner,
}

impl Account {
    /// Generate a fresh random key pair
    pub fn random() -> Self {
        Self::from_signer(PrivateKeySigner::random())
    }

    pub fn from_signer(signer: PrivateKeySigner) -> Self {
        Self {
            address: signer.address(),
            signer,
        }
    }

    /// Parse a hex private key (with or without `0x`)
    pub fn from_private_key(key: &str) -> Result<Self, StoreError> {
        let signer = PrivateKeySigner::from_str(key.trim())
            .map_err(|e| StoreError::InvalidAccount(e.to_string()))?;
        Ok(Self::from_signer(signer))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn signer(&self) -> &PrivateKeySigner {
        &self.signer
    }

    /// `0x`-prefixed hex of the 32-byte private key
    pub fn private_key_hex(&self) -> String {
        self.signer.to_bytes().to_string()
    }

    pub fn to_record(&self) -> AccountRecord {
        AccountRecord {
            address: self.address.to_string(),
            private_key: self.private_key_hex(),
        }
    }

    /// Rebuild an account from its persisted form.
    ///
    /// The stored address must match the one derived from the key.
    pub fn from_record(record: &AccountRecord) -> Result<Self, StoreError> {
        let account = Self::from_private_key(&record.private_key)?;
        let stored = Address::from_str(record.address.trim())
            .map_err(|e| StoreError::InvalidAccount(format!("{}: {}", record.address, e)))?;
        if stored != account.address {
            return Err(StoreError::InvalidAccount(format!(
                "address {} does not match its private key (derived {})",
                stored, account.address
            )));
        }
        Ok(account)
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Account {}

/// Persisted form of an [`Account`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub address: String,
    pub private_key: String,
}

/// Generate `count` fresh accounts
pub fn generate_accounts(count: usize) -> Vec<Account> {
    (0..count).map(|_| Account::random()).collect()
}

/// Durable storage for the pool.
#[async_trait]
pub trait PoolStore: Send + Sync {
    /// Overwrite the stored pool with `accounts`
    async fn save(&self, accounts: &[Arc<Account>]) -> Result<(), StoreError>;

    /// Load the stored pool; an absent store is an empty pool
    async fn load(&self) -> Result<Vec<Account>, StoreError>;
}

/// Working set of generated accounts.
///
/// Grows monotonically. Accounts `[0, funded_count)` have been through
/// initial funding; the ones whose funding failed are tracked separately and
/// never take part in redistribution.
#[derive(Debug, Default)]
pub struct WalletPool {
    accounts: RwLock<Vec<Arc<Account>>>,
    funded: AtomicUsize,
    unfunded: RwLock<BTreeSet<usize>>,
}

impl WalletPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool seeded with already-persisted accounts, all considered funded
    pub fn with_funded(accounts: Vec<Account>) -> Self {
        let funded = accounts.len();
        Self {
            accounts: RwLock::new(accounts.into_iter().map(Arc::new).collect()),
            funded: AtomicUsize::new(funded),
            unfunded: RwLock::default(),
        }
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.accounts.read().await.is_empty()
    }

    /// Append accounts, returning the new pool size
    pub async fn extend(&self, new_accounts: Vec<Account>) -> usize {
        let mut accounts = self.accounts.write().await;
        accounts.extend(new_accounts.into_iter().map(Arc::new));
        accounts.len()
    }

    /// Cheap copy of the current membership
    pub async fn snapshot(&self) -> Vec<Arc<Account>> {
        self.accounts.read().await.clone()
    }

    pub async fn get(&self, index: usize) -> Option<Arc<Account>> {
        self.accounts.read().await.get(index).cloned()
    }

    pub fn funded_count(&self) -> usize {
        self.funded.load(Ordering::Relaxed)
    }

    /// Index range of accounts still waiting for initial funding
    pub async fn unfunded_range(&self) -> Range<usize> {
        let len = self.len().await;
        self.funded_count().min(len)..len
    }

    /// Record that every account below `index` has been through funding
    pub fn mark_funded_upto(&self, index: usize) {
        self.funded.fetch_max(index, Ordering::Relaxed);
    }

    /// Record that funding the account at `index` failed
    pub async fn mark_unfunded(&self, index: usize) {
        self.unfunded.write().await.insert(index);
    }

    pub async fn unfunded_count(&self) -> usize {
        self.unfunded.read().await.len()
    }

    /// Funded accounts that actually received their funding
    pub async fn active_accounts(&self) -> Vec<Arc<Account>> {
        let accounts = self.accounts.read().await;
        let unfunded = self.unfunded.read().await;
        let funded = self.funded_count().min(accounts.len());
        accounts[..funded]
            .iter()
            .enumerate()
            .filter(|(index, _)| !unfunded.contains(index))
            .map(|(_, account)| account.clone())
            .collect()
    }
}

/// Pick a peer index uniformly from `[0, pool_len)` excluding `self_index`.
///
/// Draws from `[0, pool_len - 2]` and shifts draws at or above `self_index`
/// by one, so no rejection sampling is needed. Returns `None` when there is
/// no other member.
pub fn pick_peer<R: rand::Rng + ?Sized>(
    rng: &mut R,
    pool_len: usize,
    self_index: usize,
) -> Option<usize> {
    if pool_len < 2 || self_index >= pool_len {
        return None;
    }
    let draw = rng.gen_range(0..pool_len - 1);
    Some(if draw >= self_index { draw + 1 } else { draw })
}
