//! JSON file wallet store
//!
//! The pool is kept as a pretty-printed array of `{address, privateKey}`
//! records and rewritten in full on every save.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use walletflood::{Account, AccountRecord, PoolStore, StoreError};

pub struct JsonPoolStore {
    path: PathBuf,
}

impl JsonPoolStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PoolStore for JsonPoolStore {
    async fn save(&self, accounts: &[Arc<Account>]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let records: Vec<AccountRecord> = accounts.iter().map(|a| a.to_record()).collect();
        let json = serde_json::to_string_pretty(&records)
            .map_err(|e| StoreError::Serialize(e.to_string()))?;

        // Replace via a sibling temp file
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!("[Store] Saved {} wallets to {}", records.len(), self.path.display());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<Account>, StoreError> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("[Store] No wallet store at {}, starting empty", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let records: Vec<AccountRecord> =
            serde_json::from_str(&data).map_err(|e| StoreError::Serialize(e.to_string()))?;
        let accounts = records
            .iter()
            .map(Account::from_record)
            .collect::<Result<Vec<_>, _>>()?;

        info!("[Store] Loaded {} wallets from {}", accounts.len(), self.path.display());
        Ok(accounts)
    }
}
