//! Database module for the dispatch journal
//!
//! Uses SQLite via sqlx. Every terminal dispatch outcome becomes one row.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use walletflood::DispatchOutcome;

/// Outcome status stored in the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Submitted without waiting for a receipt
    Submitted = 0,
    /// Mined with the requested confirmation depth
    Confirmed = 1,
    /// Gave up after a terminal error
    Failed = 2,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Submitted => "submitted",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Failed => "failed",
        }
    }

    pub fn of(outcome: &DispatchOutcome) -> Self {
        if outcome.error.is_some() {
            TxStatus::Failed
        } else if outcome.receipt.is_some() {
            TxStatus::Confirmed
        } else {
            TxStatus::Submitted
        }
    }
}

/// Initialize the database and create tables
pub async fn init_db(db_path: &Path) -> Result<Pool<Sqlite>, sqlx::Error> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    // Create database file if it doesn't exist
    if !db_path.exists() {
        std::fs::File::create(db_path)?;
    }

    let db_url = format!("sqlite:{}", db_path.display());

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await?;

    create_schema(&pool).await?;
    Ok(pool)
}

async fn create_schema(pool: &Pool<Sqlite>) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dispatch_journal (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tx_hash TEXT,
            purpose TEXT NOT NULL,
            sender TEXT NOT NULL,
            recipient TEXT NOT NULL,
            nonce INTEGER,
            value_wei TEXT NOT NULL,
            gas_price_wei TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            status INTEGER NOT NULL,
            error_kind TEXT,
            error_message TEXT,
            block_number INTEGER,
            recorded_at INTEGER NOT NULL
        )
    "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for common queries
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_dispatch_journal_recorded_at ON dispatch_journal(recorded_at)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_dispatch_journal_sender ON dispatch_journal(sender)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_dispatch_journal_status ON dispatch_journal(status)")
        .execute(pool)
        .await?;

    Ok(())
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Insert one outcome
pub async fn insert_outcome(
    pool: &Pool<Sqlite>,
    outcome: &DispatchOutcome,
    recorded_at: i64,
) -> Result<i64, sqlx::Error> {
    let (error_kind, error_message) = match &outcome.error {
        Some(failure) => (
            Some(failure.kind.as_str()),
            Some(failure.error.to_string()),
        ),
        None => (None, None),
    };

    let result = sqlx::query(
        r#"
        INSERT INTO dispatch_journal (
            tx_hash, purpose, sender, recipient, nonce, value_wei, gas_price_wei,
            attempts, status, error_kind, error_message, block_number, recorded_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    "#,
    )
    .bind(outcome.tx_hash.map(|h| h.to_string()))
    .bind(outcome.purpose.as_str())
    .bind(outcome.sender.to_string())
    .bind(outcome.recipient.to_string())
    .bind(outcome.nonce.map(|n| n as i64))
    .bind(outcome.value.to_string())
    .bind(outcome.gas_price.to_string())
    .bind(outcome.attempts as i64)
    .bind(TxStatus::of(outcome) as i32)
    .bind(error_kind)
    .bind(error_message)
    .bind(outcome.receipt.as_ref().map(|r| r.block_number as i64))
    .bind(recorded_at)
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Drain `rx` into the journal until every sender is dropped
pub async fn run_journal(pool: Pool<Sqlite>, mut rx: mpsc::Receiver<DispatchOutcome>) -> u64 {
    info!("[Journal] Started");
    let mut written = 0u64;
    let mut failed = 0u64;

    while let Some(outcome) = rx.recv().await {
        match insert_outcome(&pool, &outcome, now_unix()).await {
            Ok(id) => {
                written += 1;
                debug!(
                    "[Journal] #{} {} {} -> {} {}",
                    id,
                    outcome.purpose,
                    outcome.sender,
                    outcome.recipient,
                    TxStatus::of(&outcome).as_str()
                );
            }
            Err(e) => {
                failed += 1;
                error!(
                    "[Journal] Failed to record {} from {}: {}",
                    outcome.purpose, outcome.sender, e
                );
            }
        }
    }

    info!("[Journal] Stopped | {} recorded, {} failed", written, failed);
    written
}

/// Get journal totals since a unix timestamp
pub async fn get_stats(pool: &Pool<Sqlite>, since_timestamp: i64) -> Result<JournalStats, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) as total_count,
            SUM(CASE WHEN status = 1 THEN 1 ELSE 0 END) as confirmed_count,
            SUM(CASE WHEN status = 0 THEN 1 ELSE 0 END) as submitted_count,
            SUM(CASE WHEN status = 2 THEN 1 ELSE 0 END) as failed_count,
            SUM(CASE WHEN purpose = 'funding' THEN 1 ELSE 0 END) as funding_count,
            SUM(CASE WHEN purpose = 'transfer' THEN 1 ELSE 0 END) as transfer_count,
            SUM(CASE WHEN purpose = 'blast' THEN 1 ELSE 0 END) as blast_count,
            SUM(attempts) as total_attempts
        FROM dispatch_journal
        WHERE recorded_at >= ?
        "#,
    )
    .bind(since_timestamp)
    .fetch_one(pool)
    .await?;

    use sqlx::Row;
    let count = |name: &str| row.get::<Option<i64>, _>(name).unwrap_or(0) as u64;
    Ok(JournalStats {
        total_count: row.get::<i64, _>("total_count") as u64,
        confirmed_count: count("confirmed_count"),
        submitted_count: count("submitted_count"),
        failed_count: count("failed_count"),
        funding_count: count("funding_count"),
        transfer_count: count("transfer_count"),
        blast_count: count("blast_count"),
        total_attempts: count("total_attempts"),
    })
}

/// Failure counts grouped by error kind since a unix timestamp
pub async fn get_error_breakdown(
    pool: &Pool<Sqlite>,
    since_timestamp: i64,
) -> Result<Vec<(String, u64)>, sqlx::Error> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT error_kind, COUNT(*) as count
        FROM dispatch_journal
        WHERE recorded_at >= ? AND error_kind IS NOT NULL
        GROUP BY error_kind
        ORDER BY count DESC
        "#,
    )
    .bind(since_timestamp)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(kind, count)| (kind, count as u64)).collect())
}

/// Journal statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalStats {
    pub total_count: u64,
    pub confirmed_count: u64,
    pub submitted_count: u64,
    pub failed_count: u64,
    pub funding_count: u64,
    pub transfer_count: u64,
    pub blast_count: u64,
    pub total_attempts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    use alloy::primitives::{TxHash, U256};
    use walletflood::{Account, ChainError, ErrorKind, Purpose, Receipt, SendFailure};

    async fn memory_pool() -> Pool<Sqlite> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        create_schema(&pool).await.unwrap();
        pool
    }

    fn outcome(purpose: Purpose, error: Option<SendFailure>) -> DispatchOutcome {
        DispatchOutcome {
            purpose,
            sender: Account::random().address(),
            recipient: Account::random().address(),
            value: U256::from(1_000u64),
            nonce: Some(7),
            tx_hash: Some(TxHash::repeat_byte(0x11)),
            receipt: error.is_none().then(|| Receipt {
                tx_hash: TxHash::repeat_byte(0x11),
                block_number: 42,
                success: true,
                gas_used: 21_000,
            }),
            error,
            attempts: 1,
            gas_price: 11_000_000_000,
        }
    }

    #[test]
    fn test_status_of_outcome() {
        assert_eq!(TxStatus::of(&outcome(Purpose::Funding, None)), TxStatus::Confirmed);

        let mut submitted = outcome(Purpose::Blast, None);
        submitted.receipt = None;
        assert_eq!(TxStatus::of(&submitted), TxStatus::Submitted);

        let failed = outcome(
            Purpose::Transfer,
            Some(SendFailure {
                kind: ErrorKind::Underpriced,
                error: ChainError::rpc("transaction underpriced"),
            }),
        );
        assert_eq!(TxStatus::of(&failed), TxStatus::Failed);
        assert_eq!(TxStatus::Failed.as_str(), "failed");
    }

    #[tokio::test]
    async fn test_journal_task_records_outcomes() {
        let pool = memory_pool().await;
        let (tx, rx) = mpsc::channel(16);
        let journal = tokio::spawn(run_journal(pool.clone(), rx));

        tx.send(outcome(Purpose::Funding, None)).await.unwrap();
        tx.send(outcome(Purpose::Transfer, None)).await.unwrap();
        tx.send(outcome(
            Purpose::Transfer,
            Some(SendFailure {
                kind: ErrorKind::InsufficientFunds,
                error: ChainError::rpc("insufficient funds for gas * price + value"),
            }),
        ))
        .await
        .unwrap();
        drop(tx);

        assert_eq!(journal.await.unwrap(), 3);

        let stats = get_stats(&pool, 0).await.unwrap();
        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.confirmed_count, 2);
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.funding_count, 1);
        assert_eq!(stats.transfer_count, 2);
        assert_eq!(stats.total_attempts, 3);

        let breakdown = get_error_breakdown(&pool, 0).await.unwrap();
        assert_eq!(breakdown, vec![("insufficient_funds".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_stats_respect_since() {
        let pool = memory_pool().await;
        insert_outcome(&pool, &outcome(Purpose::Blast, None), 100).await.unwrap();
        insert_outcome(&pool, &outcome(Purpose::Blast, None), 200).await.unwrap();

        assert_eq!(get_stats(&pool, 150).await.unwrap().total_count, 1);
        assert_eq!(get_stats(&pool, 500).await.unwrap(), JournalStats::default());
    }
}
