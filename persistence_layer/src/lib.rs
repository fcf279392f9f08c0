use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pnl_core::{CachedTransaction, PricePoint, TokenAggregate, TokenMetadata};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub mod memory_store;
pub mod postgres_client;

pub use memory_store::MemoryStore;
pub use postgres_client::PostgresClient;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Pool creation error: {0}")]
    PoolCreation(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Job {0} not found")]
    JobNotFound(Uuid),
    #[error("Wallet {0} already has an active job")]
    ActiveJobExists(String),
    #[error("Job {0} is no longer owned by this worker")]
    LostOwnership(Uuid),
    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Lifecycle state of an analysis job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(PersistenceError::InvalidData(format!(
                "unknown job status '{}'",
                other
            ))),
        }
    }
}

/// One wallet analysis, from request to terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub id: Uuid,
    pub wallet_address: String,
    pub agent_id: String,
    pub status: JobStatus,
    /// Signatures listed by the source so far
    pub total_signatures: i64,
    /// Transactions decoded and merged so far
    pub processed_signatures: i64,
    pub current_batch: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the job reaches a terminal state, including failure
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Light summary JSON, refreshed every batch
    pub current_results: Option<serde_json::Value>,
    /// Newest signature covered by the last completed scan
    pub last_signature: Option<String>,
    /// Resume cursor: the oldest signature already processed by the running scan
    pub pagination_token: Option<String>,
    /// Newest signature seen by the running scan
    pub scan_head_signature: Option<String>,
    pub is_incremental: bool,
    pub error: Option<String>,
    pub retry_count: i32,
}

impl JobRecord {
    pub fn new_pending(wallet_address: &str, agent_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            wallet_address: wallet_address.to_string(),
            agent_id: agent_id.to_string(),
            status: JobStatus::Pending,
            total_signatures: 0,
            processed_signatures: 0,
            current_batch: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_heartbeat: None,
            current_results: None,
            last_signature: None,
            pagination_token: None,
            scan_head_signature: None,
            is_incremental: false,
            error: None,
            retry_count: 0,
        }
    }

    /// The job has checkpointed state a worker must restore before continuing.
    pub fn has_checkpoint(&self) -> bool {
        self.current_batch > 0 || self.is_incremental
    }
}

/// Everything one batch writes, committed atomically.
#[derive(Debug, Clone)]
pub struct BatchCheckpoint {
    pub job_id: Uuid,
    /// Retry count the worker was launched with; a reclaimed job rejects stale writers
    pub epoch: i32,
    /// Aggregates touched by this batch
    pub aggregates: Vec<TokenAggregate>,
    pub total_signatures: i64,
    pub processed_signatures: i64,
    pub current_batch: i64,
    pub summary: serde_json::Value,
    pub pagination_token: Option<String>,
    pub scan_head_signature: Option<String>,
    pub heartbeat: DateTime<Utc>,
}

/// Final write of a successful scan.
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub job_id: Uuid,
    pub epoch: i32,
    pub aggregates: Vec<TokenAggregate>,
    pub total_signatures: i64,
    pub processed_signatures: i64,
    pub current_batch: i64,
    pub summary: serde_json::Value,
    /// Newest signature covered; `None` keeps the previously stored one
    pub last_signature: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// How a terminal job goes back into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Completed job with newer on-chain activity
    Incremental,
    /// Failed job resuming from its last checkpoint
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatePage {
    pub items: Vec<TokenAggregate>,
    pub total: u64,
}

/// Cached price data for one mint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceCacheEntry {
    pub mint: String,
    pub purchase_price: Decimal,
    /// Earliest timestamp ever requested for this mint
    pub purchase_timestamp: i64,
    pub current_price: Decimal,
    pub current_price_updated_at: DateTime<Utc>,
    pub ath_price: Decimal,
    pub ath_timestamp: i64,
    /// Sorted by timestamp, no duplicates
    pub history: Vec<PricePoint>,
    pub updated_at: DateTime<Utc>,
}

/// Merge a freshly fetched entry into what is stored.
///
/// The earliest purchase point wins, the ATH only moves up, histories are unioned by
/// timestamp and the newest current price wins.
pub fn merge_price_entry(existing: Option<&PriceCacheEntry>, incoming: PriceCacheEntry) -> PriceCacheEntry {
    let Some(existing) = existing else {
        return incoming;
    };

    let mut merged = incoming.clone();

    if existing.purchase_timestamp <= incoming.purchase_timestamp {
        merged.purchase_timestamp = existing.purchase_timestamp;
        merged.purchase_price = existing.purchase_price;
    }

    if existing.ath_price >= incoming.ath_price {
        merged.ath_price = existing.ath_price;
        merged.ath_timestamp = existing.ath_timestamp;
    }

    if existing.current_price_updated_at > incoming.current_price_updated_at {
        merged.current_price = existing.current_price;
        merged.current_price_updated_at = existing.current_price_updated_at;
    }

    let mut by_ts: std::collections::BTreeMap<i64, Decimal> = existing
        .history
        .iter()
        .map(|p| (p.timestamp, p.price))
        .collect();
    for point in &incoming.history {
        by_ts.insert(point.timestamp, point.price);
    }
    merged.history = by_ts
        .into_iter()
        .map(|(timestamp, price)| PricePoint { timestamp, price })
        .collect();

    merged
}

/// Merge metadata so known values are never replaced by unknowns.
pub fn merge_metadata(existing: Option<&TokenMetadata>, incoming: &TokenMetadata) -> TokenMetadata {
    let existing = existing.cloned().unwrap_or_default();
    TokenMetadata {
        symbol: incoming.symbol.clone().or(existing.symbol),
        name: incoming.name.clone().or(existing.name),
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn health_check(&self) -> Result<()>;

    /// Insert a new job. Fails with `ActiveJobExists` if the wallet already has one.
    async fn create_job(&self, job: &JobRecord) -> Result<()>;
    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>>;
    /// Most recently created job for a wallet, in any state.
    async fn latest_job_for_wallet(&self, wallet_address: &str) -> Result<Option<JobRecord>>;

    async fn count_processing(&self) -> Result<u64>;
    /// Oldest pending jobs first.
    async fn list_pending(&self, limit: usize) -> Result<Vec<JobRecord>>;
    /// Processing jobs whose heartbeat is older than `stale_before`.
    async fn list_zombies(&self, stale_before: DateTime<Utc>) -> Result<Vec<JobRecord>>;

    /// `pending -> processing` if the job is still pending.
    async fn claim_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<JobRecord>>;
    /// Take over a processing job if its heartbeat is still older than `stale_before`.
    async fn reclaim_zombie(
        &self,
        id: Uuid,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>>;
    /// Put a terminal job back into `pending`.
    async fn requeue_job(&self, id: Uuid, mode: Requeue) -> Result<Option<JobRecord>>;

    /// Upsert the batch's aggregates and update the job row in one transaction.
    async fn commit_checkpoint(&self, checkpoint: &BatchCheckpoint) -> Result<()>;
    async fn complete_job(&self, completion: &JobCompletion) -> Result<()>;
    /// Refresh the heartbeat of a job still owned at `epoch`.
    async fn touch_heartbeat(&self, id: Uuid, epoch: i32, now: DateTime<Utc>) -> Result<()>;
    /// Mark an active job owned at `epoch` as failed.
    async fn fail_job(&self, id: Uuid, epoch: i32, error: &str) -> Result<()>;

    /// Delete jobs in `status` that reached it before `older_than`, with their aggregates.
    async fn purge_jobs(&self, status: JobStatus, older_than: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait TokenAggregateStore: Send + Sync {
    /// Every aggregate of a job, ordered by mint.
    async fn load_aggregates(&self, job_id: Uuid) -> Result<Vec<TokenAggregate>>;
    /// Aggregates ordered by total USD PnL descending, then mint.
    async fn page_aggregates(&self, job_id: Uuid, page: u32, page_size: u32) -> Result<AggregatePage>;
}

#[async_trait]
pub trait PriceCacheStore: Send + Sync {
    async fn get_price_entries(&self, mints: &[String]) -> Result<HashMap<String, PriceCacheEntry>>;
    /// Store an entry using [`merge_price_entry`] against what is already there.
    async fn upsert_price_entry(&self, entry: &PriceCacheEntry) -> Result<()>;
    /// Refresh only the current-price field of existing entries.
    async fn update_current_prices(
        &self,
        prices: &HashMap<String, Decimal>,
        at: DateTime<Utc>,
    ) -> Result<()>;
    async fn purge_price_entries(&self, older_than: DateTime<Utc>) -> Result<u64>;

    async fn get_metadata(&self, mints: &[String]) -> Result<HashMap<String, TokenMetadata>>;
    /// Store metadata using [`merge_metadata`].
    async fn upsert_metadata(&self, metadata: &HashMap<String, TokenMetadata>) -> Result<()>;
}

#[async_trait]
pub trait TransactionCacheStore: Send + Sync {
    async fn get_transactions(
        &self,
        wallet_address: &str,
        signatures: &[String],
    ) -> Result<HashMap<String, CachedTransaction>>;
    /// Insert decoded transactions; existing entries are left untouched.
    async fn store_transactions(&self, wallet_address: &str, transactions: &[CachedTransaction]) -> Result<()>;
    async fn purge_transactions(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry(purchase_ts: i64, ath: Decimal, updated: i64, history: &[(i64, Decimal)]) -> PriceCacheEntry {
        PriceCacheEntry {
            mint: "M".to_string(),
            purchase_price: history.first().map(|p| p.1).unwrap_or_default(),
            purchase_timestamp: purchase_ts,
            current_price: history.last().map(|p| p.1).unwrap_or_default(),
            current_price_updated_at: DateTime::from_timestamp(updated, 0).unwrap(),
            ath_price: ath,
            ath_timestamp: purchase_ts,
            history: history
                .iter()
                .map(|(timestamp, price)| PricePoint {
                    timestamp: *timestamp,
                    price: *price,
                })
                .collect(),
            updated_at: DateTime::from_timestamp(updated, 0).unwrap(),
        }
    }

    #[test]
    fn test_merge_keeps_earliest_purchase_and_highest_ath() {
        let stored = entry(100, dec!(9), 1_000, &[(100, dec!(1)), (200, dec!(9))]);
        let incoming = entry(150, dec!(5), 2_000, &[(150, dec!(2)), (300, dec!(5))]);
        let merged = merge_price_entry(Some(&stored), incoming);

        assert_eq!(merged.purchase_timestamp, 100);
        assert_eq!(merged.purchase_price, dec!(1));
        assert_eq!(merged.ath_price, dec!(9));
        assert_eq!(merged.current_price, dec!(5));
        let ts: Vec<i64> = merged.history.iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, vec![100, 150, 200, 300]);
    }

    #[test]
    fn test_merge_takes_earlier_purchase_and_strictly_higher_ath() {
        let stored = entry(100, dec!(5), 1_000, &[(100, dec!(2))]);
        let incoming = entry(50, dec!(6), 900, &[(50, dec!(1)), (100, dec!(2))]);
        let merged = merge_price_entry(Some(&stored), incoming);

        assert_eq!(merged.purchase_timestamp, 50);
        assert_eq!(merged.purchase_price, dec!(1));
        assert_eq!(merged.ath_price, dec!(6));
        // Stored current price is newer
        assert_eq!(merged.current_price_updated_at.timestamp(), 1_000);
    }

    #[test]
    fn test_metadata_never_overwritten_with_unknown() {
        let stored = TokenMetadata {
            symbol: Some("BONK".to_string()),
            name: None,
        };
        let incoming = TokenMetadata {
            symbol: None,
            name: Some("Bonk".to_string()),
        };
        let merged = merge_metadata(Some(&stored), &incoming);
        assert_eq!(merged.symbol.as_deref(), Some("BONK"));
        assert_eq!(merged.name.as_deref(), Some("Bonk"));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }
}
