use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pnl_core::{CachedTransaction, TokenAggregate, TokenMetadata};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    merge_metadata, merge_price_entry, AggregatePage, BatchCheckpoint, JobCompletion, JobRecord,
    JobStatus, JobStore, PersistenceError, PriceCacheEntry, PriceCacheStore, Requeue, Result,
    TokenAggregateStore, TransactionCacheStore,
};

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, JobRecord>,
    aggregates: HashMap<Uuid, BTreeMap<String, TokenAggregate>>,
    prices: HashMap<String, PriceCacheEntry>,
    metadata: HashMap<String, TokenMetadata>,
    transactions: HashMap<(String, String), (CachedTransaction, DateTime<Utc>)>,
}

impl State {
    fn has_active_job(&self, wallet_address: &str, except: Option<Uuid>) -> bool {
        self.jobs.values().any(|job| {
            job.wallet_address == wallet_address
                && job.status.is_active()
                && Some(job.id) != except
        })
    }

    fn owned_job(&mut self, id: Uuid, epoch: i32) -> Result<&mut JobRecord> {
        match self.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Processing && job.retry_count == epoch => Ok(job),
            _ => Err(PersistenceError::LostOwnership(id)),
        }
    }

    fn upsert_aggregates(&mut self, job_id: Uuid, aggregates: &[TokenAggregate]) {
        let book = self.aggregates.entry(job_id).or_default();
        for agg in aggregates {
            let mut agg = agg.clone();
            if let Some(existing) = book.get(&agg.mint) {
                if agg.symbol.is_none() {
                    agg.symbol = existing.symbol.clone();
                }
                if agg.name.is_none() {
                    agg.name = existing.name.clone();
                }
            }
            book.insert(agg.mint.clone(), agg);
        }
    }
}

/// In-process store with the same semantics as [`crate::PostgresClient`].
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached price entries.
    pub async fn price_entry_count(&self) -> usize {
        self.state.read().await.prices.len()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn create_job(&self, job: &JobRecord) -> Result<()> {
        let mut state = self.state.write().await;
        if job.status.is_active() && state.has_active_job(&job.wallet_address, None) {
            return Err(PersistenceError::ActiveJobExists(job.wallet_address.clone()));
        }
        if state.jobs.contains_key(&job.id) {
            return Err(PersistenceError::InvalidData(format!("duplicate job id {}", job.id)));
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn latest_job_for_wallet(&self, wallet_address: &str) -> Result<Option<JobRecord>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.wallet_address == wallet_address)
            .max_by_key(|job| job.created_at)
            .cloned())
    }

    async fn count_processing(&self) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Processing)
            .count() as u64)
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let state = self.state.read().await;
        let mut pending: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn list_zombies(&self, stale_before: DateTime<Utc>) -> Result<Vec<JobRecord>> {
        let state = self.state.read().await;
        let mut zombies: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Processing
                    && job.last_heartbeat.map_or(true, |hb| hb < stale_before)
            })
            .cloned()
            .collect();
        zombies.sort_by_key(|job| job.created_at);
        Ok(zombies)
    }

    async fn claim_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Processing;
                job.started_at = Some(now);
                job.last_heartbeat = Some(now);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn reclaim_zombie(
        &self,
        id: Uuid,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&id) {
            Some(job)
                if job.status == JobStatus::Processing
                    && job.last_heartbeat.map_or(true, |hb| hb < stale_before) =>
            {
                job.retry_count += 1;
                job.last_heartbeat = Some(now);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn requeue_job(&self, id: Uuid, mode: Requeue) -> Result<Option<JobRecord>> {
        let mut state = self.state.write().await;
        let Some(wallet) = state.jobs.get(&id).map(|job| job.wallet_address.clone()) else {
            return Ok(None);
        };
        if state.has_active_job(&wallet, Some(id)) {
            return Err(PersistenceError::InvalidData(format!(
                "job {} cannot be requeued while another job is active",
                id
            )));
        }

        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        match (mode, job.status) {
            (Requeue::Incremental, JobStatus::Completed) => {
                job.is_incremental = true;
                job.current_batch = 0;
                job.pagination_token = None;
                job.scan_head_signature = None;
            }
            (Requeue::Retry, JobStatus::Failed) => {
                job.retry_count += 1;
            }
            _ => return Ok(None),
        }
        job.status = JobStatus::Pending;
        job.error = None;
        job.completed_at = None;
        job.last_heartbeat = None;
        Ok(Some(job.clone()))
    }

    async fn commit_checkpoint(&self, checkpoint: &BatchCheckpoint) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state.owned_job(checkpoint.job_id, checkpoint.epoch)?;

        job.total_signatures = checkpoint.total_signatures;
        job.processed_signatures = checkpoint.processed_signatures;
        job.current_batch = checkpoint.current_batch;
        job.current_results = Some(checkpoint.summary.clone());
        job.pagination_token = checkpoint.pagination_token.clone();
        if job.scan_head_signature.is_none() {
            job.scan_head_signature = checkpoint.scan_head_signature.clone();
        }
        job.last_heartbeat = Some(checkpoint.heartbeat);

        state.upsert_aggregates(checkpoint.job_id, &checkpoint.aggregates);
        Ok(())
    }

    async fn complete_job(&self, completion: &JobCompletion) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state.owned_job(completion.job_id, completion.epoch)?;

        job.status = JobStatus::Completed;
        job.total_signatures = completion.total_signatures;
        job.processed_signatures = completion.processed_signatures;
        job.current_batch = completion.current_batch;
        job.current_results = Some(completion.summary.clone());
        if completion.last_signature.is_some() {
            job.last_signature = completion.last_signature.clone();
        }
        job.pagination_token = None;
        job.scan_head_signature = None;
        job.completed_at = Some(completion.completed_at);
        job.last_heartbeat = Some(completion.completed_at);
        job.error = None;

        state.upsert_aggregates(completion.job_id, &completion.aggregates);
        Ok(())
    }

    async fn touch_heartbeat(&self, id: Uuid, epoch: i32, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        state.owned_job(id, epoch)?.last_heartbeat = Some(now);
        Ok(())
    }

    async fn fail_job(&self, id: Uuid, epoch: i32, error: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or(PersistenceError::JobNotFound(id))?;
        if !job.status.is_active() || job.retry_count != epoch {
            return Err(PersistenceError::LostOwnership(id));
        }
        job.status = JobStatus::Failed;
        job.error = Some(error.to_string());
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn purge_jobs(&self, status: JobStatus, older_than: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let expired: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|job| job.status == status && job.completed_at.map_or(false, |at| at < older_than))
            .map(|job| job.id)
            .collect();
        for id in &expired {
            state.jobs.remove(id);
            state.aggregates.remove(id);
        }
        Ok(expired.len() as u64)
    }
}

#[async_trait]
impl TokenAggregateStore for MemoryStore {
    async fn load_aggregates(&self, job_id: Uuid) -> Result<Vec<TokenAggregate>> {
        let state = self.state.read().await;
        Ok(state
            .aggregates
            .get(&job_id)
            .map(|book| book.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn page_aggregates(&self, job_id: Uuid, page: u32, page_size: u32) -> Result<AggregatePage> {
        let mut all = self.load_aggregates(job_id).await?;
        all.sort_by(|a, b| {
            b.total_pnl_usd
                .cmp(&a.total_pnl_usd)
                .then_with(|| a.mint.cmp(&b.mint))
        });
        let total = all.len() as u64;
        let offset = (page.max(1) as usize - 1) * page_size as usize;
        let items = all.into_iter().skip(offset).take(page_size as usize).collect();
        Ok(AggregatePage { items, total })
    }
}

#[async_trait]
impl PriceCacheStore for MemoryStore {
    async fn get_price_entries(&self, mints: &[String]) -> Result<HashMap<String, PriceCacheEntry>> {
        let state = self.state.read().await;
        Ok(mints
            .iter()
            .filter_map(|mint| state.prices.get(mint).map(|e| (mint.clone(), e.clone())))
            .collect())
    }

    async fn upsert_price_entry(&self, entry: &PriceCacheEntry) -> Result<()> {
        let mut state = self.state.write().await;
        let merged = merge_price_entry(state.prices.get(&entry.mint), entry.clone());
        state.prices.insert(merged.mint.clone(), merged);
        Ok(())
    }

    async fn update_current_prices(
        &self,
        prices: &HashMap<String, Decimal>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        for (mint, price) in prices {
            if let Some(entry) = state.prices.get_mut(mint) {
                entry.current_price = *price;
                entry.current_price_updated_at = at;
                entry.updated_at = at;
            }
        }
        Ok(())
    }

    async fn purge_price_entries(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let before = state.prices.len();
        state.prices.retain(|_, entry| entry.updated_at >= older_than);
        Ok((before - state.prices.len()) as u64)
    }

    async fn get_metadata(&self, mints: &[String]) -> Result<HashMap<String, TokenMetadata>> {
        let state = self.state.read().await;
        Ok(mints
            .iter()
            .filter_map(|mint| state.metadata.get(mint).map(|m| (mint.clone(), m.clone())))
            .collect())
    }

    async fn upsert_metadata(&self, metadata: &HashMap<String, TokenMetadata>) -> Result<()> {
        let mut state = self.state.write().await;
        for (mint, incoming) in metadata {
            let merged = merge_metadata(state.metadata.get(mint), incoming);
            state.metadata.insert(mint.clone(), merged);
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionCacheStore for MemoryStore {
    async fn get_transactions(
        &self,
        wallet_address: &str,
        signatures: &[String],
    ) -> Result<HashMap<String, CachedTransaction>> {
        let state = self.state.read().await;
        Ok(signatures
            .iter()
            .filter_map(|sig| {
                state
                    .transactions
                    .get(&(wallet_address.to_string(), sig.clone()))
                    .map(|(tx, _)| (sig.clone(), tx.clone()))
            })
            .collect())
    }

    async fn store_transactions(&self, wallet_address: &str, transactions: &[CachedTransaction]) -> Result<()> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        for tx in transactions {
            state
                .transactions
                .entry((wallet_address.to_string(), tx.signature.clone()))
                .or_insert_with(|| (tx.clone(), now));
        }
        Ok(())
    }

    async fn purge_transactions(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let before = state.transactions.len();
        state.transactions.retain(|_, (_, cached_at)| *cached_at >= older_than);
        Ok((before - state.transactions.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn aggregate(mint: &str, pnl: Decimal) -> TokenAggregate {
        let mut agg = TokenAggregate::new(mint);
        agg.total_pnl_usd = pnl;
        agg.trade_count = 1;
        agg
    }

    async fn processing_job(store: &MemoryStore, wallet: &str) -> JobRecord {
        let job = JobRecord::new_pending(wallet, "agent");
        store.create_job(&job).await.unwrap();
        store.claim_job(job.id, Utc::now()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_one_active_job_per_wallet() {
        let store = MemoryStore::new();
        store.create_job(&JobRecord::new_pending("W", "a")).await.unwrap();
        let err = store.create_job(&JobRecord::new_pending("W", "a")).await;
        assert!(matches!(err, Err(PersistenceError::ActiveJobExists(_))));
        store.create_job(&JobRecord::new_pending("X", "a")).await.unwrap();
    }

    #[tokio::test]
    async fn test_claim_is_conditional() {
        let store = MemoryStore::new();
        let job = JobRecord::new_pending("W", "a");
        store.create_job(&job).await.unwrap();

        assert!(store.claim_job(job.id, Utc::now()).await.unwrap().is_some());
        assert!(store.claim_job(job.id, Utc::now()).await.unwrap().is_none());
        assert_eq!(store.count_processing().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_zombie_reclaim_bumps_retry_once() {
        let store = MemoryStore::new();
        let job = processing_job(&store, "W").await;
        let later = Utc::now() + Duration::minutes(5);
        let stale_before = later - Duration::minutes(2);

        let reclaimed = store.reclaim_zombie(job.id, stale_before, later).await.unwrap().unwrap();
        assert_eq!(reclaimed.retry_count, 1);
        // Heartbeat is fresh now, a second pass must not reclaim again
        assert!(store.reclaim_zombie(job.id, stale_before, later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_writer_is_fenced_off() {
        let store = MemoryStore::new();
        let job = processing_job(&store, "W").await;
        let later = Utc::now() + Duration::minutes(5);
        store
            .reclaim_zombie(job.id, later - Duration::minutes(2), later)
            .await
            .unwrap()
            .unwrap();

        let checkpoint = BatchCheckpoint {
            job_id: job.id,
            epoch: job.retry_count,
            aggregates: vec![aggregate("A", dec!(1))],
            total_signatures: 1,
            processed_signatures: 1,
            current_batch: 1,
            summary: serde_json::json!({}),
            pagination_token: Some("sig".to_string()),
            scan_head_signature: Some("sig".to_string()),
            heartbeat: Utc::now(),
        };
        let err = store.commit_checkpoint(&checkpoint).await;
        assert!(matches!(err, Err(PersistenceError::LostOwnership(_))));
        assert!(store.load_aggregates(job.id).await.unwrap().is_empty());

        let err = store.fail_job(job.id, job.retry_count, "late").await;
        assert!(matches!(err, Err(PersistenceError::LostOwnership(_))));
        let current = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(current.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_pages_ordered_by_pnl() {
        let store = MemoryStore::new();
        let job = processing_job(&store, "W").await;
        let checkpoint = BatchCheckpoint {
            job_id: job.id,
            epoch: job.retry_count,
            aggregates: vec![
                aggregate("A", dec!(1)),
                aggregate("B", dec!(5)),
                aggregate("C", dec!(-3)),
            ],
            total_signatures: 3,
            processed_signatures: 3,
            current_batch: 1,
            summary: serde_json::json!({}),
            pagination_token: None,
            scan_head_signature: None,
            heartbeat: Utc::now(),
        };
        store.commit_checkpoint(&checkpoint).await.unwrap();

        let first = store.page_aggregates(job.id, 1, 2).await.unwrap();
        let mints: Vec<&str> = first.items.iter().map(|a| a.mint.as_str()).collect();
        assert_eq!(mints, vec!["B", "A"]);
        assert_eq!(first.total, 3);
        let second = store.page_aggregates(job.id, 2, 2).await.unwrap();
        assert_eq!(second.items[0].mint, "C");
    }

    #[tokio::test]
    async fn test_purge_removes_aggregates() {
        let store = MemoryStore::new();
        let job = processing_job(&store, "W").await;
        store.fail_job(job.id, 0, "boom").await.unwrap();

        let removed = store
            .purge_jobs(JobStatus::Failed, Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_job(job.id).await.unwrap().is_none());
        assert_eq!(store.purge_jobs(JobStatus::Completed, Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_requeue_modes() {
        let store = MemoryStore::new();
        let job = processing_job(&store, "W").await;
        store.fail_job(job.id, 0, "boom").await.unwrap();

        assert!(store.requeue_job(job.id, Requeue::Incremental).await.unwrap().is_none());
        let retried = store.requeue_job(job.id, Requeue::Retry).await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.error.is_none());
    }
}
