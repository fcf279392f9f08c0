use chrono::{Duration as ChronoDuration, Utc};
use config_manager::RetentionConfig;
use persistence_layer::JobStatus;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::Stores;

/// Rows removed by one sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub price_entries: u64,
    pub transactions: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.completed_jobs + self.failed_jobs + self.price_entries + self.transactions
    }
}

/// Periodic deletion of old terminal jobs and cache rows.
pub struct RetentionSweeper {
    stores: Stores,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(stores: Stores, config: RetentionConfig) -> Self {
        Self { stores, config }
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(self.config.sweep_interval_seconds.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }

    /// One sweep. A failing category is logged and the others still run.
    pub async fn sweep_once(&self) -> SweepReport {
        let now = Utc::now();
        let cutoff = |days: i64| now - ChronoDuration::days(days);
        let mut report = SweepReport::default();

        match self
            .stores
            .jobs
            .purge_jobs(JobStatus::Completed, cutoff(self.config.completed_job_days))
            .await
        {
            Ok(n) => report.completed_jobs = n,
            Err(e) => error!("Retention: purging completed jobs failed: {}", e),
        }

        match self
            .stores
            .jobs
            .purge_jobs(JobStatus::Failed, cutoff(self.config.failed_job_days))
            .await
        {
            Ok(n) => report.failed_jobs = n,
            Err(e) => error!("Retention: purging failed jobs failed: {}", e),
        }

        match self
            .stores
            .prices
            .purge_price_entries(cutoff(self.config.price_cache_days))
            .await
        {
            Ok(n) => report.price_entries = n,
            Err(e) => error!("Retention: purging price cache failed: {}", e),
        }

        match self
            .stores
            .transactions
            .purge_transactions(cutoff(self.config.transaction_cache_days))
            .await
        {
            Ok(n) => report.transactions = n,
            Err(e) => error!("Retention: purging transaction cache failed: {}", e),
        }

        if report.total() > 0 {
            info!("🧹 Retention sweep removed {:?}", report);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persistence_layer::{JobRecord, JobStore, MemoryStore, PriceCacheEntry, PriceCacheStore, TokenAggregateStore};
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn config() -> RetentionConfig {
        RetentionConfig {
            completed_job_days: 30,
            failed_job_days: 7,
            price_cache_days: 14,
            transaction_cache_days: 14,
            sweep_interval_seconds: 3600,
        }
    }

    fn terminal_job(status: JobStatus, days_ago: i64) -> JobRecord {
        let mut job = JobRecord::new_pending("wallet", "agent");
        job.status = status;
        job.completed_at = Some(Utc::now() - ChronoDuration::days(days_ago));
        job
    }

    fn price_entry(mint: &str, days_ago: i64) -> PriceCacheEntry {
        let at = Utc::now() - ChronoDuration::days(days_ago);
        PriceCacheEntry {
            mint: mint.to_string(),
            purchase_price: Decimal::ONE,
            purchase_timestamp: 0,
            current_price: Decimal::ONE,
            current_price_updated_at: at,
            ath_price: Decimal::ONE,
            ath_timestamp: 0,
            history: Vec::new(),
            updated_at: at,
        }
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_rows() {
        let store = Arc::new(MemoryStore::new());
        let old_completed = terminal_job(JobStatus::Completed, 31);
        let recent_completed = terminal_job(JobStatus::Completed, 29);
        let old_failed = terminal_job(JobStatus::Failed, 8);
        for job in [&old_completed, &recent_completed, &old_failed] {
            store.create_job(job).await.unwrap();
        }
        store.upsert_price_entry(&price_entry("OLD", 15)).await.unwrap();
        store.upsert_price_entry(&price_entry("NEW", 1)).await.unwrap();

        let sweeper = RetentionSweeper::new(Stores::from_backend(store.clone()), config());
        let report = sweeper.sweep_once().await;

        assert_eq!(report.completed_jobs, 1);
        assert_eq!(report.failed_jobs, 1);
        assert_eq!(report.price_entries, 1);
        assert!(store.get_job(old_completed.id).await.unwrap().is_none());
        assert!(store.get_job(old_failed.id).await.unwrap().is_none());
        assert!(store.get_job(recent_completed.id).await.unwrap().is_some());
        assert!(store.load_aggregates(old_completed.id).await.unwrap().is_empty());

        let prices = store
            .get_price_entries(&["OLD".to_string(), "NEW".to_string()])
            .await
            .unwrap();
        assert!(prices.contains_key("NEW"));
        assert!(!prices.contains_key("OLD"));

        // Nothing left to remove
        assert_eq!(sweeper.sweep_once().await.total(), 0);
    }
}
