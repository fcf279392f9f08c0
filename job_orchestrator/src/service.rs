use chrono::{DateTime, Utc};
use persistence_layer::{JobRecord, JobStatus, PersistenceError, Requeue};
use pnl_core::TokenAggregate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{OrchestratorError, Pipeline, QueueManager, Result};

const MAX_PAGE_SIZE: u32 = 100;

/// Response to a start-analysis request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartAnalysisResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub is_incremental: bool,
    /// The completed job is up to date and its stored results are returned as is
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressView {
    pub processed: i64,
    pub total: i64,
    pub batch: i64,
}

/// Status of the latest job for a wallet. `status` is `not_found` when there is none.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatusView {
    pub status: String,
    pub job_id: Option<Uuid>,
    pub progress: Option<ProgressView>,
    pub summary: Option<serde_json::Value>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub elapsed_seconds: Option<i64>,
    pub error: Option<String>,
    pub is_incremental: bool,
    pub retry_count: i32,
}

impl JobStatusView {
    fn not_found() -> Self {
        Self {
            status: "not_found".to_string(),
            job_id: None,
            progress: None,
            summary: None,
            last_heartbeat: None,
            elapsed_seconds: None,
            error: None,
            is_incremental: false,
            retry_count: 0,
        }
    }
}

/// One token row with its averages recomputed from the stored sums.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenResultView {
    #[serde(flatten)]
    pub aggregate: TokenAggregate,
    pub average_purchase_price: Option<Decimal>,
    pub average_trade_price: Option<Decimal>,
    pub average_ath_price: Option<Decimal>,
    pub average_pct_change: Option<Decimal>,
}

impl From<TokenAggregate> for TokenResultView {
    fn from(aggregate: TokenAggregate) -> Self {
        Self {
            average_purchase_price: aggregate.average_purchase_price(),
            average_trade_price: aggregate.average_trade_price(),
            average_ath_price: aggregate.average_ath_price(),
            average_pct_change: aggregate.average_pct_change(),
            aggregate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaginationView {
    pub page: u32,
    pub page_size: u32,
    pub total_items: u64,
    pub total_pages: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResults {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub summary: Option<serde_json::Value>,
    pub tokens: Vec<TokenResultView>,
    pub pagination: PaginationView,
}

/// Base58 alphabet, 32 to 44 characters.
pub fn validate_wallet_address(address: &str) -> Result<()> {
    const BASE58: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

    if !(32..=44).contains(&address.len()) {
        return Err(OrchestratorError::InvalidWallet(format!(
            "{} (expected 32-44 characters, got {})",
            address,
            address.len()
        )));
    }
    if let Some(bad) = address.chars().find(|c| !BASE58.contains(*c)) {
        return Err(OrchestratorError::InvalidWallet(format!(
            "{} (character '{}' is not base58)",
            address, bad
        )));
    }
    Ok(())
}

/// The three job-control operations exposed to callers.
#[derive(Clone)]
pub struct JobService {
    pipeline: Pipeline,
    queue: Arc<QueueManager>,
}

impl JobService {
    pub fn new(pipeline: Pipeline, queue: Arc<QueueManager>) -> Self {
        Self { pipeline, queue }
    }

    /// Create, resume or re-scan the analysis of a wallet.
    pub async fn start_analysis(&self, wallet_address: &str, agent_id: &str) -> Result<StartAnalysisResponse> {
        validate_wallet_address(wallet_address)?;
        let jobs = &self.pipeline.stores.jobs;

        let Some(job) = jobs.latest_job_for_wallet(wallet_address).await? else {
            return self.create_job(wallet_address, agent_id).await;
        };

        match job.status {
            JobStatus::Pending => Ok(respond(&job, false)),
            JobStatus::Processing => {
                let now = Utc::now();
                let stale_before = now
                    - chrono::Duration::seconds(self.pipeline.config.queue.zombie_threshold_seconds as i64);
                if job.last_heartbeat.map_or(true, |hb| hb < stale_before) {
                    if let Some(reclaimed) = jobs.reclaim_zombie(job.id, stale_before, now).await? {
                        warn!(
                            "🧟 Reclaiming job {} for {} on request (retry {})",
                            reclaimed.id, wallet_address, reclaimed.retry_count
                        );
                        self.queue.launch(reclaimed.clone());
                        return Ok(respond(&reclaimed, false));
                    }
                }
                Ok(respond(&job, false))
            }
            JobStatus::Completed => {
                let newest = match self.pipeline.transaction_cache().newest_signature(wallet_address).await {
                    Ok(newest) => newest,
                    Err(e) => {
                        warn!("⚠️ Could not check {} for new activity: {}", wallet_address, e);
                        return Ok(respond(&job, true));
                    }
                };

                if newest.is_none() || newest == job.last_signature {
                    debug!("Job {} for {} is up to date", job.id, wallet_address);
                    return Ok(respond(&job, true));
                }

                match jobs.requeue_job(job.id, Requeue::Incremental).await? {
                    Some(requeued) => {
                        info!(
                            "New activity for {} (newest {:?}), queued incremental scan of job {}",
                            wallet_address, newest, requeued.id
                        );
                        self.queue.wake();
                        Ok(respond(&requeued, false))
                    }
                    None => self.current(job).await,
                }
            }
            JobStatus::Failed => match jobs.requeue_job(job.id, Requeue::Retry).await? {
                Some(requeued) => {
                    info!(
                        "Retrying failed job {} for {} (retry {})",
                        requeued.id, wallet_address, requeued.retry_count
                    );
                    self.queue.wake();
                    Ok(respond(&requeued, false))
                }
                None => self.current(job).await,
            },
        }
    }

    async fn create_job(&self, wallet_address: &str, agent_id: &str) -> Result<StartAnalysisResponse> {
        let job = JobRecord::new_pending(wallet_address, agent_id);
        match self.pipeline.stores.jobs.create_job(&job).await {
            Ok(()) => {
                info!("Created job {} for {}", job.id, wallet_address);
                self.queue.wake();
                Ok(respond(&job, false))
            }
            // Lost a race with a concurrent request for the same wallet
            Err(PersistenceError::ActiveJobExists(_)) => {
                let existing = self
                    .pipeline
                    .stores
                    .jobs
                    .latest_job_for_wallet(wallet_address)
                    .await?
                    .ok_or_else(|| OrchestratorError::JobExecution(format!("no job for {}", wallet_address)))?;
                Ok(respond(&existing, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-read a job whose state changed under us.
    async fn current(&self, job: JobRecord) -> Result<StartAnalysisResponse> {
        let latest = self.pipeline.stores.jobs.get_job(job.id).await?.unwrap_or(job);
        Ok(respond(&latest, latest.status == JobStatus::Completed))
    }

    pub async fn get_status(&self, wallet_address: &str) -> Result<JobStatusView> {
        let Some(job) = self.pipeline.stores.jobs.latest_job_for_wallet(wallet_address).await? else {
            return Ok(JobStatusView::not_found());
        };

        let started = job.started_at.unwrap_or(job.created_at);
        let until = job.completed_at.unwrap_or_else(Utc::now);

        Ok(JobStatusView {
            status: job.status.to_string(),
            job_id: Some(job.id),
            progress: Some(ProgressView {
                processed: job.processed_signatures,
                total: job.total_signatures,
                batch: job.current_batch,
            }),
            summary: job.current_results,
            last_heartbeat: job.last_heartbeat,
            elapsed_seconds: Some((until - started).num_seconds().max(0)),
            error: job.error,
            is_incremental: job.is_incremental,
            retry_count: job.retry_count,
        })
    }

    /// Per-token aggregates of the latest job, best PnL first. `None` when the wallet has no job.
    pub async fn get_results(
        &self,
        wallet_address: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Option<AnalysisResults>> {
        let Some(job) = self.pipeline.stores.jobs.latest_job_for_wallet(wallet_address).await? else {
            return Ok(None);
        };

        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let aggregates = self
            .pipeline
            .stores
            .aggregates
            .page_aggregates(job.id, page, page_size)
            .await?;

        Ok(Some(AnalysisResults {
            job_id: job.id,
            status: job.status,
            summary: job.current_results,
            tokens: aggregates.items.into_iter().map(TokenResultView::from).collect(),
            pagination: PaginationView {
                page,
                page_size,
                total_items: aggregates.total,
                total_pages: aggregates.total.div_ceil(page_size as u64),
            },
        }))
    }
}

fn respond(job: &JobRecord, cached: bool) -> StartAnalysisResponse {
    StartAnalysisResponse {
        job_id: job.id,
        status: job.status,
        is_incremental: job.is_incremental && job.status != JobStatus::Completed,
        cached,
    }
}
