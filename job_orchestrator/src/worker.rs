use chrono::Utc;
use persistence_layer::{BatchCheckpoint, JobCompletion, JobRecord, PersistenceError};
use pnl_core::{
    decimal_from_f64, hour_bucket, AggregateBook, CachedTransaction, LightSummary, PriceAnalysis,
    PriceKey, SanityBounds, TokenMetadata,
};
use price_client::{PriceRequest, PriceResolver};
use rate_limiter::{optimal_batch_size, recommended_timeout};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tracing::{debug, error, info, warn};
use tx_parser::{TransactionCache, TransactionPage};
use uuid::Uuid;

use crate::{OrchestratorError, Pipeline, Result};

/// How a worker run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
    /// Another worker owns the job now; nothing was written
    Abandoned,
}

/// Progress of one scan, rebuilt from the job record on every launch.
struct ScanState {
    job_id: Uuid,
    epoch: i32,
    wallet_address: String,
    book: AggregateBook,
    nft_count: u64,
    /// Summary before an incremental scan started
    prior: Option<LightSummary>,
    total_signatures: i64,
    processed_signatures: i64,
    current_batch: i64,
    cursor: Option<String>,
    scan_head: Option<String>,
    /// Where an incremental scan stops
    stop_at: Option<StopMarker>,
}

/// Head of the previous scan. The block time, when the transaction cache still holds it,
/// bounds the scan if the signature itself is no longer listed by the source.
#[derive(Debug, Clone)]
struct StopMarker {
    signature: String,
    block_time: Option<i64>,
}

impl ScanState {
    fn summary(&self) -> Result<serde_json::Value> {
        let mut summary = LightSummary::derive(&self.book, self.nft_count);
        if let Some(prior) = &self.prior {
            summary.preserve_full_scan_metrics(prior);
        }
        Ok(summary.to_json()?)
    }
}

/// Transactions of `page` strictly newer than the previous scan head, how many signatures
/// that covers, and whether the head was reached.
fn cut_at_known(page: TransactionPage, stop_at: Option<&StopMarker>) -> (Vec<CachedTransaction>, usize, bool) {
    let boundary = stop_at.and_then(|stop| {
        page.signatures
            .iter()
            .position(|sig| *sig == stop.signature)
            .or_else(|| {
                let head_time = stop.block_time?;
                let older = page.transactions.iter().find(|tx| tx.block_time <= head_time)?;
                page.signatures.iter().position(|sig| *sig == older.signature)
            })
    });
    match boundary {
        None => (page.transactions, page.signatures.len(), false),
        Some(position) => {
            let newer: HashSet<&String> = page.signatures[..position].iter().collect();
            let transactions = page
                .transactions
                .into_iter()
                .filter(|tx| newer.contains(&tx.signature))
                .collect();
            (transactions, position, true)
        }
    }
}

/// Drives one job from its last checkpoint to `completed` or `failed`.
#[derive(Clone)]
pub struct AnalysisWorker {
    pipeline: Pipeline,
}

impl AnalysisWorker {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    /// Run a claimed job. Errors are recorded on the job, never returned.
    pub async fn run(&self, job: JobRecord) -> JobOutcome {
        let job_id = job.id;
        let epoch = job.retry_count;
        let wallet_address = job.wallet_address.clone();

        match self.process(job).await {
            Ok(()) => JobOutcome::Completed,
            Err(OrchestratorError::LostOwnership(_)) => {
                warn!("⚠️ Job {} for {} was reclaimed, abandoning this run", job_id, wallet_address);
                JobOutcome::Abandoned
            }
            Err(e) => {
                let message = e.to_string();
                error!("❌ Job {} for {} failed: {}", job_id, wallet_address, message);
                match self.pipeline.stores.jobs.fail_job(job_id, epoch, &message).await {
                    Ok(()) => JobOutcome::Failed(message),
                    Err(PersistenceError::LostOwnership(_)) => JobOutcome::Abandoned,
                    Err(store_err) => {
                        error!("Could not record failure of job {}: {}", job_id, store_err);
                        JobOutcome::Failed(message)
                    }
                }
            }
        }
    }

    async fn process(&self, job: JobRecord) -> Result<()> {
        let config = &self.pipeline.config;
        let analysis = &config.analysis;
        let jobs = &self.pipeline.stores.jobs;

        let cache = self.pipeline.transaction_cache();
        let resolver = self.pipeline.price_resolver();
        let mut state = self.restore(&job, &cache).await?;

        info!(
            "▶️ Starting {} scan for {} (job {}, batch {}, retry {})",
            if job.is_incremental { "incremental" } else { "full" },
            state.wallet_address,
            state.job_id,
            state.current_batch,
            state.epoch
        );

        let defaults = SanityBounds::default();
        let bounds = SanityBounds {
            max_price_usd: decimal_from_f64(analysis.max_price_usd).unwrap_or(defaults.max_price_usd),
            max_trade_pnl_usd: decimal_from_f64(analysis.max_trade_pnl_usd)
                .unwrap_or(defaults.max_trade_pnl_usd),
        };
        let mut consecutive_empty = 0u32;

        loop {
            let batch_size = self.batch_size();
            let expected_calls = (batch_size as f64 * analysis.calls_per_transaction).ceil() as usize;
            let fetch_timeout = recommended_timeout(
                expected_calls,
                self.pipeline.transaction_load.get(),
                &config.transaction_provider,
                analysis,
            );

            let fetched = timeout(
                fetch_timeout,
                self.with_heartbeat(
                    state.job_id,
                    state.epoch,
                    cache.fetch_page(&state.wallet_address, batch_size, state.cursor.as_deref()),
                ),
            )
            .await
            .map_err(|_| {
                OrchestratorError::Timeout(format!(
                    "batch {} fetch exceeded {}s",
                    state.current_batch + 1,
                    fetch_timeout.as_secs()
                ))
            })?;
            let page = fetched??;
            jobs.touch_heartbeat(state.job_id, state.epoch, Utc::now()).await?;

            if page.signatures.is_empty() {
                debug!("No more signatures for {}", state.wallet_address);
                break;
            }

            if state.scan_head.is_none() {
                state.scan_head = page.signatures.first().cloned();
            }
            let next_cursor = page
                .next_cursor
                .clone()
                .or_else(|| page.signatures.last().cloned());
            let has_more = page.has_more;
            let (transactions, new_signatures, reached_known) =
                cut_at_known(page, state.stop_at.as_ref());

            if transactions.is_empty() && !reached_known {
                consecutive_empty += 1;
                warn!(
                    "⚠️ Empty batch {} for {} ({} in a row)",
                    state.current_batch + 1,
                    state.wallet_address,
                    consecutive_empty
                );
                if consecutive_empty >= analysis.max_consecutive_empty_batches {
                    return Err(OrchestratorError::Stalled(format!(
                        "{} consecutive batches returned no transactions",
                        consecutive_empty
                    )));
                }
            } else {
                consecutive_empty = 0;
            }

            let (metadata, analyses) = self
                .with_heartbeat(state.job_id, state.epoch, async {
                    let metadata = self.resolve_metadata(&cache, &state.book, &transactions).await?;
                    let analyses = self.resolve_prices(&resolver, &transactions).await?;
                    Ok::<_, OrchestratorError>((metadata, analyses))
                })
                .await??;
            jobs.touch_heartbeat(state.job_id, state.epoch, Utc::now()).await?;

            for tx in &transactions {
                let outcome = state.book.apply_transaction(
                    tx,
                    &analyses,
                    analysis.hour_bucket_seconds,
                    &bounds,
                );
                if outcome.discarded > 0 {
                    debug!("{}: {} trades discarded as outliers", tx.signature, outcome.discarded);
                }
            }
            state.book.apply_metadata(&metadata);

            state.total_signatures += new_signatures as i64;
            state.processed_signatures += transactions.len() as i64;
            state.current_batch += 1;
            state.cursor = next_cursor;

            let checkpoint = BatchCheckpoint {
                job_id: state.job_id,
                epoch: state.epoch,
                aggregates: state.book.take_dirty(),
                total_signatures: state.total_signatures,
                processed_signatures: state.processed_signatures,
                current_batch: state.current_batch,
                summary: state.summary()?,
                pagination_token: state.cursor.clone(),
                scan_head_signature: state.scan_head.clone(),
                heartbeat: Utc::now(),
            };
            jobs.commit_checkpoint(&checkpoint).await?;

            debug!(
                "Job {} batch {}: {} transactions, {} priced keys, {} tokens so far",
                state.job_id,
                state.current_batch,
                transactions.len(),
                analyses.len(),
                state.book.len()
            );

            if reached_known || !has_more {
                break;
            }
            if analysis.inter_batch_pause_ms > 0 {
                sleep(Duration::from_millis(analysis.inter_batch_pause_ms)).await;
            }
        }

        if state.processed_signatures == 0 && state.current_batch > 1 {
            return Err(OrchestratorError::Stalled(format!(
                "no transactions processed across {} batches",
                state.current_batch
            )));
        }

        let completion = JobCompletion {
            job_id: state.job_id,
            epoch: state.epoch,
            aggregates: state.book.take_dirty(),
            total_signatures: state.total_signatures,
            processed_signatures: state.processed_signatures,
            current_batch: state.current_batch,
            summary: state.summary()?,
            last_signature: state.scan_head.clone(),
            completed_at: Utc::now(),
        };
        jobs.complete_job(&completion).await?;

        let counters = state.book.counters();
        info!(
            "✅ Job {} for {} completed: {} transactions, {} trades ({} discarded), {} tokens",
            state.job_id,
            state.wallet_address,
            state.processed_signatures,
            counters.total_trades,
            counters.discarded_trades,
            state.book.len()
        );
        Ok(())
    }

    /// Rebuild scan state from the job record and, when it has progress, from its
    /// persisted aggregates and last summary.
    async fn restore(&self, job: &JobRecord, cache: &TransactionCache) -> Result<ScanState> {
        let stop_at = match (job.is_incremental, &job.last_signature) {
            (true, Some(signature)) => Some(self.stop_marker(&job.wallet_address, signature).await?),
            _ => None,
        };
        let mut state = ScanState {
            job_id: job.id,
            epoch: job.retry_count,
            wallet_address: job.wallet_address.clone(),
            book: AggregateBook::new(),
            nft_count: 0,
            prior: None,
            total_signatures: job.total_signatures,
            processed_signatures: job.processed_signatures,
            current_batch: job.current_batch,
            cursor: job.pagination_token.clone(),
            scan_head: job.scan_head_signature.clone(),
            stop_at,
        };

        // With no previous head to stop at, a refresh walks the whole history again
        let full_rescan = job.is_incremental && state.stop_at.is_none();
        if full_rescan && job.current_batch == 0 {
            info!("No previous scan head for {}, rescanning full history", job.wallet_address);
            state.total_signatures = 0;
            state.processed_signatures = 0;
        }

        if !job.has_checkpoint() || (full_rescan && state.current_batch == 0) {
            state.nft_count = match cache.holdings_snapshot(&job.wallet_address).await {
                Ok(count) => count,
                Err(e) => {
                    warn!("⚠️ Holdings snapshot failed for {}: {}", job.wallet_address, e);
                    0
                }
            };
            return Ok(state);
        }

        let stored = job.current_results.as_ref().ok_or_else(|| {
            OrchestratorError::Stalled(format!("job {} has progress but no summary to resume from", job.id))
        })?;
        let summary = LightSummary::from_json(stored)
            .map_err(|e| OrchestratorError::Stalled(format!("resume summary unreadable: {}", e)))?;
        let aggregates = self.pipeline.stores.aggregates.load_aggregates(job.id).await?;

        info!(
            "Restored {} aggregates for job {} at batch {}",
            aggregates.len(),
            job.id,
            job.current_batch
        );

        state.book = AggregateBook::restore(aggregates, summary.counters());
        state.nft_count = summary.nft_count;
        if !full_rescan && job.is_incremental {
            state.prior = Some(summary);
        }
        Ok(state)
    }

    async fn stop_marker(&self, wallet_address: &str, signature: &str) -> Result<StopMarker> {
        let cached = self
            .pipeline
            .stores
            .transactions
            .get_transactions(wallet_address, &[signature.to_string()])
            .await?;
        let block_time = cached.get(signature).map(|tx| tx.block_time);
        if block_time.is_none() {
            debug!("Previous head {} of {} is not cached, stopping on signature only", signature, wallet_address);
        }
        Ok(StopMarker {
            signature: signature.to_string(),
            block_time,
        })
    }

    /// Await `work`, refreshing the job's heartbeat every third of the zombie threshold.
    async fn with_heartbeat<F, T>(&self, job_id: Uuid, epoch: i32, work: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let threshold = self.pipeline.config.queue.zombie_threshold_seconds;
        let period = Duration::from_secs((threshold / 3).max(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        tokio::pin!(work);

        loop {
            tokio::select! {
                output = &mut work => return Ok(output),
                _ = ticker.tick() => {
                    self.pipeline.stores.jobs.touch_heartbeat(job_id, epoch, Utc::now()).await?;
                }
            }
        }
    }

    /// Smallest batch both providers can serve within the target at current load.
    fn batch_size(&self) -> usize {
        let config = &self.pipeline.config;
        let transactions = optimal_batch_size(
            self.pipeline.transaction_load.get(),
            &config.transaction_provider,
            &config.analysis,
        );
        let prices = optimal_batch_size(
            self.pipeline.price_load.get(),
            &config.price_provider,
            &config.analysis,
        );
        transactions.min(prices)
    }

    async fn resolve_prices(
        &self,
        resolver: &dyn PriceResolver,
        transactions: &[CachedTransaction],
    ) -> Result<HashMap<PriceKey, PriceAnalysis>> {
        let bucket_seconds = self.pipeline.config.analysis.hour_bucket_seconds;
        let requests: Vec<PriceRequest> = transactions
            .iter()
            .flat_map(|tx| {
                let bucket = hour_bucket(tx.block_time, bucket_seconds);
                tx.trades
                    .iter()
                    .map(move |trade| PriceRequest::new(trade.mint.clone(), bucket))
            })
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        if requests.is_empty() {
            return Ok(HashMap::new());
        }

        let limit = Duration::from_secs(self.pipeline.config.analysis.price_resolution_timeout_seconds);
        match timeout(limit, resolver.resolve_batch(&requests)).await {
            Ok(resolved) => Ok(resolved?),
            Err(_) => {
                warn!(
                    "⚠️ Price resolution timed out after {}s, {} price keys left unpriced",
                    limit.as_secs(),
                    requests.len()
                );
                Ok(HashMap::new())
            }
        }
    }

    /// Symbol/name for mints of this batch the book does not know yet: stored metadata
    /// first, then one source lookup for the rest.
    async fn resolve_metadata(
        &self,
        cache: &TransactionCache,
        book: &AggregateBook,
        transactions: &[CachedTransaction],
    ) -> Result<HashMap<String, TokenMetadata>> {
        let mints: Vec<String> = transactions
            .iter()
            .flat_map(|tx| tx.trades.iter().map(|trade| &trade.mint))
            .filter(|mint| book.get(mint).map_or(true, |agg| agg.symbol.is_none()))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if mints.is_empty() {
            return Ok(HashMap::new());
        }

        let store = &self.pipeline.stores.prices;
        let mut metadata = store.get_metadata(&mints).await?;
        let missing: Vec<String> = mints
            .into_iter()
            .filter(|mint| !metadata.contains_key(mint))
            .collect();

        if !missing.is_empty() {
            match cache.asset_metadata(&missing).await {
                Ok(fetched) => {
                    if !fetched.is_empty() {
                        store.upsert_metadata(&fetched).await?;
                    }
                    metadata.extend(fetched);
                }
                Err(e) => warn!("⚠️ Metadata lookup failed for {} tokens: {}", missing.len(), e),
            }
        }
        Ok(metadata)
    }
}
