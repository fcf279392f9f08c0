use chrono::Utc;
use persistence_layer::JobRecord;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{AnalysisWorker, Pipeline, Result};

/// What one admission pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdmissionReport {
    pub reclaimed: usize,
    pub claimed: usize,
    /// Another pass was already running
    pub skipped: bool,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Admission control over the job table.
///
/// Keeps at most `max_concurrent_jobs` jobs in `processing`, promotes pending jobs oldest
/// first and relaunches processing jobs whose heartbeat went stale.
pub struct QueueManager {
    pipeline: Pipeline,
    worker: AnalysisWorker,
    busy: AtomicBool,
    wake: Notify,
}

impl QueueManager {
    pub fn new(pipeline: Pipeline) -> Arc<Self> {
        Arc::new(Self {
            worker: AnalysisWorker::new(pipeline.clone()),
            pipeline,
            busy: AtomicBool::new(false),
            wake: Notify::new(),
        })
    }

    /// Wait until the job store is reachable, then run admission passes on every tick and
    /// whenever a worker finishes.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.wait_for_store().await;

            let period = Duration::from_secs(manager.pipeline.config.queue.admission_interval_seconds.max(1));
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = manager.wake.notified() => {
                        debug!("Slot freed, running admission early");
                    }
                }

                match manager.run_admission_pass().await {
                    Ok(report) if report.claimed + report.reclaimed > 0 => {
                        debug!("Admission pass: {:?}", report);
                    }
                    Ok(_) => {}
                    Err(e) => error!("Admission pass failed: {}", e),
                }
            }
        })
    }

    /// Ask the running loop for an immediate pass.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    async fn wait_for_store(&self) {
        let delay = Duration::from_secs(self.pipeline.config.queue.startup_retry_delay_seconds);
        loop {
            match self.pipeline.stores.jobs.health_check().await {
                Ok(()) => {
                    info!("✅ Job store reachable, queue manager running");
                    return;
                }
                Err(e) => {
                    warn!("⚠️ Job store unreachable ({}), retrying in {}s", e, delay.as_secs());
                    sleep(delay).await;
                }
            }
        }
    }

    /// Reclaim zombies, then fill free slots with the oldest pending jobs.
    ///
    /// Overlapping calls are not queued: a pass started while another runs returns
    /// immediately with `skipped` set.
    pub async fn run_admission_pass(self: &Arc<Self>) -> Result<AdmissionReport> {
        if self.busy.swap(true, Ordering::SeqCst) {
            debug!("Admission pass already running, skipping");
            return Ok(AdmissionReport {
                skipped: true,
                ..Default::default()
            });
        }
        let _busy = BusyGuard(&self.busy);

        let reclaimed = self.recover_zombies().await?;
        let claimed = self.admit_pending().await?;
        Ok(AdmissionReport {
            reclaimed,
            claimed,
            skipped: false,
        })
    }

    async fn recover_zombies(self: &Arc<Self>) -> Result<usize> {
        let jobs = &self.pipeline.stores.jobs;
        let now = Utc::now();
        let threshold = chrono::Duration::seconds(self.pipeline.config.queue.zombie_threshold_seconds as i64);
        let stale_before = now - threshold;

        let mut reclaimed = 0;
        for zombie in jobs.list_zombies(stale_before).await? {
            match jobs.reclaim_zombie(zombie.id, stale_before, now).await {
                Ok(Some(job)) => {
                    warn!(
                        "🧟 Reclaiming job {} for {} (heartbeat {:?}, retry {})",
                        job.id, job.wallet_address, zombie.last_heartbeat, job.retry_count
                    );
                    self.launch(job);
                    reclaimed += 1;
                }
                Ok(None) => debug!("Zombie {} recovered before reclaim", zombie.id),
                Err(e) => error!("Failed to reclaim job {}: {}", zombie.id, e),
            }
        }
        Ok(reclaimed)
    }

    async fn admit_pending(self: &Arc<Self>) -> Result<usize> {
        let jobs = &self.pipeline.stores.jobs;
        let max = self.pipeline.config.queue.max_concurrent_jobs as u64;
        let processing = jobs.count_processing().await?;
        let available = max.saturating_sub(processing) as usize;

        if available == 0 {
            debug!("No free slots ({}/{} processing)", processing, max);
            return Ok(0);
        }

        let mut claimed = 0;
        for job in jobs.list_pending(available).await? {
            match jobs.claim_job(job.id, Utc::now()).await {
                Ok(Some(job)) => {
                    debug!("Claimed job {} for {}", job.id, job.wallet_address);
                    self.launch(job);
                    claimed += 1;
                }
                Ok(None) => debug!("Job {} is no longer pending", job.id),
                Err(e) => {
                    error!("Failed to claim job {}: {}", job.id, e);
                    let message = format!("claim failed: {}", e);
                    if let Err(fail_err) = jobs.fail_job(job.id, job.retry_count, &message).await {
                        error!("Could not mark job {} failed: {}", job.id, fail_err);
                    }
                }
            }
        }

        if claimed > 0 {
            info!(
                "Admitted {} jobs ({} processing, max {})",
                claimed,
                processing + claimed as u64,
                max
            );
        }
        Ok(claimed)
    }

    /// Run a claimed job in the background; its end triggers another admission pass.
    pub fn launch(self: &Arc<Self>, job: JobRecord) {
        let manager = self.clone();
        tokio::spawn(async move {
            let job_id = job.id;
            let outcome = manager.worker.run(job).await;
            debug!("Worker for job {} finished: {:?}", job_id, outcome);
            manager.wake.notify_one();
        });
    }
}
