use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pnl_core::{CachedTransaction, PricePoint, TokenAggregate, TokenMetadata, TradeExtract};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    merge_price_entry, AggregatePage, BatchCheckpoint, JobCompletion, JobRecord, JobStatus,
    JobStore, PersistenceError, PriceCacheEntry, PriceCacheStore, Requeue, Result,
    TokenAggregateStore, TransactionCacheStore,
};

const JOB_COLUMNS: &str = r#"
    id, wallet_address, agent_id, status, total_signatures, processed_signatures, current_batch,
    created_at, started_at, completed_at, last_heartbeat, current_results, last_signature,
    pagination_token, scan_head_signature, is_incremental, error, retry_count
"#;

const AGGREGATE_COLUMNS: &str = r#"
    mint, symbol, name, total_volume_usd, total_volume_native, total_pct_change, total_pnl_usd,
    total_missed_usd, trade_count, priced_trade_count, unpriced_trade_count, sum_purchase_value,
    sum_trade_value, sum_ath_price, sum_tokens_traded
"#;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS analysis_jobs (
        id UUID PRIMARY KEY,
        wallet_address TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        status TEXT NOT NULL,
        total_signatures BIGINT NOT NULL DEFAULT 0,
        processed_signatures BIGINT NOT NULL DEFAULT 0,
        current_batch BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        last_heartbeat TIMESTAMPTZ,
        current_results JSONB,
        last_signature TEXT,
        pagination_token TEXT,
        scan_head_signature TEXT,
        is_incremental BOOLEAN NOT NULL DEFAULT FALSE,
        error TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_analysis_jobs_active_wallet
        ON analysis_jobs(wallet_address) WHERE status IN ('pending', 'processing')
    "#,
    "CREATE INDEX IF NOT EXISTS idx_analysis_jobs_status_created ON analysis_jobs(status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_analysis_jobs_wallet_created ON analysis_jobs(wallet_address, created_at DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS token_aggregates (
        job_id UUID NOT NULL REFERENCES analysis_jobs(id) ON DELETE CASCADE,
        mint TEXT NOT NULL,
        symbol TEXT,
        name TEXT,
        total_volume_usd NUMERIC NOT NULL,
        total_volume_native NUMERIC NOT NULL,
        total_pct_change NUMERIC NOT NULL,
        total_pnl_usd NUMERIC NOT NULL,
        total_missed_usd NUMERIC NOT NULL,
        trade_count BIGINT NOT NULL,
        priced_trade_count BIGINT NOT NULL,
        unpriced_trade_count BIGINT NOT NULL,
        sum_purchase_value NUMERIC NOT NULL,
        sum_trade_value NUMERIC NOT NULL,
        sum_ath_price NUMERIC NOT NULL,
        sum_tokens_traded NUMERIC NOT NULL,
        average_purchase_price NUMERIC,
        average_trade_price NUMERIC,
        average_ath_price NUMERIC,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (job_id, mint)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_token_aggregates_pnl ON token_aggregates(job_id, total_pnl_usd DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS price_cache (
        mint TEXT PRIMARY KEY,
        purchase_price NUMERIC NOT NULL,
        purchase_timestamp BIGINT NOT NULL,
        current_price NUMERIC NOT NULL,
        current_price_updated_at TIMESTAMPTZ NOT NULL,
        ath_price NUMERIC NOT NULL,
        ath_timestamp BIGINT NOT NULL,
        history JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS token_metadata (
        mint TEXT PRIMARY KEY,
        symbol TEXT,
        name TEXT,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transaction_cache (
        wallet_address TEXT NOT NULL,
        signature TEXT NOT NULL,
        block_time BIGINT NOT NULL,
        native_change NUMERIC NOT NULL,
        trades JSONB NOT NULL,
        cached_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (wallet_address, signature)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_transaction_cache_cached_at ON transaction_cache(cached_at)",
];

/// PostgreSQL-backed store for jobs, aggregates and both caches
#[derive(Debug, Clone)]
pub struct PostgresClient {
    pool: PgPool,
}

impl PostgresClient {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await
            .map_err(|e| {
                PersistenceError::PoolCreation(format!("PostgreSQL connection error: {}", e))
            })?;

        info!(
            "PostgreSQL pool initialized: max_connections={}",
            max_connections
        );
        Ok(Self { pool })
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Database schema ready");
        Ok(())
    }

    fn job_from_row(row: &PgRow) -> Result<JobRecord> {
        let status: String = row.try_get("status")?;
        let current_results: Option<Json<serde_json::Value>> = row.try_get("current_results")?;

        Ok(JobRecord {
            id: row.try_get("id")?,
            wallet_address: row.try_get("wallet_address")?,
            agent_id: row.try_get("agent_id")?,
            status: status.parse()?,
            total_signatures: row.try_get("total_signatures")?,
            processed_signatures: row.try_get("processed_signatures")?,
            current_batch: row.try_get("current_batch")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            current_results: current_results.map(|json| json.0),
            last_signature: row.try_get("last_signature")?,
            pagination_token: row.try_get("pagination_token")?,
            scan_head_signature: row.try_get("scan_head_signature")?,
            is_incremental: row.try_get("is_incremental")?,
            error: row.try_get("error")?,
            retry_count: row.try_get("retry_count")?,
        })
    }

    fn aggregate_from_row(row: &PgRow) -> Result<TokenAggregate> {
        let count = |column: &str| -> Result<u64> {
            let value: i64 = row.try_get(column)?;
            Ok(value.max(0) as u64)
        };

        Ok(TokenAggregate {
            mint: row.try_get("mint")?,
            symbol: row.try_get("symbol")?,
            name: row.try_get("name")?,
            total_volume_usd: row.try_get("total_volume_usd")?,
            total_volume_native: row.try_get("total_volume_native")?,
            total_pct_change: row.try_get("total_pct_change")?,
            total_pnl_usd: row.try_get("total_pnl_usd")?,
            total_missed_usd: row.try_get("total_missed_usd")?,
            trade_count: count("trade_count")?,
            priced_trade_count: count("priced_trade_count")?,
            unpriced_trade_count: count("unpriced_trade_count")?,
            sum_purchase_value: row.try_get("sum_purchase_value")?,
            sum_trade_value: row.try_get("sum_trade_value")?,
            sum_ath_price: row.try_get("sum_ath_price")?,
            sum_tokens_traded: row.try_get("sum_tokens_traded")?,
        })
    }

    fn price_entry_from_row(row: &PgRow) -> Result<PriceCacheEntry> {
        let history: Json<Vec<PricePoint>> = row.try_get("history")?;
        Ok(PriceCacheEntry {
            mint: row.try_get("mint")?,
            purchase_price: row.try_get("purchase_price")?,
            purchase_timestamp: row.try_get("purchase_timestamp")?,
            current_price: row.try_get("current_price")?,
            current_price_updated_at: row.try_get("current_price_updated_at")?,
            ath_price: row.try_get("ath_price")?,
            ath_timestamp: row.try_get("ath_timestamp")?,
            history: history.0,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn upsert_aggregate(
        conn: &mut PgConnection,
        job_id: Uuid,
        agg: &TokenAggregate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO token_aggregates
            (job_id, mint, symbol, name, total_volume_usd, total_volume_native, total_pct_change,
             total_pnl_usd, total_missed_usd, trade_count, priced_trade_count, unpriced_trade_count,
             sum_purchase_value, sum_trade_value, sum_ath_price, sum_tokens_traded,
             average_purchase_price, average_trade_price, average_ath_price, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (job_id, mint)
            DO UPDATE SET
                symbol = COALESCE(EXCLUDED.symbol, token_aggregates.symbol),
                name = COALESCE(EXCLUDED.name, token_aggregates.name),
                total_volume_usd = EXCLUDED.total_volume_usd,
                total_volume_native = EXCLUDED.total_volume_native,
                total_pct_change = EXCLUDED.total_pct_change,
                total_pnl_usd = EXCLUDED.total_pnl_usd,
                total_missed_usd = EXCLUDED.total_missed_usd,
                trade_count = EXCLUDED.trade_count,
                priced_trade_count = EXCLUDED.priced_trade_count,
                unpriced_trade_count = EXCLUDED.unpriced_trade_count,
                sum_purchase_value = EXCLUDED.sum_purchase_value,
                sum_trade_value = EXCLUDED.sum_trade_value,
                sum_ath_price = EXCLUDED.sum_ath_price,
                sum_tokens_traded = EXCLUDED.sum_tokens_traded,
                average_purchase_price = EXCLUDED.average_purchase_price,
                average_trade_price = EXCLUDED.average_trade_price,
                average_ath_price = EXCLUDED.average_ath_price,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(job_id)
        .bind(&agg.mint)
        .bind(&agg.symbol)
        .bind(&agg.name)
        .bind(agg.total_volume_usd)
        .bind(agg.total_volume_native)
        .bind(agg.total_pct_change)
        .bind(agg.total_pnl_usd)
        .bind(agg.total_missed_usd)
        .bind(agg.trade_count as i64)
        .bind(agg.priced_trade_count as i64)
        .bind(agg.unpriced_trade_count as i64)
        .bind(agg.sum_purchase_value)
        .bind(agg.sum_trade_value)
        .bind(agg.sum_ath_price)
        .bind(agg.sum_tokens_traded)
        .bind(agg.average_purchase_price())
        .bind(agg.average_trade_price())
        .bind(agg.average_ath_price())
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn write_price_entry(conn: &mut PgConnection, entry: &PriceCacheEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO price_cache
            (mint, purchase_price, purchase_timestamp, current_price, current_price_updated_at,
             ath_price, ath_timestamp, history, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (mint)
            DO UPDATE SET
                purchase_price = EXCLUDED.purchase_price,
                purchase_timestamp = EXCLUDED.purchase_timestamp,
                current_price = EXCLUDED.current_price,
                current_price_updated_at = EXCLUDED.current_price_updated_at,
                ath_price = EXCLUDED.ath_price,
                ath_timestamp = EXCLUDED.ath_timestamp,
                history = EXCLUDED.history,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&entry.mint)
        .bind(entry.purchase_price)
        .bind(entry.purchase_timestamp)
        .bind(entry.current_price)
        .bind(entry.current_price_updated_at)
        .bind(entry.ath_price)
        .bind(entry.ath_timestamp)
        .bind(Json(&entry.history))
        .bind(entry.updated_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }
}

// =====================================
// Jobs
// =====================================

#[async_trait]
impl JobStore for PostgresClient {
    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1 as test").fetch_one(&self.pool).await?;
        Ok(())
    }

    async fn create_job(&self, job: &JobRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO analysis_jobs
            (id, wallet_address, agent_id, status, total_signatures, processed_signatures,
             current_batch, created_at, started_at, completed_at, last_heartbeat, current_results,
             last_signature, pagination_token, scan_head_signature, is_incremental, error, retry_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(job.id)
        .bind(&job.wallet_address)
        .bind(&job.agent_id)
        .bind(job.status.as_str())
        .bind(job.total_signatures)
        .bind(job.processed_signatures)
        .bind(job.current_batch)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.last_heartbeat)
        .bind(job.current_results.as_ref().map(Json))
        .bind(&job.last_signature)
        .bind(&job.pagination_token)
        .bind(&job.scan_head_signature)
        .bind(job.is_incremental)
        .bind(&job.error)
        .bind(job.retry_count)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!("Created job {} for {}", job.id, job.wallet_address);
                Ok(())
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(PersistenceError::ActiveJobExists(job.wallet_address.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM analysis_jobs WHERE id = $1", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn latest_job_for_wallet(&self, wallet_address: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM analysis_jobs WHERE wallet_address = $1 ORDER BY created_at DESC LIMIT 1",
            JOB_COLUMNS
        ))
        .bind(wallet_address)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn count_processing(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM analysis_jobs WHERE status = 'processing'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM analysis_jobs WHERE status = 'pending' ORDER BY created_at ASC LIMIT $1",
            JOB_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::job_from_row).collect()
    }

    async fn list_zombies(&self, stale_before: DateTime<Utc>) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM analysis_jobs
            WHERE status = 'processing' AND (last_heartbeat IS NULL OR last_heartbeat < $1)
            ORDER BY created_at ASC
            "#,
            JOB_COLUMNS
        ))
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::job_from_row).collect()
    }

    async fn claim_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE analysis_jobs
            SET status = 'processing', started_at = $2, last_heartbeat = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn reclaim_zombie(
        &self,
        id: Uuid,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE analysis_jobs
            SET retry_count = retry_count + 1, last_heartbeat = $3
            WHERE id = $1 AND status = 'processing'
              AND (last_heartbeat IS NULL OR last_heartbeat < $2)
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(id)
        .bind(stale_before)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn requeue_job(&self, id: Uuid, mode: Requeue) -> Result<Option<JobRecord>> {
        let sql = match mode {
            Requeue::Incremental => format!(
                r#"
                UPDATE analysis_jobs
                SET status = 'pending', is_incremental = TRUE, current_batch = 0,
                    pagination_token = NULL, scan_head_signature = NULL, error = NULL,
                    completed_at = NULL, last_heartbeat = NULL
                WHERE id = $1 AND status = 'completed'
                RETURNING {}
                "#,
                JOB_COLUMNS
            ),
            Requeue::Retry => format!(
                r#"
                UPDATE analysis_jobs
                SET status = 'pending', retry_count = retry_count + 1, error = NULL,
                    completed_at = NULL, last_heartbeat = NULL
                WHERE id = $1 AND status = 'failed'
                RETURNING {}
                "#,
                JOB_COLUMNS
            ),
        };

        let result = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await;
        match result {
            Ok(row) => row.as_ref().map(Self::job_from_row).transpose(),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(PersistenceError::InvalidData(format!(
                    "job {} cannot be requeued while another job is active",
                    id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn commit_checkpoint(&self, checkpoint: &BatchCheckpoint) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET total_signatures = $3, processed_signatures = $4, current_batch = $5,
                current_results = $6, pagination_token = $7,
                scan_head_signature = COALESCE(scan_head_signature, $8),
                last_heartbeat = $9
            WHERE id = $1 AND retry_count = $2 AND status = 'processing'
            "#,
        )
        .bind(checkpoint.job_id)
        .bind(checkpoint.epoch)
        .bind(checkpoint.total_signatures)
        .bind(checkpoint.processed_signatures)
        .bind(checkpoint.current_batch)
        .bind(Json(&checkpoint.summary))
        .bind(&checkpoint.pagination_token)
        .bind(&checkpoint.scan_head_signature)
        .bind(checkpoint.heartbeat)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Err(PersistenceError::LostOwnership(checkpoint.job_id));
        }

        for agg in &checkpoint.aggregates {
            Self::upsert_aggregate(&mut tx, checkpoint.job_id, agg, checkpoint.heartbeat).await?;
        }

        tx.commit().await?;
        debug!(
            "Checkpoint for job {}: batch {}, {} aggregates",
            checkpoint.job_id,
            checkpoint.current_batch,
            checkpoint.aggregates.len()
        );
        Ok(())
    }

    async fn complete_job(&self, completion: &JobCompletion) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'completed', total_signatures = $3, processed_signatures = $4,
                current_batch = $5, current_results = $6,
                last_signature = COALESCE($7, last_signature),
                pagination_token = NULL, scan_head_signature = NULL,
                completed_at = $8, last_heartbeat = $8, error = NULL
            WHERE id = $1 AND retry_count = $2 AND status = 'processing'
            "#,
        )
        .bind(completion.job_id)
        .bind(completion.epoch)
        .bind(completion.total_signatures)
        .bind(completion.processed_signatures)
        .bind(completion.current_batch)
        .bind(Json(&completion.summary))
        .bind(&completion.last_signature)
        .bind(completion.completed_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Err(PersistenceError::LostOwnership(completion.job_id));
        }

        for agg in &completion.aggregates {
            Self::upsert_aggregate(&mut tx, completion.job_id, agg, completion.completed_at)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn touch_heartbeat(&self, id: Uuid, epoch: i32, now: DateTime<Utc>) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE analysis_jobs SET last_heartbeat = $3
            WHERE id = $1 AND retry_count = $2 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(epoch)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(PersistenceError::LostOwnership(id));
        }
        Ok(())
    }

    async fn fail_job(&self, id: Uuid, epoch: i32, error: &str) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'failed', error = $3, completed_at = NOW()
            WHERE id = $1 AND retry_count = $2 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(id)
        .bind(epoch)
        .bind(error)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(PersistenceError::LostOwnership(id));
        }
        Ok(())
    }

    async fn purge_jobs(&self, status: JobStatus, older_than: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM analysis_jobs WHERE status = $1 AND completed_at < $2",
        )
        .bind(status.as_str())
        .bind(older_than)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }
}

// =====================================
// Token aggregates
// =====================================

#[async_trait]
impl TokenAggregateStore for PostgresClient {
    async fn load_aggregates(&self, job_id: Uuid) -> Result<Vec<TokenAggregate>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM token_aggregates WHERE job_id = $1 ORDER BY mint ASC",
            AGGREGATE_COLUMNS
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::aggregate_from_row).collect()
    }

    async fn page_aggregates(&self, job_id: Uuid, page: u32, page_size: u32) -> Result<AggregatePage> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM token_aggregates WHERE job_id = $1")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;

        let offset = (page.max(1) as i64 - 1) * page_size as i64;
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM token_aggregates
            WHERE job_id = $1
            ORDER BY total_pnl_usd DESC, mint ASC
            LIMIT $2 OFFSET $3
            "#,
            AGGREGATE_COLUMNS
        ))
        .bind(job_id)
        .bind(page_size as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(AggregatePage {
            items: rows
                .iter()
                .map(Self::aggregate_from_row)
                .collect::<Result<Vec<_>>>()?,
            total: total.max(0) as u64,
        })
    }
}

// =====================================
// Price cache and token metadata
// =====================================

#[async_trait]
impl PriceCacheStore for PostgresClient {
    async fn get_price_entries(&self, mints: &[String]) -> Result<HashMap<String, PriceCacheEntry>> {
        if mints.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT mint, purchase_price, purchase_timestamp, current_price, current_price_updated_at,
                   ath_price, ath_timestamp, history, updated_at
            FROM price_cache
            WHERE mint = ANY($1)
            "#,
        )
        .bind(mints)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Self::price_entry_from_row(row).map(|entry| (entry.mint.clone(), entry)))
            .collect()
    }

    async fn upsert_price_entry(&self, entry: &PriceCacheEntry) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            r#"
            SELECT mint, purchase_price, purchase_timestamp, current_price, current_price_updated_at,
                   ath_price, ath_timestamp, history, updated_at
            FROM price_cache
            WHERE mint = $1
            FOR UPDATE
            "#,
        )
        .bind(&entry.mint)
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(Self::price_entry_from_row)
        .transpose()?;

        let merged = merge_price_entry(existing.as_ref(), entry.clone());
        Self::write_price_entry(&mut tx, &merged).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_current_prices(
        &self,
        prices: &HashMap<String, Decimal>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (mint, price) in prices {
            sqlx::query(
                r#"
                UPDATE price_cache
                SET current_price = $2, current_price_updated_at = $3, updated_at = $3
                WHERE mint = $1
                "#,
            )
            .bind(mint)
            .bind(price)
            .bind(at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn purge_price_entries(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM price_cache WHERE updated_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }

    async fn get_metadata(&self, mints: &[String]) -> Result<HashMap<String, TokenMetadata>> {
        if mints.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query("SELECT mint, symbol, name FROM token_metadata WHERE mint = ANY($1)")
            .bind(mints)
            .fetch_all(&self.pool)
            .await?;

        let mut metadata = HashMap::with_capacity(rows.len());
        for row in rows {
            metadata.insert(
                row.try_get("mint")?,
                TokenMetadata {
                    symbol: row.try_get("symbol")?,
                    name: row.try_get("name")?,
                },
            );
        }
        Ok(metadata)
    }

    async fn upsert_metadata(&self, metadata: &HashMap<String, TokenMetadata>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        for (mint, meta) in metadata {
            sqlx::query(
                r#"
                INSERT INTO token_metadata (mint, symbol, name, updated_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (mint)
                DO UPDATE SET
                    symbol = COALESCE(EXCLUDED.symbol, token_metadata.symbol),
                    name = COALESCE(EXCLUDED.name, token_metadata.name),
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(mint)
            .bind(&meta.symbol)
            .bind(&meta.name)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

// =====================================
// Transaction cache
// =====================================

#[async_trait]
impl TransactionCacheStore for PostgresClient {
    async fn get_transactions(
        &self,
        wallet_address: &str,
        signatures: &[String],
    ) -> Result<HashMap<String, CachedTransaction>> {
        if signatures.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT signature, block_time, native_change, trades
            FROM transaction_cache
            WHERE wallet_address = $1 AND signature = ANY($2)
            "#,
        )
        .bind(wallet_address)
        .bind(signatures)
        .fetch_all(&self.pool)
        .await?;

        let mut cached = HashMap::with_capacity(rows.len());
        for row in rows {
            let trades: Json<Vec<TradeExtract>> = row.try_get("trades")?;
            let tx = CachedTransaction {
                signature: row.try_get("signature")?,
                block_time: row.try_get("block_time")?,
                native_change: row.try_get("native_change")?,
                trades: trades.0,
            };
            cached.insert(tx.signature.clone(), tx);
        }
        Ok(cached)
    }

    async fn store_transactions(&self, wallet_address: &str, transactions: &[CachedTransaction]) -> Result<()> {
        if transactions.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        for cached in transactions {
            sqlx::query(
                r#"
                INSERT INTO transaction_cache
                (wallet_address, signature, block_time, native_change, trades, cached_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (wallet_address, signature) DO NOTHING
                "#,
            )
            .bind(wallet_address)
            .bind(&cached.signature)
            .bind(cached.block_time)
            .bind(cached.native_change)
            .bind(Json(&cached.trades))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn purge_transactions(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM transaction_cache WHERE cached_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }
}
