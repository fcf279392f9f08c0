use config_manager::SystemConfig;
use persistence_layer::{
    JobStore, PersistenceError, PriceCacheStore, TokenAggregateStore, TransactionCacheStore,
};
use price_client::{CachedPriceResolver, DirectPriceResolver, PriceSource};
use rate_limiter::{ActiveJobCounter, AdaptiveRateLimiter};
use retry_utils::RetryConfig;
use solana_client::TransactionSource;
use std::sync::Arc;
use thiserror::Error;
use tx_parser::{TransactionCache, TransactionDecoder};
use uuid::Uuid;

pub mod queue_manager;
pub mod retention;
pub mod service;
pub mod worker;

pub use queue_manager::{AdmissionReport, QueueManager};
pub use retention::{RetentionSweeper, SweepReport};
pub use service::{
    validate_wallet_address, AnalysisResults, JobService, JobStatusView, PaginationView, ProgressView,
    StartAnalysisResponse, TokenResultView,
};
pub use worker::{AnalysisWorker, JobOutcome};

#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("P&L calculation error: {0}")]
    PnL(String),
    #[error("Solana client error: {0}")]
    SolanaClient(String),
    #[error("Transaction parser error: {0}")]
    TxParser(String),
    #[error("Price client error: {0}")]
    PriceClient(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Invalid wallet address: {0}")]
    InvalidWallet(String),
    #[error("Pipeline stalled: {0}")]
    Stalled(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Job {0} was taken over by another worker")]
    LostOwnership(Uuid),
    #[error("Job execution failed: {0}")]
    JobExecution(String),
}

impl From<PersistenceError> for OrchestratorError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::LostOwnership(id) => OrchestratorError::LostOwnership(id),
            other => OrchestratorError::Persistence(other.to_string()),
        }
    }
}

impl From<pnl_core::PnLError> for OrchestratorError {
    fn from(err: pnl_core::PnLError) -> Self {
        OrchestratorError::PnL(err.to_string())
    }
}

impl From<solana_client::SolanaClientError> for OrchestratorError {
    fn from(err: solana_client::SolanaClientError) -> Self {
        OrchestratorError::SolanaClient(err.to_string())
    }
}

impl From<tx_parser::ParseError> for OrchestratorError {
    fn from(err: tx_parser::ParseError) -> Self {
        match err {
            tx_parser::ParseError::Store(inner) => inner.into(),
            other => OrchestratorError::TxParser(other.to_string()),
        }
    }
}

impl From<price_client::PriceClientError> for OrchestratorError {
    fn from(err: price_client::PriceClientError) -> Self {
        match err {
            price_client::PriceClientError::Store(inner) => inner.into(),
            other => OrchestratorError::PriceClient(other.to_string()),
        }
    }
}

impl From<config_manager::ConfigurationError> for OrchestratorError {
    fn from(err: config_manager::ConfigurationError) -> Self {
        OrchestratorError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// The four stores the pipeline works against.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub aggregates: Arc<dyn TokenAggregateStore>,
    pub prices: Arc<dyn PriceCacheStore>,
    pub transactions: Arc<dyn TransactionCacheStore>,
}

impl Stores {
    /// Use one backend (PostgreSQL or in-memory) for every store.
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: JobStore + TokenAggregateStore + PriceCacheStore + TransactionCacheStore + 'static,
    {
        Self {
            jobs: backend.clone(),
            aggregates: backend.clone(),
            prices: backend.clone(),
            transactions: backend,
        }
    }
}

/// Shared wiring for every job: configuration, stores, remote collaborators and the
/// per-provider load counters all limiters pace against.
#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<SystemConfig>,
    pub stores: Stores,
    pub transaction_source: Arc<dyn TransactionSource>,
    pub decoder: Arc<dyn TransactionDecoder>,
    pub price_source: Arc<dyn PriceSource>,
    pub transaction_load: Arc<ActiveJobCounter>,
    pub price_load: Arc<ActiveJobCounter>,
    pub retry: RetryConfig,
}

impl Pipeline {
    pub fn new(
        config: SystemConfig,
        stores: Stores,
        transaction_source: Arc<dyn TransactionSource>,
        decoder: Arc<dyn TransactionDecoder>,
        price_source: Arc<dyn PriceSource>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            stores,
            transaction_source,
            decoder,
            price_source,
            transaction_load: ActiveJobCounter::new(),
            price_load: ActiveJobCounter::new(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Transaction access for one job, paced by its own limiter.
    pub fn transaction_cache(&self) -> TransactionCache {
        let limiter = AdaptiveRateLimiter::new(
            "transactions",
            self.config.transaction_provider.clone(),
            self.transaction_load.clone(),
        );
        TransactionCache::new(
            self.transaction_source.clone(),
            self.decoder.clone(),
            self.stores.transactions.clone(),
            Arc::new(limiter),
            self.retry.clone(),
            self.config.solana.max_concurrent_requests,
        )
    }

    /// Cache-aware price resolution for one job, paced by its own limiter.
    pub fn price_resolver(&self) -> CachedPriceResolver {
        let limiter = AdaptiveRateLimiter::new(
            "prices",
            self.config.price_provider.clone(),
            self.price_load.clone(),
        );
        let direct = DirectPriceResolver::new(
            self.price_source.clone(),
            Arc::new(limiter),
            self.retry.clone(),
            &self.config.prices,
        );
        CachedPriceResolver::new(
            direct,
            self.stores.prices.clone(),
            self.config.prices.freshness_window_seconds,
        )
    }
}
