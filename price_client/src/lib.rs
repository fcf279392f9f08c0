use async_trait::async_trait;
use persistence_layer::PersistenceError;
use pnl_core::{PriceAnalysis, PriceKey, PricePoint};
use retry_utils::{Classify, RetryableError};
use rust_decimal::Decimal;
use std::collections::HashMap;
use thiserror::Error;

pub mod birdeye;
pub mod resolver;

pub use birdeye::BirdeyePriceSource;
pub use resolver::{CachedPriceResolver, DirectPriceResolver};

#[derive(Error, Debug)]
pub enum PriceClientError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Price API error: {0}")]
    Api(String),
    #[error("No price data found for token: {0}")]
    NoPriceData(String),
    #[error("Invalid price data: {0}")]
    InvalidPriceData(String),
    #[error("Price cache error: {0}")]
    Store(#[from] PersistenceError),
}

impl Classify for PriceClientError {
    fn classify(&self) -> RetryableError {
        match self {
            PriceClientError::Http(e) if e.is_timeout() || e.is_connect() => RetryableError::Timeout,
            PriceClientError::Http(e) => e
                .status()
                .map(|s| RetryableError::from_status(s.as_u16()))
                .unwrap_or(RetryableError::Permanent),
            PriceClientError::Status(code) => RetryableError::from_status(*code),
            _ => RetryableError::Permanent,
        }
    }
}

pub type Result<T> = std::result::Result<T, PriceClientError>;

/// Remote price provider.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Hourly samples between `from` and `to` (unix seconds), oldest first.
    async fn fetch_price_history(&self, mint: &str, from: i64, to: i64) -> Result<Vec<PricePoint>>;

    /// Latest USD price of each mint; unknown mints are absent from the result.
    async fn fetch_current_prices_batch(&self, mints: &[String]) -> Result<HashMap<String, Decimal>>;
}

/// A price needed for one trade bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PriceRequest {
    pub mint: String,
    /// Hour-bucketed trade time
    pub timestamp: i64,
}

impl PriceRequest {
    pub fn new(mint: impl Into<String>, timestamp: i64) -> Self {
        Self {
            mint: mint.into(),
            timestamp,
        }
    }

    pub fn key(&self) -> PriceKey {
        (self.mint.clone(), self.timestamp)
    }
}

/// Resolves price analyses for a whole batch at once.
///
/// Mints that cannot be priced are left out of the result rather than failing the batch.
#[async_trait]
pub trait PriceResolver: Send + Sync {
    async fn resolve_batch(&self, requests: &[PriceRequest]) -> Result<HashMap<PriceKey, PriceAnalysis>>;
}

/// Earliest requested timestamp per mint, in mint order.
pub(crate) fn earliest_by_mint(requests: &[PriceRequest]) -> Vec<(String, i64)> {
    let mut earliest: std::collections::BTreeMap<&str, i64> = std::collections::BTreeMap::new();
    for request in requests {
        earliest
            .entry(request.mint.as_str())
            .and_modify(|ts| *ts = (*ts).min(request.timestamp))
            .or_insert(request.timestamp);
    }
    earliest
        .into_iter()
        .map(|(mint, ts)| (mint.to_string(), ts))
        .collect()
}
