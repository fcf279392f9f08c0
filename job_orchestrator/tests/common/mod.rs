//! Scripted sources and helpers shared by the orchestrator integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use config_manager::{ProviderLimits, SystemConfig};
use job_orchestrator::{Pipeline, Stores};
use persistence_layer::{JobRecord, JobStatus, JobStore, MemoryStore};
use pnl_core::{hour_bucket, CachedTransaction, PricePoint, TokenMetadata, TradeExtract};
use price_client::{PriceClientError, PriceSource};
use retry_utils::RetryConfig;
use rust_decimal::Decimal;
use solana_client::{RawTransaction, SignaturePage, SolanaClientError, TransactionSource};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tx_parser::{ParseError, TransactionDecoder};

const BASE58: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// A valid, distinct wallet address per `n`.
pub fn wallet(n: usize) -> String {
    format!(
        "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAW{}{}",
        BASE58[(n / 58) % 58] as char,
        BASE58[n % 58] as char
    )
}

/// Start of the hour one week ago; trades in tests are placed relative to it.
pub fn base_time() -> i64 {
    hour_bucket(Utc::now().timestamp() - 7 * 24 * 3600, 3600)
}

pub fn tx(signature: &str, block_time: i64, native_change: Decimal, trades: &[(&str, Decimal)]) -> CachedTransaction {
    CachedTransaction {
        signature: signature.to_string(),
        block_time,
        native_change,
        trades: trades
            .iter()
            .map(|(mint, amount)| TradeExtract {
                mint: mint.to_string(),
                amount: *amount,
            })
            .collect(),
    }
}

/// Unpaced providers, no pauses, fixed batch size.
pub fn test_config(batch_size: usize) -> SystemConfig {
    let unpaced = ProviderLimits {
        max_requests_per_second: 1_000.0,
        target_usage_percent: 100.0,
        min_delay_ms: 0,
        max_delay_ms: 0,
    };
    let mut config = SystemConfig::default();
    config.transaction_provider = unpaced.clone();
    config.price_provider = unpaced;
    config.analysis.min_batch_size = batch_size;
    config.analysis.max_batch_size = batch_size;
    config.analysis.inter_batch_pause_ms = 0;
    config.analysis.max_consecutive_empty_batches = 3;
    config.analysis.price_resolution_timeout_seconds = 5;
    config.analysis.min_batch_timeout_seconds = 5;
    config.analysis.max_batch_timeout_seconds = 10;
    config.prices.history_page_seconds = 10 * 365 * 24 * 3600;
    config.prices.freshness_window_seconds = 60;
    config.database.enabled = false;
    config
}

pub fn pipeline(
    config: SystemConfig,
    store: Arc<MemoryStore>,
    transactions: Arc<dyn TransactionSource>,
    prices: Arc<dyn PriceSource>,
) -> Pipeline {
    pipeline_with_decoder(config, store, transactions, Arc::new(JsonDecoder), prices)
}

pub fn pipeline_with_decoder(
    config: SystemConfig,
    store: Arc<MemoryStore>,
    transactions: Arc<dyn TransactionSource>,
    decoder: Arc<dyn TransactionDecoder>,
    prices: Arc<dyn PriceSource>,
) -> Pipeline {
    Pipeline::new(config, Stores::from_backend(store), transactions, decoder, prices)
        .with_retry(RetryConfig::immediate(0))
}

/// Create a pending job and claim it, as an admission pass would.
pub async fn claimed_job(store: &MemoryStore, wallet_address: &str) -> JobRecord {
    let job = JobRecord::new_pending(wallet_address, "test-agent");
    store.create_job(&job).await.unwrap();
    store.claim_job(job.id, Utc::now()).await.unwrap().unwrap()
}

/// Poll until the job leaves `pending`/`processing`.
pub async fn wait_for_terminal(store: &MemoryStore, id: uuid::Uuid) -> JobRecord {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let job = store.get_job(id).await.unwrap().unwrap();
            if matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not finish in time")
}

/// Decodes payloads produced by [`FakeTransactionSource`].
pub struct JsonDecoder;

impl TransactionDecoder for JsonDecoder {
    fn decode(&self, raw: &RawTransaction, _wallet_address: &str) -> tx_parser::Result<CachedTransaction> {
        serde_json::from_value(raw.payload.clone()).map_err(|e| ParseError::InvalidFormat(e.to_string()))
    }
}

/// Fails on every payload, as for a program the decoder does not understand.
pub struct RejectingDecoder;

impl TransactionDecoder for RejectingDecoder {
    fn decode(&self, raw: &RawTransaction, _wallet_address: &str) -> tx_parser::Result<CachedTransaction> {
        Err(ParseError::InvalidFormat(format!("unsupported transaction {}", raw.signature)))
    }
}

/// Wallet history held in memory, newest first, with optional injected failures.
pub struct FakeTransactionSource {
    history: Mutex<Vec<CachedTransaction>>,
    nft_count: u64,
    pub page_calls: AtomicUsize,
    /// Signature page calls numbered from this one on fail permanently
    fail_from_call: AtomicUsize,
    /// Signature page calls numbered from this one on never return
    stall_from_call: AtomicUsize,
}

impl FakeTransactionSource {
    /// `history` is given oldest first, as it happened.
    pub fn new(mut history: Vec<CachedTransaction>, nft_count: u64) -> Arc<Self> {
        history.reverse();
        Arc::new(Self {
            history: Mutex::new(history),
            nft_count,
            page_calls: AtomicUsize::new(0),
            fail_from_call: AtomicUsize::new(usize::MAX),
            stall_from_call: AtomicUsize::new(usize::MAX),
        })
    }

    pub fn fail_from_page_call(&self, call: usize) {
        self.fail_from_call.store(call, Ordering::SeqCst);
    }

    pub fn stall_from_page_call(&self, call: usize) {
        self.stall_from_call.store(call, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.fail_from_call.store(usize::MAX, Ordering::SeqCst);
        self.stall_from_call.store(usize::MAX, Ordering::SeqCst);
    }

    pub fn page_call_count(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    /// Drop a signature from the listed history, as a provider pruning old data would.
    pub fn forget(&self, signature: &str) {
        self.history.lock().unwrap().retain(|tx| tx.signature != signature);
    }

    /// Append newer activity, oldest first.
    pub fn record(&self, newer: Vec<CachedTransaction>) {
        let mut history = self.history.lock().unwrap();
        for tx in newer {
            history.insert(0, tx);
        }
    }
}

#[async_trait]
impl TransactionSource for FakeTransactionSource {
    async fn fetch_signature_page(
        &self,
        _wallet_address: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> solana_client::Result<SignaturePage> {
        let call = self.page_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call >= self.stall_from_call.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if call >= self.fail_from_call.load(Ordering::SeqCst) {
            return Err(SolanaClientError::Status(400));
        }

        let history = self.history.lock().unwrap();
        let start = match cursor {
            None => 0,
            Some(cursor) => history
                .iter()
                .position(|tx| tx.signature == cursor)
                .map_or(history.len(), |i| i + 1),
        };
        let end = (start + limit).min(history.len());
        let signatures: Vec<String> = history[start..end].iter().map(|tx| tx.signature.clone()).collect();

        Ok(SignaturePage {
            next_cursor: signatures.last().cloned(),
            has_more: end < history.len(),
            signatures,
        })
    }

    async fn fetch_transactions(&self, signatures: &[String]) -> solana_client::Result<Vec<RawTransaction>> {
        let history = self.history.lock().unwrap();
        Ok(signatures
            .iter()
            .filter_map(|sig| history.iter().find(|tx| &tx.signature == sig))
            .map(|tx| RawTransaction {
                signature: tx.signature.clone(),
                payload: serde_json::to_value(tx).unwrap(),
            })
            .collect())
    }

    async fn fetch_holdings_snapshot(&self, _wallet_address: &str) -> solana_client::Result<u64> {
        Ok(self.nft_count)
    }

    async fn fetch_asset_metadata_batch(
        &self,
        mints: &[String],
    ) -> solana_client::Result<HashMap<String, TokenMetadata>> {
        Ok(mints
            .iter()
            .map(|mint| {
                (
                    mint.clone(),
                    TokenMetadata {
                        symbol: Some(mint.to_uppercase()),
                        name: Some(format!("{} token", mint)),
                    },
                )
            })
            .collect())
    }
}

/// Never answers a signature page request, keeping its jobs in `processing`.
pub struct StalledTransactionSource;

#[async_trait]
impl TransactionSource for StalledTransactionSource {
    async fn fetch_signature_page(
        &self,
        _wallet_address: &str,
        _limit: usize,
        _cursor: Option<&str>,
    ) -> solana_client::Result<SignaturePage> {
        std::future::pending().await
    }

    async fn fetch_transactions(&self, _signatures: &[String]) -> solana_client::Result<Vec<RawTransaction>> {
        Ok(Vec::new())
    }

    async fn fetch_holdings_snapshot(&self, _wallet_address: &str) -> solana_client::Result<u64> {
        Ok(0)
    }

    async fn fetch_asset_metadata_batch(
        &self,
        _mints: &[String],
    ) -> solana_client::Result<HashMap<String, TokenMetadata>> {
        Ok(HashMap::new())
    }
}

/// Price model of one mint.
#[derive(Debug, Clone)]
pub struct MintPrices {
    /// Price reported at the start of every requested window
    pub opening: Option<Decimal>,
    pub points: Vec<PricePoint>,
    pub current: Decimal,
}

impl MintPrices {
    pub fn flat(purchase: Decimal, current: Decimal) -> Self {
        Self {
            opening: Some(purchase),
            points: Vec::new(),
            current,
        }
    }

    pub fn series(points: &[(i64, Decimal)], current: Decimal) -> Self {
        Self {
            opening: None,
            points: points
                .iter()
                .map(|(timestamp, price)| PricePoint {
                    timestamp: *timestamp,
                    price: *price,
                })
                .collect(),
            current,
        }
    }
}

/// Price provider answering from a table and recording every call.
#[derive(Default)]
pub struct FakePriceSource {
    prices: Mutex<HashMap<String, MintPrices>>,
    pub history_calls: Mutex<Vec<String>>,
    pub batch_calls: Mutex<Vec<Vec<String>>>,
}

impl FakePriceSource {
    pub fn new(prices: Vec<(&str, MintPrices)>) -> Arc<Self> {
        Arc::new(Self {
            prices: Mutex::new(prices.into_iter().map(|(mint, p)| (mint.to_string(), p)).collect()),
            ..Default::default()
        })
    }

    pub fn history_call_count(&self) -> usize {
        self.history_calls.lock().unwrap().len()
    }

    pub fn batch_call_sizes(&self) -> Vec<usize> {
        self.batch_calls.lock().unwrap().iter().map(Vec::len).collect()
    }
}

#[async_trait]
impl PriceSource for FakePriceSource {
    async fn fetch_price_history(&self, mint: &str, from: i64, to: i64) -> price_client::Result<Vec<PricePoint>> {
        self.history_calls.lock().unwrap().push(mint.to_string());
        let prices = self.prices.lock().unwrap();
        let Some(model) = prices.get(mint) else {
            return Ok(Vec::new());
        };

        let mut points = Vec::new();
        if let Some(opening) = model.opening {
            points.push(PricePoint {
                timestamp: from,
                price: opening,
            });
        }
        points.extend(
            model
                .points
                .iter()
                .filter(|p| p.timestamp >= from && p.timestamp < to)
                .copied(),
        );
        points.push(PricePoint {
            timestamp: to,
            price: model.current,
        });
        Ok(points)
    }

    async fn fetch_current_prices_batch(&self, mints: &[String]) -> price_client::Result<HashMap<String, Decimal>> {
        self.batch_calls.lock().unwrap().push(mints.to_vec());
        let prices = self.prices.lock().unwrap();
        if mints.iter().any(|mint| !prices.contains_key(mint)) {
            return Err(PriceClientError::Api("unknown mint in batch".to_string()));
        }
        Ok(mints
            .iter()
            .filter_map(|mint| prices.get(mint).map(|p| (mint.clone(), p.current)))
            .collect())
    }
}
