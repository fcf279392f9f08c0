use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use pnl_core::TokenMetadata;
use reqwest::Client;
use retry_utils::{Classify, RetryableError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
const METADATA_CHUNK: usize = 100;

#[derive(Error, Debug)]
pub enum SolanaClientError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl Classify for SolanaClientError {
    fn classify(&self) -> RetryableError {
        match self {
            SolanaClientError::Http(e) if e.is_timeout() || e.is_connect() => RetryableError::Timeout,
            SolanaClientError::Http(e) => e
                .status()
                .map(|s| RetryableError::from_status(s.as_u16()))
                .unwrap_or(RetryableError::Permanent),
            SolanaClientError::Status(code) => RetryableError::from_status(*code),
            // Node is behind or asks callers to slow down
            SolanaClientError::Rpc { code: -32005, .. } | SolanaClientError::Rpc { code: 429, .. } => {
                RetryableError::RateLimit
            }
            _ => RetryableError::Permanent,
        }
    }
}

pub type Result<T> = std::result::Result<T, SolanaClientError>;

/// One page of a wallet's signatures, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignaturePage {
    pub signatures: Vec<String>,
    /// Pass as `cursor` to continue with older signatures
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// A transaction as returned by the source, not yet decoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawTransaction {
    pub signature: String,
    pub payload: Value,
}

/// Where wallet history, holdings and asset metadata come from.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    /// Up to `limit` signatures older than `cursor` (or the newest when `None`).
    async fn fetch_signature_page(
        &self,
        wallet_address: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<SignaturePage>;

    /// Fetch raw transactions in the order given; signatures the source cannot find are omitted.
    async fn fetch_transactions(&self, signatures: &[String]) -> Result<Vec<RawTransaction>>;

    /// Number of non-fungible assets the wallet holds right now.
    async fn fetch_holdings_snapshot(&self, wallet_address: &str) -> Result<u64>;

    async fn fetch_asset_metadata_batch(
        &self,
        mints: &[String],
    ) -> Result<HashMap<String, TokenMetadata>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolanaClientConfig {
    pub rpc_url: String,
    /// Request timeout in seconds
    pub rpc_timeout_seconds: u64,
    /// Parallel `getTransaction` calls per fetch
    pub max_concurrent_requests: usize,
}

impl Default for SolanaClientConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
            rpc_timeout_seconds: 30,
            max_concurrent_requests: 5,
        }
    }
}

impl From<&config_manager::SolanaConfig> for SolanaClientConfig {
    fn from(config: &config_manager::SolanaConfig) -> Self {
        Self {
            rpc_url: config.rpc_url.clone(),
            rpc_timeout_seconds: config.rpc_timeout_seconds,
            max_concurrent_requests: config.max_concurrent_requests.max(1),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct SignatureInfo {
    signature: String,
}

/// JSON-RPC transaction source (requires a DAS-capable endpoint for metadata)
#[derive(Clone)]
pub struct RpcTransactionSource {
    config: SolanaClientConfig,
    http_client: Client,
    request_id_counter: Arc<AtomicU64>,
}

impl RpcTransactionSource {
    pub fn new(config: SolanaClientConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.rpc_timeout_seconds))
            .build()?;

        Ok(Self {
            config,
            http_client,
            request_id_counter: Arc::new(AtomicU64::new(1)),
        })
    }

    fn next_request_id(&self) -> u64 {
        self.request_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    async fn rpc_request(&self, method: &str, params: Value) -> Result<Value> {
        let request_body = json!({
            "jsonrpc": "2.0",
            "id": self.next_request_id(),
            "method": method,
            "params": params
        });

        let response = self
            .http_client
            .post(&self.config.rpc_url)
            .json(&request_body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SolanaClientError::Status(response.status().as_u16()));
        }

        let rpc_response: RpcResponse = response.json().await?;
        if let Some(error) = rpc_response.error {
            return Err(SolanaClientError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(rpc_response.result.unwrap_or(Value::Null))
    }

    async fn get_transaction(&self, signature: &str) -> Result<Option<RawTransaction>> {
        let params = json!([
            signature,
            {
                "encoding": "jsonParsed",
                "commitment": "finalized",
                "maxSupportedTransactionVersion": 0
            }
        ]);
        let result = self.rpc_request("getTransaction", params).await?;
        if result.is_null() {
            return Ok(None);
        }
        Ok(Some(RawTransaction {
            signature: signature.to_string(),
            payload: result,
        }))
    }
}

/// Build a page from a `getSignaturesForAddress` result.
pub fn parse_signature_page(result: Value, limit: usize) -> Result<SignaturePage> {
    let infos: Vec<SignatureInfo> = serde_json::from_value(result)?;
    let signatures: Vec<String> = infos.into_iter().map(|info| info.signature).collect();
    Ok(SignaturePage {
        next_cursor: signatures.last().cloned(),
        has_more: limit > 0 && signatures.len() >= limit,
        signatures,
    })
}

/// Count token accounts holding exactly one indivisible unit.
pub fn count_nft_accounts(result: &Value) -> u64 {
    result["value"]
        .as_array()
        .map(|accounts| {
            accounts
                .iter()
                .filter(|account| {
                    let amount = &account["account"]["data"]["parsed"]["info"]["tokenAmount"];
                    amount["decimals"].as_u64() == Some(0) && amount["amount"].as_str() == Some("1")
                })
                .count() as u64
        })
        .unwrap_or(0)
}

/// Extract symbol/name from a DAS `getAssetBatch` result.
pub fn parse_asset_batch(result: &Value) -> HashMap<String, TokenMetadata> {
    let non_empty = |v: &Value| {
        v.as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    result
        .as_array()
        .map(|assets| {
            assets
                .iter()
                .filter_map(|asset| {
                    let mint = asset["id"].as_str()?.to_string();
                    let meta = &asset["content"]["metadata"];
                    Some((
                        mint,
                        TokenMetadata {
                            symbol: non_empty(&meta["symbol"]),
                            name: non_empty(&meta["name"]),
                        },
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl TransactionSource for RpcTransactionSource {
    async fn fetch_signature_page(
        &self,
        wallet_address: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<SignaturePage> {
        let mut options = serde_json::Map::new();
        options.insert("limit".to_string(), json!(limit));
        options.insert("commitment".to_string(), json!("finalized"));
        if let Some(before) = cursor {
            options.insert("before".to_string(), json!(before));
        }

        let result = self
            .rpc_request("getSignaturesForAddress", json!([wallet_address, options]))
            .await?;
        let page = parse_signature_page(result, limit)?;
        debug!(
            "Fetched {} signatures for {} (cursor: {:?})",
            page.signatures.len(),
            wallet_address,
            cursor
        );
        Ok(page)
    }

    async fn fetch_transactions(&self, signatures: &[String]) -> Result<Vec<RawTransaction>> {
        let results: Vec<Result<Option<RawTransaction>>> = stream::iter(signatures.to_vec())
            .map(|signature| async move { self.get_transaction(&signature).await })
            .buffered(self.config.max_concurrent_requests.max(1))
            .collect()
            .await;

        let mut transactions = Vec::with_capacity(results.len());
        for result in results {
            if let Some(tx) = result? {
                transactions.push(tx);
            }
        }
        Ok(transactions)
    }

    async fn fetch_holdings_snapshot(&self, wallet_address: &str) -> Result<u64> {
        let result = self
            .rpc_request(
                "getTokenAccountsByOwner",
                json!([
                    wallet_address,
                    { "programId": TOKEN_PROGRAM_ID },
                    { "encoding": "jsonParsed" }
                ]),
            )
            .await?;
        Ok(count_nft_accounts(&result))
    }

    async fn fetch_asset_metadata_batch(
        &self,
        mints: &[String],
    ) -> Result<HashMap<String, TokenMetadata>> {
        let mut metadata = HashMap::new();
        for chunk in mints.chunks(METADATA_CHUNK) {
            match self.rpc_request("getAssetBatch", json!({ "ids": chunk })).await {
                Ok(result) => metadata.extend(parse_asset_batch(&result)),
                Err(e) if metadata.is_empty() && chunk.len() == mints.len() => return Err(e),
                Err(e) => warn!("Metadata chunk of {} mints failed: {}", chunk.len(), e),
            }
        }
        Ok(metadata)
    }
}
