use persistence_layer::TransactionCacheStore;
use pnl_core::{CachedTransaction, TokenMetadata};
use rate_limiter::AdaptiveRateLimiter;
use retry_utils::{retry_with_backoff, RetryConfig};
use solana_client::TransactionSource;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{Result, TransactionDecoder};

/// Decoded page of a wallet's history, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionPage {
    pub transactions: Vec<CachedTransaction>,
    /// Every signature listed for the page, including ones that could not be decoded
    pub signatures: Vec<String>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// A job's paced, cached view of the transaction source.
pub struct TransactionCache {
    source: Arc<dyn TransactionSource>,
    decoder: Arc<dyn TransactionDecoder>,
    store: Arc<dyn TransactionCacheStore>,
    limiter: Arc<AdaptiveRateLimiter>,
    retry: RetryConfig,
    fetch_chunk: usize,
}

impl TransactionCache {
    pub fn new(
        source: Arc<dyn TransactionSource>,
        decoder: Arc<dyn TransactionDecoder>,
        store: Arc<dyn TransactionCacheStore>,
        limiter: Arc<AdaptiveRateLimiter>,
        retry: RetryConfig,
        fetch_chunk: usize,
    ) -> Self {
        Self {
            source,
            decoder,
            store,
            limiter,
            retry,
            fetch_chunk: fetch_chunk.max(1),
        }
    }

    /// Fetch up to `limit` transactions older than `cursor`, decoding only cache misses.
    pub async fn fetch_page(
        &self,
        wallet_address: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<TransactionPage> {
        let page = retry_with_backoff("getSignaturesForAddress", &self.retry, || {
            self.limiter.schedule(|| {
                self.source
                    .fetch_signature_page(wallet_address, limit, cursor)
            })
        })
        .await?;

        if page.signatures.is_empty() {
            return Ok(TransactionPage {
                transactions: Vec::new(),
                signatures: Vec::new(),
                next_cursor: page.next_cursor,
                has_more: page.has_more,
            });
        }

        let mut known = self
            .store
            .get_transactions(wallet_address, &page.signatures)
            .await?;
        let misses: Vec<String> = page
            .signatures
            .iter()
            .filter(|sig| !known.contains_key(*sig))
            .cloned()
            .collect();

        debug!(
            "Page for {}: {} signatures, {} cached, {} to fetch",
            wallet_address,
            page.signatures.len(),
            known.len(),
            misses.len()
        );

        let mut decoded = Vec::with_capacity(misses.len());
        for chunk in misses.chunks(self.fetch_chunk) {
            let raws = retry_with_backoff("getTransaction", &self.retry, || {
                self.limiter
                    .schedule_weighted(chunk.len(), || self.source.fetch_transactions(chunk))
            })
            .await?;

            for raw in &raws {
                match self.decoder.decode(raw, wallet_address) {
                    Ok(tx) => decoded.push(tx),
                    Err(e) => warn!("Skipping undecodable transaction {}: {}", raw.signature, e),
                }
            }
        }

        if !decoded.is_empty() {
            self.store
                .store_transactions(wallet_address, &decoded)
                .await?;
        }
        known.extend(decoded.into_iter().map(|tx| (tx.signature.clone(), tx)));

        let transactions = page
            .signatures
            .iter()
            .filter_map(|sig| known.remove(sig))
            .collect();

        Ok(TransactionPage {
            transactions,
            signatures: page.signatures,
            next_cursor: page.next_cursor,
            has_more: page.has_more,
        })
    }

    /// Newest signature of the wallet, if it has any history.
    pub async fn newest_signature(&self, wallet_address: &str) -> Result<Option<String>> {
        let page = retry_with_backoff("getSignaturesForAddress", &self.retry, || {
            self.limiter
                .schedule(|| self.source.fetch_signature_page(wallet_address, 1, None))
        })
        .await?;
        Ok(page.signatures.into_iter().next())
    }

    pub async fn holdings_snapshot(&self, wallet_address: &str) -> Result<u64> {
        let count = retry_with_backoff("getTokenAccountsByOwner", &self.retry, || {
            self.limiter
                .schedule(|| self.source.fetch_holdings_snapshot(wallet_address))
        })
        .await?;
        Ok(count)
    }

    pub async fn asset_metadata(&self, mints: &[String]) -> Result<HashMap<String, TokenMetadata>> {
        if mints.is_empty() {
            return Ok(HashMap::new());
        }
        let metadata = retry_with_backoff("getAssetBatch", &self.retry, || {
            self.limiter
                .schedule(|| self.source.fetch_asset_metadata_batch(mints))
        })
        .await?;
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BalanceChangeDecoder;
    use async_trait::async_trait;
    use config_manager::ProviderLimits;
    use persistence_layer::MemoryStore;
    use rate_limiter::ActiveJobCounter;
    use serde_json::json;
    use solana_client::{RawTransaction, SignaturePage, SolanaClientError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    const WALLET: &str = "Wa11et1111111111111111111111111111111111111";

    /// Five signatures s5..s1, each a 1-token buy of its own mint.
    struct ScriptedSource {
        transaction_fetches: AtomicUsize,
        fetched_signatures: AtomicUsize,
    }

    impl ScriptedSource {
        fn new() -> Self {
            Self {
                transaction_fetches: AtomicUsize::new(0),
                fetched_signatures: AtomicUsize::new(0),
            }
        }

        fn all() -> Vec<String> {
            (1..=5).rev().map(|i| format!("s{}", i)).collect()
        }
    }

    #[async_trait]
    impl TransactionSource for ScriptedSource {
        async fn fetch_signature_page(
            &self,
            _wallet: &str,
            limit: usize,
            cursor: Option<&str>,
        ) -> std::result::Result<SignaturePage, SolanaClientError> {
            let all = Self::all();
            let start = cursor
                .and_then(|c| all.iter().position(|s| s == c).map(|i| i + 1))
                .unwrap_or(0);
            let signatures: Vec<String> = all.iter().skip(start).take(limit).cloned().collect();
            Ok(SignaturePage {
                next_cursor: signatures.last().cloned(),
                has_more: start + signatures.len() < all.len(),
                signatures,
            })
        }

        async fn fetch_transactions(
            &self,
            signatures: &[String],
        ) -> std::result::Result<Vec<RawTransaction>, SolanaClientError> {
            self.transaction_fetches.fetch_add(1, Ordering::SeqCst);
            self.fetched_signatures
                .fetch_add(signatures.len(), Ordering::SeqCst);
            Ok(signatures
                .iter()
                // s3 has no block time and cannot be decoded
                .map(|sig| RawTransaction {
                    signature: sig.clone(),
                    payload: json!({
                        "blockTime": if sig == "s3" { json!(null) } else { json!(1_700_000_000) },
                        "meta": {
                            "preBalances": [10], "postBalances": [9],
                            "preTokenBalances": [],
                            "postTokenBalances": [{
                                "mint": format!("M-{}", sig), "owner": WALLET,
                                "uiTokenAmount": { "amount": "1", "decimals": 0 }
                            }]
                        },
                        "transaction": { "message": { "accountKeys": [WALLET] } }
                    }),
                })
                .collect())
        }

        async fn fetch_holdings_snapshot(
            &self,
            _wallet: &str,
        ) -> std::result::Result<u64, SolanaClientError> {
            Ok(3)
        }

        async fn fetch_asset_metadata_batch(
            &self,
            _mints: &[String],
        ) -> std::result::Result<HashMap<String, TokenMetadata>, SolanaClientError> {
            Ok(HashMap::new())
        }
    }

    fn unpaced() -> ProviderLimits {
        ProviderLimits {
            max_requests_per_second: 1_000.0,
            target_usage_percent: 100.0,
            min_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    fn cache(source: Arc<ScriptedSource>, store: Arc<MemoryStore>) -> TransactionCache {
        paced_cache(source, store, unpaced())
    }

    fn paced_cache(
        source: Arc<ScriptedSource>,
        store: Arc<MemoryStore>,
        limits: ProviderLimits,
    ) -> TransactionCache {
        TransactionCache::new(
            source,
            Arc::new(BalanceChangeDecoder::default()),
            store,
            Arc::new(AdaptiveRateLimiter::new("rpc", limits, ActiveJobCounter::new())),
            RetryConfig::immediate(0),
            2,
        )
    }

    #[tokio::test]
    async fn test_page_in_source_order_and_cached() {
        let source = Arc::new(ScriptedSource::new());
        let store = Arc::new(MemoryStore::new());
        let cache = cache(source.clone(), store);

        let page = cache.fetch_page(WALLET, 4, None).await.unwrap();
        let sigs: Vec<&str> = page.transactions.iter().map(|t| t.signature.as_str()).collect();
        assert_eq!(sigs, vec!["s5", "s4", "s2"]);
        assert_eq!(page.signatures.len(), 4);
        assert_eq!(page.next_cursor.as_deref(), Some("s2"));
        assert!(page.has_more);
        // 4 misses in chunks of 2
        assert_eq!(source.transaction_fetches.load(Ordering::SeqCst), 2);

        let again = cache.fetch_page(WALLET, 4, None).await.unwrap();
        assert_eq!(again.transactions, page.transactions);
        // Only the undecodable s3 is fetched again
        assert_eq!(source.fetched_signatures.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_cursor_continues_with_older_signatures() {
        let source = Arc::new(ScriptedSource::new());
        let cache = cache(source, Arc::new(MemoryStore::new()));

        let page = cache.fetch_page(WALLET, 4, Some("s2")).await.unwrap();
        assert_eq!(page.signatures, vec!["s1"]);
        assert!(!page.has_more);
        assert_eq!(cache.newest_signature(WALLET).await.unwrap().as_deref(), Some("s5"));
        assert_eq!(cache.holdings_snapshot(WALLET).await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_fan_out_is_paced_per_call() {
        let limits = ProviderLimits {
            max_requests_per_second: 10.0,
            target_usage_percent: 100.0,
            min_delay_ms: 0,
            max_delay_ms: 10_000,
        };
        let cache = paced_cache(Arc::new(ScriptedSource::new()), Arc::new(MemoryStore::new()), limits);
        let start = Instant::now();

        // Signature page (100ms), then a first chunk of two fetches (200ms)
        cache.fetch_page(WALLET, 4, None).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(300));

        // The second chunk's two fetches are paid for before the next call
        cache.newest_signature(WALLET).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }
}
