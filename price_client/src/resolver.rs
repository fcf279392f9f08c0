use async_trait::async_trait;
use chrono::{DateTime, Utc};
use config_manager::PriceConfig;
use persistence_layer::{merge_price_entry, PriceCacheEntry, PriceCacheStore};
use pnl_core::{price_at, PriceAnalysis, PriceKey, PricePoint};
use rate_limiter::AdaptiveRateLimiter;
use retry_utils::{retry_with_backoff, RetryConfig};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{earliest_by_mint, PriceClientError, PriceRequest, PriceResolver, PriceSource, Result};

/// Price analysis for one request, taken from a cache entry.
fn analysis_for(entry: &PriceCacheEntry, timestamp: i64) -> PriceAnalysis {
    PriceAnalysis {
        mint: entry.mint.clone(),
        purchase_price: price_at(&entry.history, timestamp).unwrap_or(entry.purchase_price),
        purchase_timestamp: timestamp,
        current_price: entry.current_price,
        ath_price: entry.ath_price,
        ath_timestamp: entry.ath_timestamp,
    }
}

fn collect_analyses(
    requests: &[PriceRequest],
    entries: &HashMap<String, PriceCacheEntry>,
) -> HashMap<PriceKey, PriceAnalysis> {
    requests
        .iter()
        .filter_map(|request| {
            entries
                .get(&request.mint)
                .map(|entry| (request.key(), analysis_for(entry, request.timestamp)))
        })
        .collect()
}

/// Resolves every request against the remote provider, paced by the job's limiter.
pub struct DirectPriceResolver {
    source: Arc<dyn PriceSource>,
    limiter: Arc<AdaptiveRateLimiter>,
    retry: RetryConfig,
    history_page_seconds: i64,
    max_batch_mints: usize,
}

impl DirectPriceResolver {
    pub fn new(
        source: Arc<dyn PriceSource>,
        limiter: Arc<AdaptiveRateLimiter>,
        retry: RetryConfig,
        config: &PriceConfig,
    ) -> Self {
        Self {
            source,
            limiter,
            retry,
            history_page_seconds: config.history_page_seconds.max(3600),
            max_batch_mints: config.max_batch_mints.max(1),
        }
    }

    /// Full history from `from` to `now`, merged into a cache entry.
    pub async fn fetch_entry(&self, mint: &str, from: i64, now: DateTime<Utc>) -> Result<PriceCacheEntry> {
        let to = now.timestamp().max(from + 1);
        let mut merged: BTreeMap<i64, Decimal> = BTreeMap::new();

        let mut start = from;
        while start < to {
            let end = (start + self.history_page_seconds).min(to);
            let page = retry_with_backoff("history_price", &self.retry, || {
                self.limiter
                    .schedule(|| self.source.fetch_price_history(mint, start, end))
            })
            .await?;
            for point in page {
                merged.insert(point.timestamp, point.price);
            }
            start = end;
        }

        let history: Vec<PricePoint> = merged
            .into_iter()
            .map(|(timestamp, price)| PricePoint { timestamp, price })
            .collect();

        let (Some(first), Some(last)) = (history.first().copied(), history.last().copied()) else {
            return Err(PriceClientError::NoPriceData(mint.to_string()));
        };

        let mut ath = first;
        for point in &history {
            if point.price > ath.price {
                ath = *point;
            }
        }

        debug!(
            "History for {}: {} points, ATH ${} at {}",
            mint,
            history.len(),
            ath.price,
            ath.timestamp
        );

        Ok(PriceCacheEntry {
            mint: mint.to_string(),
            purchase_price: first.price,
            purchase_timestamp: from,
            current_price: last.price,
            current_price_updated_at: now,
            ath_price: ath.price,
            ath_timestamp: ath.timestamp,
            history,
            updated_at: now,
        })
    }

    /// Current prices with one provider call per `max_batch_mints` mints.
    pub async fn current_prices(&self, mints: &[String]) -> Result<HashMap<String, Decimal>> {
        let mut prices = HashMap::new();
        for chunk in mints.chunks(self.max_batch_mints) {
            let batch = retry_with_backoff("multi_price", &self.retry, || {
                self.limiter
                    .schedule(|| self.source.fetch_current_prices_batch(chunk))
            })
            .await?;
            prices.extend(batch);
        }
        Ok(prices)
    }
}

#[async_trait]
impl PriceResolver for DirectPriceResolver {
    async fn resolve_batch(&self, requests: &[PriceRequest]) -> Result<HashMap<PriceKey, PriceAnalysis>> {
        let now = Utc::now();
        let mut entries = HashMap::new();

        for (mint, from) in earliest_by_mint(requests) {
            match self.fetch_entry(&mint, from, now).await {
                Ok(entry) => {
                    entries.insert(mint, entry);
                }
                Err(e) => warn!("⚠️ No price for {}: {}", mint, e),
            }
        }

        Ok(collect_analyses(requests, &entries))
    }
}

/// Cache-aware resolver wrapping a [`DirectPriceResolver`].
///
/// Per mint: a fresh entry covering the request is used as is, a stale one only has its
/// current price refreshed (all stale mints in one batched call), anything else is fetched
/// in full and written back.
pub struct CachedPriceResolver {
    inner: DirectPriceResolver,
    store: Arc<dyn PriceCacheStore>,
    freshness: chrono::Duration,
}

impl CachedPriceResolver {
    pub fn new(inner: DirectPriceResolver, store: Arc<dyn PriceCacheStore>, freshness_window_seconds: u64) -> Self {
        Self {
            inner,
            store,
            freshness: chrono::Duration::seconds(freshness_window_seconds as i64),
        }
    }
}

#[async_trait]
impl PriceResolver for CachedPriceResolver {
    async fn resolve_batch(&self, requests: &[PriceRequest]) -> Result<HashMap<PriceKey, PriceAnalysis>> {
        if requests.is_empty() {
            return Ok(HashMap::new());
        }

        let now = Utc::now();
        let wanted = earliest_by_mint(requests);
        let mints: Vec<String> = wanted.iter().map(|(mint, _)| mint.clone()).collect();
        let mut entries = self.store.get_price_entries(&mints).await?;

        let mut fresh = 0usize;
        let mut stale = Vec::new();
        let mut missing = Vec::new();
        for (mint, from) in wanted {
            match entries.get(&mint) {
                Some(entry) if entry.purchase_timestamp <= from => {
                    if now - entry.current_price_updated_at < self.freshness {
                        fresh += 1;
                    } else {
                        stale.push(mint);
                    }
                }
                _ => missing.push((mint, from)),
            }
        }

        if !stale.is_empty() {
            match self.inner.current_prices(&stale).await {
                Ok(prices) => {
                    self.store.update_current_prices(&prices, now).await?;
                    for (mint, price) in &prices {
                        if let Some(entry) = entries.get_mut(mint) {
                            entry.current_price = *price;
                            entry.current_price_updated_at = now;
                        }
                    }
                }
                // Stale prices are still better than none
                Err(e) => warn!("⚠️ Current price refresh failed for {} tokens: {}", stale.len(), e),
            }
        }

        for (mint, from) in &missing {
            match self.inner.fetch_entry(mint, *from, now).await {
                Ok(fetched) => {
                    self.store.upsert_price_entry(&fetched).await?;
                    let merged = merge_price_entry(entries.get(mint), fetched);
                    entries.insert(mint.clone(), merged);
                }
                Err(e) => {
                    warn!("⚠️ No price for {}: {}", mint, e);
                    entries.remove(mint);
                }
            }
        }

        info!(
            "Resolved prices for {} tokens: {} fresh, {} stale, {} fetched",
            mints.len(),
            fresh,
            stale.len(),
            missing.len()
        );

        Ok(collect_analyses(requests, &entries))
    }
}
