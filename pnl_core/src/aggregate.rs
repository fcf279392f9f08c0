use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::trade_metrics::{compute_trade_metrics, trade_volume_usd, SanityBounds, TradeMetrics};
use crate::{hour_bucket, CachedTransaction, PriceAnalysis, PriceKey, TokenMetadata};

/// Running statistics for one asset within one job.
///
/// Only sums and counts are stored. Averages are always derived from them so that
/// incremental updates and restores stay exact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenAggregate {
    pub mint: String,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub total_volume_usd: Decimal,
    pub total_volume_native: Decimal,
    pub total_pct_change: Decimal,
    pub total_pnl_usd: Decimal,
    pub total_missed_usd: Decimal,
    pub trade_count: u64,
    pub priced_trade_count: u64,
    pub unpriced_trade_count: u64,
    pub sum_purchase_value: Decimal,
    pub sum_trade_value: Decimal,
    pub sum_ath_price: Decimal,
    pub sum_tokens_traded: Decimal,
}

impl TokenAggregate {
    pub fn new(mint: &str) -> Self {
        Self {
            mint: mint.to_string(),
            symbol: None,
            name: None,
            total_volume_usd: Decimal::ZERO,
            total_volume_native: Decimal::ZERO,
            total_pct_change: Decimal::ZERO,
            total_pnl_usd: Decimal::ZERO,
            total_missed_usd: Decimal::ZERO,
            trade_count: 0,
            priced_trade_count: 0,
            unpriced_trade_count: 0,
            sum_purchase_value: Decimal::ZERO,
            sum_trade_value: Decimal::ZERO,
            sum_ath_price: Decimal::ZERO,
            sum_tokens_traded: Decimal::ZERO,
        }
    }

    fn record_priced(&mut self, metrics: &TradeMetrics) {
        self.total_volume_usd += metrics.volume_usd;
        self.total_volume_native += metrics.native_share;
        self.total_pct_change += metrics.pct_change;
        self.total_pnl_usd += metrics.pnl_usd;
        self.total_missed_usd += metrics.missed_usd;
        self.sum_purchase_value += metrics.volume_usd;
        self.sum_trade_value += metrics.current_value_usd;
        self.sum_ath_price += metrics.ath_price;
        self.sum_tokens_traded += metrics.tokens;
        self.trade_count += 1;
        self.priced_trade_count += 1;
    }

    fn record_unpriced(&mut self) {
        self.trade_count += 1;
        self.unpriced_trade_count += 1;
    }

    /// Value-weighted purchase price, `None` when no priced tokens were traded.
    pub fn average_purchase_price(&self) -> Option<Decimal> {
        self.sum_purchase_value.checked_div(self.sum_tokens_traded)
    }

    /// Value-weighted current price of the traded tokens.
    pub fn average_trade_price(&self) -> Option<Decimal> {
        self.sum_trade_value.checked_div(self.sum_tokens_traded)
    }

    pub fn average_ath_price(&self) -> Option<Decimal> {
        self.sum_ath_price
            .checked_div(Decimal::from(self.priced_trade_count))
    }

    pub fn average_pct_change(&self) -> Option<Decimal> {
        self.total_pct_change
            .checked_div(Decimal::from(self.priced_trade_count))
    }
}

/// Scalar counters that live alongside the aggregate map.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScanCounters {
    pub total_trades: u64,
    pub priced_trades: u64,
    pub unpriced_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub discarded_trades: u64,
    pub transactions_processed: u64,
    pub total_volume_native: Decimal,
    pub total_pnl_usd: Decimal,
}

/// What happened to the trades of one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionOutcome {
    pub priced: u32,
    pub unpriced: u32,
    pub discarded: u32,
}

/// In-memory aggregate map for a running job, plus the set of mints touched since the
/// last checkpoint.
///
/// Trades are merged one at a time in transaction order, so the sums depend only on the
/// order of transactions, not on how they were split into batches.
#[derive(Debug, Clone, Default)]
pub struct AggregateBook {
    aggregates: BTreeMap<String, TokenAggregate>,
    counters: ScanCounters,
    dirty: BTreeSet<String>,
}

impl AggregateBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a book from persisted rows and the counters recorded in the last summary.
    pub fn restore(aggregates: Vec<TokenAggregate>, counters: ScanCounters) -> Self {
        let aggregates = aggregates
            .into_iter()
            .map(|agg| (agg.mint.clone(), agg))
            .collect();
        Self {
            aggregates,
            counters,
            dirty: BTreeSet::new(),
        }
    }

    /// Every aggregate, ordered by mint.
    pub fn snapshot(&self) -> Vec<TokenAggregate> {
        self.aggregates.values().cloned().collect()
    }

    pub fn aggregates(&self) -> impl Iterator<Item = &TokenAggregate> {
        self.aggregates.values()
    }

    pub fn get(&self, mint: &str) -> Option<&TokenAggregate> {
        self.aggregates.get(mint)
    }

    pub fn counters(&self) -> &ScanCounters {
        &self.counters
    }

    pub fn len(&self) -> usize {
        self.aggregates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty()
    }

    /// Aggregates modified since the previous call, ready for upsert.
    pub fn take_dirty(&mut self) -> Vec<TokenAggregate> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .filter_map(|mint| self.aggregates.get(&mint).cloned())
            .collect()
    }

    /// Fill in symbol/name for known aggregates without overwriting with unknowns.
    pub fn apply_metadata(&mut self, metadata: &HashMap<String, TokenMetadata>) {
        for (mint, meta) in metadata {
            if let Some(agg) = self.aggregates.get_mut(mint) {
                let mut changed = false;
                if meta.symbol.is_some() && agg.symbol != meta.symbol {
                    agg.symbol = meta.symbol.clone();
                    changed = true;
                }
                if meta.name.is_some() && agg.name != meta.name {
                    agg.name = meta.name.clone();
                    changed = true;
                }
                if changed {
                    self.dirty.insert(mint.clone());
                }
            }
        }
    }

    /// Merge every trade of a transaction into the book.
    ///
    /// Trades whose price analysis is missing count as unpriced. Trades with implausible
    /// prices are dropped before any counter moves; trades with implausible PnL count
    /// toward `total_trades` but contribute nothing else.
    pub fn apply_transaction(
        &mut self,
        tx: &CachedTransaction,
        analyses: &HashMap<PriceKey, PriceAnalysis>,
        bucket_seconds: i64,
        bounds: &SanityBounds,
    ) -> TransactionOutcome {
        let mut outcome = TransactionOutcome::default();
        let bucket = hour_bucket(tx.block_time, bucket_seconds);
        let mut priced = Vec::new();

        self.counters.transactions_processed += 1;

        for trade in &tx.trades {
            match analyses.get(&(trade.mint.clone(), bucket)) {
                None => {
                    self.counters.total_trades += 1;
                    self.counters.unpriced_trades += 1;
                    self.entry(&trade.mint).record_unpriced();
                    outcome.unpriced += 1;
                }
                Some(analysis) => match bounds.check_prices(analysis) {
                    Ok(()) => priced.push((trade, analysis)),
                    Err(rejection) => {
                        warn!("Discarding trade in {}: {}", tx.signature, rejection);
                        self.counters.discarded_trades += 1;
                        outcome.discarded += 1;
                    }
                },
            }
        }

        let tx_volume_usd: Decimal = priced
            .iter()
            .map(|(trade, analysis)| trade_volume_usd(trade, analysis))
            .sum();

        for (trade, analysis) in priced {
            self.counters.total_trades += 1;
            let metrics = compute_trade_metrics(trade, analysis, tx.native_change, tx_volume_usd);

            if let Err(rejection) = bounds.check_pnl(&metrics) {
                warn!("Discarding trade in {}: {}", tx.signature, rejection);
                self.counters.discarded_trades += 1;
                outcome.discarded += 1;
                continue;
            }

            self.counters.priced_trades += 1;
            if metrics.pnl_usd > Decimal::ZERO {
                self.counters.winning_trades += 1;
            } else if metrics.pnl_usd < Decimal::ZERO {
                self.counters.losing_trades += 1;
            }
            self.counters.total_volume_native += metrics.native_share;
            self.counters.total_pnl_usd += metrics.pnl_usd;
            self.entry(&trade.mint).record_priced(&metrics);
            outcome.priced += 1;
        }

        debug!(
            "Applied {}: {} priced, {} unpriced, {} discarded",
            tx.signature, outcome.priced, outcome.unpriced, outcome.discarded
        );
        outcome
    }

    fn entry(&mut self, mint: &str) -> &mut TokenAggregate {
        self.dirty.insert(mint.to_string());
        self.aggregates
            .entry(mint.to_string())
            .or_insert_with(|| TokenAggregate::new(mint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TradeExtract;
    use rust_decimal_macros::dec;

    fn tx(signature: &str, block_time: i64, trades: Vec<(&str, Decimal)>) -> CachedTransaction {
        CachedTransaction {
            signature: signature.to_string(),
            block_time,
            native_change: dec!(-1),
            trades: trades
                .into_iter()
                .map(|(mint, amount)| TradeExtract {
                    mint: mint.to_string(),
                    amount,
                })
                .collect(),
        }
    }

    fn analysis(mint: &str, purchase: Decimal, current: Decimal, ath: Decimal) -> PriceAnalysis {
        PriceAnalysis {
            mint: mint.to_string(),
            purchase_price: purchase,
            purchase_timestamp: 0,
            current_price: current,
            ath_price: ath,
            ath_timestamp: 0,
        }
    }

    #[test]
    fn test_averages_are_sums_over_counts() {
        let mut analyses = HashMap::new();
        analyses.insert(("A".to_string(), 0), analysis("A", dec!(2), dec!(3), dec!(4)));
        analyses.insert(("A".to_string(), 3600), analysis("A", dec!(4), dec!(3), dec!(6)));

        let mut book = AggregateBook::new();
        let bounds = SanityBounds::default();
        book.apply_transaction(&tx("s1", 10, vec![("A", dec!(10))]), &analyses, 3600, &bounds);
        book.apply_transaction(&tx("s2", 3700, vec![("A", dec!(30))]), &analyses, 3600, &bounds);

        let agg = book.get("A").unwrap();
        // (10*2 + 30*4) / 40
        assert_eq!(agg.average_purchase_price(), Some(dec!(3.5)));
        assert_eq!(agg.average_trade_price(), Some(dec!(3)));
        assert_eq!(agg.average_ath_price(), Some(dec!(5)));
        assert_eq!(agg.trade_count, 2);
    }

    #[test]
    fn test_unpriced_trade_has_no_average() {
        let mut book = AggregateBook::new();
        let outcome = book.apply_transaction(
            &tx("s1", 10, vec![("B", dec!(5))]),
            &HashMap::new(),
            3600,
            &SanityBounds::default(),
        );
        assert_eq!(outcome.unpriced, 1);
        let agg = book.get("B").unwrap();
        assert_eq!(agg.unpriced_trade_count, 1);
        assert_eq!(agg.average_purchase_price(), None);
        assert_eq!(book.counters().total_trades, 1);
    }

    #[test]
    fn test_price_outlier_touches_nothing() {
        let mut analyses = HashMap::new();
        analyses.insert(
            ("X".to_string(), 0),
            analysis("X", dec!(1), dec!(2000000), dec!(2000000)),
        );
        let mut book = AggregateBook::new();
        let outcome = book.apply_transaction(
            &tx("s1", 10, vec![("X", dec!(1))]),
            &analyses,
            3600,
            &SanityBounds::default(),
        );

        assert_eq!(outcome.discarded, 1);
        assert!(book.get("X").is_none());
        let counters = book.counters();
        assert_eq!(counters.total_trades, 0);
        assert_eq!(counters.priced_trades, 0);
        assert_eq!(counters.unpriced_trades, 0);
        assert_eq!(counters.total_pnl_usd, Decimal::ZERO);
    }

    #[test]
    fn test_native_change_split_by_volume() {
        let mut analyses = HashMap::new();
        analyses.insert(("A".to_string(), 0), analysis("A", dec!(1), dec!(1), dec!(1)));
        analyses.insert(("B".to_string(), 0), analysis("B", dec!(3), dec!(3), dec!(3)));
        let mut book = AggregateBook::new();
        book.apply_transaction(
            &tx("s1", 0, vec![("A", dec!(1)), ("B", dec!(1))]),
            &analyses,
            3600,
            &SanityBounds::default(),
        );
        assert_eq!(book.get("A").unwrap().total_volume_native, dec!(0.25));
        assert_eq!(book.get("B").unwrap().total_volume_native, dec!(0.75));
        assert_eq!(book.counters().total_volume_native, dec!(1));
    }

    #[test]
    fn test_dirty_tracking_and_restore() {
        let mut analyses = HashMap::new();
        analyses.insert(("A".to_string(), 0), analysis("A", dec!(1), dec!(2), dec!(2)));
        let mut book = AggregateBook::new();
        book.apply_transaction(&tx("s1", 0, vec![("A", dec!(1))]), &analyses, 3600, &SanityBounds::default());

        let dirty = book.take_dirty();
        assert_eq!(dirty.len(), 1);
        assert!(book.take_dirty().is_empty());

        let restored = AggregateBook::restore(book.snapshot(), book.counters().clone());
        assert_eq!(restored.snapshot(), book.snapshot());
        assert_eq!(restored.counters(), book.counters());
    }

    #[test]
    fn test_metadata_never_overwritten_with_unknown() {
        let mut book = AggregateBook::new();
        book.apply_transaction(&tx("s1", 0, vec![("A", dec!(1))]), &HashMap::new(), 3600, &SanityBounds::default());
        let mut meta = HashMap::new();
        meta.insert(
            "A".to_string(),
            TokenMetadata {
                symbol: Some("AAA".to_string()),
                name: None,
            },
        );
        book.apply_metadata(&meta);
        meta.insert("A".to_string(), TokenMetadata::default());
        book.apply_metadata(&meta);
        assert_eq!(book.get("A").unwrap().symbol.as_deref(), Some("AAA"));
    }
}
