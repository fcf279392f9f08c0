use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::aggregate::{AggregateBook, ScanCounters, TokenAggregate};
use crate::{PnLError, Result};

const TOP_PAIN_POINTS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformerSummary {
    pub mint: String,
    pub symbol: Option<String>,
    pub total_pnl_usd: Decimal,
}

/// An asset ranked by how much value was given up versus its all-time high.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PainPoint {
    pub mint: String,
    pub symbol: Option<String>,
    pub missed_usd: Decimal,
    pub average_ath_price: Option<Decimal>,
    pub average_trade_price: Option<Decimal>,
    pub ath_distance_pct: Option<Decimal>,
}

/// Compact snapshot stored on the job record after every batch.
///
/// It also carries the scalar counters needed to resume a scan, so it has to
/// round-trip through JSON without loss.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LightSummary {
    pub total_missed_usd: Decimal,
    pub total_volume_sol: Decimal,
    pub total_pnl: Decimal,
    pub success_rate: Decimal,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub total_trades: u64,
    pub priced_trades: u64,
    pub unpriced_trades: u64,
    pub discarded_trades: u64,
    pub tokens_discovered: u64,
    pub transactions_processed: u64,
    pub nft_count: u64,
    pub tokens_in_profit: u64,
    pub tokens_in_loss: u64,
    pub best_performer: Option<PerformerSummary>,
    pub worst_performer: Option<PerformerSummary>,
    pub top_pain_points: Vec<PainPoint>,
}

impl LightSummary {
    /// Derive the summary from the current book.
    pub fn derive(book: &AggregateBook, nft_count: u64) -> Self {
        let counters = book.counters();

        let success_rate = Decimal::from(counters.winning_trades)
            .checked_div(Decimal::from(counters.priced_trades))
            .map(|rate| (rate * dec!(100)).round_dp(2))
            .unwrap_or(Decimal::ZERO);

        let mut total_missed_usd = Decimal::ZERO;
        let mut tokens_in_profit = 0;
        let mut tokens_in_loss = 0;
        let mut best: Option<&TokenAggregate> = None;
        let mut worst: Option<&TokenAggregate> = None;

        for agg in book.aggregates() {
            total_missed_usd += agg.total_missed_usd;
            if agg.total_pnl_usd > Decimal::ZERO {
                tokens_in_profit += 1;
            } else if agg.total_pnl_usd < Decimal::ZERO {
                tokens_in_loss += 1;
            }
            if agg.priced_trade_count == 0 {
                continue;
            }
            if best.map_or(true, |b| agg.total_pnl_usd > b.total_pnl_usd) {
                best = Some(agg);
            }
            if worst.map_or(true, |w| agg.total_pnl_usd < w.total_pnl_usd) {
                worst = Some(agg);
            }
        }

        Self {
            total_missed_usd,
            total_volume_sol: counters.total_volume_native,
            total_pnl: counters.total_pnl_usd,
            success_rate,
            winning_trades: counters.winning_trades,
            losing_trades: counters.losing_trades,
            total_trades: counters.total_trades,
            priced_trades: counters.priced_trades,
            unpriced_trades: counters.unpriced_trades,
            discarded_trades: counters.discarded_trades,
            tokens_discovered: book.len() as u64,
            transactions_processed: counters.transactions_processed,
            nft_count,
            tokens_in_profit,
            tokens_in_loss,
            best_performer: best.map(performer),
            worst_performer: worst.map(performer),
            top_pain_points: pain_points(book),
        }
    }

    /// Counters needed to continue a scan from this summary.
    pub fn counters(&self) -> ScanCounters {
        ScanCounters {
            total_trades: self.total_trades,
            priced_trades: self.priced_trades,
            unpriced_trades: self.unpriced_trades,
            winning_trades: self.winning_trades,
            losing_trades: self.losing_trades,
            discarded_trades: self.discarded_trades,
            transactions_processed: self.transactions_processed,
            total_volume_native: self.total_volume_sol,
            total_pnl_usd: self.total_pnl,
        }
    }

    /// Copy forward the metrics an incremental scan cannot re-derive.
    ///
    /// Win rate, native volume, total PnL and the holdings snapshot describe the full
    /// history; an incremental pass only sees the newest transactions.
    pub fn preserve_full_scan_metrics(&mut self, prior: &LightSummary) {
        self.total_volume_sol = prior.total_volume_sol;
        self.total_pnl = prior.total_pnl;
        self.success_rate = prior.success_rate;
        self.nft_count = prior.nft_count;
        self.winning_trades = prior.winning_trades;
        self.losing_trades = prior.losing_trades;
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| PnLError::InvalidSummary(e.to_string()))
    }
}

fn performer(agg: &TokenAggregate) -> PerformerSummary {
    PerformerSummary {
        mint: agg.mint.clone(),
        symbol: agg.symbol.clone(),
        total_pnl_usd: agg.total_pnl_usd,
    }
}

fn pain_points(book: &AggregateBook) -> Vec<PainPoint> {
    let mut ranked: Vec<&TokenAggregate> = book
        .aggregates()
        .filter(|agg| agg.total_missed_usd > Decimal::ZERO)
        .collect();
    // Stable sort keeps mint order among equal values.
    ranked.sort_by(|a, b| b.total_missed_usd.cmp(&a.total_missed_usd));

    ranked
        .into_iter()
        .take(TOP_PAIN_POINTS)
        .map(|agg| {
            let average_ath_price = agg.average_ath_price();
            let average_trade_price = agg.average_trade_price();
            let ath_distance_pct = match (average_ath_price, average_trade_price) {
                (Some(ath), Some(trade)) => ((ath - trade) * dec!(100))
                    .checked_div(ath)
                    .map(|pct| pct.round_dp(2)),
                _ => None,
            };
            PainPoint {
                mint: agg.mint.clone(),
                symbol: agg.symbol.clone(),
                missed_usd: agg.total_missed_usd,
                average_ath_price,
                average_trade_price,
                ath_distance_pct,
            }
        })
        .collect()
}
