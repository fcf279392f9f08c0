pub mod aggregate;
pub mod summary;
pub mod trade_metrics;

pub use aggregate::{AggregateBook, ScanCounters, TokenAggregate, TransactionOutcome};
pub use summary::{LightSummary, PainPoint, PerformerSummary};
pub use trade_metrics::{compute_trade_metrics, Rejection, SanityBounds, TradeMetrics};

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PnLError {
    #[error("Invalid summary data: {0}")]
    InvalidSummary(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Calculation error: {0}")]
    Calculation(String),
}

pub type Result<T> = std::result::Result<T, PnLError>;

/// Seconds in the default hour bucket
pub const DEFAULT_HOUR_BUCKET_SECONDS: i64 = 3600;

/// One balance-changing transfer of a fungible asset, as extracted by the decoder.
///
/// `amount` is signed: positive when the wallet received tokens, negative when it sent them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeExtract {
    pub mint: String,
    pub amount: Decimal,
}

/// Decoded, immutable view of a finalized transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedTransaction {
    pub signature: String,
    /// Unix seconds
    pub block_time: i64,
    /// Net native-currency (SOL) balance change of the wallet
    pub native_change: Decimal,
    pub trades: Vec<TradeExtract>,
}

/// Price context for one asset at one purchase time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceAnalysis {
    pub mint: String,
    pub purchase_price: Decimal,
    pub purchase_timestamp: i64,
    pub current_price: Decimal,
    pub ath_price: Decimal,
    pub ath_timestamp: i64,
}

/// A single sample from a price history series.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PricePoint {
    pub timestamp: i64,
    pub price: Decimal,
}

/// Display metadata for a mint. Either field may be unknown.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenMetadata {
    pub symbol: Option<String>,
    pub name: Option<String>,
}

/// Key used to match a trade to a resolved price: (mint, hour-bucketed timestamp).
pub type PriceKey = (String, i64);

/// Round a unix timestamp down to the start of its bucket.
pub fn hour_bucket(timestamp: i64, bucket_seconds: i64) -> i64 {
    if bucket_seconds <= 0 {
        return timestamp;
    }
    timestamp - timestamp.rem_euclid(bucket_seconds)
}

/// Convert a provider float into a decimal, rejecting NaN and infinities.
pub fn decimal_from_f64(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::from_f64(value)
}

/// Price in `history` in effect at `timestamp`: the last sample at or before it,
/// falling back to the first sample when the series starts later.
pub fn price_at(history: &[PricePoint], timestamp: i64) -> Option<Decimal> {
    history
        .iter()
        .take_while(|p| p.timestamp <= timestamp)
        .last()
        .or_else(|| history.first())
        .map(|p| p.price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_hour_bucket_rounds_down() {
        assert_eq!(hour_bucket(7_205, 3600), 7_200);
        assert_eq!(hour_bucket(7_200, 3600), 7_200);
        assert_eq!(hour_bucket(-1, 3600), -3600);
        assert_eq!(hour_bucket(1_234, 0), 1_234);
    }

    #[test]
    fn test_decimal_from_f64_rejects_non_finite() {
        assert_eq!(decimal_from_f64(f64::NAN), None);
        assert_eq!(decimal_from_f64(f64::INFINITY), None);
        assert_eq!(decimal_from_f64(0.5), Some(dec!(0.5)));
    }

    #[test]
    fn test_price_at_picks_preceding_sample() {
        let history = vec![
            PricePoint { timestamp: 100, price: dec!(1) },
            PricePoint { timestamp: 200, price: dec!(2) },
            PricePoint { timestamp: 300, price: dec!(3) },
        ];
        assert_eq!(price_at(&history, 250), Some(dec!(2)));
        assert_eq!(price_at(&history, 300), Some(dec!(3)));
        assert_eq!(price_at(&history, 50), Some(dec!(1)));
        assert_eq!(price_at(&[], 50), None);
    }
}
