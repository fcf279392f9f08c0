use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::{PriceAnalysis, TradeExtract};

/// Ceilings above which upstream price data is considered corrupt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SanityBounds {
    /// Maximum plausible unit price in USD for purchase, current and ATH prices
    pub max_price_usd: Decimal,
    /// Maximum plausible absolute profit/loss in USD for a single trade
    pub max_trade_pnl_usd: Decimal,
}

impl Default for SanityBounds {
    fn default() -> Self {
        Self {
            max_price_usd: dec!(1000000),
            max_trade_pnl_usd: dec!(100000),
        }
    }
}

/// Why a trade was kept out of every aggregate.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    PriceOutOfBounds { mint: String, price: Decimal },
    PnlOutOfBounds { mint: String, pnl_usd: Decimal },
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::PriceOutOfBounds { mint, price } => {
                write!(f, "price ${} for {} exceeds sanity ceiling", price, mint)
            }
            Rejection::PnlOutOfBounds { mint, pnl_usd } => {
                write!(f, "pnl ${} for {} exceeds sanity ceiling", pnl_usd, mint)
            }
        }
    }
}

impl SanityBounds {
    /// Reject analyses carrying an implausible purchase, current or ATH price.
    pub fn check_prices(&self, analysis: &PriceAnalysis) -> Result<(), Rejection> {
        for price in [
            analysis.purchase_price,
            analysis.current_price,
            analysis.ath_price,
        ] {
            if price > self.max_price_usd {
                return Err(Rejection::PriceOutOfBounds {
                    mint: analysis.mint.clone(),
                    price,
                });
            }
        }
        Ok(())
    }

    /// Reject trades whose computed profit/loss is implausible in either direction.
    pub fn check_pnl(&self, metrics: &TradeMetrics) -> Result<(), Rejection> {
        if metrics.pnl_usd.abs() > self.max_trade_pnl_usd {
            return Err(Rejection::PnlOutOfBounds {
                mint: metrics.mint.clone(),
                pnl_usd: metrics.pnl_usd,
            });
        }
        Ok(())
    }
}

/// Monetary outcome of one priced trade.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeMetrics {
    pub mint: String,
    /// Absolute number of tokens moved
    pub tokens: Decimal,
    pub purchase_price: Decimal,
    pub current_price: Decimal,
    pub ath_price: Decimal,
    /// Purchase-time USD value of the trade
    pub volume_usd: Decimal,
    /// This trade's share of the transaction's native balance change (absolute)
    pub native_share: Decimal,
    pub pct_change: Decimal,
    pub pnl_usd: Decimal,
    pub missed_usd: Decimal,
    /// Current USD value of the traded tokens
    pub current_value_usd: Decimal,
}

/// Purchase-time USD volume of a trade.
pub fn trade_volume_usd(trade: &TradeExtract, analysis: &PriceAnalysis) -> Decimal {
    trade.amount.abs() * analysis.purchase_price
}

/// Compute the per-trade figures.
///
/// `tx_volume_usd` is the summed purchase-time volume of every priced trade in the same
/// transaction; the native change is split across trades proportionally to that volume.
pub fn compute_trade_metrics(
    trade: &TradeExtract,
    analysis: &PriceAnalysis,
    tx_native_change: Decimal,
    tx_volume_usd: Decimal,
) -> TradeMetrics {
    let tokens = trade.amount.abs();
    let volume_usd = tokens * analysis.purchase_price;

    let native_share = if tx_volume_usd.is_zero() {
        Decimal::ZERO
    } else {
        ((volume_usd / tx_volume_usd) * tx_native_change).abs()
    };

    let price_delta = analysis.current_price - analysis.purchase_price;
    let pct_change = if analysis.purchase_price.is_zero() {
        Decimal::ZERO
    } else {
        price_delta / analysis.purchase_price * dec!(100)
    };

    let missed_per_token = (analysis.ath_price - analysis.current_price).max(Decimal::ZERO);

    TradeMetrics {
        mint: trade.mint.clone(),
        tokens,
        purchase_price: analysis.purchase_price,
        current_price: analysis.current_price,
        ath_price: analysis.ath_price,
        volume_usd,
        native_share,
        pct_change,
        pnl_usd: tokens * price_delta,
        missed_usd: tokens * missed_per_token,
        current_value_usd: tokens * analysis.current_price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis(purchase: Decimal, current: Decimal, ath: Decimal) -> PriceAnalysis {
        PriceAnalysis {
            mint: "MintA".to_string(),
            purchase_price: purchase,
            purchase_timestamp: 0,
            current_price: current,
            ath_price: ath,
            ath_timestamp: 0,
        }
    }

    #[test]
    fn test_metrics_for_losing_trade() {
        let trade = TradeExtract {
            mint: "MintA".to_string(),
            amount: dec!(-10),
        };
        let a = analysis(dec!(2), dec!(1), dec!(5));
        let m = compute_trade_metrics(&trade, &a, dec!(-0.5), dec!(40));

        assert_eq!(m.tokens, dec!(10));
        assert_eq!(m.volume_usd, dec!(20));
        // 20 / 40 of a 0.5 SOL change
        assert_eq!(m.native_share, dec!(0.25));
        assert_eq!(m.pct_change, dec!(-50));
        assert_eq!(m.pnl_usd, dec!(-10));
        assert_eq!(m.missed_usd, dec!(40));
        assert_eq!(m.current_value_usd, dec!(10));
    }

    #[test]
    fn test_missed_is_zero_when_current_above_ath() {
        let trade = TradeExtract {
            mint: "MintA".to_string(),
            amount: dec!(3),
        };
        let m = compute_trade_metrics(&trade, &analysis(dec!(1), dec!(4), dec!(3)), dec!(1), dec!(3));
        assert_eq!(m.missed_usd, Decimal::ZERO);
        assert_eq!(m.pct_change, dec!(300));
    }

    #[test]
    fn test_zero_purchase_price_and_volume_do_not_divide() {
        let trade = TradeExtract {
            mint: "MintA".to_string(),
            amount: dec!(3),
        };
        let m = compute_trade_metrics(&trade, &analysis(dec!(0), dec!(4), dec!(4)), dec!(1), dec!(0));
        assert_eq!(m.pct_change, Decimal::ZERO);
        assert_eq!(m.native_share, Decimal::ZERO);
    }

    #[test]
    fn test_sanity_bounds() {
        let bounds = SanityBounds::default();
        assert!(bounds
            .check_prices(&analysis(dec!(1), dec!(1000001), dec!(2)))
            .is_err());
        assert!(bounds.check_prices(&analysis(dec!(1), dec!(2), dec!(3))).is_ok());

        let trade = TradeExtract {
            mint: "MintA".to_string(),
            amount: dec!(200000),
        };
        let m = compute_trade_metrics(&trade, &analysis(dec!(1), dec!(2), dec!(2)), dec!(1), dec!(1));
        assert!(matches!(
            bounds.check_pnl(&m),
            Err(Rejection::PnlOutOfBounds { .. })
        ));
    }
}
