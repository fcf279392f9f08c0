use pnl_core::{CachedTransaction, TradeExtract};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use solana_client::RawTransaction;
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

pub mod transaction_cache;

pub use transaction_cache::{TransactionCache, TransactionPage};

/// Lamports per SOL as a decimal scale
const NATIVE_DECIMALS: u32 = 9;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Transaction parsing error: {0}")]
    Parsing(String),
    #[error("Invalid transaction format: {0}")]
    InvalidFormat(String),
    #[error("Missing required data: {0}")]
    MissingData(String),
    #[error("Transaction source error: {0}")]
    Source(#[from] solana_client::SolanaClientError),
    #[error("Transaction cache error: {0}")]
    Store(#[from] persistence_layer::PersistenceError),
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// Turns a raw transaction into the lightweight view the pipeline works on.
pub trait TransactionDecoder: Send + Sync {
    fn decode(&self, raw: &RawTransaction, wallet_address: &str) -> Result<CachedTransaction>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Mints never reported as trades (wrapped native currency)
    pub excluded_mints: Vec<String>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            excluded_mints: vec![
                "So11111111111111111111111111111111111111112".to_string(), // wSOL
            ],
        }
    }
}

/// Decoder based on pre/post balances in the transaction meta
#[derive(Debug, Clone, Default)]
pub struct BalanceChangeDecoder {
    config: DecoderConfig,
}

impl BalanceChangeDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    fn native_change(payload: &Value, wallet_address: &str) -> Result<Decimal> {
        let keys = payload["transaction"]["message"]["accountKeys"]
            .as_array()
            .ok_or_else(|| ParseError::InvalidFormat("missing accountKeys".to_string()))?;

        // jsonParsed gives objects with a pubkey, plain json gives strings
        let wallet_index = keys.iter().position(|key| {
            key.as_str().or_else(|| key["pubkey"].as_str()) == Some(wallet_address)
        });
        let Some(index) = wallet_index else {
            return Ok(Decimal::ZERO);
        };

        let meta = &payload["meta"];
        let pre = meta["preBalances"][index].as_i64().unwrap_or(0);
        let post = meta["postBalances"][index].as_i64().unwrap_or(0);
        Ok(Decimal::new(post - pre, NATIVE_DECIMALS))
    }

    fn token_balances(balances: &Value, wallet_address: &str) -> Result<BTreeMap<String, Decimal>> {
        let mut by_mint = BTreeMap::new();
        let Some(entries) = balances.as_array() else {
            return Ok(by_mint);
        };

        for entry in entries {
            if entry["owner"].as_str() != Some(wallet_address) {
                continue;
            }
            let mint = entry["mint"]
                .as_str()
                .ok_or_else(|| ParseError::MissingData("token balance without mint".to_string()))?;
            let amount = Self::ui_amount(&entry["uiTokenAmount"])?;
            *by_mint.entry(mint.to_string()).or_insert(Decimal::ZERO) += amount;
        }
        Ok(by_mint)
    }

    /// Exact amount from the raw integer string and its decimals.
    fn ui_amount(token_amount: &Value) -> Result<Decimal> {
        let raw = token_amount["amount"]
            .as_str()
            .ok_or_else(|| ParseError::MissingData("uiTokenAmount.amount".to_string()))?;
        let decimals = token_amount["decimals"].as_u64().unwrap_or(0) as u32;
        let mut amount = Decimal::from_str(raw)
            .map_err(|e| ParseError::Parsing(format!("amount '{}': {}", raw, e)))?;
        amount
            .set_scale(decimals)
            .map_err(|e| ParseError::Parsing(format!("decimals {}: {}", decimals, e)))?;
        Ok(amount)
    }
}

impl TransactionDecoder for BalanceChangeDecoder {
    fn decode(&self, raw: &RawTransaction, wallet_address: &str) -> Result<CachedTransaction> {
        let payload = &raw.payload;
        let block_time = payload["blockTime"]
            .as_i64()
            .ok_or_else(|| ParseError::MissingData(format!("blockTime for {}", raw.signature)))?;

        if payload["meta"].is_null() {
            return Err(ParseError::MissingData(format!("meta for {}", raw.signature)));
        }

        let native_change = Self::native_change(payload, wallet_address)?;
        let pre = Self::token_balances(&payload["meta"]["preTokenBalances"], wallet_address)?;
        let post = Self::token_balances(&payload["meta"]["postTokenBalances"], wallet_address)?;

        let mut mints: Vec<&String> = pre.keys().chain(post.keys()).collect();
        mints.sort();
        mints.dedup();

        let trades: Vec<TradeExtract> = mints
            .into_iter()
            .filter(|mint| !self.config.excluded_mints.contains(*mint))
            .filter_map(|mint| {
                let before = pre.get(mint).copied().unwrap_or(Decimal::ZERO);
                let after = post.get(mint).copied().unwrap_or(Decimal::ZERO);
                let amount = after - before;
                (!amount.is_zero()).then(|| TradeExtract {
                    mint: mint.clone(),
                    amount,
                })
            })
            .collect();

        debug!(
            "Decoded {}: {} SOL, {} token changes",
            raw.signature,
            native_change,
            trades.len()
        );

        Ok(CachedTransaction {
            signature: raw.signature.clone(),
            block_time,
            native_change,
            trades,
        })
    }
}
