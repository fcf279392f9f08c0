use async_trait::async_trait;
use config_manager::PriceConfig;
use pnl_core::{decimal_from_f64, PricePoint};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{PriceClientError, PriceSource, Result};

/// Historical price response from BirdEye
#[derive(Debug, Deserialize)]
struct HistoryPriceResponse {
    success: bool,
    data: Option<HistoryPriceData>,
}

#[derive(Debug, Deserialize)]
struct HistoryPriceData {
    #[serde(default)]
    items: Vec<HistoryPriceItem>,
}

#[derive(Debug, Deserialize)]
struct HistoryPriceItem {
    #[serde(rename = "unixTime")]
    unix_time: i64,
    value: f64,
}

/// BirdEye-backed price source
#[derive(Debug, Clone)]
pub struct BirdeyePriceSource {
    api_base_url: String,
    api_key: String,
    http_client: Client,
}

impl BirdeyePriceSource {
    pub fn new(config: &PriceConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;

        Ok(Self {
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            http_client,
        })
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.api_base_url, path);
        let response = self
            .http_client
            .get(&url)
            .header("X-API-KEY", &self.api_key)
            .header("x-chain", "solana")
            .header("accept", "application/json")
            .query(query)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PriceClientError::Status(response.status().as_u16()));
        }
        Ok(response)
    }
}

/// Convert history items into sorted, de-duplicated price points.
pub fn parse_history(mint: &str, body: &str) -> Result<Vec<PricePoint>> {
    let response: HistoryPriceResponse = serde_json::from_str(body)?;
    if !response.success {
        return Err(PriceClientError::Api(format!("history for {} returned success=false", mint)));
    }

    let mut points: Vec<PricePoint> = response
        .data
        .map(|d| d.items)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|item| {
            decimal_from_f64(item.value).map(|price| PricePoint {
                timestamp: item.unix_time,
                price,
            })
        })
        .collect();

    points.sort_by_key(|p| p.timestamp);
    points.dedup_by_key(|p| p.timestamp);
    Ok(points)
}

/// Read `{data: {mint: {value}}}`; entries without a usable value are skipped.
pub fn parse_multi_price(body: &str) -> Result<HashMap<String, Decimal>> {
    let response: Value = serde_json::from_str(body)?;
    if response["success"].as_bool() == Some(false) {
        return Err(PriceClientError::Api("multi_price returned success=false".to_string()));
    }

    let mut prices = HashMap::new();
    if let Some(data) = response["data"].as_object() {
        for (mint, entry) in data {
            match entry["value"].as_f64().and_then(decimal_from_f64) {
                Some(price) => {
                    prices.insert(mint.clone(), price);
                }
                None => debug!("No current price for {}", mint),
            }
        }
    }
    Ok(prices)
}

#[async_trait]
impl PriceSource for BirdeyePriceSource {
    async fn fetch_price_history(&self, mint: &str, from: i64, to: i64) -> Result<Vec<PricePoint>> {
        debug!("Fetching price history from BirdEye for {} ({}..{})", mint, from, to);

        let response = self
            .get(
                "/defi/history_price",
                &[
                    ("address", mint.to_string()),
                    ("address_type", "token".to_string()),
                    ("type", "1H".to_string()),
                    ("time_from", from.to_string()),
                    ("time_to", to.to_string()),
                ],
            )
            .await?;

        let body = response.text().await?;
        parse_history(mint, &body)
    }

    async fn fetch_current_prices_batch(&self, mints: &[String]) -> Result<HashMap<String, Decimal>> {
        if mints.is_empty() {
            return Ok(HashMap::new());
        }
        debug!("Fetching current prices from BirdEye for {} tokens", mints.len());

        let response = self
            .get("/defi/multi_price", &[("list_address", mints.join(","))])
            .await?;
        let body = response.text().await?;
        let prices = parse_multi_price(&body)?;

        if prices.len() < mints.len() {
            warn!(
                "BirdEye returned prices for {}/{} tokens",
                prices.len(),
                mints.len()
            );
        }
        Ok(prices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_history_sorts_and_dedups() {
        let body = r#"{"success":true,"data":{"items":[
            {"unixTime":7200,"value":2.0,"address":"M"},
            {"unixTime":3600,"value":1.5,"address":"M"},
            {"unixTime":7200,"value":2.0,"address":"M"}
        ]}}"#;
        let points = parse_history("M", body).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].timestamp, 3600);
        assert_eq!(points[0].price, dec!(1.5));
        assert_eq!(points[1].price, dec!(2));
    }

    #[test]
    fn test_parse_history_failure_flag() {
        assert!(matches!(
            parse_history("M", r#"{"success":false,"data":null}"#),
            Err(PriceClientError::Api(_))
        ));
    }

    #[test]
    fn test_parse_multi_price_skips_nulls() {
        let body = r#"{"success":true,"data":{
            "A":{"value":0.25,"updateUnixTime":1},
            "B":null
        }}"#;
        let prices = parse_multi_price(body).unwrap();
        assert_eq!(prices.len(), 1);
        assert_eq!(prices["A"], dec!(0.25));
    }
}
