//! HTTP surface of the wallet analyzer: start an analysis, poll its status, page through results.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use job_orchestrator::{JobService, OrchestratorError};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::error;

pub mod handlers;
pub mod types;

use handlers::*;
use types::*;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: JobService,
}

impl AppState {
    pub fn new(service: JobService) -> Self {
        Self { service }
    }
}

/// Main application error type
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("Orchestrator error: {0}")]
    Orchestrator(OrchestratorError),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::InvalidWallet(message) => ApiError::Validation(format!("invalid wallet address {}", message)),
            other => ApiError::Orchestrator(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Orchestrator(e) => {
                error!("Request failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(ErrorResponse {
            error: self.to_string(),
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/wallets/:wallet_address/analysis", post(start_analysis))
        .route("/api/wallets/:wallet_address/status", get(get_status))
        .route("/api/wallets/:wallet_address/results", get(get_results))
        .layer(
            ServiceBuilder::new()
                .layer(CorsLayer::permissive())
                .into_inner(),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use config_manager::SystemConfig;
    use job_orchestrator::{Pipeline, QueueManager, Stores};
    use persistence_layer::MemoryStore;
    use pnl_core::{CachedTransaction, PricePoint, TokenMetadata};
    use price_client::PriceSource;
    use rust_decimal::Decimal;
    use serde_json::Value;
    use solana_client::{RawTransaction, SignaturePage, TransactionSource};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tower::ServiceExt;
    use tx_parser::{ParseError, TransactionDecoder};

    const WALLET: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";

    struct QuietChain;

    #[async_trait]
    impl TransactionSource for QuietChain {
        async fn fetch_signature_page(
            &self,
            _wallet_address: &str,
            _limit: usize,
            _cursor: Option<&str>,
        ) -> solana_client::Result<SignaturePage> {
            Ok(SignaturePage::default())
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

    struct NoPrices;

    #[async_trait]
    impl PriceSource for NoPrices {
        async fn fetch_price_history(&self, _mint: &str, _from: i64, _to: i64) -> price_client::Result<Vec<PricePoint>> {
            Ok(Vec::new())
        }

        async fn fetch_current_prices_batch(&self, _mints: &[String]) -> price_client::Result<HashMap<String, Decimal>> {
            Ok(HashMap::new())
        }
    }

    struct RejectAll;

    impl TransactionDecoder for RejectAll {
        fn decode(&self, raw: &RawTransaction, _wallet_address: &str) -> tx_parser::Result<CachedTransaction> {
            Err(ParseError::InvalidFormat(raw.signature.clone()))
        }
    }

    fn app() -> Router {
        let pipeline = Pipeline::new(
            SystemConfig::default(),
            Stores::from_backend(Arc::new(MemoryStore::new())),
            Arc::new(QuietChain),
            Arc::new(RejectAll),
            Arc::new(NoPrices),
        );
        let service = JobService::new(pipeline.clone(), QueueManager::new(pipeline));
        create_router(AppState::new(service))
    }

    async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_start_then_poll_status() {
        let app = app();

        let (status, body) = send(&app, "POST", &format!("/api/wallets/{}/analysis", WALLET)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["status"], "pending");
        let job_id = body["data"]["job_id"].clone();

        let (status, body) = send(&app, "GET", &format!("/api/wallets/{}/status", WALLET)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "pending");
        assert_eq!(body["data"]["job_id"], job_id);

        let (status, body) = send(&app, "GET", &format!("/api/wallets/{}/results?page=1&page_size=10", WALLET)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["tokens"].as_array().unwrap().len(), 0);
        assert_eq!(body["data"]["pagination"]["page_size"], 10);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let app = app();

        let (status, body) = send(&app, "POST", "/api/wallets/not-a-wallet/analysis").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("invalid wallet address"));

        let (status, _) = send(&app, "GET", &format!("/api/wallets/{}/results", WALLET)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Unknown wallets have a status, not an error
        let (status, body) = send(&app, "GET", &format!("/api/wallets/{}/status", WALLET)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "not_found");
    }
}
