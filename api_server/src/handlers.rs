use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use tracing::{debug, info};

use crate::types::*;
use crate::{ApiError, AppState};

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(SuccessResponse::new(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

/// Start (or resume, or refresh) the analysis of a wallet
pub async fn start_analysis(
    State(state): State<AppState>,
    Path(wallet_address): Path<String>,
    body: Option<Json<StartAnalysisRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let agent_id = request.agent_id.as_deref().unwrap_or(DEFAULT_AGENT_ID);

    let response = state.service.start_analysis(&wallet_address, agent_id).await?;
    info!(
        "Analysis requested for {} by {}: job {} ({})",
        wallet_address, agent_id, response.job_id, response.status
    );

    let status = if response.cached {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(SuccessResponse::new(response))))
}

/// Status of the latest job for a wallet
pub async fn get_status(
    State(state): State<AppState>,
    Path(wallet_address): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.service.get_status(&wallet_address).await?;
    debug!("Status for {}: {}", wallet_address, status.status);
    Ok(Json(SuccessResponse::new(status)))
}

/// Paginated per-token results of the latest job
pub async fn get_results(
    State(state): State<AppState>,
    Path(wallet_address): Path<String>,
    Query(query): Query<ResultsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = query.page.unwrap_or(1);
    let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE);

    let results = state
        .service
        .get_results(&wallet_address, page, page_size)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no analysis for wallet {}", wallet_address)))?;

    Ok(Json(SuccessResponse::new(results)))
}
