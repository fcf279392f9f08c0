use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Standard API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Standard API success response
#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse<T> {
    pub data: T,
    pub timestamp: DateTime<Utc>,
}

impl<T> SuccessResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Body of a start-analysis request. The body itself is optional.
#[derive(Debug, Default, Deserialize)]
pub struct StartAnalysisRequest {
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

pub const DEFAULT_AGENT_ID: &str = "api";
pub const DEFAULT_PAGE_SIZE: u32 = 50;
