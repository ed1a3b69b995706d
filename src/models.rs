use serde::{Deserialize, Serialize};

// Body of a 429 response
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TooManyRequestsBody {
    pub error: String,
    pub message: String,
    pub retry_after: i64, // seconds
}

// Body of gateway-generated errors (no upstream, upstream failure)
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct UpstreamSummary {
    pub healthy: usize,
    pub total: usize,
}

// GET /health response
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub upstreams: UpstreamSummary,
}
