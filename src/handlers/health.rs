use axum::{Json, extract::State};
use std::sync::Arc;
use crate::models::{HealthResponse, UpstreamSummary};
use crate::state::AppState;

// Edge liveness plus a view of upstream health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let healthy = state.load_balancer.healthy_count();
    let total = state.load_balancer.all_upstreams().len();

    let status = if healthy > 0 { "healthy" } else { "degraded" };

    Json(HealthResponse {
        status: status.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        upstreams: UpstreamSummary { healthy, total },
    })
}
