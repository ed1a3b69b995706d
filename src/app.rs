use axum::{Router, middleware, routing::get};
use std::sync::Arc;
use crate::handlers::{health_handler, metrics_handler, proxy_handler};
use crate::middleware::edge_middleware;
use crate::state::AppState;

// Routes served by the edge itself; everything else goes upstream.
// The edge middleware wraps all of them, fallback included.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(middleware::from_fn_with_state(state.clone(), edge_middleware))
        .with_state(state)
}
