use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::models::ErrorBody;

// Failures while forwarding to the functions layer
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("at least one upstream is required")]
    NoUpstreams,

    #[error("no healthy upstreams available")]
    NoHealthyUpstream,

    #[error("request body could not be read: {0}")]
    Body(#[from] axum::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NoUpstreams | GatewayError::NoHealthyUpstream => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Body(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
