use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::header::{CONNECTION, CONTENT_LENGTH, HOST, TE, TRAILER, TRANSFER_ENCODING, UPGRADE};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::Response;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::metrics::UPSTREAM_ERRORS_TOTAL;
use crate::rate_limit::client_ip;
use crate::state::AppState;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

// Headers that describe one hop and must not be relayed
const HOP_BY_HOP: [HeaderName; 7] = [
    CONNECTION,
    HOST,
    CONTENT_LENGTH,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

// Forward anything not served by the edge to an upstream route handler
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Result<Response, GatewayError> {
    let upstream = state
        .load_balancer
        .next_upstream()
        .ok_or(GatewayError::NoHealthyUpstream)?;

    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", upstream.url, path_and_query);

    let mut headers = strip_hop_by_hop(&parts.headers);
    let ip = client_ip(&parts.headers, &state.rate_limiter.config().client_ip_header);
    if let Ok(value) = HeaderValue::from_str(&ip) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    let body = to_bytes(body, MAX_BODY_BYTES).await?;

    debug!(method = %parts.method, %url, "forwarding request");

    let result = state
        .client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    let res = match result {
        Ok(res) => res,
        // Marking upstream as unhealthy on error
        Err(e) => {
            UPSTREAM_ERRORS_TOTAL.inc();
            upstream.set_healthy(false);
            warn!(url = %upstream.url, error = %e, "upstream failed, marked unhealthy");
            return Err(e.into());
        }
    };

    let status = res.status();
    let headers = strip_hop_by_hop(res.headers());
    let bytes = res.bytes().await?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in HOP_BY_HOP {
        out.remove(name);
    }
    out.remove("keep-alive");
    out.remove("proxy-connection");
    out
}
