use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, ORIGIN, REFERRER_POLICY,
    STRICT_TRANSPORT_SECURITY, VARY, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::config::AllowedOrigins;
use crate::metrics::{RATE_LIMITED_TOTAL, REQUEST_LATENCY, REQUEST_TOTAL};
use crate::rate_limit::{client_ip, rate_limit_headers, rate_limit_response};
use crate::state::AppState;

const PERMISSIONS_POLICY: HeaderName = HeaderName::from_static("permissions-policy");

pub async fn edge_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    REQUEST_TOTAL.inc();
    let start_time = Instant::now();

    let origin = req
        .headers()
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let cors = cors_headers(&state.allowed_origins, origin.as_deref());

    // Preflight never reaches the limiter or the handler
    if req.method() == Method::OPTIONS {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        response.headers_mut().extend(cors);
        return response;
    }

    // only the parts are borrowed across the store calls; the body is not Sync
    let (parts, body) = req.into_parts();
    let result = state
        .rate_limiter
        .check(parts.uri.path(), &parts.headers)
        .await;

    if !result.allowed {
        RATE_LIMITED_TOTAL.inc();
        info!(
            client_ip = %client_ip(&parts.headers, &state.rate_limiter.config().client_ip_header),
            path = %parts.uri.path(),
            limit = result.limit,
            "rate limit exceeded"
        );
        let mut response = rate_limit_response(&result, &cors);
        apply_security_headers(response.headers_mut());
        REQUEST_LATENCY.observe(start_time.elapsed().as_secs_f64());
        return response;
    }

    let mut response = next.run(Request::from_parts(parts, body)).await;

    let headers = response.headers_mut();
    headers.extend(cors);
    headers.extend(rate_limit_headers(&result));
    apply_security_headers(headers);

    REQUEST_LATENCY.observe(start_time.elapsed().as_secs_f64());
    response
}

// Empty if the origin is not allowed
pub fn cors_headers(allowed: &AllowedOrigins, origin: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let allow_origin = match (allowed, origin) {
        (AllowedOrigins::Any, None) => HeaderValue::from_static("*"),
        (_, Some(origin)) if allowed.allows(origin) => match HeaderValue::from_str(origin) {
            Ok(value) => value,
            Err(_) => return headers,
        },
        _ => return headers,
    };

    let echoes_origin = allow_origin != "*";
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    if echoes_origin {
        headers.insert(
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.insert(VARY, HeaderValue::from_static("Origin"));
    }
    headers
}

pub fn apply_security_headers(headers: &mut HeaderMap) {
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    headers.insert(
        PERMISSIONS_POLICY,
        HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
    );
}
