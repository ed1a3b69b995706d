use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{RateLimit, RateLimitConfig};
use crate::metrics::STORE_ERRORS_TOTAL;
use crate::models::TooManyRequestsBody;
use crate::store::{KvStore, StoreError};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

// Number of leading path segments that share one counter
const BASE_PATH_SEGMENTS: usize = 2;

const UNKNOWN_CLIENT: &str = "unknown";

// Rate window record - one per (client IP, base path)
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WindowRecord {
    pub count: u32,
    pub window_start: i64, // unix seconds
}

impl WindowRecord {
    pub fn fresh(now: i64) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    pub fn is_expired(&self, now: i64, window: u64) -> bool {
        now.saturating_sub(self.window_start) >= window as i64
    }
}

// Outcome of a rate limit check. remaining == -1 means "not limited"
// (exempt path or store failure)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: i64,
    pub reset_at: i64,
    pub limit: u32,
}

impl RateLimitResult {
    pub const fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: -1,
            reset_at: 0,
            limit: 0,
        }
    }

    pub fn is_limited(&self) -> bool {
        self.remaining >= 0
    }
}

// Fixed window per (client IP, base path). Read-increment-write is not atomic.
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    config: RateLimitConfig,
    store_timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, config: RateLimitConfig, store_timeout: Duration) -> Self {
        Self {
            store,
            config,
            store_timeout,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub async fn check(&self, path: &str, headers: &HeaderMap) -> RateLimitResult {
        let ip = client_ip(headers, &self.config.client_ip_header);
        self.check_at(&ip, path, unix_now()).await
    }

    pub async fn check_at(&self, client_ip: &str, path: &str, now: i64) -> RateLimitResult {
        // lookup and bucketing must see the same path
        let path = normalize_path(path);
        let Some(limit) = self.config.limit_for(&path) else {
            return RateLimitResult::unlimited();
        };

        let key = cache_key(client_ip, &base_path(&path));

        match self.count_request(&key, limit, now).await {
            Ok(result) => {
                debug!(
                    client_ip,
                    %path,
                    allowed = result.allowed,
                    remaining = result.remaining,
                    "rate limit checked"
                );
                result
            }
            Err(err) => {
                STORE_ERRORS_TOTAL.inc();
                warn!(error = %err, client_ip, %path, "rate limit store failed, allowing request");
                RateLimitResult::unlimited()
            }
        }
    }

    async fn count_request(
        &self,
        key: &str,
        limit: RateLimit,
        now: i64,
    ) -> Result<RateLimitResult, StoreError> {
        let stored = self.bounded(self.store.get(key)).await?;

        let mut record = match stored {
            Some(raw) => serde_json::from_str::<WindowRecord>(&raw)?,
            None => WindowRecord::fresh(now),
        };
        if record.is_expired(now, limit.window) {
            record = WindowRecord::fresh(now);
        }
        record.count = record.count.saturating_add(1);

        let raw = serde_json::to_string(&record)?;
        self.bounded(self.store.put(key, raw, Duration::from_secs(limit.window)))
            .await?;

        let requests = i64::from(limit.requests);
        Ok(RateLimitResult {
            allowed: record.count <= limit.requests,
            remaining: (requests - i64::from(record.count)).max(0),
            reset_at: record.window_start + limit.window as i64,
            limit: limit.requests,
        })
    }

    // Caps a store call at `store_timeout`; a hung store counts as a failure
    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.store_timeout, op)
            .await
            .map_err(|_| StoreError::Timeout(self.store_timeout))?
    }
}

// trusted platform header -> first x-forwarded-for hop -> "unknown"
pub fn client_ip(headers: &HeaderMap, trusted_header: &str) -> String {
    let trusted = headers
        .get(trusted_header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = trusted {
        return ip.to_string();
    }

    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(UNKNOWN_CLIENT)
        .to_string()
}

// Collapses repeated and trailing slashes: "//api//events/" -> "/api/events"
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

// "/api/events/42" -> "/api/events"
pub fn base_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .take(BASE_PATH_SEGMENTS)
        .collect();
    format!("/{}", segments.join("/"))
}

// Store key: hash of client IP + base path
pub fn cache_key(client_ip: &str, base_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(client_ip);
    hasher.update(b"\n");
    hasher.update(base_path);
    format!("ratelimit:{:x}", hasher.finalize())
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn rate_limit_headers(result: &RateLimitResult) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if !result.is_limited() {
        return headers;
    }

    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(result.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(result.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(result.reset_at));
    headers
}

pub fn rate_limit_response(result: &RateLimitResult, cors_headers: &HeaderMap) -> Response {
    rate_limit_response_at(result, cors_headers, unix_now())
}

pub fn rate_limit_response_at(
    result: &RateLimitResult,
    cors_headers: &HeaderMap,
    now: i64,
) -> Response {
    let retry_after = (result.reset_at - now).max(1);

    let body = TooManyRequestsBody {
        error: "Too many requests".to_string(),
        message: format!("Rate limit exceeded. Please try again in {retry_after} seconds."),
        retry_after,
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.extend(cors_headers.clone());
    headers.extend(rate_limit_headers(result));
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    const NOW: i64 = 1_760_000_000;

    fn limiter() -> (Arc<MemoryStore>, RateLimiter) {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(
            store.clone(),
            RateLimitConfig::default(),
            Duration::from_millis(250),
        );
        (store, limiter)
    }

    // Store that fails every call
    struct BrokenStore;

    #[async_trait]
    impl KvStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("connection reset".to_string()))
        }

        async fn put(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection reset".to_string()))
        }
    }

    // Reads succeed, every write fails
    struct WriteFailsStore;

    #[async_trait]
    impl KvStore for WriteFailsStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Ok(None)
        }

        async fn put(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("write quota exhausted".to_string()))
        }
    }

    // Store whose reads never complete
    struct HungStore;

    #[async_trait]
    impl KvStore for HungStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            std::future::pending().await
        }

        async fn put(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sixty_one_requests_to_events() {
        let (_, limiter) = limiter();

        for n in 1..=60 {
            let result = limiter.check_at("203.0.113.7", "/api/events", NOW).await;
            assert!(result.allowed, "request {n} should be allowed");
            assert_eq!(result.remaining, 60 - n);
            assert_eq!(result.limit, 60);
            assert_eq!(result.reset_at, NOW + 60);
        }

        let result = limiter.check_at("203.0.113.7", "/api/events", NOW).await;
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);

        let response = rate_limit_response_at(&result, &HeaderMap::new(), NOW + 5);
        assert_eq!(response.headers()[RETRY_AFTER], "55");
    }

    #[tokio::test]
    async fn test_expired_window_resets_counter() {
        let (store, limiter) = limiter();
        let key = cache_key("198.51.100.4", "/api/subscriptions");
        let stale = WindowRecord {
            count: 10,
            window_start: NOW - 61,
        };
        store
            .put(&key, serde_json::to_string(&stale).unwrap(), Duration::from_secs(60))
            .await
            .unwrap();

        let result = limiter
            .check_at("198.51.100.4", "/api/subscriptions", NOW)
            .await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 9);
        assert_eq!(result.reset_at, NOW + 60);
    }

    #[tokio::test]
    async fn test_window_boundary_is_inclusive() {
        let (_, limiter) = limiter();

        for _ in 0..10 {
            limiter.check_at("10.0.0.1", "/api/subscriptions", NOW).await;
        }
        let blocked = limiter
            .check_at("10.0.0.1", "/api/subscriptions", NOW + 59)
            .await;
        assert!(!blocked.allowed);

        let reset = limiter
            .check_at("10.0.0.1", "/api/subscriptions", NOW + 60)
            .await;
        assert!(reset.allowed);
        assert_eq!(reset.remaining, 9);
    }

    #[tokio::test]
    async fn test_exempt_paths_are_not_counted() {
        let (store, limiter) = limiter();

        for path in ["/api/admin/events", "/", "/schedule/mine", "/api/internal/cron"] {
            let result = limiter.check_at("10.0.0.1", path, NOW).await;
            assert_eq!(result, RateLimitResult::unlimited());
            assert!(rate_limit_headers(&result).is_empty());
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sub_resources_share_a_counter() {
        let (_, limiter) = limiter();

        limiter.check_at("10.0.0.1", "/api/events", NOW).await;
        limiter.check_at("10.0.0.1", "/api/events/12", NOW).await;
        let result = limiter
            .check_at("10.0.0.1", "/api/events/12/performances", NOW)
            .await;
        assert_eq!(result.remaining, 57);
    }

    #[tokio::test]
    async fn test_clients_and_endpoints_are_isolated() {
        let (_, limiter) = limiter();

        limiter.check_at("10.0.0.1", "/api/schedule", NOW).await;
        let other_client = limiter.check_at("10.0.0.2", "/api/schedule", NOW).await;
        let other_endpoint = limiter.check_at("10.0.0.1", "/api/feeds", NOW).await;

        assert_eq!(other_client.remaining, 29);
        assert_eq!(other_endpoint.remaining, 19);
    }

    #[tokio::test]
    async fn test_resend_activation_uses_five_minute_window() {
        let (_, limiter) = limiter();

        for _ in 0..3 {
            assert!(
                limiter
                    .check_at("10.0.0.1", "/api/resend-activation", NOW)
                    .await
                    .allowed
            );
        }
        let blocked = limiter
            .check_at("10.0.0.1", "/api/resend-activation", NOW + 200)
            .await;
        assert!(!blocked.allowed);
        assert_eq!(blocked.reset_at, NOW + 300);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let limiter = RateLimiter::new(
            Arc::new(BrokenStore),
            RateLimitConfig::default(),
            Duration::from_millis(250),
        );

        let result = limiter.check_at("10.0.0.1", "/api/events", NOW).await;
        assert_eq!(result, RateLimitResult::unlimited());
    }

    #[tokio::test]
    async fn test_failed_write_fails_open() {
        let limiter = RateLimiter::new(
            Arc::new(WriteFailsStore),
            RateLimitConfig::default(),
            Duration::from_millis(250),
        );

        let result = limiter.check_at("10.0.0.1", "/api/events", NOW).await;
        assert_eq!(result, RateLimitResult::unlimited());
    }

    #[tokio::test]
    async fn test_extra_slashes_share_bucket_and_limit() {
        let (_, limiter) = limiter();

        let first = limiter.check_at("10.0.0.1", "//api/events", NOW).await;
        assert_eq!(first.limit, 60);
        assert_eq!(first.remaining, 59);

        let second = limiter.check_at("10.0.0.1", "/api//events", NOW).await;
        assert_eq!(second.limit, 60);
        assert_eq!(second.remaining, 58);

        let third = limiter.check_at("10.0.0.1", "/api/events/", NOW).await;
        assert_eq!(third.limit, 60);
        assert_eq!(third.remaining, 57);
    }

    #[tokio::test]
    async fn test_extra_slashes_keep_admin_exempt() {
        let (store, limiter) = limiter();

        for path in ["/api//admin/x", "//api/admin", "/api/admin//venues"] {
            let result = limiter.check_at("10.0.0.1", path, NOW).await;
            assert_eq!(result, RateLimitResult::unlimited());
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("//api//events/"), "/api/events");
        assert_eq!(normalize_path("/api/events/42"), "/api/events/42");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
    }

    #[tokio::test]
    async fn test_hung_store_times_out_and_fails_open() {
        let limiter = RateLimiter::new(
            Arc::new(HungStore),
            RateLimitConfig::default(),
            Duration::from_millis(20),
        );

        let result = limiter.check_at("10.0.0.1", "/api/events", NOW).await;
        assert_eq!(result, RateLimitResult::unlimited());
    }

    #[tokio::test]
    async fn test_malformed_record_fails_open() {
        let (store, limiter) = limiter();
        let key = cache_key("10.0.0.1", "/api/events");
        store
            .put(&key, "not json".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        let result = limiter.check_at("10.0.0.1", "/api/events", NOW).await;
        assert_eq!(result, RateLimitResult::unlimited());
    }

    #[tokio::test]
    async fn test_record_is_stored_as_json_blob() {
        let (store, limiter) = limiter();
        limiter.check_at("10.0.0.1", "/api/feeds/rss", NOW).await;

        let raw = store
            .get(&cache_key("10.0.0.1", "/api/feeds"))
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["count"], 1);
        assert_eq!(value["windowStart"], NOW);
    }

    #[test]
    fn test_client_ip_prefers_trusted_header() {
        let mut headers = HeaderMap::new();
        headers.insert("cf-connecting-ip", HeaderValue::from_static("203.0.113.9"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.1.1.1"));
        assert_eq!(client_ip(&headers, "cf-connecting-ip"), "203.0.113.9");
    }

    #[test]
    fn test_client_ip_falls_back_to_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 198.51.100.2 , 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, "cf-connecting-ip"), "198.51.100.2");
        assert_eq!(client_ip(&HeaderMap::new(), "cf-connecting-ip"), "unknown");
    }

    #[test]
    fn test_base_path() {
        assert_eq!(base_path("/api/events"), "/api/events");
        assert_eq!(base_path("/api/events/42/lineup"), "/api/events");
        assert_eq!(base_path("/api/events/"), "/api/events");
        assert_eq!(base_path("/api"), "/api");
    }

    #[test]
    fn test_cache_key_depends_on_ip_and_path() {
        let key = cache_key("10.0.0.1", "/api/events");
        assert!(key.starts_with("ratelimit:"));
        assert_eq!(key, cache_key("10.0.0.1", "/api/events"));
        assert_ne!(key, cache_key("10.0.0.2", "/api/events"));
        assert_ne!(key, cache_key("10.0.0.1", "/api/feeds"));
    }

    #[test]
    fn test_rate_limit_headers_triple() {
        let result = RateLimitResult {
            allowed: true,
            remaining: 12,
            reset_at: NOW + 30,
            limit: 20,
        };
        let headers = rate_limit_headers(&result);
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[X_RATELIMIT_LIMIT], "20");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "12");
        assert_eq!(headers[X_RATELIMIT_RESET], (NOW + 30).to_string());
    }

    #[test]
    fn test_rate_limit_response_retry_after_is_at_least_one() {
        let result = RateLimitResult {
            allowed: false,
            remaining: 0,
            reset_at: NOW,
            limit: 10,
        };
        let mut cors = HeaderMap::new();
        cors.insert(
            "access-control-allow-origin",
            HeaderValue::from_static("https://setlist.example"),
        );

        let response = rate_limit_response_at(&result, &cors, NOW + 30);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "1");
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "https://setlist.example"
        );
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "0");
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
    }
}
