use lazy_static::lazy_static;
use prometheus::{Counter, Gauge, Histogram, register_counter, register_gauge, register_histogram};


lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("setlist_edge_requests_total", "Total number of requests").unwrap();
    pub static ref RATE_LIMITED_TOTAL: Counter =
        register_counter!("setlist_edge_rate_limited_total", "Requests rejected with 429").unwrap();
    pub static ref STORE_ERRORS_TOTAL: Counter = register_counter!(
        "setlist_edge_store_errors_total",
        "Rate limit store failures that were let through"
    )
    .unwrap();
    pub static ref UPSTREAM_ERRORS_TOTAL: Counter =
        register_counter!("setlist_edge_upstream_errors_total", "Failed upstream calls").unwrap();
    pub static ref REQUEST_LATENCY: Histogram = register_histogram!(
        "setlist_edge_request_latency_seconds",
        "Request latency in seconds"
    )
    .unwrap();
    pub static ref STORE_KEYS: Gauge =
        register_gauge!("setlist_edge_store_keys", "Current number of rate limit records").unwrap();
}
