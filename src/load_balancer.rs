use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::time::{Duration, interval};
use tracing::{info, warn};

use crate::error::GatewayError;

// Single upstream functions-layer server

pub struct Upstream {
    pub url: String,
    healthy: AtomicBool,
}

impl Upstream {
    pub fn new(url: String) -> Self {
        Self {
            url,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }
}

// Load Balancer with multiple upstreams

pub struct LoadBalancer {
    upstreams: Vec<Arc<Upstream>>,
    current: AtomicUsize,
}

impl LoadBalancer {
    // Create from comma-separated urls "localhost:8788, localhost:8789"
    pub fn new(upstreams_str: &str) -> Result<Self, GatewayError> {
        let upstreams: Vec<Arc<Upstream>> = upstreams_str
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|url| {
                // add http:// if not present
                let full_url = if url.starts_with("http") {
                    url.trim_end_matches('/').to_string()
                } else {
                    format!("http://{}", url.trim_end_matches('/'))
                };
                Arc::new(Upstream::new(full_url))
            })
            .collect();
        if upstreams.is_empty() {
            return Err(GatewayError::NoUpstreams);
        }

        info!(count = upstreams.len(), "load balancer initialized");
        for (i, u) in upstreams.iter().enumerate() {
            info!(index = i + 1, url = %u.url, "upstream registered");
        }

        Ok(Self {
            upstreams,
            current: AtomicUsize::new(0),
        })
    }

    // Get next healthy upstream (round-robin)
    pub fn next_upstream(&self) -> Option<Arc<Upstream>> {
        let len = self.upstreams.len();
        let start = self.current.fetch_add(1, Ordering::Relaxed) % len;

        for i in 0..len {
            let idx = (start + i) % len;
            let upstream = &self.upstreams[idx];

            if upstream.is_healthy() {
                return Some(Arc::clone(upstream));
            }
        }
        // No healthy upstreams
        None
    }

    pub fn all_upstreams(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }

    pub fn healthy_count(&self) -> usize {
        self.upstreams.iter().filter(|u| u.is_healthy()).count()
    }
}

// Health check loop - probes every upstream each `check_interval`

pub async fn health_checker(
    load_balancer: Arc<LoadBalancer>,
    client: reqwest::Client,
    check_interval: Duration,
    health_path: String,
) {
    let mut interval = interval(check_interval);

    info!(?check_interval, %health_path, "health checker started");

    loop {
        interval.tick().await;

        for upstream in load_balancer.all_upstreams() {
            let url = format!("{}{}", upstream.url, health_path);

            let was_healthy = upstream.is_healthy();

            let is_healthy = match client.get(&url).timeout(Duration::from_secs(5)).send().await {
                Ok(res) => res.status().is_success(),
                Err(_) => false,
            };
            upstream.set_healthy(is_healthy);

            // Log status changes
            if was_healthy != is_healthy {
                if is_healthy {
                    info!(url = %upstream.url, "upstream is now healthy");
                } else {
                    warn!(url = %upstream.url, "upstream is now unhealthy");
                }
            }
        }
    }
}
