use std::sync::Arc;
use crate::config::AllowedOrigins;
use crate::load_balancer::LoadBalancer;
use crate::rate_limit::RateLimiter;
// app's shared state

pub struct AppState {
    pub client: reqwest::Client,
    pub load_balancer: Arc<LoadBalancer>,
    pub rate_limiter: RateLimiter,        // store is injected into the limiter
    pub allowed_origins: AllowedOrigins, // CORS
}
