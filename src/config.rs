use clap::Parser;

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "setlist-edge")]
#[command(about = "Edge middleware for the setlist event scheduler: CORS, rate limiting and security headers")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "SETLIST_EDGE_PORT", default_value_t = 8080)]
    pub port: u16,

    // Upstream functions-layer servers (comma-separated)
    // Example: "localhost:8788,localhost:8789"
    #[arg(short, long, env = "SETLIST_EDGE_UPSTREAMS", default_value = "localhost:8788")]
    pub upstreams: String,

    // Health check interval in seconds
    #[arg(long, env = "SETLIST_EDGE_HEALTH_INTERVAL", default_value_t = 30)]
    pub health_interval: u64,

    // Upstream path probed by the health checker
    #[arg(long, env = "SETLIST_EDGE_HEALTH_PATH", default_value = "/api/health")]
    pub health_path: String,

    // Upper bound for a single rate limit store call, in milliseconds
    #[arg(long, env = "SETLIST_EDGE_STORE_TIMEOUT_MS", default_value_t = 250)]
    pub store_timeout_ms: u64,

    // How often expired rate limit records are swept, in seconds
    #[arg(long, env = "SETLIST_EDGE_SWEEP_INTERVAL", default_value_t = 60)]
    pub sweep_interval: u64,

    // Header the hosting platform sets to the real client address
    #[arg(long, env = "SETLIST_EDGE_CLIENT_IP_HEADER", default_value = "cf-connecting-ip")]
    pub client_ip_header: String,

    // CORS origins (comma-separated), "*" allows any
    #[arg(long, env = "SETLIST_EDGE_ALLOWED_ORIGINS", default_value = "*")]
    pub allowed_origins: String,

    // Emit logs as JSON lines
    #[arg(long, env = "SETLIST_EDGE_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

// `requests` per `window` seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests: u32,
    pub window: u64,
}

impl RateLimit {
    pub const fn new(requests: u32, window: u64) -> Self {
        Self { requests, window }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateRule {
    pub prefix: String,
    pub limit: RateLimit,
}

impl RateRule {
    pub fn new(prefix: impl Into<String>, requests: u32, window: u64) -> Self {
        Self {
            prefix: prefix.into(),
            limit: RateLimit::new(requests, window),
        }
    }
}

// Rules are tried in order, first match wins. Unmatched API paths get
// default_limit; paths outside api_root or under a skip prefix are exempt.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub api_root: String,
    pub skip_prefixes: Vec<String>,
    pub rules: Vec<RateRule>,
    pub default_limit: RateLimit,
    pub client_ip_header: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            api_root: "/api".to_string(),
            skip_prefixes: vec!["/api/admin".to_string(), "/api/internal".to_string()],
            rules: vec![
                RateRule::new("/api/events", 60, 60),
                RateRule::new("/api/schedule", 30, 60),
                RateRule::new("/api/feeds", 20, 60),
                RateRule::new("/api/subscriptions", 10, 60),
                RateRule::new("/api/metrics", 100, 60),
                RateRule::new("/api/activate", 10, 60),
                RateRule::new("/api/resend-activation", 3, 300),
            ],
            default_limit: RateLimit::new(30, 60),
            client_ip_header: "cf-connecting-ip".to_string(),
        }
    }
}

impl RateLimitConfig {
    pub fn with_client_ip_header(mut self, header: impl Into<String>) -> Self {
        self.client_ip_header = header.into().to_ascii_lowercase();
        self
    }

    pub fn limit_for(&self, path: &str) -> Option<RateLimit> {
        if !has_prefix(path, &self.api_root) {
            return None;
        }
        if self.skip_prefixes.iter().any(|skip| has_prefix(path, skip)) {
            return None;
        }

        let limit = self
            .rules
            .iter()
            .find(|rule| has_prefix(path, &rule.prefix))
            .map(|rule| rule.limit)
            .unwrap_or(self.default_limit);
        Some(limit)
    }
}

// Prefix match on a segment boundary: "/api/events" matches "/api/events/1"
// but not "/api/eventsfeed"
fn has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    Any,
    List(Vec<String>),
}

impl AllowedOrigins {
    // Parse "*" or "https://a.example,https://b.example"
    pub fn parse(raw: &str) -> Self {
        let origins: Vec<String> = raw
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.trim_end_matches('/').to_string())
            .collect();

        if origins.is_empty() || origins.iter().any(|o| o == "*") {
            AllowedOrigins::Any
        } else {
            AllowedOrigins::List(origins)
        }
    }

    pub fn allows(&self, origin: &str) -> bool {
        match self {
            AllowedOrigins::Any => true,
            AllowedOrigins::List(list) => list.iter().any(|o| o == origin),
        }
    }
}
