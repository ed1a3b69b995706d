use anyhow::Context;
use clap::Parser;
use setlist_edge::app::build_app;
use setlist_edge::config::{AllowedOrigins, Args, RateLimitConfig};
use setlist_edge::load_balancer::{LoadBalancer, health_checker};
use setlist_edge::rate_limit::RateLimiter;
use setlist_edge::state::AppState;
use setlist_edge::store::{MemoryStore, sweep_expired};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let client = reqwest::Client::new();
    let load_balancer = Arc::new(LoadBalancer::new(&args.upstreams)?);

    let store = Arc::new(MemoryStore::new());
    let rate_config = RateLimitConfig::default().with_client_ip_header(&args.client_ip_header);
    let rate_limiter = RateLimiter::new(
        store.clone(),
        rate_config,
        Duration::from_millis(args.store_timeout_ms),
    );

    let state = Arc::new(AppState {
        client: client.clone(),
        load_balancer: load_balancer.clone(),
        rate_limiter,
        allowed_origins: AllowedOrigins::parse(&args.allowed_origins),
    });

    // spawn the background tasks
    tokio::spawn(health_checker(
        load_balancer,
        client,
        Duration::from_secs(args.health_interval),
        args.health_path.clone(),
    ));
    tokio::spawn(sweep_expired(store, Duration::from_secs(args.sweep_interval)));

    let app = build_app(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(port = args.port, "setlist edge listening");
    info!(upstreams = %args.upstreams, "forwarding to functions layer");
    info!(
        store_timeout_ms = args.store_timeout_ms,
        client_ip_header = %args.client_ip_header,
        "rate limiting enabled"
    );

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
