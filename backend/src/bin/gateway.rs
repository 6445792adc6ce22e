use axum::{
    http::Method,
    middleware as axum_middleware,
    routing::{any, get},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use palisade_backend::{
    config::GatewayConfig,
    gateway::client::UpstreamClients,
    gateway::health::{spawn_probe, HealthRegistry},
    gateway::metrics::GatewayMetrics,
    gateway::proxy::dispatch,
    gateway::routes::Upstream,
    handlers,
    middleware::rate_limit::{create_login_rate_limiter, SlidingWindowLimiter},
    middleware::request_context::request_context,
    state::GatewayState,
};

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "palisade_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::load()?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers.max(1));
    }
    builder.build()?.block_on(run(config))
}

async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    tracing::info!(
        authn_base_url = %config.authn_base_url,
        authz_base_url = %config.authz_base_url,
        upstream_timeout_secs = config.upstream_timeout_secs,
        dev_fallback = config.dev_fallback,
        rate_limit_max_requests = config.rate_limit_max_requests,
        rate_limit_window_secs = config.rate_limit_window_secs,
        "Loaded configuration from environment/.env"
    );
    if config.dev_fallback {
        tracing::warn!(
            "Development fallback enabled: authorize calls fail open when the \
             authorization service is unreachable"
        );
    }

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .pool_max_idle_per_host(20)
        .build()?;

    let clients = Arc::new(UpstreamClients::new(client.clone(), &config));
    let limiter = Arc::new(SlidingWindowLimiter::from_config(&config));
    let health = Arc::new(HealthRegistry::default());
    let metrics = Arc::new(GatewayMetrics::default());

    let probe_interval = Duration::from_secs(config.health_probe_interval_secs);
    spawn_probe(
        client.clone(),
        health.clone(),
        Upstream::Authn,
        config.authn_base_url.clone(),
        probe_interval,
    );
    spawn_probe(
        client,
        health.clone(),
        Upstream::Authz,
        config.authz_base_url.clone(),
        probe_interval,
    );

    let state = GatewayState::new(config.clone(), clients, limiter, health, metrics);

    let meta_routes = Router::new()
        .route("/gateway/health", get(handlers::gateway::gateway_health))
        .route("/gateway/metrics", get(handlers::gateway::gateway_metrics))
        .route("/gateway/config", get(handlers::gateway::gateway_config));

    // Credential endpoints sit behind an extra peer-IP limiter.
    let credential_routes = Router::new()
        .route("/api/v1/auth/login", any(dispatch))
        .route("/api/v1/auth/refresh", any(dispatch))
        .route_layer(create_login_rate_limiter(&config));

    let app = Router::new()
        .merge(meta_routes)
        .merge(credential_routes)
        .fallback(dispatch)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods([
                            Method::GET,
                            Method::POST,
                            Method::PUT,
                            Method::DELETE,
                            Method::OPTIONS,
                        ])
                        .allow_headers(Any),
                )
                .layer(axum_middleware::from_fn(request_context)),
        )
        .with_state(state);

    let addr = config.bind_addr()?;
    tracing::info!("API gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
