use axum::{
    http::Method,
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use palisade_backend::{
    config::AuthzConfig,
    db::connection::create_pool,
    handlers,
    middleware::request_context::request_context,
    services::audit_sink::{spawn_alert_scanner, AuditSink, PgAuditStore},
    services::authz_engine::{AuthzEngine, PgPolicyProvider},
    services::policy_service::PolicyService,
    state::AuthzState,
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

    let config = AuthzConfig::load()?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers.max(1));
    }
    builder.build()?.block_on(run(config))
}

async fn run(config: AuthzConfig) -> anyhow::Result<()> {
    tracing::info!(
        database_url = %config.database_url,
        decision_cache_ttl_secs = config.decision_cache_ttl_secs,
        decision_cache_capacity = config.decision_cache_capacity,
        default_effect = config.default_effect.as_str(),
        bulk_concurrency = config.bulk_concurrency,
        "Loaded configuration from environment/.env"
    );

    // Initialize database
    let pool = create_pool(&config.database_url).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let audit = AuditSink::spawn(
        Arc::new(PgAuditStore::new(pool.clone())),
        config.audit_queue_capacity,
    );
    spawn_alert_scanner(
        pool.clone(),
        config.alert_failed_threshold,
        config.alert_window_minutes,
        Duration::from_secs(60),
    );

    let engine = Arc::new(AuthzEngine::new(
        Arc::new(PgPolicyProvider::new(pool.clone())),
        audit.clone(),
        config.clone(),
    ));
    let policies = Arc::new(PolicyService::new(pool.clone(), audit.clone()));

    let state = AuthzState::new(pool, config.clone(), engine, policies, audit);

    let app = Router::new()
        .route("/authorize", post(handlers::authz::authorize))
        .route("/authorize/bulk", post(handlers::authz::authorize_bulk))
        .route(
            "/authorize/batch-optimized",
            post(handlers::authz::authorize_batch_optimized),
        )
        .route(
            "/policies",
            get(handlers::policies::list_policies).post(handlers::policies::create_policy),
        )
        .route(
            "/policies/{id}",
            get(handlers::policies::get_policy)
                .put(handlers::policies::update_policy)
                .delete(handlers::policies::delete_policy),
        )
        .route("/audit/decisions", get(handlers::authz::audit_decisions))
        .route("/status", get(handlers::authz::status))
        .route(
            "/metrics/performance",
            get(handlers::authz::metrics_performance),
        )
        .route("/admin/cache/clear", post(handlers::authz::cache_clear))
        .route("/admin/warm-cache", post(handlers::authz::warm_cache))
        .route(
            "/admin/security-alerts",
            get(handlers::authz::security_alerts),
        )
        .route(
            "/admin/security-alert/{id}/acknowledge",
            post(handlers::authz::acknowledge_alert),
        )
        .route("/health", get(handlers::authz::health))
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
    tracing::info!("Authorization service listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
