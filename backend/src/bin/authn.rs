use axum::{
    http::Method,
    middleware as axum_middleware,
    routing::{delete, get, post},
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
    config::AuthnConfig,
    db::connection::create_pool,
    handlers,
    middleware::{auth as auth_middleware, request_context::request_context},
    services::audit_sink::{spawn_alert_scanner, AuditSink, PgAuditStore},
    services::token_service::TokenService,
    services::user_service::UserService,
    state::AuthnState,
};

fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "<empty>".into();
    }
    let prefix = s.chars().take(4).collect::<String>();
    format!("{}*** (len={})", prefix, s.len())
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "palisade_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration; missing or short signing secret refuses to start.
    let config = AuthnConfig::load()?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers.max(1));
    }
    builder.build()?.block_on(run(config))
}

async fn run(config: AuthnConfig) -> anyhow::Result<()> {
    tracing::info!(
        database_url = %config.database_url,
        jwt_secret = %mask_secret(&config.jwt_secret),
        access_token_ttl_secs = config.access_token_ttl_secs,
        refresh_token_ttl_days = config.refresh_token_ttl_days,
        refresh_rotation = config.refresh_rotation,
        max_failed_attempts = config.max_failed_attempts,
        lockout_duration_minutes = config.lockout_duration_minutes,
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

    let users = Arc::new(UserService::new(pool.clone(), config.clone(), audit.clone()));
    let tokens = Arc::new(TokenService::new(pool.clone(), config.clone(), audit.clone()));

    users.ensure_default_admin().await?;

    let state = AuthnState::new(pool, config.clone(), users, tokens, audit);

    // Build public routes (no auth)
    let public_routes = Router::new()
        .route("/auth/login", post(handlers::authn::login))
        .route("/auth/refresh", post(handlers::authn::refresh))
        .route("/auth/validate", get(handlers::authn::validate))
        .route("/health", get(handlers::authn::health))
        .route("/metrics", get(handlers::authn::metrics));

    // Build user-protected routes (auth required)
    let user_routes = Router::new()
        .route("/auth/logout", post(handlers::authn::logout))
        .route(
            "/users/me",
            get(handlers::users::me).put(handlers::users::update_me),
        )
        .route(
            "/users/change-password",
            post(handlers::users::change_password),
        )
        .route("/sessions/me", get(handlers::sessions::list_sessions))
        .route(
            "/sessions/all",
            delete(handlers::sessions::revoke_all_sessions),
        )
        .route("/sessions/{id}", delete(handlers::sessions::revoke_session))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware::auth,
        ));

    // Build admin-protected routes (auth + admin role)
    let admin_routes = Router::new()
        .route(
            "/users",
            get(handlers::users::admin_list_users).post(handlers::users::admin_create_user),
        )
        .route(
            "/users/{id}",
            get(handlers::users::admin_get_user)
                .put(handlers::users::admin_update_user)
                .delete(handlers::users::admin_delete_user),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware::auth_admin,
        ));

    // Compose app with shared layers (CORS/Trace/request-id) and shared state
    let app = Router::new()
        .merge(public_routes)
        .merge(user_routes)
        .merge(admin_routes)
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

    // Start server
    let addr = config.bind_addr()?;
    tracing::info!("Authentication service listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
