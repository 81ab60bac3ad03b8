//! Wirefleet Configuration Server
//!
//! Allocates peer addresses, propagates network defaults and serves each
//! polling device its view of the fleet

use anyhow::Result;
use axum::http::{header, Method};
use sqlx::sqlite::SqlitePoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wirefleet_server::cache::{StatusCache, TtlStatusCache};
use wirefleet_server::config::ServerConfig;
use wirefleet_server::engine::Engine;
use wirefleet_server::handlers::{self, ACTOR_HEADER, API_KEY_HEADER};
use wirefleet_server::state::AppState;
use wirefleet_server::store::{SqliteStore, Store};
use wirefleet_server::{db, jobs, metrics};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "wirefleet_server=debug,info".into()),
        ))
        .init();

    tracing::info!("Starting Wirefleet configuration server...");

    let config = ServerConfig::from_env();

    // Initialize database
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;

    db::migrate(&pool).await?;

    tracing::info!("✓ Database initialized");

    metrics::init_metrics()?;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool, config.store_timeout));
    let cache: Arc<dyn StatusCache> = Arc::new(TtlStatusCache::new(config.status_cache_ttl));
    let engine = Arc::new(Engine::new(store, cache.clone(), config.server_name.clone()));
    let app_state = Arc::new(AppState::new(engine));

    // Configure CORS
    let cors = if std::env::var("CORS_ALLOW_ALL").unwrap_or_default() == "true" {
        CorsLayer::permissive()
    } else {
        let allowed_origins = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173,http://localhost:3000".to_string());

        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
            .allow_headers([
                header::CONTENT_TYPE,
                header::ACCEPT,
                header::IF_NONE_MATCH,
                header::HeaderName::from_static(API_KEY_HEADER),
                header::HeaderName::from_static(ACTOR_HEADER),
            ])
            .expose_headers([header::ETAG])
            .allow_origin(
                allowed_origins
                    .split(',')
                    .filter_map(|s| s.trim().parse().ok())
                    .collect::<Vec<_>>(),
            )
    };

    // Build router
    let app = handlers::routes()
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        // Security headers
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            header::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            header::HeaderValue::from_static("DENY"),
        ));

    // Expired status snapshots are swept in the background
    jobs::spawn_cache_sweep(cache, config.cache_sweep_interval);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
