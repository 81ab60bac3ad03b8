//! Test utilities

#![allow(dead_code)]

use axum::{body::Body, http::Response, Router};
use http_body_util::BodyExt;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::time::Duration;
use wirefleet_core::{Device, Network, Peer, Settings};

// Re-export server modules for tests
pub use wirefleet_server::{
    cache::{StatusCache, TtlStatusCache},
    db,
    engine::{Engine, Poll},
    handlers,
    state::AppState,
    store::{PeerFilter, SqliteStore, Store},
};

/// Store over a fresh in-memory database
pub async fn create_test_store() -> Arc<dyn Store> {
    // Create in-memory SQLite database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create test database");

    // Run migrations
    db::migrate(&pool).await.expect("Failed to run migrations");

    Arc::new(SqliteStore::new(pool, Duration::from_secs(5)))
}

/// Engine over the given store with a one minute cache
pub fn engine_with_store(store: Arc<dyn Store>) -> Arc<Engine> {
    let cache: Arc<dyn StatusCache> = Arc::new(TtlStatusCache::new(Duration::from_secs(60)));
    Arc::new(Engine::new(store, cache, "wirefleet-test"))
}

/// Engine over an in-memory database
pub async fn create_test_engine() -> Arc<Engine> {
    engine_with_store(create_test_store().await)
}

/// Create a test application with in-memory database
pub async fn create_test_app() -> (Router, Arc<Engine>) {
    let engine = create_test_engine().await;
    let app_state = Arc::new(AppState::new(engine.clone()));
    (handlers::routes().with_state(app_state), engine)
}

/// Extract JSON body from response
pub async fn response_body(response: Response<Body>) -> Value {
    let body = response.into_body();
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

pub fn network(name: &str, pools: &[&str]) -> Network {
    Network {
        account_id: "acct-1".into(),
        name: name.into(),
        default: Settings {
            address: pools.iter().map(|p| p.to_string()).collect(),
            mtu: 1420,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn peer(net_id: &str, device_id: &str, name: &str) -> Peer {
    Peer {
        net_id: net_id.into(),
        device_id: device_id.into(),
        name: name.into(),
        enable: true,
        ..Default::default()
    }
}

pub async fn create_device(engine: &Engine, name: &str) -> Device {
    engine
        .create_device(Device {
            account_id: "acct-1".into(),
            name: name.into(),
            enable: true,
            os: "linux".into(),
            ..Default::default()
        })
        .await
        .expect("Failed to create device")
}
