//! API handlers

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, Extensions, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use wirefleet_core::{Device, FleetError, Network, Peer, Service};

use crate::engine::{NetworkUpdate, Poll};
use crate::error_codes::{ApiError, ErrorCode};
use crate::metrics;
use crate::state::AppState;

/// Device capability token header
pub const API_KEY_HEADER: &str = "x-api-key";
/// Identity recorded in audit fields, set by the fronting auth layer
pub const ACTOR_HEADER: &str = "x-wirefleet-user";

const SYSTEM_ACTOR: &str = "system";

type AppResult<T> = Result<T, AppError>;

// Error handling
pub struct AppError(FleetError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = ErrorCode::classify(&self.0);

        let body = if status.is_server_error() {
            // Log detailed error internally, return generic message to client
            tracing::error!("Request failed: {}", self.0);
            ApiError::new(code, code.default_message())
        } else {
            tracing::debug!("Request rejected: {}", self.0);
            let error = ApiError::new(code, self.0.to_string());
            match &self.0 {
                FleetError::Validation(reasons) => {
                    error.with_details(serde_json::json!({ "reasons": reasons }))
                }
                _ => error,
            }
        };

        let mut response = (status, Json(body)).into_response();
        if self.0.is_transient() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

impl From<FleetError> for AppError {
    fn from(err: FleetError) -> Self {
        Self(err)
    }
}

fn actor(headers: &HeaderMap) -> String {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(SYSTEM_ACTOR)
        .to_string()
}

/// Client address, preferring the first hop of X-Forwarded-For
fn source_ip(headers: &HeaderMap, extensions: &Extensions) -> Option<IpAddr> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());

    forwarded.or_else(|| {
        extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip())
    })
}

/// API routes, without middleware
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/api/v1/device", post(create_device))
        .route("/api/v1/device/{id}", get(get_device).delete(delete_device))
        .route("/api/v1/device/{id}/status", get(device_status))
        .route("/api/v1/net", get(list_networks).post(create_network))
        .route(
            "/api/v1/net/{id}",
            get(get_network).put(update_network).delete(delete_network),
        )
        .route("/api/v1/vpn", post(create_peer))
        .route(
            "/api/v1/vpn/{id}",
            get(get_peer).put(update_peer).delete(delete_peer),
        )
        .route("/api/v1/service", get(list_services).post(create_service))
        .route(
            "/api/v1/service/{id}",
            get(get_service).delete(delete_service),
        )
}

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db_ok = state.engine.store().ping().await.is_ok();

    let status = if db_ok { "ok" } else { "degraded" };
    let status_code = if db_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        status_code,
        Json(serde_json::json!({
            "status": status,
            "service": "wirefleet-server",
            "version": env!("CARGO_PKG_VERSION"),
            "database": if db_ok { "connected" } else { "disconnected" }
        })),
    )
}

// === Poll ===

pub async fn device_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    extensions: Extensions,
) -> AppResult<Response> {
    let Some(api_key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) else {
        let code = ErrorCode::MissingAuthorization;
        return Ok((
            StatusCode::UNAUTHORIZED,
            Json(ApiError::new(code, code.default_message())),
        )
            .into_response());
    };

    let device = state.engine.authenticate_device(&id, api_key).await?;
    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());

    let poll = state
        .engine
        .poll(&device, if_none_match, source_ip(&headers, &extensions))
        .await?;

    let response = match poll {
        Poll::NotModified { etag } => {
            tracing::debug!("Status of {} not modified", device.id);
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
                response.headers_mut().insert(header::ETAG, value);
            }
            response
        }
        Poll::Fresh(snapshot) => {
            tracing::debug!("ETag for {} is {}", device.id, snapshot.etag);
            let mut response = (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                snapshot.body.clone(),
            )
                .into_response();
            if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", snapshot.etag)) {
                response.headers_mut().insert(header::ETAG, value);
            }
            response
        }
    };

    Ok(response)
}

// === Networks ===

#[derive(Deserialize)]
pub struct AccountQuery {
    pub account_id: String,
}

#[derive(Deserialize)]
pub struct UpdateNetworkQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn create_network(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(network): Json<Network>,
) -> AppResult<(StatusCode, Json<Network>)> {
    let network = state.engine.create_network(network, &actor(&headers)).await?;
    Ok((StatusCode::CREATED, Json(network)))
}

pub async fn list_networks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AccountQuery>,
) -> AppResult<Json<Vec<Network>>> {
    Ok(Json(state.engine.list_networks(&query.account_id).await?))
}

pub async fn get_network(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Network>> {
    Ok(Json(state.engine.read_network(&id).await?))
}

pub async fn update_network(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<UpdateNetworkQuery>,
    headers: HeaderMap,
    Json(network): Json<Network>,
) -> AppResult<Json<NetworkUpdate>> {
    let update = state
        .engine
        .update_network(&id, network, query.force, &actor(&headers))
        .await?;
    Ok(Json(update))
}

pub async fn delete_network(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    state.engine.delete_network(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Peers ===

pub async fn create_peer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(peer): Json<Peer>,
) -> AppResult<(StatusCode, Json<Peer>)> {
    let peer = state.engine.create_peer(peer, &actor(&headers)).await?;
    Ok((StatusCode::CREATED, Json(peer)))
}

pub async fn get_peer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Peer>> {
    Ok(Json(state.engine.read_peer(&id).await?))
}

pub async fn update_peer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(peer): Json<Peer>,
) -> AppResult<Json<Peer>> {
    Ok(Json(
        state.engine.update_peer(&id, peer, &actor(&headers)).await?,
    ))
}

pub async fn delete_peer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    state.engine.delete_peer(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Devices ===

pub async fn create_device(
    State(state): State<Arc<AppState>>,
    Json(device): Json<Device>,
) -> AppResult<(StatusCode, Json<Device>)> {
    let device = state.engine.create_device(device).await?;
    Ok((StatusCode::CREATED, Json(device)))
}

pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Device>> {
    Ok(Json(state.engine.read_device(&id).await?))
}

pub async fn delete_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    state.engine.delete_device(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Services ===

pub async fn create_service(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(service): Json<Service>,
) -> AppResult<(StatusCode, Json<Service>)> {
    let service = state.engine.create_service(service, &actor(&headers)).await?;
    Ok((StatusCode::CREATED, Json(service)))
}

pub async fn list_services(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AccountQuery>,
) -> AppResult<Json<Vec<Service>>> {
    Ok(Json(state.engine.list_services(&query.account_id).await?))
}

pub async fn get_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Service>> {
    Ok(Json(state.engine.read_service(&id).await?))
}

pub async fn delete_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    state.engine.delete_service(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
