//! Health, metrics and parking-lot admin endpoints
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`)
//! - Prometheus metrics (`/metrics`)
//! - Circuit state per DLQ (`/circuits`)
//! - Parking lot admin (`/admin/parked/{dlq}/*`)

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{delete, get, post},
};
use core_config::AppInfo;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::broker::Readiness;
use crate::error::SinkError;
use crate::metrics;
use crate::sink::ParkingLot;
use crate::tracker::CircuitRegistry;

type ApiError = (StatusCode, Json<Value>);

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub app: AppInfo,
    pub circuits: CircuitRegistry,
    /// Broker connectivity for readiness.
    pub readiness: Arc<dyn Readiness>,
    pub parking: Arc<dyn ParkingLot>,
}

impl HealthState {
    pub fn new(
        app: AppInfo,
        circuits: CircuitRegistry,
        readiness: Arc<dyn Readiness>,
        parking: Arc<dyn ParkingLot>,
    ) -> Self {
        Self {
            app,
            circuits,
            readiness,
            parking,
        }
    }

    fn known_dlq(&self, dlq_name: &str) -> Result<(), ApiError> {
        match self.circuits.get(dlq_name) {
            Some(_) => Ok(()),
            None => Err((
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("Unknown DLQ '{dlq_name}'") })),
            )),
        }
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Liveness probe handler.
///
/// Always returns OK if the server is running.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app.name,
        version: state.app.version,
    })
}

/// Readiness probe handler.
///
/// Pings the broker; 503 when it is unreachable. Open circuits are
/// reported but do not fail readiness.
pub async fn ready_handler(State(state): State<HealthState>) -> Result<Json<Value>, ApiError> {
    let open_circuits = state.circuits.open_count();

    match state.readiness.ping().await {
        Ok(()) => Ok(Json(json!({
            "status": "ready",
            "checks": {
                "broker": "ok",
                "open_circuits": open_circuits
            }
        }))),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": {
                    "broker": format!("error: {e}"),
                    "open_circuits": open_circuits
                }
            })),
        )),
    }
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Circuit state of every DLQ.
///
/// `GET /circuits`
pub async fn circuits_handler(State(state): State<HealthState>) -> Json<Value> {
    let circuits = state.circuits.report();
    Json(json!({
        "open": circuits.iter().filter(|c| c.circuit_open).count(),
        "circuits": circuits,
    }))
}

// ============================================================================
// Parking lot admin handlers
// ============================================================================

/// Query parameters for the parked list endpoint.
#[derive(Debug, Deserialize)]
pub struct ParkedListParams {
    /// Maximum number of entries to return (default: 10, max: 100)
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

fn sink_error(e: SinkError) -> ApiError {
    let status = match e {
        SinkError::NotFound(_) => StatusCode::NOT_FOUND,
        SinkError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

/// `GET /admin/parked/{dlq}/stats`
pub async fn parked_stats_handler(
    State(state): State<HealthState>,
    Path(dlq_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.known_dlq(&dlq_name)?;
    let stats = state.parking.stats(&dlq_name).await.map_err(sink_error)?;
    Ok(Json(stats))
}

/// Oldest parked entries first.
///
/// `GET /admin/parked/{dlq}/messages?limit=10`
pub async fn parked_list_handler(
    State(state): State<HealthState>,
    Path(dlq_name): Path<String>,
    Query(params): Query<ParkedListParams>,
) -> Result<impl IntoResponse, ApiError> {
    state.known_dlq(&dlq_name)?;

    // Cap limit at 100
    let limit = params.limit.min(100);

    let entries = state
        .parking
        .list(&dlq_name, limit)
        .await
        .map_err(sink_error)?;
    Ok(Json(json!({
        "dlq_name": dlq_name,
        "limit": limit,
        "count": entries.len(),
        "messages": entries,
    })))
}

/// Push a parked entry back onto its DLQ with a fresh attempt counter.
///
/// `POST /admin/parked/{dlq}/replay/{id}`
pub async fn parked_replay_handler(
    State(state): State<HealthState>,
    Path((dlq_name, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state.known_dlq(&dlq_name)?;
    let delivery_tag = state
        .parking
        .replay(&dlq_name, &id)
        .await
        .map_err(sink_error)?;

    Ok(Json(json!({
        "success": true,
        "parked_id": id,
        "delivery_tag": delivery_tag,
        "message": "Message requeued onto the DLQ"
    })))
}

/// Delete a parked entry for good.
///
/// `DELETE /admin/parked/{dlq}/{id}`
pub async fn parked_discard_handler(
    State(state): State<HealthState>,
    Path((dlq_name, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state.known_dlq(&dlq_name)?;
    state
        .parking
        .discard(&dlq_name, &id)
        .await
        .map_err(sink_error)?;

    tracing::info!(dlq_name = %dlq_name, parked_id = %id, "Discarded parked message");
    Ok(Json(json!({
        "success": true,
        "parked_id": id,
        "message": "Message discarded"
    })))
}

/// Every health, metrics and admin route, with request tracing.
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/circuits", get(circuits_handler))
        .route("/admin/parked/{dlq}/stats", get(parked_stats_handler))
        .route("/admin/parked/{dlq}/messages", get(parked_list_handler))
        .route("/admin/parked/{dlq}/replay/{id}", post(parked_replay_handler))
        .route("/admin/parked/{dlq}/{id}", delete(parked_discard_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
