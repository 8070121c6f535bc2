//! HTTP transport for the gateway. Requires the `http` feature.
//!
//! ## Routes
//!
//! - `POST /rpc/:procedure`: dispatch a procedure. Body = JSON input,
//!   request headers become the session.
//! - `GET /health`: `{ "ok": true, "procedures": [...], "delivery": bool }`.
//! - `POST /outbox/deliver`: run one delivery tick and return its report.
//!   Dropping the request cancels the tick.
//! - `POST /maintenance/sweep`: purge expired idempotency records and idle
//!   rate-limit buckets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::service::{Gateway, ProcedureRequest, ProcedureResponse};
use crate::outbox::DeliveryTrigger;

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

struct AppState<R> {
    gateway: Arc<Gateway<R>>,
    delivery: Option<Arc<dyn DeliveryTrigger>>,
}

impl<R> Clone for AppState<R> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
            delivery: self.delivery.clone(),
        }
    }
}

/// Build the router. Without a delivery trigger, `/outbox/deliver` answers
/// 503.
pub fn router<R: Send + Sync + 'static>(
    gateway: Arc<Gateway<R>>,
    delivery: Option<Arc<dyn DeliveryTrigger>>,
) -> Router {
    Router::new()
        .route("/health", get(health_handler::<R>))
        .route("/rpc/:procedure", post(rpc_handler::<R>))
        .route("/outbox/deliver", post(deliver_handler::<R>))
        .route("/maintenance/sweep", post(sweep_handler::<R>))
        .with_state(AppState { gateway, delivery })
}

/// Serve `app` at `addr` with peer addresses available to the handlers.
pub async fn serve(app: Router, addr: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "relay gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

async fn health_handler<R: Send + Sync + 'static>(
    State(state): State<AppState<R>>,
) -> impl IntoResponse {
    let procedures: Vec<Value> = state
        .gateway
        .procedures()
        .into_iter()
        .map(|(name, kind)| json!({ "name": name, "kind": kind }))
        .collect();
    Json(json!({
        "ok": true,
        "procedures": procedures,
        "delivery": state.delivery.is_some(),
    }))
}

async fn rpc_handler<R: Send + Sync + 'static>(
    State(state): State<AppState<R>>,
    Path(procedure): Path<String>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(input): Json<Value>,
) -> Response {
    let request = ProcedureRequest {
        procedure,
        input,
        session_variables: session_from_headers(&headers),
        client: client_identity(peer.map(|ConnectInfo(addr)| addr), &headers),
    };

    let gateway = state.gateway.clone();
    match tokio::task::spawn_blocking(move || gateway.dispatch(&request)).await {
        Ok(response) => into_http(response),
        Err(err) => {
            error!(error = %err, "dispatch task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "dispatch failed" })),
            )
                .into_response()
        }
    }
}

async fn deliver_handler<R: Send + Sync + 'static>(
    State(state): State<AppState<R>>,
) -> Response {
    let Some(delivery) = state.delivery.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "delivery worker not configured" })),
        )
            .into_response();
    };

    let cancel = CancellationToken::new();
    // Cancels the tick if axum drops this future (client went away).
    let _cancel_on_drop = cancel.clone().drop_guard();
    match delivery.trigger(cancel).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(err) => {
            error!(error = %err, "delivery tick failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn sweep_handler<R: Send + Sync + 'static>(State(state): State<AppState<R>>) -> Response {
    let gateway = state.gateway.clone();
    match tokio::task::spawn_blocking(move || gateway.sweep()).await {
        Ok(Ok(report)) => (StatusCode::OK, Json(report)).into_response(),
        Ok(Err(err)) => {
            error!(error = %err, "sweep failed");
            let status = StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(err.body())).into_response()
        }
        Err(err) => {
            error!(error = %err, "sweep task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn into_http(response: ProcedureResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut http = (status, Json(response.body)).into_response();
    let headers = http.headers_mut();

    if let Some(decision) = response.rate_limit {
        headers.insert(
            HeaderName::from_static(RATE_LIMIT_LIMIT_HEADER),
            HeaderValue::from(decision.limit),
        );
        headers.insert(
            HeaderName::from_static(RATE_LIMIT_REMAINING_HEADER),
            HeaderValue::from(decision.remaining),
        );
        if let Some(secs) = decision.retry_after_secs() {
            headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(secs));
        }
    }
    if response.replayed {
        headers.insert(
            HeaderName::from_static(REPLAYED_HEADER),
            HeaderValue::from_static("true"),
        );
    }
    http
}

/// All headers, lowercased, as session variables.
fn session_from_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Peer address when known, else the first `X-Forwarded-For` hop, else
/// `unknown`.
fn client_identity(peer: Option<SocketAddr>, headers: &HeaderMap) -> String {
    if let Some(addr) = peer {
        return addr.ip().to_string();
    }
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".to_string())
}
