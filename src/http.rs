//! HTTP transport: `PUT /postpone` feeds the switch, `GET /health` reports it.

use crate::signals;
use crate::switch::{PostponeRequest, Postponer, SwitchState};
use axum::extract::{ConnectInfo, Form, FromRequest, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

pub const POSTPONE_PATH: &str = "/postpone";

/// Query or form parameter naming who sent the postpone.
pub const SOURCE_PARAMETER: &str = "source";

#[derive(Clone)]
struct AppState {
    postponer: Arc<dyn Postponer>,
    status: watch::Receiver<SwitchState>,
}

type Params = Vec<(String, String)>;

/// Build the router. `status` feeds the health route.
pub fn router(postponer: Arc<dyn Postponer>, status: watch::Receiver<SwitchState>) -> Router {
    let state = AppState { postponer, status };

    Router::new()
        .route(POSTPONE_PATH, put(postpone))
        .route("/health", get(health))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn postpone(State(state): State<AppState>, request: Request) -> Response {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    let query = match Query::<Params>::try_from_uri(request.uri()) {
        Ok(Query(params)) => params,
        Err(rejection) => return rejection.into_response(),
    };
    let form = if is_form(request.headers()) {
        match Form::<Params>::from_request(request, &state).await {
            Ok(Form(params)) => params,
            Err(rejection) => return rejection.into_response(),
        }
    } else {
        Params::new()
    };

    // Body values come before query values; the first `source` wins.
    let source = first_value(&form, SOURCE_PARAMETER)
        .or_else(|| first_value(&query, SOURCE_PARAMETER))
        .unwrap_or_default()
        .to_string();

    let pr = PostponeRequest {
        source,
        remote_addr,
    };

    if state.postponer.postpone(pr) {
        StatusCode::OK.into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"))
}

fn first_value<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let current = *state.status.borrow();
    Json(serde_json::json!({"ok": true, "state": current.as_str()}))
}

/// Normalize a listen address. A bare integer is a port on all interfaces,
/// as is an address with an empty host (":8080"). All interfaces means the
/// IPv6 wildcard, which also accepts IPv4 on dual-stack hosts.
pub fn listen_address(address: &str) -> String {
    let address = address.trim();
    if let Ok(port) = address.parse::<u16>() {
        return format!("[::]:{port}");
    }
    match address.strip_prefix(':') {
        Some(port) => format!("[::]:{port}"),
        None => address.to_string(),
    }
}

/// Bind the listener for `address` (see `listen_address`).
pub async fn bind(address: &str) -> std::io::Result<TcpListener> {
    TcpListener::bind(listen_address(address)).await
}

/// Serve `app` on `listener` until `shutdown` flips to true or its sender is
/// dropped.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let local_addr = listener.local_addr()?;
    tracing::info!("PUT http://{local_addr}{POSTPONE_PATH} to postpone triggering actions");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        signals::wait_for_shutdown(shutdown).await;
        tracing::debug!("HTTP server shutting down");
    })
    .await?;
    Ok(())
}
