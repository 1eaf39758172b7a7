//! Router assembly and the HTTP surface.
//!
//! SYSTEM CONTEXT
//! ==============
//! The engine exposes four read-only HTTP handlers next to the socket
//! endpoint: the distributable config, the flattened canvas, per-layer
//! snapshots, and (when a client directory is configured) the static
//! browser bundle. Methods are clamped to GET/HEAD/OPTIONS and every
//! response carries the no-cache header set.

pub mod ws;

use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::services::ServeDir;

use crate::protocol::DistConfig;
use crate::state::AppState;

const SERVER_HEADER: &str = concat!("reichat-server/", env!("CARGO_PKG_VERSION"));

pub fn app(state: AppState) -> Router {
    let router = Router::new()
        .route("/config", get(get_config))
        .route("/canvas", get(get_canvas))
        .route("/layers/{n}", get(get_layer))
        .route("/socket", get(ws::handle_ws));

    let router = match &state.config.client_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router.fallback(fallback_404),
    };

    router
        .layer(middleware::from_fn(method_policy))
        .layer(middleware::from_fn(common_headers))
        .with_state(state)
}

// =============================================================================
// HANDLERS
// =============================================================================

async fn get_config(State(state): State<AppState>) -> Json<DistConfig> {
    Json(state.config.distributable())
}

async fn get_canvas(State(state): State<AppState>) -> Response {
    let room = state.room.read().await;
    match room.canvas.flatten() {
        Ok(bytes) => png_response(bytes),
        Err(e) => {
            tracing::error!(error = %e, "canvas flatten failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_layer(State(state): State<AppState>, Path(n): Path<String>) -> Response {
    let Ok(n) = n.parse::<usize>() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if n >= state.config.layer_count {
        return StatusCode::NOT_FOUND.into_response();
    }

    // Write lock: serving a layer may populate its snapshot cache.
    let mut room = state.room.write().await;
    let Some(layer) = room.canvas.layer_mut(n) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match layer.encode_snapshot() {
        Ok(bytes) => png_response(bytes.to_vec()),
        Err(e) => {
            tracing::error!(error = %e, layer = n, "layer snapshot encode failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn png_response(bytes: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "image/png")], bytes).into_response()
}

// =============================================================================
// MIDDLEWARE
// =============================================================================

/// GET and HEAD pass through; OPTIONS answers the allow-list; anything
/// else is 405.
async fn method_policy(req: Request, next: Next) -> Response {
    match *req.method() {
        Method::GET | Method::HEAD => next.run(req).await,
        Method::OPTIONS => {
            (StatusCode::OK, [(header::ALLOW, "HEAD, GET, OPTIONS")]).into_response()
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

/// Mandatory headers on every response, the method-policy short-circuits
/// included.
async fn common_headers(req: Request, next: Next) -> Response {
    let mut res = next.run(req).await;
    let headers = res.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER_HEADER));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("none"));
    res
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
