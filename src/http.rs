use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{self, Next},
    response::{IntoResponse, Json, Redirect, Response},
    routing::get,
    Router,
};
use socketioxide::extract::SocketRef;
use socketioxide::SocketIo;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::registry::RoomRegistry;
use crate::relay::Relay;
use crate::socket::{self, SocketIoOutbound};
use crate::AppState;

// ─── Router ─────────────────────────────────────────────────────────────────

/// Build the full relay application: HTTP routes plus the Socket.IO layer.
pub fn build_app(config: RelayConfig) -> (Router, Arc<AppState>) {
    let (sio_layer, io) = SocketIo::builder().build_layer();

    let relay = Relay::new(RoomRegistry::new(), SocketIoOutbound::new(io.clone()))
        .with_membership_check(config.enforce_membership);
    let cors = build_cors_layer(&config.allowed_origins);

    let state = Arc::new(AppState {
        relay,
        config,
        started_at: Instant::now(),
    });

    io.ns("/", {
        let state = state.clone();
        move |socket: SocketRef| socket::on_connect(socket, state.clone())
    });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/api/health", get(health_handler))
        // Pages only; the Socket.IO endpoint is a layer and never redirected.
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            force_https_middleware,
        ))
        .layer(sio_layer)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security_headers_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    (app, state)
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn index_handler() -> &'static str {
    "WebRTC signaling relay is running"
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let info = state.relay.info();
    Json(serde_json::json!({
        "status": "ok",
        "uptime": state.started_at.elapsed().as_secs_f64(),
        "rooms_active": info.rooms_active,
        "security": {
            "tls_enabled": state.config.tls_enabled,
            "force_https": state.config.force_https,
            "ip_masking": state.config.ip_masking,
        },
    }))
}

// ─── Middleware ─────────────────────────────────────────────────────────────

/// Redirect plain-HTTP requests to HTTPS when `force_https` is on. Requests
/// already terminated by TLS (here or at a proxy) pass through.
async fn force_https_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if !state.config.force_https || state.config.tls_enabled || forwarded_https(&request) {
        return next.run(request).await;
    }

    let Some(host) = request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
    else {
        return next.run(request).await;
    };

    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Redirect::temporary(&format!("https://{host}{path}")).into_response()
}

fn forwarded_https(request: &Request) -> bool {
    request
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("https"))
}

/// With IP masking on: strip the forwarded client address before anything
/// downstream sees it and add privacy headers to every response.
async fn security_headers_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    if !state.config.ip_masking {
        return next.run(request).await;
    }

    request.headers_mut().remove("x-forwarded-for");
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("strict-transport-security"),
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    headers.insert(
        HeaderName::from_static("x-xss-protection"),
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("SAMEORIGIN"),
    );
    response
}

// ─── CORS configuration ────────────────────────────────────────────────────

fn build_cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins == "*" {
        warn!("CORS: permissive mode (allow all origins)");
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = s, "CORS: ignoring invalid origin");
                None
            }
        })
        .collect();

    info!("CORS: restricted to {} origin(s)", origins.len());

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
