//! Router assembly and the middleware stack (spec §6 "Transport", SPEC_FULL
//! §0.3 "Ambient stack").
//!
//! Layer order (outermost → innermost for requests), matched to the
//! production gateway this crate is descended from:
//! 1. `CatchPanicLayer` — converts handler panics to 500s
//! 2. `SetSensitiveHeadersLayer` — marks Authorization/Cookie as redacted
//! 3. `SetRequestIdLayer` — generates x-request-id before tracing
//! 4. `TraceLayer` — logs requests with redacted headers + request ID
//! 5. `CorsLayer` — handles preflight; logged by trace
//! 6. `PropagateRequestIdLayer` — copies x-request-id to response
//! 7. Security response headers — X-Content-Type-Options, X-Frame-Options
//! 8. `RequestBodyLimitLayer` — rejects oversized bodies
//! 9. `CompressionLayer` (innermost) — compresses response body

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::{HeaderValue, StatusCode, header},
    response::IntoResponse,
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    sensitive_headers::SetSensitiveHeadersLayer,
    set_header::SetResponseHeaderLayer,
    trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::{
    inbox_routes::inbox_router, infra_routes::infra_router, keypackage_routes::keypackage_router,
    presence_routes::presence_router, session_routes::session_router, social_routes::social_router,
    sse::sse_router, state::Runtime, ws,
};

/// 2 MiB global request body limit — generous for any JSON API payload here,
/// small enough to bound abuse. `env` payloads are capped separately by
/// `max_env_b64_len`.
const REQUEST_BODY_LIMIT: usize = 2 * 1024 * 1024;

pub fn build_router(state: Arc<Runtime>) -> Router {
    let router = Router::new()
        .merge(infra_router())
        .merge(session_router())
        .merge(crate::conversation_routes::conversation_router())
        .merge(inbox_router())
        .merge(keypackage_router())
        .merge(social_router())
        .merge(presence_router())
        .merge(sse_router())
        .route("/v1/ws", axum::routing::get(ws_upgrade_handler))
        .with_state(state);

    apply_middleware_stack(router, build_cors_layer())
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            |origin: &HeaderValue, parts: &axum::http::request::Parts| {
                let origin_str = origin.to_str().unwrap_or("");
                let host = parts.headers.get(header::HOST).and_then(|v| v.to_str().ok()).unwrap_or("");
                is_same_origin(origin_str, host)
            },
        ))
        .allow_methods(Any)
        .allow_headers(Any)
}

fn apply_middleware_stack<S>(router: Router<S>, cors: CorsLayer) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let router = router
        .layer(CompressionLayer::new())
        .layer(RequestBodyLimitLayer::new(REQUEST_BODY_LIMIT))
        .layer(SetResponseHeaderLayer::overriding(
            header::HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("deny"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_owned();
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        uri = %request.uri(),
                        request_id = %request_id,
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        );

    router
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(SetSensitiveHeadersLayer::new([
            header::AUTHORIZATION,
            header::COOKIE,
            header::SET_COOKIE,
        ]))
        .layer(CatchPanicLayer::new())
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    headers: axum::http::HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<Runtime>>,
) -> impl IntoResponse {
    // CSWSH protection: browsers always send Origin on cross-origin upgrades;
    // non-browser clients (CLI, SDKs) typically omit it and are allowed through.
    if let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        let host = headers.get(header::HOST).and_then(|v| v.to_str().ok()).unwrap_or("");
        if !is_same_origin(origin, host) {
            tracing::warn!(origin, host, remote = %addr, "rejected cross-origin WebSocket upgrade");
            return (StatusCode::FORBIDDEN, "cross-origin WebSocket connections are not allowed")
                .into_response();
        }
    }
    ws.on_upgrade(move |socket| ws::handle_connection(socket, state)).into_response()
}

/// `Origin` is a full URL (`https://host:port`), `Host` is bare
/// `host[:port]`. Loopback variants (`localhost`, `127.0.0.1`, `::1`,
/// `*.localhost`) are treated as equivalent to each other.
fn is_same_origin(origin: &str, host: &str) -> bool {
    let origin_host = origin.split("://").nth(1).unwrap_or(origin).split('/').next().unwrap_or("");

    fn strip_port(h: &str) -> &str {
        if h.starts_with('[') {
            h.rsplit_once("]:").map_or(h, |(addr, _)| addr).trim_start_matches('[').trim_end_matches(']')
        } else {
            h.rsplit_once(':').map_or(h, |(addr, _)| addr)
        }
    }

    let oh = strip_port(origin_host);
    let hh = strip_port(host);

    let is_loopback = |h: &str| matches!(h, "localhost" | "127.0.0.1" | "::1") || h.ends_with(".localhost");
    if is_loopback(oh) && is_loopback(hh) {
        return true;
    }
    oh == hh
}

pub async fn start_gateway(config: crate::GatewayConfig) -> anyhow::Result<()> {
    let pool = crate::db::open_pool(&config.db_path).await?;
    let bind_addr = config.bind_addr.clone();
    let directory_file = config.gateway_directory_file.clone();
    let state = Runtime::new(config, pool);
    let _sweeper_handles = state.spawn_sweepers();

    if let Some(path) = directory_file {
        match state.directory.load_from_file(&path).await {
            Ok(count) => tracing::info!(count, path, "loaded gateway directory"),
            Err(e) => tracing::warn!(error = %e, path, "failed to load gateway directory file"),
        }
    }

    let app = build_router(state.clone());
    let addr: SocketAddr = bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "gateway listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    state.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_origin_accepts_matching_host() {
        assert!(is_same_origin("https://gateway.example.com", "gateway.example.com"));
        assert!(is_same_origin("https://gateway.example.com:443", "gateway.example.com:443"));
    }

    #[test]
    fn same_origin_rejects_mismatched_host() {
        assert!(!is_same_origin("https://evil.example.com", "gateway.example.com"));
    }

    #[test]
    fn same_origin_normalizes_loopback_variants() {
        assert!(is_same_origin("http://localhost:8080", "127.0.0.1:8080"));
        assert!(is_same_origin("http://foo.localhost:8080", "localhost:8080"));
    }
}
