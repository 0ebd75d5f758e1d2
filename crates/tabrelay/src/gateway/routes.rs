//! Gateway route definitions.

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderName, Method, Uri, header},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use log::{info, warn};
use serde_json::json;
use tabrelay_protocol::BridgeRequest;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::GatewayState;
use super::error::ApiError;
use super::proxy::{self, bridge_headers, ensure_connected};

/// Administrative completion signal.
pub const COMPLETE_PATH: &str = "/__tabrelay/complete";

/// Header marking administrative requests forwarded to the host.
pub const ADMIN_HEADER: &str = "X-Tabrelay-Admin";

/// Create the gateway router.
pub fn build_router(state: GatewayState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(health))
        .route(COMPLETE_PATH, any(complete))
        .route("/__tabrelay/{*rest}", any(admin_not_found))
        .fallback(proxy::proxy_request)
        .layer(trace_layer)
        .layer(build_cors_layer())
        .with_state(state)
}

/// CORS for browser callers: any origin, mirrored so credentials work.
fn build_cors_layer() -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::PATCH,
        Method::OPTIONS,
    ];

    let headers = [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::RANGE,
        HeaderName::from_static("apikey"),
        HeaderName::from_static("prefer"),
        HeaderName::from_static("x-client-info"),
        HeaderName::from_static("x-supabase-api-version"),
        HeaderName::from_static("accept-profile"),
        HeaderName::from_static("content-profile"),
    ];

    let exposed = [
        header::CONTENT_RANGE,
        header::CONTENT_TYPE,
        HeaderName::from_static("x-content-encoding"),
    ];

    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(methods)
        .allow_headers(headers)
        .expose_headers(exposed)
        .allow_credentials(true)
}

/// GET /health
async fn health(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "connected": state.transport.is_connected(),
        "mode": state.transport.mode(),
        "targetUrl": state.target_url,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /__tabrelay/complete
///
/// Tells the host the one-shot command is done. The gateway counts as
/// completed whether or not the host could be told.
async fn complete(
    State(state): State<GatewayState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return ApiError::method_not_allowed(&method)
            .at(&method, uri.path())
            .into_response();
    }

    let mut request = BridgeRequest::new(uuid::Uuid::new_v4().to_string(), "POST", COMPLETE_PATH)
        .with_body_bytes(body.to_vec());
    request.headers.extend(bridge_headers(&headers));
    request
        .headers
        .insert(ADMIN_HEADER.to_string(), "complete".to_string());

    let outcome = match ensure_connected(&state).await {
        Ok(()) => state.transport.send_request(request).await.map(|_| ()),
        Err(e) => Err(e),
    };
    state.completed.cancel();

    match outcome {
        Ok(()) => {
            info!("completion signal delivered to host");
            Json(json!({ "status": "completed", "delivered": true })).into_response()
        }
        Err(e) => {
            warn!("completion signal not delivered: {e}");
            Json(json!({
                "status": "completed",
                "delivered": false,
                "error": e.to_string(),
            }))
            .into_response()
        }
    }
}

async fn admin_not_found(method: Method, uri: Uri) -> Response {
    ApiError::not_found(uri.path())
        .at(&method, uri.path())
        .into_response()
}
