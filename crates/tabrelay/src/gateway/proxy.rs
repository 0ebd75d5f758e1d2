//! Catch-all handler that carries HTTP calls across the bridge.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use http_body_util::LengthLimitError;
use log::debug;
use tabrelay_protocol::{BridgeRequest, BridgeResponse, CONTENT_ENCODING_HEADER, Headers};

use super::GatewayState;
use super::error::ApiError;
use crate::error::{BridgeError, BridgeResult};

/// Headers that describe this hop rather than the request.
const HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "content-length",
];

const PROXIED_METHODS: &[Method] = &[
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
];

/// ANY /*
pub async fn proxy_request(State(state): State<GatewayState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let method = parts.method;
    let path = parts.uri.path().to_string();

    // Preflights are answered by the CORS layer before reaching this point.
    if method == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }
    if !PROXIED_METHODS.contains(&method) {
        return ApiError::method_not_allowed(&method)
            .at(&method, &path)
            .into_response();
    }

    if declared_length(&parts.headers).is_some_and(|len| len > state.max_body_bytes) {
        return ApiError::PayloadTooLarge(state.max_body_bytes)
            .at(&method, &path)
            .into_response();
    }
    let bytes = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let inner = e.into_inner();
            let error = if exceeds_limit(inner.as_ref()) {
                ApiError::PayloadTooLarge(state.max_body_bytes)
            } else {
                ApiError::from(BridgeError::serialization(format!(
                    "failed to read request body: {inner}"
                )))
            };
            return error.at(&method, &path).into_response();
        }
    };

    if let Err(e) = ensure_connected(&state).await {
        return ApiError::from(e).at(&method, &path).into_response();
    }

    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let mut bridge_request =
        BridgeRequest::new(uuid::Uuid::new_v4().to_string(), method.as_str(), url);
    bridge_request.headers = bridge_headers(&parts.headers);
    let bridge_request = bridge_request.with_body_bytes(bytes.to_vec());
    let id = bridge_request.id.clone();

    let result = state.transport.send_request(bridge_request).await;
    match result.and_then(replay) {
        Ok(response) => {
            debug!("{method} {path} ({id}) -> {}", response.status());
            response
        }
        Err(e) => ApiError::from(e).at(&method, &path).into_response(),
    }
}

/// Open the transport if it is down. One attempt per call.
pub(super) async fn ensure_connected(state: &GatewayState) -> BridgeResult<()> {
    if state.transport.is_connected() {
        return Ok(());
    }
    debug!("transport not connected; attempting to connect");
    state.transport.connect().await
}

/// Request headers as carried in a bridge message.
pub(super) fn bridge_headers(headers: &HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in headers {
        let name = name.as_str();
        if HOP_HEADERS.contains(&name) || name.eq_ignore_ascii_case(CONTENT_ENCODING_HEADER) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            debug!("skipping non-text header {name}");
            continue;
        };
        out.entry(name.to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

/// Turn a host answer into the HTTP response the caller sees.
fn replay(response: BridgeResponse) -> BridgeResult<Response> {
    let status = StatusCode::from_u16(response.status).map_err(|_| {
        BridgeError::serialization(format!("host returned invalid status {}", response.status))
    })?;
    let body = response.body_bytes()?;

    let mut builder = Response::builder().status(status);
    for (name, value) in response.replay_headers() {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => debug!("dropping invalid response header {name}"),
        }
    }
    builder
        .body(Body::from(body))
        .map_err(|e| BridgeError::serialization(format!("failed to build response: {e}")))
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn exceeds_limit(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<LengthLimitError>() {
            return true;
        }
        current = e.source();
    }
    false
}
