//! HTTP proxy logic
//!
//! Receives inbound requests, strips hop-by-hop and credential headers, and
//! sends them through the authenticated pipeline. The session's credentials
//! never leave the proxy: inbound `Authorization`/`Cookie` are dropped and
//! outbound `Set-Cookie`/`access_token` are stripped from responses.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use session_auth::ACCESS_TOKEN_HEADER;
use session_pipeline::{Error as PipelineError, PendingRequest, RequestPipeline};
use tracing::{error, instrument, warn};
use transport::{ApiRequest, ApiResponse, RequestBody, TransportError};

/// Header a client uses to name the page it is on, for the login `returnTo`.
pub const RETURN_TO_HEADER: &str = "x-return-to";

/// Largest request body the proxy buffers.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Inbound headers the pipeline owns or the transport recomputes.
const OWNED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "authorization",
    "cookie",
    "content-length",
    RETURN_TO_HEADER,
];

/// Backend response headers that carry session credentials.
const CREDENTIAL_RESPONSE_HEADERS: &[&str] = &["set-cookie", ACCESS_TOKEN_HEADER];

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub pipeline: Arc<RequestPipeline>,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

/// Decrements the in-flight gauge when the request future completes or is dropped.
struct InFlight(Arc<AtomicU64>);

impl InFlight {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
///
/// `redirect` is included for session expiry so clients know where to send the user.
pub fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
    redirect: Option<&str>,
) -> Response {
    let mut error = serde_json::json!({
        "type": error_type,
        "message": message,
        "request_id": request_id,
    });
    if let Some(redirect) = redirect {
        error["redirect"] = serde_json::Value::String(redirect.to_owned());
    }
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        serde_json::json!({ "error": error }).to_string(),
    )
        .into_response()
}

/// Map a pipeline failure onto the proxy's error responses.
pub fn pipeline_error_response(err: &PipelineError, request_id: &str) -> Response {
    match err {
        PipelineError::AuthExpired { login, .. } => error_response(
            StatusCode::UNAUTHORIZED,
            "auth_expired",
            &err.to_string(),
            request_id,
            Some(login),
        ),
        PipelineError::Transport(TransportError::Timeout(_)) => error_response(
            StatusCode::GATEWAY_TIMEOUT,
            "backend_timeout",
            &err.to_string(),
            request_id,
            None,
        ),
        PipelineError::Transport(TransportError::Invalid(_)) => error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            &err.to_string(),
            request_id,
            None,
        ),
        PipelineError::Transport(_) => error_response(
            StatusCode::BAD_GATEWAY,
            "backend_error",
            &err.to_string(),
            request_id,
            None,
        ),
        PipelineError::Cancelled => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "cancelled",
            &err.to_string(),
            request_id,
            None,
        ),
    }
}

/// Proxy an inbound request to the backend through the session pipeline.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlight::enter(&state.in_flight);
    let started = Instant::now();

    let method = request.method().clone();
    let return_to = request
        .headers()
        .get(RETURN_TO_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| v.starts_with('/'))
        .unwrap_or("/")
        .to_owned();
    let url = state.pipeline.url(
        request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/"),
    );
    let headers = forwardable_headers(request.headers());

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                &request_id,
                None,
            );
        }
    };

    let mut api_request = ApiRequest::new(method.clone(), url);
    api_request.headers = headers;
    if !body.is_empty() {
        api_request.body = RequestBody::Bytes(body);
    }

    let response = match state
        .pipeline
        .execute(PendingRequest::new(api_request, return_to))
        .await
    {
        Ok(response) => into_axum_response(response, &request_id),
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            if let PipelineError::Transport(transport_err) = &e {
                crate::metrics::record_backend_error(transport_err.kind());
                error!(error = %e, "backend call failed");
            } else {
                warn!(error = %e, "request not completed");
            }
            pipeline_error_response(&e, &request_id)
        }
    };

    crate::metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Copy inbound headers minus hop-by-hop and pipeline-owned ones.
fn forwardable_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if !is_hop_by_hop(name.as_str()) && !is_owned_request_header(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

/// Convert a backend response, keeping session credentials inside the proxy.
pub fn into_axum_response(response: ApiResponse, request_id: &str) -> Response {
    let mut builder = Response::builder().status(response.status);
    for (name, value) in &response.headers {
        if !is_hop_by_hop(name.as_str()) && !is_credential_response_header(name.as_str()) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(axum::body::Body::from(response.body))
        .unwrap_or_else(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "proxy_error",
                &format!("response build error: {e}"),
                request_id,
                None,
            )
        })
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

fn is_owned_request_header(name: &str) -> bool {
    OWNED_REQUEST_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

fn is_credential_response_header(name: &str) -> bool {
    CREDENTIAL_RESPONSE_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
