//! Session endpoints
//!
//! - `POST /session/login` forwards a login submission and keeps the issued credentials
//! - `POST /session/logout` signs out at the backend and clears local state
//! - `GET /session` reports who is signed in, and until when

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header::CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use reqwest::Method;
use session_auth::LOGIN_PATH;
use session_pipeline::RequestPipeline;
use tracing::info;
use transport::RequestBody;

use crate::proxy::{into_axum_response, pipeline_error_response};

/// Build the session router. Merged into the main router.
pub fn build_session_router(pipeline: Arc<RequestPipeline>) -> Router {
    Router::new()
        .route("/session", get(session_status))
        .route("/session/login", post(login))
        .route("/session/logout", post(logout))
        .with_state(pipeline)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// GET /session: session snapshot. Never exposes the credential itself.
async fn session_status(State(pipeline): State<Arc<RequestPipeline>>) -> Response {
    let snapshot = pipeline.store().snapshot().await;
    json_response(StatusCode::OK, serde_json::json!(snapshot))
}

/// POST /session/login: body and content type are forwarded verbatim to the backend.
///
/// A rejected login comes back with the backend's status and body.
async fn login(
    State(pipeline): State<Arc<RequestPipeline>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());

    let mut request = pipeline.request(Method::POST, LOGIN_PATH);
    if let Some(content_type) = headers.get(CONTENT_TYPE) {
        request.headers.insert(CONTENT_TYPE, content_type.clone());
    }
    if !body.is_empty() {
        request.body = RequestBody::Bytes(body);
    }

    match pipeline.login(request).await {
        Ok(response) if response.is_success() => {
            let snapshot = pipeline.store().snapshot().await;
            json_response(StatusCode::OK, serde_json::json!(snapshot))
        }
        Ok(response) => into_axum_response(response, &request_id),
        Err(e) => pipeline_error_response(&e, &request_id),
    }
}

/// POST /session/logout: always succeeds locally.
async fn logout(State(pipeline): State<Arc<RequestPipeline>>) -> Response {
    let backend_status = pipeline.logout().await;
    info!(
        backend_status = backend_status.map(|s| s.as_u16()),
        "session signed out"
    );
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "signed_out": true,
            "backend_status": backend_status.map(|s| s.as_u16()),
        }),
    )
}
