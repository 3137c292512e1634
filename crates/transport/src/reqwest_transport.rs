//! `reqwest`-backed transport
//!
//! Maps an `ApiRequest` onto a `reqwest::RequestBuilder`, buffers the full
//! response, and classifies failures into `TransportError`. Multipart forms
//! are rebuilt from owned parts on every dispatch, so replays send the same
//! payload with a fresh boundary.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::debug;

use crate::{ApiRequest, ApiResponse, MultipartForm, RequestBody, Result, Transport, TransportError};

/// Default timeout for general API calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Production transport over a shared `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    async fn dispatch(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone())
            .timeout(timeout);

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Bytes(bytes) => builder.body(bytes.clone()),
            RequestBody::Multipart(form) => builder.multipart(build_form(form)?),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| match classify(e, timeout) {
                TransportError::Request(msg) => TransportError::Body(msg),
                other => other,
            })?;

        debug!(
            method = %request.method,
            path = request.path(),
            status = status.as_u16(),
            bytes = body.len(),
            "transport call completed"
        );

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

impl Transport for ReqwestTransport {
    fn send<'a>(
        &'a self,
        request: &'a ApiRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>> {
        Box::pin(self.dispatch(request))
    }
}

fn build_form(form: &MultipartForm) -> Result<reqwest::multipart::Form> {
    let mut out = reqwest::multipart::Form::new();
    for part in &form.parts {
        let mut built = reqwest::multipart::Part::bytes(part.data.to_vec());
        if let Some(filename) = &part.filename {
            built = built.file_name(filename.clone());
        }
        if let Some(mime) = &part.mime {
            built = built.mime_str(mime).map_err(|e| {
                TransportError::Invalid(format!("invalid mime type for part {}: {e}", part.name))
            })?;
        }
        out = out.part(part.name.clone(), built);
    }
    Ok(out)
}

fn classify(e: reqwest::Error, timeout: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(timeout)
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else if e.is_builder() {
        TransportError::Invalid(e.to_string())
    } else {
        TransportError::Request(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FormPart, MultipartForm};
    use axum::body::Body;
    use axum::http::StatusCode;
    use reqwest::header::{HeaderName, HeaderValue};
    use tokio::net::TcpListener;

    /// Start a backend stub that echoes method, path, headers and body as JSON.
    async fn start_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let app = axum::Router::new()
                .route(
                    "/slow",
                    axum::routing::get(|| async {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        "late"
                    }),
                )
                .fallback(|request: axum::http::Request<Body>| async move {
                    let mut headers = serde_json::Map::new();
                    for (name, value) in request.headers() {
                        headers.insert(
                            name.to_string(),
                            serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
                        );
                    }
                    let method = request.method().to_string();
                    let path = request.uri().path().to_string();
                    let body = axum::body::to_bytes(request.into_body(), 1024 * 1024)
                        .await
                        .unwrap();
                    let status = if path == "/missing" {
                        StatusCode::NOT_FOUND
                    } else {
                        StatusCode::OK
                    };
                    (
                        status,
                        [("set-cookie", "refresh_token=rt_1; Path=/")],
                        axum::Json(serde_json::json!({
                            "method": method,
                            "path": path,
                            "headers": headers,
                            "body": String::from_utf8_lossy(&body),
                        })),
                    )
                });
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{addr}")
    }

    #[tokio::test]
    async fn forwards_method_headers_and_body() {
        let base = start_echo_server().await;
        let transport = ReqwestTransport::new(reqwest::Client::new());

        let request = ApiRequest::post(format!("{base}/boards"))
            .header(
                HeaderName::from_static("x-trace"),
                HeaderValue::from_static("abc"),
            )
            .json(&serde_json::json!({"title": "hello"}))
            .unwrap();

        let response = transport.send(&request).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(
            response.header_str("set-cookie"),
            Some("refresh_token=rt_1; Path=/")
        );

        let echoed: serde_json::Value = response.json().unwrap();
        assert_eq!(echoed["method"], "POST");
        assert_eq!(echoed["path"], "/boards");
        assert_eq!(echoed["headers"]["x-trace"], "abc");
        assert_eq!(echoed["headers"]["content-type"], "application/json");
        assert_eq!(echoed["body"], r#"{"title":"hello"}"#);
    }

    #[tokio::test]
    async fn error_statuses_are_responses_not_errors() {
        let base = start_echo_server().await;
        let transport = ReqwestTransport::new(reqwest::Client::new());

        let response = transport
            .send(&ApiRequest::get(format!("{base}/missing")))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn multipart_gets_boundary_content_type() {
        let base = start_echo_server().await;
        let transport = ReqwestTransport::new(reqwest::Client::new());

        let form = MultipartForm::new()
            .part(FormPart::text("title", "desk lamp"))
            .part(FormPart::file("image", "lamp.png", "image/png", b"PNGDATA".to_vec()));
        let request = ApiRequest::post(format!("{base}/items")).multipart(form);

        let response = transport.send(&request).await.unwrap();
        let echoed: serde_json::Value = response.json().unwrap();
        let content_type = echoed["headers"]["content-type"].as_str().unwrap();
        assert!(
            content_type.starts_with("multipart/form-data; boundary="),
            "transport must set a boundary-bearing content type, got: {content_type}"
        );
        let body = echoed["body"].as_str().unwrap();
        assert!(body.contains("name=\"title\""));
        assert!(body.contains("filename=\"lamp.png\""));
        assert!(body.contains("PNGDATA"));
    }

    #[tokio::test]
    async fn timeout_is_classified() {
        let base = start_echo_server().await;
        let transport = ReqwestTransport::new(reqwest::Client::new());

        let request = ApiRequest::get(format!("{base}/slow")).timeout(Duration::from_millis(50));
        let err = transport.send(&request).await.unwrap_err();
        assert_eq!(err, TransportError::Timeout(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn refused_connection_is_classified() {
        // Bind then drop to obtain a port with nothing listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = ReqwestTransport::new(reqwest::Client::new());
        let err = transport
            .send(&ApiRequest::get(format!("http://{addr}/boards")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "connection", "got: {err:?}");
    }

    #[test]
    fn invalid_mime_is_rejected() {
        let form = MultipartForm::new().part(FormPart::file("f", "a.bin", "not a mime", vec![0u8]));
        let err = build_form(&form).unwrap_err();
        assert_eq!(err.kind(), "invalid");
    }
}
