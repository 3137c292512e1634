//! Request/response envelope and transport abstraction
//!
//! Defines the `Transport` trait that decouples the authenticated-request
//! pipeline from the HTTP library that actually moves bytes. The envelope
//! types (`ApiRequest`, `ApiResponse`) are plain owned data so a request can
//! be captured, cloned and replayed verbatim after a credential renewal.
//!
//! `ReqwestTransport` is the production implementation. With the `test-util`
//! feature, `mock::MockTransport` provides a scripted in-memory transport.

pub mod reqwest_transport;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use reqwest_transport::ReqwestTransport;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Errors from the transport layer. HTTP error statuses are NOT errors here:
/// any response the server produced comes back as `Ok(ApiResponse)`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("response body error: {0}")]
    Body(String),

    #[error("invalid request: {0}")]
    Invalid(String),
}

impl TransportError {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "timeout",
            TransportError::Connect(_) => "connection",
            TransportError::Request(_) => "request",
            TransportError::Body(_) => "body",
            TransportError::Invalid(_) => "invalid",
        }
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// One named part of a multipart payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPart {
    pub name: String,
    pub data: Bytes,
    pub filename: Option<String>,
    pub mime: Option<String>,
}

impl FormPart {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Bytes::from(value.into()),
            filename: None,
            mime: None,
        }
    }

    pub fn file(
        name: impl Into<String>,
        filename: impl Into<String>,
        mime: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            filename: Some(filename.into()),
            mime: Some(mime.into()),
        }
    }
}

/// Multipart payload kept as owned parts so it can be rebuilt on replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartForm {
    pub parts: Vec<FormPart>,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn part(mut self, part: FormPart) -> Self {
        self.parts.push(part);
        self
    }
}

/// Outbound body.
///
/// `Multipart` is special-cased by the pipeline: any explicit content type is
/// removed so the transport can emit its own boundary-bearing value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Bytes),
    Multipart(MultipartForm),
}

impl RequestBody {
    pub fn is_multipart(&self) -> bool {
        matches!(self, RequestBody::Multipart(_))
    }
}

/// A fully described outbound call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
    /// Per-request timeout; the transport default applies when `None`.
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// Serialize `value` as the JSON body and set the JSON content type.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| TransportError::Invalid(format!("serializing JSON body: {e}")))?;
        self.headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = RequestBody::Bytes(Bytes::from(bytes));
        Ok(self)
    }

    pub fn multipart(mut self, form: MultipartForm) -> Self {
        self.body = RequestBody::Multipart(form);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Path component of the URL, used for logs and request matching.
    pub fn path(&self) -> &str {
        let without_scheme = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        let path = without_scheme
            .find('/')
            .map(|i| &without_scheme[i..])
            .unwrap_or("/");
        path.split(['?', '#']).next().unwrap_or("/")
    }
}

/// A buffered response. Every status code, including 4xx/5xx, lands here.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Header value as a string, if present and valid UTF-8.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| TransportError::Body(format!("decoding JSON body: {e}")))
    }
}

/// Abstraction over the HTTP library.
///
/// Uses a `Pin<Box<dyn Future>>` return type so the pipeline can hold an
/// `Arc<dyn Transport>` and tests can substitute a scripted implementation.
pub trait Transport: Send + Sync {
    /// Dispatch `request` once. No retries, no credential handling.
    fn send<'a>(
        &'a self,
        request: &'a ApiRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>>;
}
