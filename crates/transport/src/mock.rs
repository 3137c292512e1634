//! Scripted in-memory transport for tests
//!
//! The handler closure decides each response from the request alone; stateful
//! scripts keep their own atomics. Every dispatched request is recorded so
//! tests can assert on exact call counts and attached headers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{ApiRequest, ApiResponse, Result, Transport};

type Handler = dyn Fn(&ApiRequest) -> Result<ApiResponse> + Send + Sync;

/// Transport that answers from a closure and records every request.
#[derive(Clone)]
pub struct MockTransport {
    handler: Arc<Handler>,
    requests: Arc<Mutex<Vec<ApiRequest>>>,
    latency: Option<Duration>,
}

impl MockTransport {
    pub fn new(handler: impl Fn(&ApiRequest) -> Result<ApiResponse> + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
            requests: Arc::new(Mutex::new(Vec::new())),
            latency: None,
        }
    }

    /// Sleep before answering, making each call a real suspension point.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Snapshot of all requests dispatched so far, in order.
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().clone()
    }

    /// Requests whose URL path equals `path`.
    pub fn requests_to(&self, path: &str) -> Vec<ApiRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.path() == path)
            .cloned()
            .collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.requests_to(path).len()
    }
}

impl Transport for MockTransport {
    fn send<'a>(
        &'a self,
        request: &'a ApiRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>> {
        Box::pin(async move {
            self.requests.lock().push(request.clone());
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            (self.handler)(request)
        })
    }
}
