//! Service wiring
//!
//! Builds the session components from configuration and holds the runtime
//! counters shared between handlers.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use session_auth::{CookieJar, CredentialStore, RenewalClient, RenewalSettings};
use session_pipeline::{LoginRedirect, Navigator, PipelineSettings, RenewalPolicy, RequestPipeline};
use tracing::{info, warn};
use transport::ReqwestTransport;

use crate::config::Config;

/// How long in-flight requests get to finish after a shutdown signal.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime counters tracked while the service is running
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Requests currently being processed, reported if the drain deadline passes.
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// The proxy has no screen to navigate. A login redirect is logged and
/// counted; the client learns about it from the 401 body's `redirect` field.
pub struct MetricsNavigator;

impl Navigator for MetricsNavigator {
    fn current_path(&self) -> String {
        "/".to_owned()
    }

    fn redirect_to_login(&self, redirect: &LoginRedirect) {
        warn!(location = %redirect.location(), "{}", redirect.message);
        crate::metrics::record_login_redirect();
    }
}

/// Build the request pipeline and everything it owns from `config`.
pub async fn build_pipeline(
    config: &Config,
    client: reqwest::Client,
) -> session_auth::Result<Arc<RequestPipeline>> {
    let transport = Arc::new(ReqwestTransport::new(client).with_default_timeout(config.backend.timeout()));

    let store = match &config.session.state_file {
        Some(path) => Arc::new(CredentialStore::load(path.clone()).await?),
        None => {
            info!("no state_file configured, session kept in memory");
            Arc::new(CredentialStore::in_memory())
        }
    };
    let jar = Arc::new(CookieJar::new());
    if store.restore_refresh(&jar).await {
        info!("restored refresh cookie from state file");
    }

    let renewal = Arc::new(RenewalClient::new(
        transport.clone(),
        store.clone(),
        jar.clone(),
        RenewalSettings {
            base_url: config.backend.base_url.clone(),
            max_retries: config.session.max_renewal_retries,
            backoff_step: config.session.renewal_backoff(),
            timeout: config.backend.timeout(),
        },
    ));

    let policy = if config.session.coalesce_renewals {
        RenewalPolicy::Coalesced
    } else {
        RenewalPolicy::Independent
    };

    Ok(Arc::new(RequestPipeline::new(
        transport,
        store,
        jar,
        renewal,
        Arc::new(MetricsNavigator),
        PipelineSettings {
            base_url: config.backend.base_url.clone(),
            timeout: config.backend.timeout(),
            liveness_timeout: config.backend.liveness_timeout(),
            login_path: config.session.login_path.clone(),
            policy,
        },
    )))
}
