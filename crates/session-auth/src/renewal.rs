//! Access credential renewal
//!
//! Trades the refresh credential (cookie) for a new access credential via
//! `POST /reissue`, retrying with linear backoff. On exhaustion the session
//! is torn down: the access credential is cleared and the refresh cookie is
//! invalidated, so the next request starts from a signed-out state.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, HeaderValue};
use tracing::{debug, info, warn};
use transport::{ApiRequest, ApiResponse, Transport};

use crate::codec;
use crate::constants::{
    ACCESS_TOKEN_HEADER, API_TIMEOUT, DEFAULT_BACKOFF_STEP, DEFAULT_BASE_URL, DEFAULT_MAX_RETRIES,
    REFRESH_COOKIE_NAME, REISSUE_PATH,
};
use crate::cookies::CookieJar;
use crate::error::RenewalFailure;
use crate::store::{AccessCredential, CredentialStore};

/// Retry and endpoint settings for renewal.
#[derive(Debug, Clone)]
pub struct RenewalSettings {
    pub base_url: String,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_step: Duration,
    pub timeout: Duration,
}

impl Default for RenewalSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_step: DEFAULT_BACKOFF_STEP,
            timeout: API_TIMEOUT,
        }
    }
}

/// Position within one renewal's retry sequence. Zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalAttempt {
    pub index: u32,
    pub max_retries: u32,
}

impl RenewalAttempt {
    pub fn first(max_retries: u32) -> Self {
        Self {
            index: 0,
            max_retries,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.index < self.max_retries
    }

    /// Wait before the next attempt: `(index + 1) * step`, saturating at `Duration::MAX`.
    pub fn backoff(&self, step: Duration) -> Duration {
        step.saturating_mul(self.number())
    }

    pub fn next(self) -> Self {
        Self {
            index: self.index.saturating_add(1),
            ..self
        }
    }

    /// One-based attempt number, for logs.
    pub fn number(&self) -> u32 {
        self.index.saturating_add(1)
    }
}

/// Performs renewals against the backend.
pub struct RenewalClient {
    transport: Arc<dyn Transport>,
    store: Arc<CredentialStore>,
    jar: Arc<CookieJar>,
    settings: RenewalSettings,
}

impl RenewalClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
        jar: Arc<CookieJar>,
        settings: RenewalSettings,
    ) -> Self {
        Self {
            transport,
            store,
            jar,
            settings,
        }
    }

    /// Obtain a new access credential.
    ///
    /// Returns `NoRefreshCredential` without any network call when the jar
    /// has no refresh cookie. Otherwise makes up to `max_retries + 1`
    /// attempts; exhaustion clears stored credentials and returns `Exhausted`.
    pub async fn renew(&self) -> Result<AccessCredential, RenewalFailure> {
        let mut attempt = RenewalAttempt::first(self.settings.max_retries);

        loop {
            // Re-read each time: a concurrent sign-out may have removed it.
            let Some(refresh) = self.jar.get(REFRESH_COOKIE_NAME) else {
                info!("no refresh credential, renewal skipped");
                return Err(RenewalFailure::NoRefreshCredential);
            };

            match self.attempt(&refresh).await {
                Ok(credential) => {
                    self.accept_credential(credential.clone()).await;
                    info!(attempt = attempt.number(), "access credential renewed");
                    return Ok(credential);
                }
                Err(failure) => {
                    warn!(
                        attempt = attempt.number(),
                        max_attempts = self.settings.max_retries.saturating_add(1),
                        error = %failure,
                        "renewal attempt failed"
                    );
                }
            }

            if !attempt.can_retry() {
                break;
            }
            let wait = attempt.backoff(self.settings.backoff_step);
            debug!(wait_ms = wait.as_millis() as u64, "backing off before next renewal attempt");
            tokio::time::sleep(wait).await;
            attempt = attempt.next();
        }

        let attempts = attempt.number();
        warn!(attempts, "renewal exhausted, clearing session credentials");
        self.store.clear().await;
        self.jar.invalidate(REFRESH_COOKIE_NAME);
        self.store.sync_refresh(&self.jar).await;
        Err(RenewalFailure::Exhausted { attempts })
    }

    /// Store a newly issued credential and cache its identity if none is cached.
    ///
    /// Decode failures are not errors here: the credential is still usable.
    pub async fn accept_credential(&self, credential: AccessCredential) {
        match codec::decode(Some(credential.expose())) {
            Ok(claims) => {
                if let Some(identity) = claims.identity() {
                    self.store.set_subject_if_absent(identity.to_owned()).await;
                }
            }
            Err(e) => debug!(error = %e, "issued credential has no readable claims"),
        }
        self.store.set(credential).await;
    }

    async fn attempt(&self, refresh: &str) -> Result<AccessCredential, RenewalFailure> {
        let request = self.reissue_request(refresh)?;

        let response = self
            .transport
            .send(&request)
            .await
            .map_err(|e| RenewalFailure::NetworkError(e.to_string()))?;

        // Rotated refresh cookie arrives with the reissue response.
        self.jar.store_response_cookies(&response.headers);
        self.store.sync_refresh(&self.jar).await;

        extract_credential(&response)
    }

    fn reissue_request(&self, refresh: &str) -> Result<ApiRequest, RenewalFailure> {
        let invalid = |e: reqwest::header::InvalidHeaderValue| {
            RenewalFailure::NetworkError(format!("refresh credential is not a valid header: {e}"))
        };

        let mut bearer = HeaderValue::from_str(&format!("Bearer {refresh}")).map_err(invalid)?;
        bearer.set_sensitive(true);

        let mut request = ApiRequest::post(format!(
            "{}{REISSUE_PATH}",
            self.settings.base_url.trim_end_matches('/')
        ))
        .header(AUTHORIZATION, bearer)
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .timeout(self.settings.timeout);

        if let Some(cookies) = self.jar.cookie_header() {
            let mut value = HeaderValue::from_str(&cookies).map_err(invalid)?;
            value.set_sensitive(true);
            request = request.header(COOKIE, value);
        }
        Ok(request)
    }
}

fn extract_credential(response: &ApiResponse) -> Result<AccessCredential, RenewalFailure> {
    if response.status != reqwest::StatusCode::OK {
        return Err(RenewalFailure::NetworkError(format!(
            "reissue returned {}",
            response.status
        )));
    }
    response
        .header_str(ACCESS_TOKEN_HEADER)
        .and_then(AccessCredential::from_header_value)
        .ok_or_else(|| {
            RenewalFailure::NetworkError("reissue response carried no access credential".into())
        })
}
