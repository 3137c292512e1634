//! The authenticated request pipeline
//!
//! `RequestPipeline` is the single entry point for backend calls. It owns no
//! global state: the credential store, cookie jar, renewal client and
//! navigator are all injected, so one process can run several sessions.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use metrics::counter;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, HeaderValue};
use reqwest::{Method, StatusCode};
use session_auth::{
    ACCESS_TOKEN_HEADER, API_TIMEOUT, AccessCredential, CookieJar, CredentialStore,
    DEFAULT_BASE_URL, LIVENESS_TIMEOUT, LOGIN_PATH, LOGOUT_PATH, REFRESH_COOKIE_NAME,
    RenewalClient, RenewalFailure,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use transport::{ApiRequest, ApiResponse, Transport, TransportError};

use crate::error::{AuthExpiredReason, Error, Result};
use crate::flight::{RenewalFlight, RenewalPolicy};
use crate::navigation::{LoginRedirect, Navigator};
use crate::request::PendingRequest;

/// Pipeline-wide settings.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub base_url: String,
    /// Applied to requests that do not set their own timeout.
    pub timeout: Duration,
    pub liveness_timeout: Duration,
    pub login_path: String,
    pub policy: RenewalPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            timeout: API_TIMEOUT,
            liveness_timeout: LIVENESS_TIMEOUT,
            login_path: LOGIN_PATH.to_owned(),
            policy: RenewalPolicy::default(),
        }
    }
}

pub struct RequestPipeline {
    transport: Arc<dyn Transport>,
    store: Arc<CredentialStore>,
    jar: Arc<CookieJar>,
    renewal: Arc<RenewalClient>,
    navigator: Arc<dyn Navigator>,
    flight: RenewalFlight,
    settings: PipelineSettings,
}

impl RequestPipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
        jar: Arc<CookieJar>,
        renewal: Arc<RenewalClient>,
        navigator: Arc<dyn Navigator>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            transport,
            store,
            jar,
            renewal,
            navigator,
            flight: RenewalFlight::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn jar(&self) -> &Arc<CookieJar> {
        &self.jar
    }

    /// Absolute backend URL for `path`. Absolute URLs pass through unchanged.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_owned();
        }
        let base = self.settings.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    pub fn request(&self, method: Method, path: &str) -> ApiRequest {
        ApiRequest::new(method, self.url(path))
    }

    /// Execute `request` with the navigator's current location as return target.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let return_to = self.navigator.current_path();
        self.execute(PendingRequest::new(request, return_to)).await
    }

    /// Execute one logical request.
    ///
    /// Any non-401 response is returned as-is. A 401 with budget left renews
    /// the credential and replays the request once; renewal failure or a
    /// second 401 yields `Error::AuthExpired`.
    #[instrument(skip_all, fields(method = %pending.request.method, path = pending.request.path()))]
    pub async fn execute(&self, pending: PendingRequest) -> Result<ApiResponse> {
        let sent_with = self.store.get().await;
        let response = self.dispatch(&pending.request, sent_with.as_ref()).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(replay) = pending.replay() else {
            debug!("credential rejected and retry budget spent");
            return Err(self.expired(AuthExpiredReason::ReplayRejected, &pending.return_to));
        };

        debug!("credential rejected, renewing");
        let credential = self
            .renew_for(sent_with, &pending.return_to)
            .await
            .map_err(|failure| {
                self.expired(AuthExpiredReason::RenewalFailed(failure), &pending.return_to)
            })?;

        let response = self.dispatch(&replay.request, Some(&credential)).await?;
        if response.status == StatusCode::UNAUTHORIZED {
            warn!("request rejected again after renewal");
            return Err(self.expired(AuthExpiredReason::ReplayRejected, &replay.return_to));
        }
        Ok(response)
    }

    /// Like `execute`, but resolves to `Error::Cancelled` once `cancel` fires.
    ///
    /// A renewal already started on behalf of this request still completes.
    pub async fn execute_with_cancel(
        &self,
        pending: PendingRequest,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("request cancelled by caller");
                Err(Error::Cancelled)
            }
            result = self.execute(pending) => result,
        }
    }

    /// Sign in with a caller-built login request.
    ///
    /// On success the issued credential replaces the session; the refresh
    /// cookie is captured from the response like any other.
    pub async fn login(&self, request: ApiRequest) -> Result<ApiResponse> {
        let response = self.dispatch(&request, None).await?;
        if !response.is_success() {
            info!(status = response.status.as_u16(), "login rejected");
            return Ok(response);
        }

        match response
            .header_str(ACCESS_TOKEN_HEADER)
            .and_then(AccessCredential::from_header_value)
        {
            Some(credential) => {
                self.store.clear_all().await;
                self.renewal.accept_credential(credential).await;
                info!("signed in");
            }
            None => warn!("login succeeded without an access credential header"),
        }
        Ok(response)
    }

    /// Sign out. Never fails: local state is cleared whatever the backend says.
    ///
    /// Returns the backend's status when the call got a response.
    pub async fn logout(&self) -> Option<StatusCode> {
        let request = self.request(Method::POST, LOGOUT_PATH);
        let credential = self.store.get().await;

        let status = match self.dispatch(&request, credential.as_ref()).await {
            Ok(response) => {
                info!(
                    status = response.status.as_u16(),
                    body = %response.text(),
                    "logout response"
                );
                Some(response.status)
            }
            Err(e) => {
                warn!(error = %e, "logout call failed, clearing local session anyway");
                None
            }
        };

        self.store.clear_all().await;
        self.jar.invalidate(REFRESH_COOKIE_NAME);
        // Every other backend cookie belonged to the signed-out session too.
        self.jar.clear();
        self.store.sync_refresh(&self.jar).await;
        status
    }

    /// Whether the backend answers `path` with a success status within the liveness timeout.
    ///
    /// Sent bare, straight to the transport: no credential, no cookies, and a
    /// 401 is just "not up". The session is never touched.
    pub async fn liveness(&self, path: &str) -> bool {
        let request = self
            .request(Method::GET, path)
            .timeout(self.settings.liveness_timeout);
        match self.transport.send(&request).await {
            Ok(response) => {
                debug!(status = response.status.as_u16(), "liveness response");
                response.is_success()
            }
            Err(e) => {
                debug!(error = %e, "liveness check failed");
                false
            }
        }
    }

    /// Obtain a credential to replay with, honoring the renewal policy.
    async fn renew_for(
        &self,
        sent_with: Option<AccessCredential>,
        return_to: &str,
    ) -> std::result::Result<AccessCredential, RenewalFailure> {
        let redirect = LoginRedirect::new(self.settings.login_path.clone(), return_to);

        match self.settings.policy {
            RenewalPolicy::Independent => {
                renew_and_settle(
                    self.renewal.clone(),
                    self.store.clone(),
                    self.navigator.clone(),
                    redirect,
                )
                .await
            }
            RenewalPolicy::Coalesced => {
                // Another request may have renewed while this one was in flight.
                if let Some(current) = self.store.get().await {
                    if sent_with.as_ref() != Some(&current) {
                        debug!("credential already renewed by a concurrent request");
                        return Ok(current);
                    }
                }

                let renewal = self.renewal.clone();
                let store = self.store.clone();
                let navigator = self.navigator.clone();
                self.flight
                    .run(move || renew_and_settle(renewal, store, navigator, redirect).boxed())
                    .await
            }
        }
    }

    /// Prepare and send one attempt, recording any cookies the response sets.
    async fn dispatch(
        &self,
        request: &ApiRequest,
        credential: Option<&AccessCredential>,
    ) -> Result<ApiResponse> {
        let prepared = self.prepare(request, credential)?;
        let response = self.transport.send(&prepared).await?;
        self.jar.store_response_cookies(&response.headers);
        self.store.sync_refresh(&self.jar).await;
        debug!(status = response.status.as_u16(), "backend responded");
        Ok(response)
    }

    /// Attach credential, cookies, content type and default timeout.
    fn prepare(
        &self,
        request: &ApiRequest,
        credential: Option<&AccessCredential>,
    ) -> Result<ApiRequest> {
        let mut prepared = request.clone();

        // Multipart needs the transport's boundary-bearing content type.
        if prepared.body.is_multipart() {
            prepared.headers.remove(CONTENT_TYPE);
        } else if !prepared.headers.contains_key(CONTENT_TYPE) {
            prepared
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        if let Some(credential) = credential {
            prepared
                .headers
                .insert(AUTHORIZATION, sensitive(&credential.bearer())?);
        }

        if let Some(cookies) = self.jar.cookie_header() {
            prepared.headers.insert(COOKIE, sensitive(&cookies)?);
        }

        if prepared.timeout.is_none() {
            prepared.timeout = Some(self.settings.timeout);
        }
        Ok(prepared)
    }

    fn expired(&self, reason: AuthExpiredReason, return_to: &str) -> Error {
        Error::AuthExpired {
            reason,
            login: LoginRedirect::new(self.settings.login_path.clone(), return_to).location(),
        }
    }
}

fn sensitive(value: &str) -> Result<HeaderValue> {
    let mut header = HeaderValue::from_str(value)
        .map_err(|e| TransportError::Invalid(format!("credential is not a valid header: {e}")))?;
    header.set_sensitive(true);
    Ok(header)
}

/// Run one renewal and apply its session-level consequences.
///
/// Failure clears the access credential and sends the user to login, unless
/// they are already on the login page.
async fn renew_and_settle(
    renewal: Arc<RenewalClient>,
    store: Arc<CredentialStore>,
    navigator: Arc<dyn Navigator>,
    redirect: LoginRedirect,
) -> std::result::Result<AccessCredential, RenewalFailure> {
    match renewal.renew().await {
        Ok(credential) => {
            counter!("session_renewals_total", "outcome" => "renewed").increment(1);
            Ok(credential)
        }
        Err(failure) => {
            counter!("session_renewals_total", "outcome" => failure.label()).increment(1);
            store.clear().await;
            if redirect.is_self_redirect() {
                debug!("already on the login page, redirect skipped");
            } else {
                warn!(
                    return_to = %redirect.return_to,
                    reason = %failure,
                    "session expired, redirecting to login"
                );
                navigator.redirect_to_login(&redirect);
            }
            Err(failure)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::navigation::RecordingNavigator;
    use crate::request::RetryBudget;
    use reqwest::header::{HeaderName, SET_COOKIE};
    use session_auth::{REISSUE_PATH, RenewalSettings};
    use transport::mock::MockTransport;
    use transport::{FormPart, MultipartForm};

    const FRESH: &str = "fresh";

    struct Harness {
        pipeline: Arc<RequestPipeline>,
        transport: MockTransport,
        store: Arc<CredentialStore>,
        jar: Arc<CookieJar>,
        navigator: Arc<RecordingNavigator>,
    }

    fn harness(transport: MockTransport, policy: RenewalPolicy) -> Harness {
        let store = Arc::new(CredentialStore::in_memory());
        let jar = Arc::new(CookieJar::new());
        let navigator = Arc::new(RecordingNavigator::new("/mypage"));
        let renewal = Arc::new(RenewalClient::new(
            Arc::new(transport.clone()),
            store.clone(),
            jar.clone(),
            RenewalSettings {
                base_url: "http://backend".into(),
                ..Default::default()
            },
        ));
        let pipeline = Arc::new(RequestPipeline::new(
            Arc::new(transport.clone()),
            store.clone(),
            jar.clone(),
            renewal,
            navigator.clone(),
            PipelineSettings {
                base_url: "http://backend".into(),
                policy,
                ..Default::default()
            },
        ));
        Harness {
            pipeline,
            transport,
            store,
            jar,
            navigator,
        }
    }

    fn auth(req: &ApiRequest) -> &str {
        req.headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    fn status(code: StatusCode) -> transport::Result<ApiResponse> {
        Ok(ApiResponse::new(code))
    }

    /// Backend that accepts only `FRESH` and reissues it for any refresh cookie.
    fn backend() -> MockTransport {
        MockTransport::new(|req| match req.path() {
            REISSUE_PATH if auth(req).starts_with("Bearer rt_") => Ok(ApiResponse::new(StatusCode::OK)
                .with_header(
                    HeaderName::from_static(ACCESS_TOKEN_HEADER),
                    HeaderValue::from_static(FRESH),
                )
                .with_header(SET_COOKIE, HeaderValue::from_static("refresh_token=rt_2; Path=/; HttpOnly"))),
            REISSUE_PATH => status(StatusCode::UNAUTHORIZED),
            _ if auth(req) == "Bearer fresh" => Ok(ApiResponse::new(StatusCode::OK).with_body("[]")),
            _ => status(StatusCode::UNAUTHORIZED),
        })
    }

    fn boards(h: &Harness) -> ApiRequest {
        h.pipeline.request(Method::GET, "/boards")
    }

    #[tokio::test]
    async fn valid_credential_passes_through() {
        let h = harness(backend(), RenewalPolicy::Coalesced);
        h.store.set(AccessCredential::new(FRESH)).await;

        let response = h.pipeline.send(boards(&h)).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(h.transport.count(REISSUE_PATH), 0);

        let sent = h.transport.requests_to("/boards");
        assert_eq!(sent.len(), 1);
        assert_eq!(auth(&sent[0]), "Bearer fresh");
        assert_eq!(sent[0].headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(sent[0].timeout, Some(API_TIMEOUT));
    }

    #[tokio::test]
    async fn expired_credential_is_renewed_and_replayed_once() {
        let h = harness(backend(), RenewalPolicy::Coalesced);
        h.store.set(AccessCredential::new("stale")).await;
        h.jar.set(REFRESH_COOKIE_NAME, "rt_1");

        let response = h.pipeline.send(boards(&h)).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(h.transport.count(REISSUE_PATH), 1);

        let sent = h.transport.requests_to("/boards");
        assert_eq!(sent.len(), 2);
        assert_eq!(auth(&sent[0]), "Bearer stale");
        assert_eq!(auth(&sent[1]), "Bearer fresh");
        assert_eq!(h.store.get().await.unwrap().expose(), FRESH);
        assert_eq!(h.jar.get(REFRESH_COOKIE_NAME).as_deref(), Some("rt_2"));
        assert!(h.navigator.redirects().is_empty());
    }

    #[tokio::test]
    async fn second_rejection_is_auth_expired_without_third_dispatch() {
        let transport = MockTransport::new(|req| match req.path() {
            REISSUE_PATH => Ok(ApiResponse::new(StatusCode::OK).with_header(
                HeaderName::from_static(ACCESS_TOKEN_HEADER),
                HeaderValue::from_static(FRESH),
            )),
            _ => status(StatusCode::UNAUTHORIZED),
        });
        let h = harness(transport, RenewalPolicy::Coalesced);
        h.store.set(AccessCredential::new("stale")).await;
        h.jar.set(REFRESH_COOKIE_NAME, "rt_1");

        let err = h.pipeline.send(boards(&h)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::AuthExpired {
                reason: AuthExpiredReason::ReplayRejected,
                ..
            }
        ));
        assert_eq!(h.transport.count("/boards"), 2);
        assert_eq!(h.transport.count(REISSUE_PATH), 1);
    }

    #[tokio::test]
    async fn no_credentials_redirects_to_login_once() {
        let h = harness(backend(), RenewalPolicy::Coalesced);

        let err = h.pipeline.send(boards(&h)).await.unwrap_err();
        match err {
            Error::AuthExpired { reason, login } => {
                assert_eq!(
                    reason,
                    AuthExpiredReason::RenewalFailed(RenewalFailure::NoRefreshCredential)
                );
                assert_eq!(login, "/login?returnTo=%2Fmypage");
            }
            other => panic!("expected AuthExpired, got {other:?}"),
        }

        assert_eq!(h.transport.count(REISSUE_PATH), 0);
        assert_eq!(h.transport.count("/boards"), 1);
        assert!(auth(&h.transport.requests_to("/boards")[0]).is_empty());
        let redirects = h.navigator.redirects();
        assert_eq!(redirects.len(), 1);
        assert_eq!(redirects[0].location(), "/login?returnTo=%2Fmypage");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_renewal_tears_down_session() {
        let transport = MockTransport::new(|req| match req.path() {
            REISSUE_PATH => status(StatusCode::INTERNAL_SERVER_ERROR),
            _ => status(StatusCode::UNAUTHORIZED),
        });
        let h = harness(transport, RenewalPolicy::Coalesced);
        h.store.set(AccessCredential::new("stale")).await;
        h.jar.set(REFRESH_COOKIE_NAME, "rt_1");

        let err = h.pipeline.send(boards(&h)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::AuthExpired {
                reason: AuthExpiredReason::RenewalFailed(RenewalFailure::Exhausted { attempts: 3 }),
                ..
            }
        ));
        assert_eq!(h.transport.count(REISSUE_PATH), 3);
        assert!(h.store.get().await.is_none());
        assert!(h.jar.get(REFRESH_COOKIE_NAME).is_none());
        assert_eq!(h.navigator.redirects().len(), 1);
    }

    #[tokio::test]
    async fn no_redirect_from_the_login_page() {
        let h = harness(backend(), RenewalPolicy::Coalesced);
        h.navigator.set_current("/login");

        let err = h.pipeline.send(boards(&h)).await.unwrap_err();
        assert_eq!(err.kind(), "auth_expired");
        assert!(h.navigator.redirects().is_empty());
    }

    #[tokio::test]
    async fn spent_budget_is_not_renewed() {
        let h = harness(backend(), RenewalPolicy::Coalesced);
        h.jar.set(REFRESH_COOKIE_NAME, "rt_1");

        let pending = PendingRequest::new(boards(&h), "/boards").with_budget(RetryBudget::spent());
        let err = h.pipeline.execute(pending).await.unwrap_err();
        assert!(matches!(
            err,
            Error::AuthExpired {
                reason: AuthExpiredReason::ReplayRejected,
                ..
            }
        ));
        assert_eq!(h.transport.count(REISSUE_PATH), 0);
    }

    #[tokio::test]
    async fn other_error_statuses_are_returned_untouched() {
        let transport = MockTransport::new(|req| match req.path() {
            "/forbidden" => status(StatusCode::FORBIDDEN),
            _ => status(StatusCode::INTERNAL_SERVER_ERROR),
        });
        let h = harness(transport, RenewalPolicy::Coalesced);

        let forbidden = h
            .pipeline
            .send(h.pipeline.request(Method::GET, "/forbidden"))
            .await
            .unwrap();
        assert_eq!(forbidden.status, StatusCode::FORBIDDEN);
        let broken = h.pipeline.send(boards(&h)).await.unwrap();
        assert_eq!(broken.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(h.transport.count(REISSUE_PATH), 0);
    }

    #[tokio::test]
    async fn transport_failure_propagates_without_renewal() {
        let transport = MockTransport::new(|_| Err(TransportError::Connect("refused".into())));
        let h = harness(transport, RenewalPolicy::Coalesced);
        h.jar.set(REFRESH_COOKIE_NAME, "rt_1");

        let err = h.pipeline.send(boards(&h)).await.unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Connect(_))));
        assert_eq!(h.transport.count(REISSUE_PATH), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_rejections_share_one_renewal() {
        let h = harness(
            backend().with_latency(Duration::from_millis(50)),
            RenewalPolicy::Coalesced,
        );
        h.store.set(AccessCredential::new("stale")).await;
        h.jar.set(REFRESH_COOKIE_NAME, "rt_1");

        let a = tokio::spawn({
            let p = h.pipeline.clone();
            let req = boards(&h);
            async move { p.send(req).await }
        });
        let b = tokio::spawn({
            let p = h.pipeline.clone();
            let req = h.pipeline.request(Method::GET, "/orders");
            async move { p.send(req).await }
        });

        assert_eq!(a.await.unwrap().unwrap().status, StatusCode::OK);
        assert_eq!(b.await.unwrap().unwrap().status, StatusCode::OK);
        assert_eq!(h.transport.count(REISSUE_PATH), 1);
        assert_eq!(h.transport.count("/boards"), 2);
        assert_eq!(h.transport.count("/orders"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn late_rejection_reuses_credential_renewed_meanwhile() {
        let h = harness(
            backend().with_latency(Duration::from_millis(50)),
            RenewalPolicy::Coalesced,
        );
        h.store.set(AccessCredential::new("stale")).await;
        h.jar.set(REFRESH_COOKIE_NAME, "rt_1");

        // A: 401 at 50ms, renewal stores `fresh` at 100ms.
        let a = tokio::spawn({
            let p = h.pipeline.clone();
            let req = boards(&h);
            async move { p.send(req).await }
        });
        // B: sent with `stale` at 75ms, rejected at 125ms after the renewal finished.
        let b = tokio::spawn({
            let p = h.pipeline.clone();
            let req = h.pipeline.request(Method::GET, "/orders");
            async move {
                tokio::time::sleep(Duration::from_millis(75)).await;
                p.send(req).await
            }
        });

        assert_eq!(a.await.unwrap().unwrap().status, StatusCode::OK);
        assert_eq!(b.await.unwrap().unwrap().status, StatusCode::OK);
        assert_eq!(h.transport.count(REISSUE_PATH), 1);

        let orders = h.transport.requests_to("/orders");
        assert_eq!(orders.len(), 2);
        assert_eq!(auth(&orders[0]), "Bearer stale");
        assert_eq!(auth(&orders[1]), "Bearer fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn independent_policy_renews_per_request() {
        let h = harness(
            backend().with_latency(Duration::from_millis(50)),
            RenewalPolicy::Independent,
        );
        h.store.set(AccessCredential::new("stale")).await;
        h.jar.set(REFRESH_COOKIE_NAME, "rt_1");

        let a = tokio::spawn({
            let p = h.pipeline.clone();
            let req = boards(&h);
            async move { p.send(req).await }
        });
        let b = tokio::spawn({
            let p = h.pipeline.clone();
            let req = h.pipeline.request(Method::GET, "/orders");
            async move { p.send(req).await }
        });

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert_eq!(h.transport.count(REISSUE_PATH), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_failures_redirect_once() {
        let transport = MockTransport::new(|req| match req.path() {
            REISSUE_PATH => status(StatusCode::BAD_GATEWAY),
            _ => status(StatusCode::UNAUTHORIZED),
        })
        .with_latency(Duration::from_millis(50));
        let h = harness(transport, RenewalPolicy::Coalesced);
        h.store.set(AccessCredential::new("stale")).await;
        h.jar.set(REFRESH_COOKIE_NAME, "rt_1");

        let a = tokio::spawn({
            let p = h.pipeline.clone();
            let req = boards(&h);
            async move { p.send(req).await }
        });
        let b = tokio::spawn({
            let p = h.pipeline.clone();
            let req = h.pipeline.request(Method::GET, "/orders");
            async move { p.send(req).await }
        });

        assert_eq!(a.await.unwrap().unwrap_err().kind(), "auth_expired");
        assert_eq!(b.await.unwrap().unwrap_err().kind(), "auth_expired");
        assert_eq!(h.transport.count(REISSUE_PATH), 3);
        assert_eq!(h.navigator.redirects().len(), 1);
    }

    #[tokio::test]
    async fn multipart_drops_explicit_content_type() {
        let h = harness(backend(), RenewalPolicy::Coalesced);
        h.store.set(AccessCredential::new(FRESH)).await;

        let form = MultipartForm::new()
            .part(FormPart::text("title", "desk lamp"))
            .part(FormPart::file("image", "lamp.png", "image/png", vec![1u8, 2, 3]));
        let request = h
            .pipeline
            .request(Method::POST, "/items")
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .multipart(form);

        h.pipeline.send(request).await.unwrap();
        let sent = h.transport.requests_to("/items");
        assert!(sent[0].headers.get(CONTENT_TYPE).is_none());
        assert_eq!(auth(&sent[0]), "Bearer fresh");
    }

    #[tokio::test]
    async fn cookies_and_caller_timeout_are_kept() {
        let h = harness(backend(), RenewalPolicy::Coalesced);
        h.store.set(AccessCredential::new(FRESH)).await;
        h.jar.set(REFRESH_COOKIE_NAME, "rt_1");

        let request = boards(&h).timeout(Duration::from_secs(3));
        h.pipeline.send(request).await.unwrap();

        let sent = h.transport.requests_to("/boards");
        assert_eq!(sent[0].headers.get(COOKIE).unwrap(), "refresh_token=rt_1");
        assert_eq!(sent[0].timeout, Some(Duration::from_secs(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_resolves_to_cancelled() {
        let h = harness(
            backend().with_latency(Duration::from_secs(5)),
            RenewalPolicy::Coalesced,
        );
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let pending = PendingRequest::new(boards(&h), "/boards");
        let err = h
            .pipeline
            .execute_with_cancel(pending, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn logout_clears_session_even_when_backend_fails() {
        let h = harness(
            MockTransport::new(|_| Err(TransportError::Connect("refused".into()))),
            RenewalPolicy::Coalesced,
        );
        h.store.set(AccessCredential::new(FRESH)).await;
        h.store.set_subject_if_absent("kim@example.com".into()).await;
        h.jar.set(REFRESH_COOKIE_NAME, "rt_1");
        h.jar.set("tracking", "1");

        assert_eq!(h.pipeline.logout().await, None);
        assert!(h.store.get().await.is_none());
        assert!(h.store.subject().await.is_none());
        assert!(h.jar.get(REFRESH_COOKIE_NAME).is_none());
        assert!(h.jar.cookie_header().is_none());
    }

    #[tokio::test]
    async fn logout_sends_bearer_and_reports_status() {
        let h = harness(
            MockTransport::new(|_| Ok(ApiResponse::new(StatusCode::OK).with_body("bye"))),
            RenewalPolicy::Coalesced,
        );
        h.store.set(AccessCredential::new(FRESH)).await;

        assert_eq!(h.pipeline.logout().await, Some(StatusCode::OK));
        let sent = h.transport.requests_to(LOGOUT_PATH);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, Method::POST);
        assert_eq!(auth(&sent[0]), "Bearer fresh");
        assert!(h.store.get().await.is_none());
    }

    #[tokio::test]
    async fn login_stores_credential_identity_and_refresh_cookie() {
        use base64::Engine;
        let token = format!(
            "h.{}.s",
            base64::engine::general_purpose::URL_SAFE_NO_PAD
                .encode(r#"{"email":"kim@example.com","role":"ROLE_USER"}"#)
        );
        let issued = token.clone();
        let transport = MockTransport::new(move |_| {
            Ok(ApiResponse::new(StatusCode::OK)
                .with_header(
                    HeaderName::from_static(ACCESS_TOKEN_HEADER),
                    HeaderValue::from_str(&issued).unwrap(),
                )
                .with_header(SET_COOKIE, HeaderValue::from_static("refresh_token=rt_1; Path=/; HttpOnly")))
        });
        let h = harness(transport, RenewalPolicy::Coalesced);
        h.store.set_subject_if_absent("previous@example.com".into()).await;

        let request = h
            .pipeline
            .request(Method::POST, LOGIN_PATH)
            .json(&serde_json::json!({"username": "kim", "password": "pw"}))
            .unwrap();
        let response = h.pipeline.login(request).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(h.store.get().await.unwrap().expose(), token);
        assert_eq!(h.store.subject().await.as_deref(), Some("kim@example.com"));
        assert_eq!(h.jar.get(REFRESH_COOKIE_NAME).as_deref(), Some("rt_1"));
        assert!(auth(&h.transport.requests()[0]).is_empty());
    }

    #[tokio::test]
    async fn rejected_login_leaves_session_alone() {
        let h = harness(
            MockTransport::new(|_| status(StatusCode::UNAUTHORIZED)),
            RenewalPolicy::Coalesced,
        );
        h.store.set(AccessCredential::new("existing")).await;

        let request = h.pipeline.request(Method::POST, LOGIN_PATH);
        let response = h.pipeline.login(request).await.unwrap();
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(h.store.get().await.unwrap().expose(), "existing");
        assert_eq!(h.transport.count(REISSUE_PATH), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_rejection_leaves_session_alone() {
        let transport = MockTransport::new(|req| match req.path() {
            REISSUE_PATH => status(StatusCode::BAD_GATEWAY),
            _ => status(StatusCode::UNAUTHORIZED),
        });
        let h = harness(transport, RenewalPolicy::Coalesced);
        h.store.set(AccessCredential::new("stale")).await;
        h.jar.set(REFRESH_COOKIE_NAME, "rt_1");

        let start = tokio::time::Instant::now();
        assert!(!h.pipeline.liveness("/health").await);
        assert!(start.elapsed() < Duration::from_secs(1), "no renewal backoff");

        assert_eq!(h.transport.count(REISSUE_PATH), 0);
        assert!(h.navigator.redirects().is_empty());
        assert_eq!(h.store.get().await.unwrap().expose(), "stale");
        assert_eq!(h.jar.get(REFRESH_COOKIE_NAME).as_deref(), Some("rt_1"));

        let sent = h.transport.requests_to("/health");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].headers.get(AUTHORIZATION).is_none());
        assert!(sent[0].headers.get(COOKIE).is_none());
    }

    #[tokio::test]
    async fn liveness_uses_short_timeout() {
        let transport = MockTransport::new(|req| match req.path() {
            "/health" => status(StatusCode::OK),
            _ => status(StatusCode::SERVICE_UNAVAILABLE),
        });
        let h = harness(transport, RenewalPolicy::Coalesced);

        assert!(h.pipeline.liveness("/health").await);
        assert!(!h.pipeline.liveness("/down").await);
        let sent = h.transport.requests_to("/health");
        assert_eq!(sent[0].timeout, Some(LIVENESS_TIMEOUT));
    }

    #[test]
    fn url_joins_base_and_path() {
        let h = harness(backend(), RenewalPolicy::Coalesced);
        assert_eq!(h.pipeline.url("/boards"), "http://backend/boards");
        assert_eq!(h.pipeline.url("boards"), "http://backend/boards");
        assert_eq!(
            h.pipeline.url("https://other.example/x"),
            "https://other.example/x"
        );
    }
}
