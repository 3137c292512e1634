//! Authenticated-request pipeline
//!
//! Wraps every outbound API call with the session's access credential and
//! recovers from credential expiry without the caller noticing. A request
//! that comes back 401 triggers one renewal and is replayed exactly once;
//! if renewal fails the session is torn down and the user is sent to login.
//!
//! Request lifecycle:
//! 1. `prepare` attaches bearer, cookies, content type and timeout
//! 2. Transport dispatches; non-401 outcomes return to the caller as-is
//! 3. 401 with budget left → renew (coalesced with concurrent 401s by default)
//! 4. Renewal success → replay once with the new credential
//! 5. Renewal failure → clear session, redirect to login once, `AuthExpired`

pub mod error;
pub mod flight;
pub mod navigation;
pub mod pipeline;
pub mod request;

pub use error::{AuthExpiredReason, Error, Result};
pub use flight::{RenewalFlight, RenewalPolicy};
pub use navigation::{LoginRedirect, Navigator, RecordingNavigator};
pub use pipeline::{PipelineSettings, RequestPipeline};
pub use request::{PendingRequest, RetryBudget};
