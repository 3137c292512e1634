//! Error types for pipeline operations

use session_auth::RenewalFailure;
use transport::TransportError;

/// Why the session could not be kept alive for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthExpiredReason {
    /// Renewal did not produce a credential.
    RenewalFailed(RenewalFailure),
    /// The replay after a successful renewal was rejected again.
    ReplayRejected,
}

impl std::fmt::Display for AuthExpiredReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthExpiredReason::RenewalFailed(failure) => write!(f, "{failure}"),
            AuthExpiredReason::ReplayRejected => write!(f, "request rejected after renewal"),
        }
    }
}

/// Errors from the request pipeline.
///
/// Non-401 HTTP statuses are not errors: they come back as `Ok(ApiResponse)`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("authentication expired: {reason}")]
    AuthExpired {
        reason: AuthExpiredReason,
        /// Login location the user was (or would be) sent to.
        login: String,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("request cancelled")]
    Cancelled,
}

impl Error {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::AuthExpired { .. } => "auth_expired",
            Error::Transport(e) => e.kind(),
            Error::Cancelled => "cancelled",
        }
    }
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
