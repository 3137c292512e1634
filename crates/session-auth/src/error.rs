//! Error types for session credential handling

/// Errors from the credential store's persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("session state parse error: {0}")]
    StateParse(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why an access credential could not be decoded into claims.
///
/// Always recovered locally: callers treat it as "no identity available".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("no credential to decode")]
    Missing,

    #[error("credential has {segments} segments, expected 3")]
    Malformed { segments: usize },

    #[error("credential payload is not base64url: {0}")]
    Base64(String),

    #[error("credential payload is not a claims object: {0}")]
    Payload(String),
}

/// Why a renewal did not produce a new access credential.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenewalFailure {
    /// The cookie jar holds no refresh credential; no call was made.
    #[error("no refresh credential available")]
    NoRefreshCredential,

    /// Every attempt failed; stored credentials have been cleared.
    #[error("renewal exhausted after {attempts} attempts")]
    Exhausted { attempts: u32 },

    /// One attempt failed. Retried internally, never returned by `renew()`.
    #[error("renewal attempt failed: {0}")]
    NetworkError(String),
}

impl RenewalFailure {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            RenewalFailure::NoRefreshCredential => "no_refresh_credential",
            RenewalFailure::Exhausted { .. } => "exhausted",
            RenewalFailure::NetworkError(_) => "network_error",
        }
    }
}
