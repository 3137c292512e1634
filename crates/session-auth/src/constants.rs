//! Backend contract constants
//!
//! Paths, header and cookie names the backend uses for its session
//! protocol. These identify wire-level contract points, not secrets.

use std::time::Duration;

/// Backend base URL when neither config nor `API_BASE_URL` provides one.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// Renewal endpoint: exchanges the refresh credential for a new access credential.
pub const REISSUE_PATH: &str = "/reissue";

/// Sign-out endpoint.
pub const LOGOUT_PATH: &str = "/auth/logout";

/// Form login endpoint on the backend.
pub const LOGIN_PATH: &str = "/login";

/// Response header carrying a freshly issued access credential.
pub const ACCESS_TOKEN_HEADER: &str = "access_token";

/// Cookie holding the refresh credential.
pub const REFRESH_COOKIE_NAME: &str = "refresh_token";

/// Renewal retries after the first attempt (three attempts total).
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Linear backoff unit: attempt `n` waits `(n + 1) * step`.
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_millis(1000);

/// Timeout for general API calls, renewal included.
pub const API_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the backend liveness check.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);
