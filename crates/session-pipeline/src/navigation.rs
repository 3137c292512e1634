//! Login redirect
//!
//! The pipeline does not know how its host shows a login screen. It hands a
//! `LoginRedirect` to a `Navigator`, which may navigate a UI, answer with an
//! HTTP redirect, or just log.

use parking_lot::Mutex;

/// Where to send the user once the session cannot be renewed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRedirect {
    pub login_path: String,
    /// Location to come back to after signing in.
    pub return_to: String,
    /// Human-readable notice for the host to display.
    pub message: String,
}

impl LoginRedirect {
    pub fn new(login_path: impl Into<String>, return_to: impl Into<String>) -> Self {
        Self {
            login_path: login_path.into(),
            return_to: return_to.into(),
            message: "Your session has expired. Please sign in again.".into(),
        }
    }

    /// Login location with the origin encoded as `returnTo`.
    pub fn location(&self) -> String {
        format!(
            "{}?returnTo={}",
            self.login_path,
            urlencoding::encode(&self.return_to)
        )
    }

    /// A redirect from the login page to itself would loop.
    pub fn is_self_redirect(&self) -> bool {
        self.return_to == self.login_path
    }
}

/// Host hook for sending the user to login.
pub trait Navigator: Send + Sync {
    /// Location the user is currently looking at, used as the default return target.
    fn current_path(&self) -> String;

    fn redirect_to_login(&self, redirect: &LoginRedirect);
}

/// Navigator that records redirects instead of performing them.
pub struct RecordingNavigator {
    current: Mutex<String>,
    redirects: Mutex<Vec<LoginRedirect>>,
}

impl RecordingNavigator {
    pub fn new(current: impl Into<String>) -> Self {
        Self {
            current: Mutex::new(current.into()),
            redirects: Mutex::new(Vec::new()),
        }
    }

    pub fn set_current(&self, path: impl Into<String>) {
        *self.current.lock() = path.into();
    }

    pub fn redirects(&self) -> Vec<LoginRedirect> {
        self.redirects.lock().clone()
    }
}

impl Default for RecordingNavigator {
    fn default() -> Self {
        Self::new("/")
    }
}

impl Navigator for RecordingNavigator {
    fn current_path(&self) -> String {
        self.current.lock().clone()
    }

    fn redirect_to_login(&self, redirect: &LoginRedirect) {
        self.redirects.lock().push(redirect.clone());
    }
}
