//! Cookie jar for the refresh credential
//!
//! The backend delivers the refresh credential as a `Set-Cookie` and rotates
//! it on every renewal. The jar records cookies from responses, renders the
//! `Cookie` request header, and invalidates a cookie the same way a server
//! would: by applying an expired `Set-Cookie`.
//!
//! Only `Max-Age` is honored for expiry; `Expires` dates are ignored.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::Secret;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, SET_COOKIE};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct StoredCookie {
    value: Secret<String>,
    /// Wall-clock deadline so it can be written to the state file.
    expires_at: Option<SystemTime>,
}

impl StoredCookie {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Persistable form of one cookie: its value and expiry in unix seconds.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieRecord {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl std::fmt::Debug for CookieRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieRecord")
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Name, value and `Max-Age` of one `Set-Cookie` header. Other attributes
/// describe browser scoping and are not needed for a single-backend jar.
#[derive(Debug)]
struct SetCookie {
    name: String,
    value: String,
    max_age: Option<i64>,
}

fn parse_set_cookie(header: &str) -> Option<SetCookie> {
    let mut attrs = header.split(';');
    let (name, value) = attrs.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let max_age = attrs.find_map(|attr| {
        let (key, val) = attr.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("max-age")
            .then(|| val.trim().parse().ok())
            .flatten()
    });

    Some(SetCookie {
        name: name.to_owned(),
        value: value.trim().trim_matches('"').to_owned(),
        max_age,
    })
}

/// Deadline `secs` from now, or `None` when it lies beyond what `SystemTime` can hold.
fn deadline_after(secs: u64) -> Option<SystemTime> {
    SystemTime::now().checked_add(Duration::from_secs(secs))
}

/// `Set-Cookie` value that expires `name` immediately.
pub fn invalidation_cookie(name: &str) -> String {
    format!("{name}=; Max-Age=0; Path=/; Secure; SameSite=Strict")
}

/// Session-scoped cookie storage keyed by cookie name.
#[derive(Default)]
pub struct CookieJar {
    cookies: RwLock<HashMap<String, StoredCookie>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of cookie `name`, if present and unexpired.
    pub fn get(&self, name: &str) -> Option<String> {
        let now = SystemTime::now();
        self.cookies
            .read()
            .get(name)
            .filter(|c| !c.is_expired(now))
            .map(|c| c.value.expose().clone())
    }

    /// Set a session cookie directly (no expiry).
    pub fn set(&self, name: &str, value: impl Into<String>) {
        self.cookies.write().insert(
            name.to_owned(),
            StoredCookie {
                value: Secret::new(value.into()),
                expires_at: None,
            },
        );
    }

    /// Apply one `Set-Cookie` header value.
    ///
    /// A `Max-Age` too large to represent is treated as no expiry.
    pub fn apply_set_cookie(&self, header: &str) {
        let Some(parsed) = parse_set_cookie(header) else {
            warn!("ignoring malformed set-cookie header");
            return;
        };

        let removed = parsed.value.is_empty() || parsed.max_age.is_some_and(|age| age <= 0);
        let mut cookies = self.cookies.write();
        if removed {
            if cookies.remove(&parsed.name).is_some() {
                debug!(cookie = %parsed.name, "cookie removed");
            }
            return;
        }

        let expires_at = parsed.max_age.and_then(|age| deadline_after(age.unsigned_abs()));
        debug!(cookie = %parsed.name, "cookie stored");
        cookies.insert(
            parsed.name,
            StoredCookie {
                value: Secret::new(parsed.value),
                expires_at,
            },
        );
    }

    /// Record every `Set-Cookie` in a response.
    pub fn store_response_cookies(&self, headers: &HeaderMap) {
        for value in headers.get_all(SET_COOKIE) {
            match value.to_str() {
                Ok(header) => self.apply_set_cookie(header),
                Err(_) => warn!("ignoring non-UTF-8 set-cookie header"),
            }
        }
    }

    /// `Cookie` request header for all live cookies, sorted by name.
    pub fn cookie_header(&self) -> Option<String> {
        let now = SystemTime::now();
        let cookies = self.cookies.read();
        let mut pairs: Vec<(&String, &StoredCookie)> =
            cookies.iter().filter(|(_, c)| !c.is_expired(now)).collect();
        if pairs.is_empty() {
            return None;
        }
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        Some(
            pairs
                .iter()
                .map(|(name, c)| format!("{name}={}", c.value.expose()))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Expire cookie `name` with root path, `Secure` and `SameSite=Strict`.
    pub fn invalidate(&self, name: &str) {
        self.apply_set_cookie(&invalidation_cookie(name));
    }

    pub fn clear(&self) {
        self.cookies.write().clear();
    }

    /// Live cookie `name` in persistable form.
    pub fn record(&self, name: &str) -> Option<CookieRecord> {
        let now = SystemTime::now();
        self.cookies
            .read()
            .get(name)
            .filter(|c| !c.is_expired(now))
            .map(|c| CookieRecord {
                value: c.value.expose().clone(),
                expires_at: c
                    .expires_at
                    .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs()),
            })
    }

    /// Put back a cookie saved with [`CookieJar::record`]. Already-expired
    /// records are dropped. Returns whether the cookie was restored.
    pub fn restore(&self, name: &str, record: CookieRecord) -> bool {
        let expires_at = record
            .expires_at
            .and_then(|secs| UNIX_EPOCH.checked_add(Duration::from_secs(secs)));
        let cookie = StoredCookie {
            value: Secret::new(record.value),
            expires_at,
        };
        if cookie.value.expose().is_empty() || cookie.is_expired(SystemTime::now()) {
            debug!(cookie = %name, "saved cookie already expired, not restored");
            return false;
        }
        self.cookies.write().insert(name.to_owned(), cookie);
        true
    }
}
