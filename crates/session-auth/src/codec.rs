//! Claims decoding for access credentials
//!
//! Access credentials are three dot-separated segments; the middle one is a
//! base64url JSON object. Decoding only reads the payload for display and
//! identity caching. It does NOT verify the signature.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

use crate::error::DecodeError;

/// Claims the backend puts in its access credentials. Unknown keys land in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    /// Expiry, unix seconds.
    #[serde(default)]
    pub exp: Option<u64>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Claims {
    /// Identity to cache for the session: email, then subject, then username.
    pub fn identity(&self) -> Option<&str> {
        self.email
            .as_deref()
            .or(self.sub.as_deref())
            .or(self.username.as_deref())
            .filter(|s| !s.is_empty())
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.exp
    }

    /// Whether `exp` lies at or before `now` (unix seconds). No `exp` means not expired.
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.exp.is_some_and(|exp| exp <= now)
    }
}

/// Decode the claims of `raw`.
///
/// Pure function: a missing credential, a wrong segment count, bad base64 or
/// a non-object payload all yield a `DecodeError`, never a panic.
pub fn decode(raw: Option<&str>) -> Result<Claims, DecodeError> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty()).ok_or(DecodeError::Missing)?;

    let segments: Vec<&str> = raw.split('.').collect();
    if segments.len() != 3 {
        return Err(DecodeError::Malformed {
            segments: segments.len(),
        });
    }

    // Accept both padded and unpadded payloads, and the standard alphabet too.
    let payload: String = segments[1]
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.as_bytes())
        .map_err(|e| DecodeError::Base64(e.to_string()))?;

    serde_json::from_slice(&bytes).map_err(|e| DecodeError::Payload(e.to_string()))
}
