//! Session credential handling for the authenticated-request pipeline
//!
//! Holds everything the pipeline needs to know about "who is signed in":
//! the access credential store, the cookie jar carrying the refresh
//! credential, the claims codec, and the renewal client that trades the
//! refresh credential for a new access credential.
//!
//! Credential flow:
//! 1. Login response carries `access_token` header + `refresh_token` cookie
//! 2. `CredentialStore::set()` keeps the access credential (optionally on disk)
//! 3. `CookieJar::store_response_cookies()` keeps the refresh credential
//! 4. On expiry, `RenewalClient::renew()` POSTs `/reissue` with bounded retry
//! 5. Exhaustion clears the store and invalidates the refresh cookie

pub mod codec;
pub mod constants;
pub mod cookies;
pub mod error;
pub mod renewal;
pub mod store;

pub use codec::{Claims, decode};
pub use constants::*;
pub use cookies::{CookieJar, CookieRecord};
pub use error::{DecodeError, Error, RenewalFailure, Result};
pub use renewal::{RenewalAttempt, RenewalClient, RenewalSettings};
pub use store::{AccessCredential, CredentialStore, SessionSnapshot};
