//! Shared building blocks for the session workspace: redacted secrets,
//! configuration errors, and config-path/env resolution.

mod env;
mod error;
mod secret;

pub use env::{env_override, resolve_config_path};
pub use error::{Error, Result};
pub use secret::Secret;
