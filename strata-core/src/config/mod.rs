//! Configuration management for Strata
//!
//! - Schema-driven configuration with validation
//! - Layered loading: defaults, TOML file, `STRATA_*` environment variables
//!
//! # Examples
//!
//! ```rust,no_run
//! use strata_core::config::ConfigLoader;
//!
//! let config = ConfigLoader::new().load().expect("Failed to load configuration");
//! println!("Server will bind to {}", config.server.bind_address());
//! ```
//!
//! Environment variables use `__` between nesting levels:
//! `STRATA_SERVER__PORT=4333`, `STRATA_JETSTREAM__ENABLED=false`.

pub mod loader;
pub mod schema;
pub mod validator;

pub use loader::ConfigLoader;
pub use schema::*;
pub use validator::{ConfigValidator, ValidationContext};

use crate::Result;

/// Load configuration from the default search paths and environment.
///
/// # Errors
/// Returns [`crate::Error::Configuration`] if any source is unreadable or the
/// merged configuration is invalid.
pub fn load_default() -> Result<StrataConfig> {
    ConfigLoader::new().load()
}
