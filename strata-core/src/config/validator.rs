//! # Configuration Validation
//!
//! Field checks come from the `validator` derives on the schema; this module
//! adds the cross-field rules that cannot be expressed as attributes.

use crate::{
    config::schema::StrataConfig,
    subject::validate_subject,
    Error, Result,
};
use std::net::SocketAddr;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use validator::{Validate, ValidationErrors};

/// Facts about the host that some rules depend on.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext {
    /// Logical CPUs available
    pub cpu_cores: usize,
}

impl ValidationContext {
    /// Detect the current machine.
    #[must_use]
    pub fn detect() -> Self {
        Self { cpu_cores: num_cpus::get() }
    }
}

/// Configuration validator.
#[derive(Debug, Clone, Copy)]
pub struct ConfigValidator {
    context: ValidationContext,
}

impl ConfigValidator {
    /// Create a validator for the current machine.
    #[must_use]
    pub fn new() -> Self {
        Self { context: ValidationContext::detect() }
    }

    /// Create a validator with a custom context.
    #[must_use]
    pub const fn with_context(context: ValidationContext) -> Self {
        Self { context }
    }

    /// Validate a configuration with the detected context.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] describing the first failing rule.
    pub fn validate(config: &StrataConfig) -> Result<()> {
        Self::new().validate_config(config)
    }

    /// Run field and cross-field validation.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] describing the first failing rule.
    pub fn validate_config(&self, config: &StrataConfig) -> Result<()> {
        debug!("Starting configuration validation");

        config.validate().map_err(|e| Error::Configuration {
            message: format_validation_errors(&e).join("; "),
        })?;

        self.validate_server(config)?;
        Self::validate_jetstream(config)?;
        Self::validate_logging(config)?;

        debug!("Configuration validation completed successfully");
        Ok(())
    }

    fn validate_server(&self, config: &StrataConfig) -> Result<()> {
        let bind_addr = config.server.bind_address();
        bind_addr.parse::<SocketAddr>().map_err(|e| Error::Configuration {
            message: format!("Invalid bind address {bind_addr}: {e}"),
        })?;

        if config.server.port != 0 && config.server.port < 1024 {
            warn!("Using privileged port {} may require special permissions", config.server.port);
        }

        if let Some(threads) = config.server.worker_threads {
            if threads == 0 {
                return Err(Error::Configuration {
                    message: "Worker threads must be greater than 0".to_string(),
                });
            }
            if threads > self.context.cpu_cores * 4 {
                warn!(
                    "Worker threads ({threads}) significantly exceed CPU cores ({}), may cause contention",
                    self.context.cpu_cores
                );
            }
        }
        Ok(())
    }

    fn validate_jetstream(config: &StrataConfig) -> Result<()> {
        let js = &config.jetstream;
        let prefixes = [
            ("api_prefix", &js.api_prefix),
            ("ack_prefix", &js.ack_prefix),
            ("kv_prefix", &js.kv_prefix),
        ];

        for (field, prefix) in prefixes {
            validate_subject(prefix).map_err(|_| Error::Configuration {
                message: format!("jetstream.{field} '{prefix}' is not a valid subject"),
            })?;
        }

        for (i, (a_field, a)) in prefixes.iter().enumerate() {
            for (b_field, b) in &prefixes[i + 1..] {
                let a_dot = format!("{a}.");
                let b_dot = format!("{b}.");
                if a == b || a_dot.starts_with(&b_dot) || b_dot.starts_with(&a_dot) {
                    return Err(Error::Configuration {
                        message: format!("jetstream.{a_field} and jetstream.{b_field} overlap"),
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_logging(config: &StrataConfig) -> Result<()> {
        EnvFilter::try_new(&config.logging.level).map_err(|e| Error::Configuration {
            message: format!("Invalid log level '{}': {e}", config.logging.level),
        })?;
        Ok(())
    }

    /// Validation context in use.
    #[must_use]
    pub const fn context(&self) -> &ValidationContext {
        &self.context
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Flatten nested `validator` errors into `path: message` lines.
#[must_use]
pub fn format_validation_errors(errors: &ValidationErrors) -> Vec<String> {
    fn walk(prefix: &str, errors: &ValidationErrors, out: &mut Vec<String>) {
        for (field, kind) in errors.errors() {
            let path = if prefix.is_empty() { (*field).to_string() } else { format!("{prefix}.{field}") };
            match kind {
                validator::ValidationErrorsKind::Field(errs) => {
                    for err in errs {
                        out.push(format!("{path}: {}", err.code));
                    }
                },
                validator::ValidationErrorsKind::Struct(inner) => walk(&path, inner, out),
                validator::ValidationErrorsKind::List(items) => {
                    for (idx, inner) in items {
                        walk(&format!("{path}[{idx}]"), inner, out);
                    }
                },
            }
        }
    }

    let mut out = Vec::new();
    walk("", errors, &mut out);
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validation() {
        assert!(ConfigValidator::validate(&StrataConfig::default()).is_ok());
    }

    #[test]
    fn test_invalid_port_field_reported() {
        let mut config = StrataConfig::default();
        config.server.max_payload = 0;
        let err = ConfigValidator::validate(&config).unwrap_err();
        match err {
            Error::Configuration { message } => assert!(message.contains("server.max_payload")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_overlapping_prefixes_rejected() {
        let mut config = StrataConfig::default();
        config.jetstream.ack_prefix = "$JS.API.ACK".to_string();
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_wildcard_prefix_rejected() {
        let mut config = StrataConfig::default();
        config.jetstream.kv_prefix = "$KV.*".to_string();
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let mut config = StrataConfig::default();
        config.logging.level = "strata=loud".to_string();
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_zero_worker_threads_rejected() {
        let mut config = StrataConfig::default();
        config.server.worker_threads = Some(0);
        let validator = ConfigValidator::with_context(ValidationContext { cpu_cores: 2 });
        assert!(validator.validate_config(&config).is_err());
    }
}
