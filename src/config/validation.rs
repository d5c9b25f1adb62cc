//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, capacity > 0)
//! - Check that the log filter and metrics address parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TracerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::schema::TracerConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("instrumentation.snapshot_timeout_ms must be greater than zero")]
    ZeroSnapshotTimeout,

    #[error("instrumentation.trace_buffer_capacity must be greater than zero")]
    ZeroBufferCapacity,

    #[error("instrumentation.tracing_runtime_url must not be empty")]
    EmptyRuntimeUrl,

    #[error("observability.log_level '{level}' is not a valid filter: {reason}")]
    InvalidLogLevel { level: String, reason: String },

    #[error("observability.metrics_address '{0}' is not a socket address")]
    InvalidMetricsAddress(String),
}

pub fn validate_config(config: &TracerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let instrumentation = &config.instrumentation;
    let observability = &config.observability;

    if instrumentation.snapshot_timeout_ms == 0 {
        errors.push(ValidationError::ZeroSnapshotTimeout);
    }
    if instrumentation.trace_buffer_capacity == 0 {
        errors.push(ValidationError::ZeroBufferCapacity);
    }
    if instrumentation.tracing_runtime_url.trim().is_empty() {
        errors.push(ValidationError::EmptyRuntimeUrl);
    }

    if let Err(err) = EnvFilter::try_new(&observability.log_level) {
        errors.push(ValidationError::InvalidLogLevel {
            level: observability.log_level.clone(),
            reason: err.to_string(),
        });
    }

    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(validate_config(&TracerConfig::default()), Ok(()));
    }

    #[test]
    fn metrics_address_checked_only_when_enabled() {
        let mut config = TracerConfig::default();
        config.observability.metrics_address = "not-an-address".to_string();
        assert_eq!(validate_config(&config), Ok(()));

        config.observability.metrics_enabled = true;
        assert_eq!(
            validate_config(&config),
            Err(vec![ValidationError::InvalidMetricsAddress(
                "not-an-address".to_string()
            )])
        );
    }

    #[test]
    fn reports_every_problem() {
        let mut config = TracerConfig::default();
        config.instrumentation.snapshot_timeout_ms = 0;
        config.instrumentation.tracing_runtime_url = " ".to_string();
        config.observability.log_level = "worker_tracer=verbose".to_string();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.contains(&ValidationError::ZeroSnapshotTimeout));
        assert!(errors.contains(&ValidationError::EmptyRuntimeUrl));
    }
}
