//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate addresses, URLs and value ranges
//! - Detect duplicate mirror names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: DaemonConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;
use url::Url;

use crate::config::schema::DaemonConfig;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &DaemonConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_addr(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }

    if config.control.enabled {
        check_addr(&mut errors, "control.bind_address", &config.control.bind_address);
        if config.control.api_key.trim().is_empty() {
            errors.push(ValidationError::new("control.api_key", "must not be empty"));
        }
    }

    if config.monitor.interval_secs == 0 {
        errors.push(ValidationError::new("monitor.interval_secs", "must be greater than 0"));
    }
    if config.monitor.timeout_secs == 0 {
        errors.push(ValidationError::new("monitor.timeout_secs", "must be greater than 0"));
    }
    if config.monitor.healthy_threshold == 0 || config.monitor.unhealthy_threshold == 0 {
        errors.push(ValidationError::new("monitor", "thresholds must be greater than 0"));
    }

    let mut names = HashSet::new();
    for (i, mirror) in config.monitor.mirrors.iter().enumerate() {
        if !names.insert(mirror.name.as_str()) {
            errors.push(ValidationError::new(
                format!("monitor.mirrors[{}].name", i),
                format!("duplicate mirror name '{}'", mirror.name),
            ));
        }
        match Url::parse(&mirror.base_url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            Ok(url) => errors.push(ValidationError::new(
                format!("monitor.mirrors[{}].base_url", i),
                format!("unsupported scheme '{}'", url.scheme()),
            )),
            Err(e) => errors.push(ValidationError::new(
                format!("monitor.mirrors[{}].base_url", i),
                e.to_string(),
            )),
        }
    }

    if config.process.pid_file.trim().is_empty() {
        errors.push(ValidationError::new("process.pid_file", "must not be empty"));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be greater than 0"));
    }
    if config.observability.metrics_enabled {
        check_addr(&mut errors, "observability.metrics_address", &config.observability.metrics_address);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_addr(errors: &mut Vec<ValidationError>, field: &str, value: &str) {
    if let Err(e) = value.parse::<SocketAddr>() {
        errors.push(ValidationError::new(field, format!("invalid socket address '{}': {}", value, e)));
    }
}
