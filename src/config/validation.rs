//! Configuration validation.
//!
//! Semantic checks only; serde handles syntax. Every problem is reported,
//! not just the first.

use thiserror::Error;

use crate::config::schema::GatewayConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("auth.api_key must not be empty")]
    EmptyApiKey,

    #[error("auth.protected_prefix must start with '/'")]
    BadProtectedPrefix,

    #[error("rate_limit.policies.{method}: {reason}")]
    BadPolicy { method: String, reason: &'static str },

    #[error("rate_limit.policies must contain at least one method")]
    NoPolicies,

    #[error("rate_limit.{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("workers.{0} must be greater than zero")]
    ZeroWorkerSetting(&'static str),

    #[error("workers.binary_path must not be empty")]
    EmptyBinaryPath,
}

/// Validate a loaded configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.auth.api_key.is_empty() {
        errors.push(ValidationError::EmptyApiKey);
    }
    if !config.auth.protected_prefix.starts_with('/') {
        errors.push(ValidationError::BadProtectedPrefix);
    }

    let rate_limit = &config.rate_limit;
    if rate_limit.policies.is_empty() {
        errors.push(ValidationError::NoPolicies);
    }
    for (method, policy) in &rate_limit.policies {
        if axum::http::Method::from_bytes(method.as_bytes()).is_err()
            || method.to_ascii_uppercase() != *method
        {
            errors.push(ValidationError::BadPolicy {
                method: method.clone(),
                reason: "not an upper-case HTTP method",
            });
        }
        if !(policy.rate_per_sec.is_finite() && policy.rate_per_sec > 0.0) {
            errors.push(ValidationError::BadPolicy {
                method: method.clone(),
                reason: "rate_per_sec must be a positive number",
            });
        }
        if policy.burst == 0 {
            errors.push(ValidationError::BadPolicy {
                method: method.clone(),
                reason: "burst must be greater than zero",
            });
        }
    }
    if rate_limit.sweep_interval_secs == 0 {
        errors.push(ValidationError::ZeroInterval("sweep_interval_secs"));
    }
    if rate_limit.retention_secs == 0 {
        errors.push(ValidationError::ZeroInterval("retention_secs"));
    }

    let workers = &config.workers;
    if workers.binary_path.as_os_str().is_empty() {
        errors.push(ValidationError::EmptyBinaryPath);
    }
    if workers.max_concurrent == Some(0) {
        errors.push(ValidationError::ZeroWorkerSetting("max_concurrent"));
    }
    if workers.request_timeout_secs == 0 {
        errors.push(ValidationError::ZeroWorkerSetting("request_timeout_secs"));
    }
    if workers.buffer_size == 0 {
        errors.push(ValidationError::ZeroWorkerSetting("buffer_size"));
    }
    if workers.flush_threshold == 0 {
        errors.push(ValidationError::ZeroWorkerSetting("flush_threshold"));
    }
    if workers.max_body_size == 0 {
        errors.push(ValidationError::ZeroWorkerSetting("max_body_size"));
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

    fn valid() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.auth.api_key = "secret".into();
        config
    }

    #[test]
    fn test_default_with_key_is_valid() {
        assert!(validate_config(&valid()).is_ok());
    }

    #[test]
    fn test_reports_all_errors() {
        let mut config = valid();
        config.auth.api_key.clear();
        config.workers.buffer_size = 0;
        config.workers.max_concurrent = Some(0);
        config.rate_limit.policies.get_mut("GET").unwrap().burst = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.contains(&ValidationError::EmptyApiKey));
        assert!(errors.contains(&ValidationError::ZeroWorkerSetting("buffer_size")));
    }

    #[test]
    fn test_rejects_lower_case_method() {
        let mut config = valid();
        let policy = config.rate_limit.policies["GET"];
        config.rate_limit.policies.insert("get".into(), policy);

        let errors = validate_config(&config).unwrap_err();
        assert!(matches!(
            &errors[0],
            ValidationError::BadPolicy { method, .. } if method == "get"
        ));
    }
}
