//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the media gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind host and port).
    pub listener: ListenerConfig,

    /// API key authentication.
    pub auth: AuthConfig,

    /// Cross-origin policy.
    pub cors: CorsConfig,

    /// Per-client rate limiting.
    pub rate_limit: RateLimitConfig,

    /// External worker (extraction tool) settings.
    pub workers: WorkerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Interface to bind (e.g., "0.0.0.0").
    pub host: String,

    /// TCP port.
    pub port: u16,
}

impl ListenerConfig {
    /// Combined `host:port` string suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// API key authentication configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret expected in the `X-API-KEY` header.
    pub api_key: String,

    /// Paths starting with this prefix require the key.
    pub protected_prefix: String,

    /// Exact path under the protected prefix that stays public.
    pub exempt_path: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            protected_prefix: "/api".to_string(),
            exempt_path: "/api/hello".to_string(),
        }
    }
}

/// Operating mode of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Development,
    #[default]
    Production,
}

impl RunMode {
    /// Parse the value of `APP_ENV`/`GO_ENV`. Anything but "development" is production.
    pub fn from_env_value(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("development") {
            RunMode::Development
        } else {
            RunMode::Production
        }
    }
}

/// Cross-origin configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Permissive CORS headers are only emitted in development mode.
    pub mode: RunMode,

    /// Origin allowed in development (the web client's dev server).
    pub client_url: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Production,
            client_url: "http://localhost:5173".to_string(),
        }
    }
}

/// Token bucket policy for one HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct MethodPolicyConfig {
    /// Sustained requests per second.
    pub rate_per_sec: f64,

    /// Bucket ceiling.
    pub burst: u32,

    /// Ban applied when the bucket is empty, in seconds.
    pub ban_secs: u64,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Policies keyed by upper-case method name. Methods without an entry are rejected.
    pub policies: BTreeMap<String, MethodPolicyConfig>,

    /// How often idle clients are swept, in seconds.
    pub sweep_interval_secs: u64,

    /// Clients not seen for this long are forgotten, in seconds.
    pub retention_secs: u64,
}

impl RateLimitConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut policies = BTreeMap::new();
        policies.insert(
            "GET".to_string(),
            MethodPolicyConfig {
                rate_per_sec: 10.0,
                burst: 20,
                ban_secs: 10,
            },
        );
        policies.insert(
            "POST".to_string(),
            MethodPolicyConfig {
                rate_per_sec: 3.0,
                burst: 6,
                ban_secs: 30,
            },
        );
        Self {
            policies,
            sweep_interval_secs: 60,
            retention_secs: 300,
        }
    }
}

/// External worker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Path to the extraction tool executable.
    pub binary_path: PathBuf,

    /// Maximum simultaneous worker processes. Defaults to available parallelism.
    pub max_concurrent: Option<usize>,

    /// Ceiling for info and download requests, in seconds.
    pub request_timeout_secs: u64,

    /// Size of each pooled copy buffer in bytes.
    pub buffer_size: usize,

    /// Bytes written between transport flushes.
    pub flush_threshold: usize,

    /// Maximum accepted JSON body for download requests.
    pub max_body_size: usize,
}

impl WorkerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Effective gate capacity.
    pub fn capacity(&self) -> usize {
        self.max_concurrent.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("yt-dlp"),
            max_concurrent: None,
            request_timeout_secs: 300,
            buffer_size: 256 * 1024,
            flush_threshold: 5 * 1024 * 1024,
            max_body_size: 64 * 1024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_get_and_post() {
        let config = GatewayConfig::default();
        let get = config.rate_limit.policies.get("GET").unwrap();
        assert_eq!(get.burst, 20);
        assert_eq!(get.ban_secs, 10);
        let post = config.rate_limit.policies.get("POST").unwrap();
        assert_eq!(post.burst, 6);
        assert!(!config.rate_limit.policies.contains_key("PUT"));
        assert_eq!(config.listener.bind_address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [listener]
            port = 9000

            [cors]
            mode = "development"

            [rate_limit.policies.GET]
            rate_per_sec = 5.0
            burst = 5
            ban_secs = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.listener.port, 9000);
        assert_eq!(config.listener.host, "0.0.0.0");
        assert_eq!(config.cors.mode, RunMode::Development);
        assert_eq!(config.rate_limit.policies["GET"].burst, 5);
        // An explicit policy table replaces the default map entirely.
        assert!(!config.rate_limit.policies.contains_key("POST"));
        assert_eq!(config.workers.flush_threshold, 5 * 1024 * 1024);
    }

    #[test]
    fn test_run_mode_from_env() {
        assert_eq!(RunMode::from_env_value("development"), RunMode::Development);
        assert_eq!(RunMode::from_env_value(" Development "), RunMode::Development);
        assert_eq!(RunMode::from_env_value("production"), RunMode::Production);
        assert_eq!(RunMode::from_env_value(""), RunMode::Production);
    }

    #[test]
    fn test_explicit_capacity_wins() {
        let workers = WorkerConfig {
            max_concurrent: Some(3),
            ..WorkerConfig::default()
        };
        assert_eq!(workers.capacity(), 3);
        assert!(WorkerConfig::default().capacity() >= 1);
    }
}
