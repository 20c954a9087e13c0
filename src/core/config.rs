//! # Configuration Module
//!
//! Configuration for the aggregator process, loaded from YAML or JSON.
//!
//! ## Key Features
//! - YAML/JSON parsing with serde, every section optional with defaults
//! - Environment variable overrides (`AGGREGATOR_*`)
//! - Validation that reports every problem at once
//! - Human-readable durations (`5m`, `250ms`) through `humantime-serde`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::error::{AggregatorError, AggregatorResult};
use crate::core::types::UserInfo;

/// Top-level aggregator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub server: ServerConfig,
    pub controller: ControllerConfig,
    pub proxy: ProxyConfig,
    pub auth: AuthConfig,
    pub registry: RegistryConfig,
    pub observability: ObservabilityConfig,
}

impl AggregatorConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> AggregatorResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AggregatorError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: AggregatorConfig = serde_yaml::from_str(&content)
            .map_err(|e| AggregatorError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from JSON
    pub async fn load_from_json<P: AsRef<Path>>(path: P) -> AggregatorResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AggregatorError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: AggregatorConfig = serde_json::from_str(&content)
            .map_err(|e| AggregatorError::config(format!("Failed to parse JSON config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load by extension: `.json` as JSON, anything else as YAML
    pub async fn load<P: AsRef<Path>>(path: P) -> AggregatorResult<Self> {
        if path.as_ref().extension().and_then(|s| s.to_str()) == Some("json") {
            Self::load_from_json(path).await
        } else {
            Self::load_from_file(path).await
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) -> AggregatorResult<()> {
        use std::env;

        if let Ok(addr) = env::var("AGGREGATOR_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Ok(workers) = env::var("AGGREGATOR_CONTROLLER_WORKERS") {
            self.controller.workers = workers.parse().map_err(|e| {
                AggregatorError::config(format!("Invalid AGGREGATOR_CONTROLLER_WORKERS: {}", e))
            })?;
        }

        if let Ok(interval) = env::var("AGGREGATOR_RESYNC_INTERVAL") {
            self.controller.resync_interval = humantime::parse_duration(&interval).map_err(|e| {
                AggregatorError::config(format!("Invalid AGGREGATOR_RESYNC_INTERVAL: {}", e))
            })?;
        }

        if let Ok(path) = env::var("AGGREGATOR_MANIFEST_PATH") {
            self.registry.manifest_path = Some(PathBuf::from(path));
        }

        if let Ok(level) = env::var("AGGREGATOR_LOG_LEVEL") {
            self.observability.log_level = level;
        }

        if let Ok(format) = env::var("AGGREGATOR_LOG_FORMAT") {
            self.observability.log_format = match format.as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => {
                    return Err(AggregatorError::config(format!(
                        "Invalid AGGREGATOR_LOG_FORMAT: {}",
                        other
                    )))
                }
            };
        }

        if let Ok(addr) = env::var("AGGREGATOR_METRICS_BIND_ADDRESS") {
            self.observability.metrics_bind_address = Some(addr);
        }

        Ok(())
    }

    /// Validate the configuration, collecting every problem
    pub fn validate(&self) -> AggregatorResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "server.bind_address '{}' is not a socket address",
                self.server.bind_address
            ));
        }

        if self.server.max_request_body_bytes == 0 {
            errors.push("server.max_request_body_bytes must be greater than 0".to_string());
        }

        if self.controller.workers == 0 {
            errors.push("controller.workers must be greater than 0".to_string());
        }

        if self.controller.base_backoff.is_zero() {
            errors.push("controller.base_backoff must be greater than 0".to_string());
        }

        if self.controller.max_backoff < self.controller.base_backoff {
            errors.push("controller.max_backoff must not be less than base_backoff".to_string());
        }

        if self.proxy.backend_scheme != "https" && self.proxy.backend_scheme != "http" {
            errors.push(format!(
                "proxy.backend_scheme must be 'https' or 'http', got '{}'",
                self.proxy.backend_scheme
            ));
        }

        if let IdentityConfig::RequestHeader {
            username_header,
            group_header,
            extra_header_prefix,
        } = &self.proxy.identity
        {
            for (field, value) in [
                ("username_header", username_header),
                ("group_header", group_header),
                ("extra_header_prefix", extra_header_prefix),
            ] {
                if axum::http::HeaderName::from_bytes(value.as_bytes()).is_err() {
                    errors.push(format!("proxy.identity.{} '{}' is not a header name", field, value));
                }
            }
        }

        if let Some(cert) = &self.proxy.client_certificate {
            if cert.cert_file.as_os_str().is_empty() || cert.key_file.as_os_str().is_empty() {
                errors.push("proxy.client_certificate needs both cert_file and key_file".to_string());
            }
        }

        for (index, token) in self.auth.tokens.iter().enumerate() {
            if token.token.is_empty() {
                errors.push(format!("auth.tokens[{}].token cannot be empty", index));
            }
            if token.username.is_empty() {
                errors.push(format!("auth.tokens[{}].username cannot be empty", index));
            }
        }

        if let Some(addr) = &self.observability.metrics_bind_address {
            if addr.parse::<std::net::SocketAddr>().is_err() {
                errors.push(format!(
                    "observability.metrics_bind_address '{}' is not a socket address",
                    addr
                ));
            }
        }

        if !errors.is_empty() {
            return Err(AggregatorError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,

    /// Upper bound for bodies the aggregator reads itself (registration API)
    pub max_request_body_bytes: usize,

    /// How long in-flight requests get to finish after shutdown starts
    #[serde(with = "humantime_serde")]
    pub shutdown_grace_period: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8443".to_string(),
            max_request_body_bytes: 1024 * 1024,
            shutdown_grace_period: Duration::from_secs(10),
        }
    }
}

/// Registration controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Number of concurrent reconciliation workers
    pub workers: usize,

    /// Full relist period
    #[serde(with = "humantime_serde")]
    pub resync_interval: Duration,

    /// First retry delay for a failing backend
    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,

    /// Retry delay cap
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            resync_interval: Duration::from_secs(5 * 60),
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_secs(1000),
        }
    }
}

/// Reverse proxy settings shared by every backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Scheme used to reach backends; `http` is only meant for local testing
    pub backend_scheme: String,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub pool_idle_timeout: Duration,

    pub identity: IdentityConfig,

    /// Client certificate the aggregator presents to backends
    pub client_certificate: Option<ClientCertificateConfig>,

    /// File holding a bearer token the aggregator sends to backends
    pub bearer_token_file: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            backend_scheme: "https".to_string(),
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            identity: IdentityConfig::default(),
            client_certificate: None,
            bearer_token_file: None,
        }
    }
}

/// How the caller's identity is handed to backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IdentityConfig {
    /// Front-proxy style headers, trusted by the backend because of the client certificate
    RequestHeader {
        username_header: String,
        group_header: String,
        extra_header_prefix: String,
    },
    /// `Impersonate-*` headers
    Impersonation,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self::RequestHeader {
            username_header: "X-Remote-User".to_string(),
            group_header: "X-Remote-Group".to_string(),
            extra_header_prefix: "X-Remote-Extra-".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCertificateConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Authentication of incoming requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Treat requests without credentials as `system:anonymous`
    pub allow_anonymous: bool,

    /// Paths that skip authentication entirely
    pub excluded_paths: Vec<String>,

    /// Static bearer tokens
    pub tokens: Vec<TokenConfig>,

    /// YAML file with additional `tokens` entries
    pub tokens_file: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allow_anonymous: false,
            excluded_paths: vec!["/healthz".to_string()],
            tokens: Vec::new(),
            tokens_file: None,
        }
    }
}

/// A bearer token and the user it authenticates as
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub token: String,
    pub username: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, Vec<String>>,
}

impl TokenConfig {
    pub fn user_info(&self) -> UserInfo {
        UserInfo {
            username: self.username.clone(),
            groups: self.groups.clone(),
            extra: self.extra.clone(),
        }
    }
}

/// Where backend descriptors come from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// YAML manifest of backends loaded at startup
    pub manifest_path: Option<PathBuf>,

    /// Reapply the manifest whenever the file changes
    pub watch_manifest: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            manifest_path: None,
            watch_manifest: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Logging and metrics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub log_level: String,

    pub log_format: LogFormat,

    /// Serve Prometheus metrics on this address when set
    pub metrics_bind_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            metrics_bind_address: None,
        }
    }
}
