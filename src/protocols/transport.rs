//! # Backend Transport
//!
//! HTTP clients used to reach one backend. Each proxy handler owns a
//! [`Transport`] built from its backend's TLS settings plus the settings
//! shared by all backends ([`ProxySettings`]).
//!
//! Two clients are kept per transport: a regular one (HTTP/2 when the backend
//! negotiates it) and an HTTP/1.1-only one for protocol upgrades, which
//! HTTP/2 cannot carry.

use axum::http::HeaderValue;
use reqwest::{Certificate, Client, ClientBuilder, Identity};
use std::time::Duration;
use tracing::debug;

use crate::core::config::ProxyConfig;
use crate::core::error::{AggregatorError, AggregatorResult};
use crate::core::types::BackendDescriptor;
use crate::protocols::identity::IdentityPropagation;

/// Proxy settings shared by every backend
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// `https` in production, `http` for plain-text test backends
    pub scheme: String,
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub identity: IdentityPropagation,
    /// PEM certificate chain followed by the private key
    pub client_identity_pem: Option<Vec<u8>>,
    /// `Authorization` value the aggregator sends to backends
    pub bearer_token: Option<HeaderValue>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            scheme: "https".to_string(),
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            identity: IdentityPropagation::default(),
            client_identity_pem: None,
            bearer_token: None,
        }
    }
}

impl ProxySettings {
    /// Build settings from configuration, reading certificate and token files
    pub async fn from_config(config: &ProxyConfig) -> AggregatorResult<Self> {
        let client_identity_pem = match &config.client_certificate {
            Some(cert) => {
                let mut pem = tokio::fs::read(&cert.cert_file).await.map_err(|e| {
                    AggregatorError::config(format!(
                        "Failed to read client certificate {}: {}",
                        cert.cert_file.display(),
                        e
                    ))
                })?;
                let key = tokio::fs::read(&cert.key_file).await.map_err(|e| {
                    AggregatorError::config(format!(
                        "Failed to read client key {}: {}",
                        cert.key_file.display(),
                        e
                    ))
                })?;
                pem.push(b'\n');
                pem.extend_from_slice(&key);
                // Fail at startup rather than on the first proxied request.
                Identity::from_pem(&pem).map_err(|e| {
                    AggregatorError::config(format!("Invalid client certificate or key: {}", e))
                })?;
                Some(pem)
            }
            None => None,
        };

        let bearer_token = match &config.bearer_token_file {
            Some(path) => {
                let token = tokio::fs::read_to_string(path).await.map_err(|e| {
                    AggregatorError::config(format!(
                        "Failed to read bearer token {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let mut value = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                    .map_err(|e| AggregatorError::config(format!("Invalid bearer token: {}", e)))?;
                value.set_sensitive(true);
                Some(value)
            }
            None => None,
        };

        Ok(Self {
            scheme: config.backend_scheme.clone(),
            connect_timeout: config.connect_timeout,
            pool_idle_timeout: config.pool_idle_timeout,
            identity: IdentityPropagation::from_config(&config.identity)?,
            client_identity_pem,
            bearer_token,
        })
    }
}

/// TLS settings of one backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendTls {
    pub insecure_skip_tls_verify: bool,
    pub ca_bundle: Vec<u8>,
}

impl From<&BackendDescriptor> for BackendTls {
    fn from(descriptor: &BackendDescriptor) -> Self {
        Self {
            insecure_skip_tls_verify: descriptor.insecure_skip_tls_verify,
            ca_bundle: descriptor.ca_bundle.clone(),
        }
    }
}

/// Clients for one backend
#[derive(Debug, Clone)]
pub struct Transport {
    pub(crate) http: Client,
    pub(crate) upgrade: Client,
}

impl Transport {
    pub fn build(backend: &str, tls: &BackendTls, settings: &ProxySettings) -> AggregatorResult<Self> {
        let http = Self::builder(backend, tls, settings)?
            .build()
            .map_err(|e| AggregatorError::transport(backend, e.to_string()))?;
        let upgrade = Self::builder(backend, tls, settings)?
            .http1_only()
            .build()
            .map_err(|e| AggregatorError::transport(backend, e.to_string()))?;

        debug!(
            backend = %backend,
            insecure = tls.insecure_skip_tls_verify,
            custom_ca = !tls.ca_bundle.is_empty(),
            "Built backend transport"
        );
        Ok(Self { http, upgrade })
    }

    fn builder(backend: &str, tls: &BackendTls, settings: &ProxySettings) -> AggregatorResult<ClientBuilder> {
        let mut builder = Client::builder()
            .use_rustls_tls()
            .connect_timeout(settings.connect_timeout)
            .pool_idle_timeout(settings.pool_idle_timeout)
            // Responses, redirects included, go back to the caller untouched.
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy();

        if tls.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        } else if !tls.ca_bundle.is_empty() {
            let roots = Certificate::from_pem_bundle(&tls.ca_bundle)
                .map_err(|e| AggregatorError::transport(backend, format!("invalid CA bundle: {}", e)))?;
            if roots.is_empty() {
                return Err(AggregatorError::transport(backend, "CA bundle holds no certificates"));
            }
            builder = builder.tls_built_in_root_certs(false);
            for root in roots {
                builder = builder.add_root_certificate(root);
            }
        }

        if let Some(pem) = &settings.client_identity_pem {
            let identity = Identity::from_pem(pem)
                .map_err(|e| AggregatorError::transport(backend, format!("invalid client identity: {}", e)))?;
            builder = builder.identity(identity);
        }

        Ok(builder)
    }
}
