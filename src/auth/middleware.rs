//! # Authentication Middleware
//!
//! Resolves the caller of every request from a bearer token and stores the
//! resulting [`UserInfo`] in the request extensions as `Arc<UserInfo>`, where
//! proxy handlers pick it up for identity propagation.

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::config::{AuthConfig, TokenConfig};
use crate::core::error::{AggregatorError, AggregatorResult};
use crate::core::types::UserInfo;

const BEARER_PREFIX: &str = "Bearer ";

#[derive(Debug, Default, Deserialize)]
struct TokensFile {
    #[serde(default)]
    tokens: Vec<TokenConfig>,
}

/// Static bearer-token authenticator
#[derive(Debug, Default)]
pub struct TokenAuthenticator {
    tokens: HashMap<String, Arc<UserInfo>>,
    allow_anonymous: bool,
    excluded_paths: Vec<String>,
}

impl TokenAuthenticator {
    pub fn new(config: &AuthConfig) -> Self {
        let mut authenticator = Self {
            tokens: HashMap::new(),
            allow_anonymous: config.allow_anonymous,
            excluded_paths: config.excluded_paths.clone(),
        };
        authenticator.add_tokens(&config.tokens);
        authenticator
    }

    /// Build from configuration, including the optional tokens file
    pub async fn from_config(config: &AuthConfig) -> AggregatorResult<Self> {
        let mut authenticator = Self::new(config);
        if let Some(path) = &config.tokens_file {
            let file = load_tokens_file(path).await?;
            authenticator.add_tokens(&file.tokens);
        }
        debug!(tokens = authenticator.tokens.len(), "Token authenticator ready");
        Ok(authenticator)
    }

    fn add_tokens(&mut self, tokens: &[TokenConfig]) {
        for token in tokens {
            self.tokens.insert(token.token.clone(), Arc::new(token.user_info()));
        }
    }

    /// Extract the bearer token from the `Authorization` header
    fn extract_token<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix(BEARER_PREFIX))
            .map(str::trim)
    }

    /// Paths ending in `*` match by prefix, everything else exactly
    fn is_excluded_path(&self, path: &str) -> bool {
        self.excluded_paths.iter().any(|excluded| match excluded.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => path == excluded,
        })
    }

    /// Resolve the caller of a request. `Ok(None)` means the path needs no caller.
    pub fn authenticate(&self, path: &str, headers: &HeaderMap) -> AggregatorResult<Option<Arc<UserInfo>>> {
        if self.is_excluded_path(path) {
            return Ok(None);
        }

        match self.extract_token(headers) {
            Some(token) => self
                .tokens
                .get(token)
                .cloned()
                .map(Some)
                .ok_or_else(|| AggregatorError::unauthenticated("invalid bearer token")),
            None if self.allow_anonymous => Ok(Some(Arc::new(UserInfo::anonymous()))),
            None => Err(AggregatorError::unauthenticated("missing bearer token")),
        }
    }
}

async fn load_tokens_file(path: &Path) -> AggregatorResult<TokensFile> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        AggregatorError::config(format!("Failed to read tokens file {}: {}", path.display(), e))
    })?;
    serde_yaml::from_str(&content)
        .map_err(|e| AggregatorError::config(format!("Failed to parse tokens file: {}", e)))
}

/// Axum middleware: authenticate and attach the caller to the request
pub async fn authenticate(
    State(authenticator): State<Arc<TokenAuthenticator>>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticator.authenticate(request.uri().path(), request.headers()) {
        Ok(Some(user)) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Ok(None) => next.run(request).await,
        Err(e) => {
            warn!(path = %request.uri().path(), error = %e, "Rejected unauthenticated request");
            e.into_response()
        }
    }
}
