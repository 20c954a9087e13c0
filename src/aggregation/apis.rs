//! # Discovery Aggregation Handlers
//!
//! [`ApisHandler`] sits in front of the path multiplexer and answers
//! `/apis` with the merged group list. [`GroupDiscoveryHandler`] is
//! registered per group at `/apis/<group>`.
//!
//! Both read the registry on every request, so they always reflect the
//! current descriptors, including backends whose proxy is disabled but whose
//! descriptor still exists.

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::aggregation::documents::{aggregated_group_list, discovery_group};
use crate::core::error::{AggregatorError, AggregatorResult};
use crate::core::types::ApiGroup;
use crate::discovery::registry::BackendRegistry;
use crate::routing::mux::RouteHandler;

/// Serialize `value` as a JSON response; encoding failures become a 500
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = (status, body).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            warn!(error = %e, "Failed to encode response");
            AggregatorError::internal(format!("failed to encode response: {}", e)).into_response()
        }
    }
}

/// Answers `/apis` and `/apis/`; everything else goes to `delegate`
pub struct ApisHandler {
    registry: Arc<dyn BackendRegistry>,
    delegate: Arc<dyn RouteHandler>,
    own_group: ApiGroup,
    own_prefix: String,
}

impl ApisHandler {
    pub fn new(registry: Arc<dyn BackendRegistry>, delegate: Arc<dyn RouteHandler>, own_group: ApiGroup) -> Self {
        let own_prefix = format!("/apis/{}/", own_group.name);
        Self {
            registry,
            delegate,
            own_group,
            own_prefix,
        }
    }

    fn is_own_group_path(&self, path: &str) -> bool {
        path.starts_with(&self.own_prefix) || path == self.own_prefix.trim_end_matches('/')
    }

    async fn group_list(&self) -> AggregatorResult<Response> {
        let descriptors = self.registry.list().await?;
        let list = aggregated_group_list(self.own_group.clone(), descriptors);
        Ok(json_response(StatusCode::OK, &list))
    }
}

#[async_trait]
impl RouteHandler for ApisHandler {
    async fn serve(&self, request: Request) -> Response {
        let path = request.uri().path();
        if self.is_own_group_path(path) || (path != "/apis" && path != "/apis/") {
            return self.delegate.serve(request).await;
        }

        match self.group_list().await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Failed to build API group list");
                AggregatorError::internal(e.to_string()).into_response()
            }
        }
    }
}

/// Answers `/apis/<group>` with the versions currently registered for the group.
///
/// It is mounted on the group subtree, so it also sees paths of versions
/// without a proxy; those get a 404.
pub struct GroupDiscoveryHandler {
    group: String,
    path: String,
    registry: Arc<dyn BackendRegistry>,
}

impl GroupDiscoveryHandler {
    pub fn new(group: impl Into<String>, registry: Arc<dyn BackendRegistry>) -> Self {
        let group = group.into();
        Self {
            path: format!("/apis/{}", group),
            group,
            registry,
        }
    }

    async fn group(&self) -> AggregatorResult<ApiGroup> {
        let members: Vec<_> = self
            .registry
            .list()
            .await?
            .into_iter()
            .filter(|descriptor| descriptor.group == self.group)
            .collect();

        discovery_group(&members).ok_or_else(|| AggregatorError::not_found("group", &self.group))
    }
}

#[async_trait]
impl RouteHandler for GroupDiscoveryHandler {
    async fn serve(&self, request: Request) -> Response {
        let path = request.uri().path();
        let trimmed = path.strip_suffix('/').unwrap_or(path);
        if trimmed != self.path {
            return AggregatorError::not_found("path", path).into_response();
        }
        if request.method() != Method::GET && request.method() != Method::HEAD {
            return AggregatorError::MethodNotAllowed {
                method: request.method().to_string(),
                path: path.to_string(),
            }
            .into_response();
        }

        match self.group().await {
            Ok(group) => json_response(StatusCode::OK, &group),
            Err(e) if e.is_not_found() => {
                debug!(group = %self.group, "No backends registered for group");
                e.into_response()
            }
            Err(e) => {
                warn!(group = %self.group, error = %e, "Failed to build API group");
                AggregatorError::internal(e.to_string()).into_response()
            }
        }
    }
}
