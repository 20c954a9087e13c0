//! # Path Multiplexer
//!
//! Routes requests by path prefix to dynamically registered handlers.
//!
//! Matching rules:
//! - a pattern without a trailing slash matches that exact path only;
//! - a pattern ending in `/` matches every path below it (a subtree);
//! - an exact match wins, otherwise the longest subtree pattern wins;
//! - a pattern can be registered once, and is never removed.
//!
//! Proxy handlers are registered under both `/apis/<group>/<version>` and
//! `/apis/<group>/<version>/`, which covers the version root and everything
//! underneath it.

use async_trait::async_trait;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::error::{AggregatorError, AggregatorResult};

/// A handler the multiplexer can dispatch to
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn serve(&self, request: Request) -> Response;
}

/// Answers every request with a 404
pub struct NotFoundHandler;

#[async_trait]
impl RouteHandler for NotFoundHandler {
    async fn serve(&self, request: Request) -> Response {
        AggregatorError::not_found("path", request.uri().path()).into_response()
    }
}

pub struct PathMux {
    routes: RwLock<HashMap<String, Arc<dyn RouteHandler>>>,
    fallback: Arc<dyn RouteHandler>,
}

impl Default for PathMux {
    fn default() -> Self {
        Self::new()
    }
}

impl PathMux {
    pub fn new() -> Self {
        Self::with_fallback(Arc::new(NotFoundHandler))
    }

    /// Multiplexer that hands unmatched requests to `fallback`
    pub fn with_fallback(fallback: Arc<dyn RouteHandler>) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            fallback,
        }
    }

    /// Register `handler` under every pattern in `patterns`, all or nothing.
    ///
    /// Fails with `RouteConflict` when any pattern is already taken, in which
    /// case nothing is registered.
    pub fn register<S: AsRef<str>>(
        &self,
        patterns: &[S],
        handler: Arc<dyn RouteHandler>,
    ) -> AggregatorResult<()> {
        let mut routes = self.routes.write();

        for pattern in patterns {
            let pattern = pattern.as_ref();
            if !pattern.starts_with('/') {
                return Err(AggregatorError::internal(format!(
                    "route pattern '{}' must start with '/'",
                    pattern
                )));
            }
            if routes.contains_key(pattern) {
                return Err(AggregatorError::RouteConflict {
                    pattern: pattern.to_string(),
                });
            }
        }

        for pattern in patterns {
            routes.insert(pattern.as_ref().to_string(), Arc::clone(&handler));
        }
        Ok(())
    }

    /// Find the handler for `path`
    pub fn lookup(&self, path: &str) -> Option<Arc<dyn RouteHandler>> {
        let routes = self.routes.read();

        if let Some(handler) = routes.get(path) {
            return Some(Arc::clone(handler));
        }

        // Walk the subtree candidates from the longest down to "/".
        path.rmatch_indices('/')
            .map(|(index, _)| &path[..=index])
            .find_map(|prefix| routes.get(prefix).map(Arc::clone))
    }

    pub fn is_registered(&self, pattern: &str) -> bool {
        self.routes.read().contains_key(pattern)
    }

    /// Registered patterns, sorted
    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self.routes.read().keys().cloned().collect();
        patterns.sort();
        patterns
    }
}

#[async_trait]
impl RouteHandler for PathMux {
    async fn serve(&self, request: Request) -> Response {
        let handler = self
            .lookup(request.uri().path())
            .unwrap_or_else(|| Arc::clone(&self.fallback));
        handler.serve(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::StatusCode;

    struct Named(&'static str);

    #[async_trait]
    impl RouteHandler for Named {
        async fn serve(&self, _request: Request) -> Response {
            self.0.into_response()
        }
    }

    async fn body_of(mux: &PathMux, path: &str) -> (StatusCode, String) {
        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        let response = mux.serve(request).await;
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_exact_and_subtree_matching() {
        let mux = PathMux::new();
        let proxy: Arc<dyn RouteHandler> = Arc::new(Named("proxy"));
        let group: Arc<dyn RouteHandler> = Arc::new(Named("group"));
        mux.register(&["/apis/foo.io/v1", "/apis/foo.io/v1/"], proxy).unwrap();
        mux.register(&["/apis/foo.io", "/apis/foo.io/"], group).unwrap();

        assert_eq!(body_of(&mux, "/apis/foo.io/v1").await.1, "proxy");
        assert_eq!(body_of(&mux, "/apis/foo.io/v1/widgets/a").await.1, "proxy");
        assert_eq!(body_of(&mux, "/apis/foo.io").await.1, "group");
        // subtree match only; the group handler itself rejects unknown versions
        assert_eq!(body_of(&mux, "/apis/foo.io/v2/x").await.1, "group");
        assert_eq!(body_of(&mux, "/apis/bar.io").await.0, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_exact_pattern_does_not_match_subpaths() {
        let mux = PathMux::new();
        mux.register(&["/api"], Arc::new(Named("legacy"))).unwrap();
        assert!(mux.lookup("/api").is_some());
        assert!(mux.lookup("/api/v1/pods").is_none());
        assert!(mux.lookup("/apis").is_none());
    }

    #[test]
    fn test_register_is_all_or_nothing() {
        let mux = PathMux::new();
        mux.register(&["/apis/foo.io/"], Arc::new(Named("a"))).unwrap();

        let err = mux
            .register(&["/apis/foo.io", "/apis/foo.io/"], Arc::new(Named("b")))
            .unwrap_err();
        assert!(matches!(err, AggregatorError::RouteConflict { .. }));
        assert!(!mux.is_registered("/apis/foo.io"));
        assert_eq!(mux.patterns(), vec!["/apis/foo.io/"]);
    }
}
