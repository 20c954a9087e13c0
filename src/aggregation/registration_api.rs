//! # Registration API
//!
//! The aggregator's own API group, through which backends are registered:
//!
//! | Path                                       | Methods            |
//! |--------------------------------------------|--------------------|
//! | `/apis/<own>`                              | GET (group)        |
//! | `/apis/<own>/v1beta1`                      | GET (resources)    |
//! | `/apis/<own>/v1beta1/backends`             | GET, POST          |
//! | `/apis/<own>/v1beta1/backends/<name>`      | GET, PUT, DELETE   |
//!
//! Writes go to a [`BackendStore`]; the registration controller picks them up
//! through the registry watch like any other change.

use async_trait::async_trait;
use axum::body::to_bytes;
use axum::extract::Request;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::aggregation::apis::json_response;
use crate::core::error::{AggregatorError, AggregatorResult};
use crate::core::types::{ApiGroup, ApiResource, ApiResourceList, BackendDescriptor, GroupVersionForDiscovery};
use crate::discovery::registry::BackendStore;
use crate::routing::mux::RouteHandler;

/// Group served by the aggregator itself
pub const REGISTRATION_GROUP: &str = "apiregistration.aggregator.io";
pub const REGISTRATION_VERSION: &str = "v1beta1";
const RESOURCE: &str = "backends";

/// Discovery document of the registration group
pub fn registration_group() -> ApiGroup {
    ApiGroup::new(
        REGISTRATION_GROUP,
        vec![GroupVersionForDiscovery {
            group_version: format!("{}/{}", REGISTRATION_GROUP, REGISTRATION_VERSION),
            version: REGISTRATION_VERSION.to_string(),
        }],
    )
}

fn resource_list() -> ApiResourceList {
    ApiResourceList {
        kind: "APIResourceList".to_string(),
        api_version: "v1".to_string(),
        group_version: format!("{}/{}", REGISTRATION_GROUP, REGISTRATION_VERSION),
        resources: vec![ApiResource {
            name: RESOURCE.to_string(),
            namespaced: false,
            kind: "Backend".to_string(),
            verbs: ["create", "delete", "get", "list", "update"]
                .into_iter()
                .map(String::from)
                .collect(),
        }],
    }
}

/// List wrapper returned by `GET .../backends`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendList {
    pub kind: String,
    pub api_version: String,
    pub items: Vec<BackendDescriptor>,
}

pub struct RegistrationApi {
    store: Arc<dyn BackendStore>,
    max_body_bytes: usize,
}

impl RegistrationApi {
    pub fn new(store: Arc<dyn BackendStore>, max_body_bytes: usize) -> Self {
        Self { store, max_body_bytes }
    }

    /// Patterns to register in the path multiplexer
    pub fn patterns() -> [String; 2] {
        [
            format!("/apis/{}", REGISTRATION_GROUP),
            format!("/apis/{}/", REGISTRATION_GROUP),
        ]
    }

    async fn handle(&self, request: Request) -> AggregatorResult<Response> {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let rest = path
            .strip_prefix(&format!("/apis/{}", REGISTRATION_GROUP))
            .unwrap_or_default();
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

        match (segments.as_slice(), &method) {
            ([], &Method::GET) => Ok(json_response(StatusCode::OK, &registration_group())),
            ([REGISTRATION_VERSION], &Method::GET) => Ok(json_response(StatusCode::OK, &resource_list())),
            ([REGISTRATION_VERSION, RESOURCE], &Method::GET) => {
                let mut items = self.store.list().await?;
                items.sort_by(|a, b| a.name.cmp(&b.name));
                let list = BackendList {
                    kind: "BackendList".to_string(),
                    api_version: format!("{}/{}", REGISTRATION_GROUP, REGISTRATION_VERSION),
                    items,
                };
                Ok(json_response(StatusCode::OK, &list))
            }
            ([REGISTRATION_VERSION, RESOURCE], &Method::POST) => {
                let descriptor = self.read_descriptor(request).await?;
                let created = self.store.create(descriptor).await?;
                info!(backend = %created.name, "Backend registered");
                Ok(json_response(StatusCode::CREATED, &created))
            }
            ([REGISTRATION_VERSION, RESOURCE, name], &Method::GET) => {
                Ok(json_response(StatusCode::OK, &self.store.get(name).await?))
            }
            ([REGISTRATION_VERSION, RESOURCE, name], &Method::PUT) => {
                let name = name.to_string();
                let descriptor = self.read_descriptor(request).await?;
                if descriptor.name != name {
                    return Err(AggregatorError::bad_request(format!(
                        "name in body '{}' does not match path '{}'",
                        descriptor.name, name
                    )));
                }
                let updated = self.store.update(descriptor).await?;
                info!(backend = %updated.name, "Backend updated");
                Ok(json_response(StatusCode::OK, &updated))
            }
            ([REGISTRATION_VERSION, RESOURCE, name], &Method::DELETE) => {
                let deleted = self.store.delete(name).await?;
                info!(backend = %deleted.name, "Backend unregistered");
                Ok(json_response(StatusCode::OK, &deleted))
            }
            ([]
            | [REGISTRATION_VERSION]
            | [REGISTRATION_VERSION, RESOURCE]
            | [REGISTRATION_VERSION, RESOURCE, _], _) => Err(AggregatorError::MethodNotAllowed {
                method: method.to_string(),
                path: path.clone(),
            }),
            _ => Err(AggregatorError::not_found("path", path.clone())),
        }
    }

    async fn read_descriptor(&self, request: Request) -> AggregatorResult<BackendDescriptor> {
        let body = to_bytes(request.into_body(), self.max_body_bytes)
            .await
            .map_err(|e| AggregatorError::bad_request(format!("failed to read body: {}", e)))?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl RouteHandler for RegistrationApi {
    async fn serve(&self, request: Request) -> Response {
        match self.handle(request).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }
}
