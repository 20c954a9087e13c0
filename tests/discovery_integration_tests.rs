//! # Discovery Integration Tests
//!
//! The merged `/apis` document, group discovery and the registration API,
//! driven through the full HTTP application with `axum-test`.

mod common;

use api_aggregator::aggregation::REGISTRATION_GROUP;
use api_aggregator::{AggregatorConfig, AggregatorServer, BackendDescriptor, BackendRegistry, BackendStore};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use common::{eventually, test_config, TEST_TOKEN};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const BACKENDS: &str = "/apis/apiregistration.aggregator.io/v1beta1/backends";

fn bearer() -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static("authorization"),
        HeaderValue::from_str(&format!("Bearer {}", TEST_TOKEN)).unwrap(),
    )
}

async fn test_server(config: AggregatorConfig) -> (TestServer, AggregatorServer) {
    let aggregator = AggregatorServer::new(config).await.unwrap();
    let server = TestServer::new(aggregator.router()).unwrap();
    (server, aggregator)
}

fn group_names(list: &Value) -> Vec<String> {
    list["groups"]
        .as_array()
        .unwrap()
        .iter()
        .map(|group| group["name"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_apis_orders_by_priority_then_name() {
    let (server, aggregator) = test_server(test_config()).await;
    let registry = aggregator.registry();
    for descriptor in [
        BackendDescriptor::new("zeta.io", "v1", "zeta:443", 5),
        BackendDescriptor::new("alpha.io", "v1", "alpha:443", 5),
        BackendDescriptor::new("first.io", "v1", "first:443", 1),
        BackendDescriptor::new("first.io", "v2", "first:443", 50),
        BackendDescriptor::new("first.io", "v1beta1", "first:443", 1),
        BackendDescriptor::new("", "v1", "core:443", 1),
    ] {
        registry.create(descriptor).await.unwrap();
    }

    let (name, value) = bearer();
    let response = server.get("/apis").add_header(name, value).await;
    response.assert_status_ok();

    let list: Value = response.json();
    assert_eq!(list["kind"], "APIGroupList");
    // Own group first, the legacy backend never appears.
    assert_eq!(
        group_names(&list),
        vec![REGISTRATION_GROUP, "first.io", "alpha.io", "zeta.io"]
    );

    let first = &list["groups"][1];
    let versions: Vec<_> = first["versions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|version| version["version"].as_str().unwrap())
        .collect();
    assert_eq!(versions, vec!["v1", "v1beta1", "v2"]);
    assert_eq!(first["preferredVersion"]["groupVersion"], "first.io/v1");
}

#[tokio::test]
async fn test_apis_trailing_slash_is_same_document() {
    let (server, aggregator) = test_server(test_config()).await;
    aggregator
        .registry()
        .create(BackendDescriptor::new("foo.io", "v1", "foo:443", 1))
        .await
        .unwrap();

    let (name, value) = bearer();
    let plain: Value = server.get("/apis").add_header(name.clone(), value.clone()).await.json();
    let slash: Value = server.get("/apis/").add_header(name, value).await.json();
    assert_eq!(plain, slash);
}

#[tokio::test]
async fn test_group_discovery_appears_with_first_backend() {
    let config = test_config();
    let aggregator = AggregatorServer::new(config).await.unwrap();
    let registry = Arc::clone(aggregator.registry());
    let routes = Arc::clone(aggregator.routes());
    let controller = Arc::clone(aggregator.controller());
    let server = TestServer::new(aggregator.router()).unwrap();

    let shutdown = CancellationToken::new();
    let running = tokio::spawn(controller.run(1, shutdown.clone()));

    let (name, value) = bearer();
    server
        .get("/apis/late.io")
        .add_header(name.clone(), value.clone())
        .await
        .assert_status(StatusCode::NOT_FOUND);

    registry
        .create(BackendDescriptor::new("late.io", "v1", "late:443", 3))
        .await
        .unwrap();
    assert!(eventually(|| async { routes.handler("v1.late.io").is_some() }).await);

    let response = server.get("/apis/late.io").add_header(name.clone(), value.clone()).await;
    response.assert_status_ok();
    let group: Value = response.json();
    assert_eq!(group["kind"], "APIGroup");
    assert_eq!(group["name"], "late.io");
    assert_eq!(group["preferredVersion"]["version"], "v1");

    registry.delete("v1.late.io").await.unwrap();
    server
        .get("/apis/late.io/")
        .add_header(name, value)
        .await
        .assert_status(StatusCode::NOT_FOUND);

    shutdown.cancel();
    running.await.unwrap();
}

#[tokio::test]
async fn test_registration_api_lifecycle() {
    let (server, aggregator) = test_server(test_config()).await;
    let (name, value) = bearer();

    let body = json!({
        "name": "v1.widgets.io",
        "group": "widgets.io",
        "version": "v1",
        "internalHost": "widgets.default.svc:443",
        "priority": 7,
        "insecureSkipTLSVerify": true
    });
    let response = server
        .post(BACKENDS)
        .add_header(name.clone(), value.clone())
        .json(&body)
        .await;
    response.assert_status(StatusCode::CREATED);
    assert_eq!(aggregator.registry().len(), 1);

    server
        .post(BACKENDS)
        .add_header(name.clone(), value.clone())
        .json(&body)
        .await
        .assert_status(StatusCode::CONFLICT);

    let list: Value = server.get(BACKENDS).add_header(name.clone(), value.clone()).await.json();
    assert_eq!(list["kind"], "BackendList");
    assert_eq!(list["items"][0]["internalHost"], "widgets.default.svc:443");

    let mut changed = body.clone();
    changed["priority"] = json!(3);
    server
        .put(&format!("{}/v1.widgets.io", BACKENDS))
        .add_header(name.clone(), value.clone())
        .json(&changed)
        .await
        .assert_status_ok();
    assert_eq!(aggregator.registry().get("v1.widgets.io").await.unwrap().priority, 3);

    server
        .delete(&format!("{}/v1.widgets.io", BACKENDS))
        .add_header(name.clone(), value.clone())
        .await
        .assert_status_ok();
    server
        .get(&format!("{}/v1.widgets.io", BACKENDS))
        .add_header(name, value)
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_registration_api_rejects_invalid_descriptors() {
    let (server, _aggregator) = test_server(test_config()).await;
    let (name, value) = bearer();

    let response = server
        .post(BACKENDS)
        .add_header(name.clone(), value.clone())
        .json(&json!({
            "name": "wrong-name",
            "group": "Not_A_Group",
            "version": "v1",
            "internalHost": "no-port",
            "priority": 0
        }))
        .await;
    response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    let error: Value = response.json();
    assert_eq!(error["error"]["type"], "validation_error");

    server
        .post(BACKENDS)
        .add_header(name.clone(), value.clone())
        .json(&json!({
            "name": "v1.apiregistration.aggregator.io",
            "group": REGISTRATION_GROUP,
            "version": "v1",
            "internalHost": "own:443",
            "priority": 1
        }))
        .await
        .assert_status(StatusCode::UNPROCESSABLE_ENTITY);

    server
        .patch(BACKENDS)
        .add_header(name, value)
        .await
        .assert_status(StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_own_group_documents() {
    let (server, _aggregator) = test_server(test_config()).await;
    let (name, value) = bearer();

    let group: Value = server
        .get("/apis/apiregistration.aggregator.io")
        .add_header(name.clone(), value.clone())
        .await
        .json();
    assert_eq!(group["name"], REGISTRATION_GROUP);
    assert_eq!(group["preferredVersion"]["version"], "v1beta1");

    let resources: Value = server
        .get("/apis/apiregistration.aggregator.io/v1beta1")
        .add_header(name, value)
        .await
        .json();
    assert_eq!(resources["kind"], "APIResourceList");
    assert_eq!(resources["resources"][0]["name"], "backends");
}

#[tokio::test]
async fn test_authentication_gate() {
    let (server, _aggregator) = test_server(test_config()).await;

    server.get("/healthz").await.assert_status_ok();

    let response = server.get("/apis").await;
    response.assert_status(StatusCode::UNAUTHORIZED);
    let error: Value = response.json();
    assert_eq!(error["error"]["code"], 401);

    let mut anonymous = test_config();
    anonymous.auth.allow_anonymous = true;
    let (server, _aggregator) = test_server(anonymous).await;
    server.get("/apis").await.assert_status_ok();
}
