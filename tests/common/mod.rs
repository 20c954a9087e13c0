//! Shared fixtures for the integration tests: a loopback echo backend, a
//! running aggregator and a polling helper.

#![allow(dead_code)]

use api_aggregator::core::config::TokenConfig;
use api_aggregator::{AggregatorConfig, AggregatorResult, AggregatorServer, MemoryRegistry, RouteManager};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Request;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TEST_TOKEN: &str = "test-token";

/// Aggregator config for plain-text loopback backends with one known token
pub fn test_config() -> AggregatorConfig {
    let mut config = AggregatorConfig::default();
    config.server.bind_address = "127.0.0.1:0".to_string();
    config.proxy.backend_scheme = "http".to_string();
    config.controller.resync_interval = Duration::from_secs(3600);
    config.auth.tokens.push(TokenConfig {
        token: TEST_TOKEN.to_string(),
        username: "alice".to_string(),
        groups: vec!["devs".to_string(), "ops".to_string()],
        extra: BTreeMap::from([("Scopes".to_string(), vec!["read".to_string(), "write".to_string()])]),
    });
    config
}

pub struct RunningAggregator {
    pub address: SocketAddr,
    pub registry: Arc<MemoryRegistry>,
    pub routes: Arc<RouteManager>,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<AggregatorResult<()>>,
}

impl RunningAggregator {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.address, path)
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}

pub async fn start_aggregator(config: AggregatorConfig) -> RunningAggregator {
    let server = AggregatorServer::new(config).await.unwrap();
    let registry = Arc::clone(server.registry());
    let routes = Arc::clone(server.routes());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(server.serve(listener, shutdown.clone()));

    RunningAggregator {
        address,
        registry,
        routes,
        shutdown,
        handle,
    }
}

/// Backend that answers every request with a JSON description of it, and
/// echoes websocket text frames on any path ending in `/watch`.
pub async fn spawn_echo_backend() -> SocketAddr {
    let app = Router::new()
        .route("/api/v1/watch", get(websocket_echo))
        .route("/apis/:group/:version/watch", get(websocket_echo))
        .fallback(describe_request);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    address
}

async fn describe_request(request: Request) -> Json<Value> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();

    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in &parts.headers {
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(value.to_str().unwrap_or_default().to_string());
    }

    Json(json!({
        "method": parts.method.as_str(),
        "path": parts.uri.path(),
        "query": parts.uri.query(),
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    }))
}

async fn websocket_echo(upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(|mut socket: WebSocket| async move {
        while let Some(Ok(message)) = socket.recv().await {
            match message {
                Message::Text(text) => {
                    if socket.send(Message::Text(format!("echo: {}", text))).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    })
}

/// Address nothing listens on
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);
    address
}

/// Poll `check` until it returns true or five seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// Status of an authenticated GET through the aggregator
pub async fn get_status(aggregator: &RunningAggregator, path: &str) -> u16 {
    client()
        .get(aggregator.url(path))
        .bearer_auth(TEST_TOKEN)
        .send()
        .await
        .map(|response| response.status().as_u16())
        .unwrap_or(0)
}
