//! # Backend Proxy Handler
//!
//! One [`ProxyHandler`] exists per registered backend for the life of the
//! process. Registration changes never replace it; they mutate its state in
//! place (destination, TLS settings, enabled flag), so routes installed in the
//! path multiplexer stay valid.
//!
//! ## Rust Concepts Used
//!
//! - `parking_lot::RwLock` around the mutable state; reads and writes are
//!   short and the lock is never held across an `.await`
//! - the transport is rebuilt outside the lock and swapped in afterwards
//! - `hyper::upgrade::on` plus `tokio::io::copy_bidirectional` to splice
//!   upgraded connections (WebSocket, SPDY, exec/attach style streams)

use async_trait::async_trait;
use axum::body::{Body, HttpBody};
use axum::extract::Request;
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use hyper_util::rt::TokioIo;
use metrics::{counter, histogram};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::core::error::{AggregatorError, AggregatorResult};
use crate::core::types::BackendDescriptor;
use crate::discovery::validation::split_host_port;
use crate::protocols::identity::IdentityAccessor;
use crate::protocols::transport::{BackendTls, ProxySettings, Transport};
use crate::routing::mux::RouteHandler;

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    HeaderName::from_static("keep-alive"),
];

struct ProxyState {
    enabled: bool,
    destination_host: String,
    tls: BackendTls,
    /// Construction errors are kept and reported per request
    transport: Result<Arc<Transport>, AggregatorError>,
}

pub struct ProxyHandler {
    name: String,
    state: RwLock<ProxyState>,
    settings: Arc<ProxySettings>,
    identity: IdentityAccessor,
}

impl ProxyHandler {
    /// Create an enabled handler for `descriptor`
    pub fn new(descriptor: &BackendDescriptor, settings: Arc<ProxySettings>, identity: IdentityAccessor) -> Self {
        let tls = BackendTls::from(descriptor);
        let transport = Transport::build(&descriptor.name, &tls, &settings).map(Arc::new);
        if let Err(e) = &transport {
            warn!(backend = %descriptor.name, error = %e, "Backend transport unavailable");
        }

        Self {
            name: descriptor.name.clone(),
            state: RwLock::new(ProxyState {
                enabled: true,
                destination_host: descriptor.internal_host.clone(),
                tls,
                transport,
            }),
            settings,
            identity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.state.read().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.write().enabled = enabled;
    }

    pub fn destination_host(&self) -> String {
        self.state.read().destination_host.clone()
    }

    pub fn set_destination_host(&self, host: impl Into<String>) {
        self.state.write().destination_host = host.into();
    }

    pub fn tls_config(&self) -> BackendTls {
        self.state.read().tls.clone()
    }

    /// Replace the TLS settings, rebuilding the transport when they changed
    pub fn set_tls_config(&self, tls: BackendTls) {
        if self.state.read().tls == tls {
            return;
        }

        let transport = Transport::build(&self.name, &tls, &self.settings).map(Arc::new);
        if let Err(e) = &transport {
            warn!(backend = %self.name, error = %e, "Backend transport unavailable");
        }

        let mut state = self.state.write();
        state.tls = tls;
        state.transport = transport;
    }

    /// Apply a newer descriptor and enable the handler
    pub fn update_from(&self, descriptor: &BackendDescriptor) {
        self.set_destination_host(descriptor.internal_host.clone());
        self.set_tls_config(BackendTls::from(descriptor));
        self.set_enabled(true);
    }

    fn transport(&self) -> AggregatorResult<Arc<Transport>> {
        self.state.read().transport.clone()
    }

    async fn forward(&self, mut request: Request) -> AggregatorResult<Response> {
        let user = (self.identity)(&request)
            .ok_or_else(|| AggregatorError::missing_identity("missing user"))?;

        let location = destination_url(&self.settings.scheme, &self.destination_host(), request.uri())?;
        let transport = self.transport()?;

        let upgrade = is_upgrade_request(request.headers());
        let on_upgrade = upgrade.then(|| hyper::upgrade::on(&mut request));

        let (parts, body) = request.into_parts();
        let mut headers = parts.headers;
        let has_body = !HttpBody::is_end_stream(&body);
        if !upgrade {
            strip_hop_by_hop(&mut headers);
        }
        headers.remove(header::HOST);
        self.settings.identity.apply(&mut headers, &user)?;
        match &self.settings.bearer_token {
            Some(token) => {
                headers.insert(header::AUTHORIZATION, token.clone());
            }
            None => {
                headers.remove(header::AUTHORIZATION);
            }
        }

        let client = if upgrade { &transport.upgrade } else { &transport.http };
        let mut outbound = client.request(parts.method, location).headers(headers);
        if has_body && !upgrade {
            outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream = outbound
            .send()
            .await
            .map_err(|e| AggregatorError::upstream(&self.name, e.to_string()))?;

        match on_upgrade {
            Some(on_upgrade) if upstream.status() == StatusCode::SWITCHING_PROTOCOLS => {
                self.splice_upgrade(on_upgrade, upstream).await
            }
            _ => Ok(self.stream_response(upstream)),
        }
    }

    fn stream_response(&self, upstream: reqwest::Response) -> Response {
        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let backend = self.name.clone();
        let stream = upstream.bytes_stream().inspect_err(move |e| {
            warn!(backend = %backend, error = %e, "Backend response body aborted");
        });

        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }

    async fn splice_upgrade(
        &self,
        on_upgrade: hyper::upgrade::OnUpgrade,
        upstream: reqwest::Response,
    ) -> AggregatorResult<Response> {
        let status = upstream.status();
        let headers = upstream.headers().clone();
        let mut backend_io = upstream
            .upgrade()
            .await
            .map_err(|e| AggregatorError::upstream(&self.name, format!("upgrade failed: {}", e)))?;

        let backend = self.name.clone();
        tokio::spawn(async move {
            let client_io = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    warn!(backend = %backend, error = %e, "Client connection upgrade failed");
                    return;
                }
            };
            counter!("aggregator_upgraded_sessions_total", "backend" => backend.clone()).increment(1);

            let mut client_io = TokioIo::new(client_io);
            match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
                Ok((to_backend, to_client)) => {
                    debug!(backend = %backend, to_backend, to_client, "Upgraded session closed");
                }
                Err(e) => debug!(backend = %backend, error = %e, "Upgraded session ended with error"),
            }
        });

        let mut response = Response::new(Body::empty());
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

#[async_trait]
impl RouteHandler for ProxyHandler {
    async fn serve(&self, request: Request) -> Response {
        // A request that sees the handler enabled here runs to completion even
        // if the backend is disabled meanwhile.
        if !self.is_enabled() {
            return AggregatorError::not_found("backend", &self.name).into_response();
        }

        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let started = Instant::now();
        let response = match self.forward(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(backend = %self.name, method = %method, path = %path, error = %e, "Proxy request failed");
                e.into_response()
            }
        };

        counter!(
            "aggregator_proxy_requests_total",
            "backend" => self.name.clone(),
            "code" => status_class(response.status())
        )
        .increment(1);
        histogram!("aggregator_proxy_request_duration_seconds", "backend" => self.name.clone())
            .record(started.elapsed().as_secs_f64());
        response
    }
}

/// `<scheme>://<host><path>?<query>` with path and query copied from the request
///
/// The parsed location must name exactly the host and port of `host`.
pub fn destination_url(scheme: &str, host: &str, uri: &Uri) -> AggregatorResult<Url> {
    let invalid = |reason: String| AggregatorError::internal(format!("invalid backend location '{}': {}", host, reason));

    let (expected_host, expected_port) = split_host_port(host).map_err(|e| invalid(e.to_string()))?;
    let mut url = Url::parse(&format!("{}://{}", scheme, host)).map_err(|e| invalid(e.to_string()))?;

    let parsed_host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        .unwrap_or_default();
    if !parsed_host.eq_ignore_ascii_case(&expected_host)
        || url.port_or_known_default() != Some(expected_port)
        || !url.username().is_empty()
        || url.password().is_some()
    {
        return Err(invalid(format!("parses as '{}'", url)));
    }

    url.set_path(uri.path());
    url.set_query(uri.query());
    Ok(url)
}

/// True when the request asks to switch protocols (`Connection: upgrade` plus `Upgrade`)
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade && headers.contains_key(header::UPGRADE)
}

/// Remove hop-by-hop headers, including any named in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}
