//! # Aggregator Server
//!
//! Builds every component from an [`AggregatorConfig`] and serves them behind
//! one axum application.
//!
//! ## Request flow
//!
//! ```text
//! request_id -> TraceLayer -> authenticate -> fallback
//!     -> ApisHandler (/apis, /apis/)
//!     -> PathMux (own registration API, group discovery, backend proxies)
//! ```
//!
//! `/healthz` is an axum route and never reaches the multiplexer. Every other
//! path is dispatched dynamically, so routes installed by the controller take
//! effect without rebuilding the axum router.
//!
//! ## Rust Concepts Used
//!
//! - `Arc<dyn RouteHandler>` as axum state for the dynamic dispatch entry point
//! - `CancellationToken` shared by the HTTP server, controller and manifest watcher
//! - `tokio::select!` to bound the graceful shutdown by a grace period

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router as AxumRouter,
};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::aggregation::apis::ApisHandler;
use crate::aggregation::registration_api::{registration_group, RegistrationApi, REGISTRATION_GROUP};
use crate::auth::middleware::{authenticate, TokenAuthenticator};
use crate::controller::registration::RegistrationController;
use crate::core::config::AggregatorConfig;
use crate::core::error::{AggregatorError, AggregatorResult};
use crate::discovery::manifest::ManifestSource;
use crate::discovery::memory::MemoryRegistry;
use crate::observability::logging::request_id;
use crate::protocols::identity::default_identity_accessor;
use crate::protocols::transport::ProxySettings;
use crate::routing::manager::RouteManager;
use crate::routing::mux::{PathMux, RouteHandler};

pub struct AggregatorServer {
    config: AggregatorConfig,
    registry: Arc<MemoryRegistry>,
    routes: Arc<RouteManager>,
    controller: Arc<RegistrationController>,
    manifest: Option<Arc<ManifestSource>>,
    entry: Arc<dyn RouteHandler>,
    authenticator: Arc<TokenAuthenticator>,
}

impl AggregatorServer {
    /// Build all components. Nothing runs until [`AggregatorServer::run`].
    pub async fn new(config: AggregatorConfig) -> AggregatorResult<Self> {
        config.validate()?;

        let registry = Arc::new(MemoryRegistry::new(REGISTRATION_GROUP));
        let settings = Arc::new(ProxySettings::from_config(&config.proxy).await?);
        let authenticator = Arc::new(TokenAuthenticator::from_config(&config.auth).await?);

        let mux = Arc::new(PathMux::new());
        mux.register(
            &RegistrationApi::patterns(),
            Arc::new(RegistrationApi::new(
                registry.clone(),
                config.server.max_request_body_bytes,
            )),
        )?;

        let routes = Arc::new(RouteManager::new(
            Arc::clone(&mux),
            registry.clone(),
            settings,
            default_identity_accessor(),
            REGISTRATION_GROUP,
        ));

        let entry: Arc<dyn RouteHandler> = Arc::new(ApisHandler::new(
            registry.clone(),
            mux,
            registration_group(),
        ));

        let controller = Arc::new(RegistrationController::new(
            registry.clone(),
            routes.clone(),
            &config.controller,
        ));

        let manifest = config
            .registry
            .manifest_path
            .as_ref()
            .map(|path| Arc::new(ManifestSource::new(path.clone(), registry.clone())));

        Ok(Self {
            config,
            registry,
            routes,
            controller,
            manifest,
            entry,
            authenticator,
        })
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// The backend store behind both the registration API and the controller
    pub fn registry(&self) -> &Arc<MemoryRegistry> {
        &self.registry
    }

    pub fn routes(&self) -> &Arc<RouteManager> {
        &self.routes
    }

    pub fn controller(&self) -> &Arc<RegistrationController> {
        &self.controller
    }

    /// The HTTP application
    pub fn router(&self) -> AxumRouter {
        AxumRouter::new()
            .route("/healthz", get(health_check))
            .fallback(dispatch)
            .with_state(Arc::clone(&self.entry))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn(request_id))
                    .layer(TraceLayer::new_for_http())
                    .layer(middleware::from_fn_with_state(
                        Arc::clone(&self.authenticator),
                        authenticate,
                    )),
            )
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> AggregatorResult<()> {
        let bind_address = self.config.server.bind_address.clone();
        let listener = TcpListener::bind(&bind_address)
            .await
            .map_err(|e| AggregatorError::internal(format!("Failed to bind {}: {}", bind_address, e)))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` fires.
    ///
    /// Loads the manifest first, then starts the manifest watcher, the
    /// controller and the HTTP server. All of them stop on the token; open
    /// connections get `shutdown_grace_period` to finish.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> AggregatorResult<()> {
        let address: SocketAddr = listener.local_addr()?;
        let manifest_task = self.start_manifest(&shutdown).await?;

        let controller = tokio::spawn(
            Arc::clone(&self.controller).run(self.config.controller.workers, shutdown.clone()),
        );

        let app = self.router();
        info!(address = %address, "API aggregator listening");

        let server = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .into_future();
        tokio::pin!(server);

        let grace_period = self.config.server.shutdown_grace_period;
        let grace = async {
            shutdown.cancelled().await;
            tokio::time::sleep(grace_period).await;
        };

        let result = tokio::select! {
            result = &mut server => result.map_err(AggregatorError::from),
            _ = grace => {
                warn!(grace_period = ?grace_period, "Grace period elapsed with connections still open");
                Ok(())
            }
        };

        // The server may have failed on its own; stop the background tasks too.
        shutdown.cancel();
        if let Err(e) = controller.await {
            error!(error = %e, "Registration controller task failed");
        }
        if let Some(task) = manifest_task {
            if let Err(e) = task.await {
                error!(error = %e, "Manifest watcher task failed");
            }
        }

        info!("API aggregator stopped");
        result
    }

    async fn start_manifest(&self, shutdown: &CancellationToken) -> AggregatorResult<Option<JoinHandle<()>>> {
        let Some(manifest) = &self.manifest else {
            return Ok(None);
        };

        manifest.load().await?;
        if !self.config.registry.watch_manifest {
            return Ok(None);
        }
        Arc::clone(manifest).watch(shutdown.clone()).map(Some)
    }
}

async fn dispatch(State(entry): State<Arc<dyn RouteHandler>>, request: Request) -> Response {
    entry.serve(request).await
}

/// Health check handler
pub async fn health_check() -> impl IntoResponse {
    let health_info = serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    });

    (StatusCode::OK, Json(health_info))
}
